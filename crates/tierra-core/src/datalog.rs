//! Time-series ring buffers and histogram snapshots for engine metrics.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::Serialize;

/// Default sampling interval in instructions.
pub const DEFAULT_SAMPLE_INTERVAL: u64 = 25_000;

/// Default ring-buffer capacity per series.
pub const DEFAULT_SERIES_CAPACITY: usize = 10_000;

/// One sampled data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Global instruction count at sampling time.
    pub at: u64,
    pub value: f64,
}

/// A bounded ring buffer of samples.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl TimeSeries {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn record(&mut self, at: u64, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at, value });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples.iter().copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY)
    }
}

/// Aggregate metrics computed by the simulation for one sample.
#[derive(Debug, Clone, Default)]
pub struct SampleStats {
    pub population: usize,
    pub mean_cell_size: f64,
    pub genotypes: usize,
    /// Occupied fraction of the soup, in percent.
    pub soup_fullness: f64,
    /// Highest offspring count among living cells.
    pub max_offspring: u32,
    pub size_histogram: HashMap<usize, u32>,
    pub genotype_frequency: HashMap<String, u32>,
}

/// Collection of built-in series sampled on a fixed instruction cadence.
#[derive(Debug)]
pub struct DataLog {
    sample_interval: u64,
    last_sample_at: u64,
    pub population: TimeSeries,
    pub mean_cell_size: TimeSeries,
    pub genotypes: TimeSeries,
    pub soup_fullness: TimeSeries,
    pub max_offspring: TimeSeries,
    pub instructions_per_second: TimeSeries,
    /// Latest size histogram, replaced on each sample.
    pub size_histogram: HashMap<usize, u32>,
    /// Latest genotype populations, replaced on each sample.
    pub genotype_frequency: HashMap<String, u32>,
    speed_anchor: Option<(u64, Instant)>,
}

impl DataLog {
    #[must_use]
    pub fn new(sample_interval: u64) -> Self {
        Self {
            sample_interval: sample_interval.max(1),
            last_sample_at: 0,
            population: TimeSeries::default(),
            mean_cell_size: TimeSeries::default(),
            genotypes: TimeSeries::default(),
            soup_fullness: TimeSeries::default(),
            max_offspring: TimeSeries::default(),
            instructions_per_second: TimeSeries::default(),
            size_histogram: HashMap::new(),
            genotype_frequency: HashMap::new(),
            speed_anchor: None,
        }
    }

    /// Whether the cadence calls for a sample at `at` instructions.
    #[must_use]
    pub fn should_sample(&self, at: u64) -> bool {
        at - self.last_sample_at >= self.sample_interval
    }

    /// Record one sample across all series.
    pub fn record(&mut self, at: u64, stats: SampleStats) {
        self.last_sample_at = at;
        self.population.record(at, stats.population as f64);
        self.mean_cell_size.record(at, stats.mean_cell_size);
        self.genotypes.record(at, stats.genotypes as f64);
        self.soup_fullness.record(at, stats.soup_fullness);
        self.max_offspring
            .record(at, f64::from(stats.max_offspring));

        let now = Instant::now();
        if let Some((last_at, last_time)) = self.speed_anchor {
            let elapsed = now.duration_since(last_time).as_secs_f64();
            if elapsed > 0.0 {
                let speed = (at - last_at) as f64 / elapsed;
                self.instructions_per_second.record(at, speed);
            }
        }
        self.speed_anchor = Some((at, now));

        self.size_histogram = stats.size_histogram;
        self.genotype_frequency = stats.genotype_frequency;
    }
}

impl Default for DataLog {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}
