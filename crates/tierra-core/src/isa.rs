//! The 32-instruction virtual CPU: opcode table, template matching, and
//! per-instruction execution.
//!
//! Handlers operate on the whole simulation because several instructions
//! reach beyond the executing cell: `movii` writes the soup, `mal` can
//! trigger the reaper, `divide` registers genotypes and touches both queues.

use rand::Rng;

use crate::cell::Cell;
use crate::events::{MutationKind, SimEvent};
use crate::simulation::Simulation;
use crate::soup::{ACCESS_READ, ACCESS_WRITE, AllocPolicy, Soup};
use crate::{CellId, mutation, wrap_address};

/// Number of distinct opcodes.
pub const OPCODE_COUNT: usize = 32;

/// The instruction set. Discriminants are the opcode byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop0 = 0,
    Nop1 = 1,
    Not0 = 2,
    Shl = 3,
    Zero = 4,
    Ifz = 5,
    SubCab = 6,
    SubAac = 7,
    IncA = 8,
    IncB = 9,
    DecC = 10,
    IncC = 11,
    PushA = 12,
    PushB = 13,
    PushC = 14,
    PushD = 15,
    PopA = 16,
    PopB = 17,
    PopC = 18,
    PopD = 19,
    Jmpo = 20,
    Jmpb = 21,
    Call = 22,
    Ret = 23,
    MovDc = 24,
    MovBa = 25,
    Movii = 26,
    Adro = 27,
    Adrb = 28,
    Adrf = 29,
    Mal = 30,
    Divide = 31,
}

const OPCODES: [OpCode; OPCODE_COUNT] = [
    OpCode::Nop0,
    OpCode::Nop1,
    OpCode::Not0,
    OpCode::Shl,
    OpCode::Zero,
    OpCode::Ifz,
    OpCode::SubCab,
    OpCode::SubAac,
    OpCode::IncA,
    OpCode::IncB,
    OpCode::DecC,
    OpCode::IncC,
    OpCode::PushA,
    OpCode::PushB,
    OpCode::PushC,
    OpCode::PushD,
    OpCode::PopA,
    OpCode::PopB,
    OpCode::PopC,
    OpCode::PopD,
    OpCode::Jmpo,
    OpCode::Jmpb,
    OpCode::Call,
    OpCode::Ret,
    OpCode::MovDc,
    OpCode::MovBa,
    OpCode::Movii,
    OpCode::Adro,
    OpCode::Adrb,
    OpCode::Adrf,
    OpCode::Mal,
    OpCode::Divide,
];

const MNEMONICS: [&str; OPCODE_COUNT] = [
    "nop0", "nop1", "not0", "shl", "zero", "ifz", "subCAB", "subAAC", "incA", "incB", "decC",
    "incC", "pushA", "pushB", "pushC", "pushD", "popA", "popB", "popC", "popD", "jmpo", "jmpb",
    "call", "ret", "movDC", "movBA", "movii", "adro", "adrb", "adrf", "mal", "divide",
];

impl OpCode {
    /// Decode a soup byte; only the low 5 bits participate.
    #[inline]
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        OPCODES[(byte & 0x1f) as usize]
    }

    /// The opcode byte value.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Canonical mnemonic, as used by the genome text format.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        MNEMONICS[self as usize]
    }

    /// Parse a mnemonic, case-insensitively.
    #[must_use]
    pub fn from_mnemonic(name: &str) -> Option<Self> {
        MNEMONICS
            .iter()
            .position(|m| m.eq_ignore_ascii_case(name))
            .map(|i| OPCODES[i])
    }

    /// Whether this opcode is a template bit (`nop0`/`nop1`).
    #[must_use]
    pub const fn is_nop(self) -> bool {
        matches!(self, Self::Nop0 | Self::Nop1)
    }
}

/// Direction of a template search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDirection {
    /// Alternate forward and backward, nearest match wins.
    Outward,
    /// Forward only, starting past the source template.
    Forward,
    /// Backward only, starting before the instruction.
    Backward,
}

/// Result of a template search: the address just past the matched
/// complement (if any) and the source template length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TemplateMatch {
    pub addr: Option<usize>,
    pub len: usize,
}

#[inline]
fn is_nop_byte(byte: u8) -> bool {
    byte <= 1
}

/// Find the complement of the template following `ip`, scanning at most
/// `max_dist` addresses per direction. Templates shorter than `min_len`
/// never match.
pub(crate) fn find_template(
    soup: &Soup,
    ip: usize,
    direction: SearchDirection,
    max_dist: usize,
    min_len: usize,
) -> TemplateMatch {
    let size = soup.size();
    let mut template = Vec::new();
    let mut pos = (ip + 1) % size;
    while is_nop_byte(soup.read(pos)) && template.len() < size {
        template.push(soup.read(pos));
        pos = (pos + 1) % size;
    }
    let tlen = template.len();
    if tlen == 0 || tlen < min_len {
        return TemplateMatch { addr: None, len: tlen };
    }

    let complement: Vec<u8> = template.iter().map(|&bit| 1 - bit).collect();
    let matches_at = |start: usize| (0..tlen).all(|j| soup.read(start + j) == complement[j]);

    let max_dist = max_dist.min(size);
    let forward_origin = (ip + 1 + tlen) % size;
    let found = |start: usize| TemplateMatch {
        addr: Some((start + tlen) % size),
        len: tlen,
    };

    match direction {
        SearchDirection::Forward => {
            for dist in 1..=max_dist {
                let check = (forward_origin + dist) % size;
                if matches_at(check) {
                    return found(check);
                }
            }
        }
        SearchDirection::Backward => {
            for dist in 1..=max_dist {
                let check = (ip + size - dist % size) % size;
                if matches_at(check) {
                    return found(check);
                }
            }
        }
        SearchDirection::Outward => {
            for dist in 1..=max_dist {
                let ahead = (forward_origin + dist) % size;
                if matches_at(ahead) {
                    return found(ahead);
                }
                let behind = (ip + size - dist % size) % size;
                if matches_at(behind) {
                    return found(behind);
                }
            }
        }
    }
    TemplateMatch { addr: None, len: tlen }
}

/// Index of the last nop of the template following `ip`, so the fetch
/// loop's increment lands on the first instruction past it.
fn last_template_nop(soup: &Soup, ip: usize) -> usize {
    let size = soup.size();
    let mut pos = (ip + 1) % size;
    let mut scanned = 0;
    while is_nop_byte(soup.read(pos)) && scanned < size {
        pos = (pos + 1) % size;
        scanned += 1;
    }
    (pos + size - 1) % size
}

/// Draw a flaw offset for a register-writing instruction, emitting the
/// mutation event when one fires.
fn flaw(sim: &mut Simulation, id: CellId) -> i32 {
    let offset = sim.mutation.flaw(&mut sim.rng);
    if offset != 0 {
        sim.events.emit(SimEvent::Mutation {
            kind: MutationKind::Flaw,
            cell: Some(id),
        });
    }
    offset
}

fn template_search(sim: &Simulation, id: CellId, direction: SearchDirection) -> TemplateMatch {
    let max_dist = sim.config.search_limit as usize * sim.mean_cell_size();
    find_template(
        &sim.soup,
        sim.cells[id].cpu.ip,
        direction,
        max_dist,
        sim.config.min_templ_size,
    )
}

/// Jump-style search: on a hit the IP lands past the matched complement; on
/// a miss the error flag is raised and the IP skips the source template.
fn jump(sim: &mut Simulation, id: CellId, direction: SearchDirection) {
    let result = template_search(sim, id, direction);
    let cell = &mut sim.cells[id];
    match result.addr {
        Some(addr) => {
            cell.cpu.ip = addr;
            cell.cpu.ip_moved = true;
            cell.cpu.flags.error = false;
        }
        None => {
            cell.cpu.flags.error = true;
            if result.len > 0 {
                cell.cpu.ip = last_template_nop(&sim.soup, cell.cpu.ip);
            }
        }
    }
}

/// Address-style search: the match address lands in `ax`, the template
/// length in `cx`, and the IP always skips the source template.
fn address_of(sim: &mut Simulation, id: CellId, direction: SearchDirection) {
    let result = template_search(sim, id, direction);
    let cell = &mut sim.cells[id];
    match result.addr {
        Some(addr) => {
            cell.cpu.ax = addr as i32;
            cell.cpu.cx = result.len as i32;
            cell.cpu.flags.error = false;
        }
        None => cell.cpu.flags.error = true,
    }
    if result.len > 0 {
        cell.cpu.ip = last_template_nop(&sim.soup, cell.cpu.ip);
    }
}

fn call(sim: &mut Simulation, id: CellId) {
    let result = template_search(sim, id, SearchDirection::Outward);
    let size = sim.soup.size();
    let cell = &mut sim.cells[id];
    match result.addr {
        Some(addr) => {
            let ret_addr = (cell.cpu.ip + 1 + result.len) % size;
            if cell.cpu.push(ret_addr as i32) {
                cell.cpu.ip = addr;
                cell.cpu.ip_moved = true;
                cell.cpu.flags.error = false;
            } else if result.len > 0 {
                // Stack full: no jump, continue past the template.
                cell.cpu.ip = last_template_nop(&sim.soup, cell.cpu.ip);
            }
        }
        None => {
            cell.cpu.flags.error = true;
            if result.len > 0 {
                cell.cpu.ip = last_template_nop(&sim.soup, cell.cpu.ip);
            }
        }
    }
}

fn ret(sim: &mut Simulation, id: CellId) {
    let offset = flaw(sim, id);
    let size = sim.soup.size();
    let cell = &mut sim.cells[id];
    if let Some(value) = cell.cpu.pop() {
        cell.cpu.ip = wrap_address(value.wrapping_add(offset), size);
        cell.cpu.ip_moved = true;
    }
}

/// Copy one instruction from `[bx]` to `[ax]`. The destination must lie in
/// the executing cell's daughter region and pass write protection; the
/// source must pass read protection. Copy mutation may corrupt the byte.
fn movii(sim: &mut Simulation, id: CellId) {
    let size = sim.soup.size();
    let masks = sim.config.protection();
    let (src_addr, dst_addr) = {
        let cpu = &sim.cells[id].cpu;
        (wrap_address(cpu.bx, size), wrap_address(cpu.ax, size))
    };

    if !sim.cells[id].owns_daughter(dst_addr, size)
        || !sim.soup.check_access(dst_addr, id, masks, ACCESS_WRITE)
        || !sim.soup.check_access(src_addr, id, masks, ACCESS_READ)
    {
        sim.cells[id].cpu.flags.error = true;
        return;
    }

    let mut value = sim.soup.read(src_addr);
    if sim.mutation.rate_copy > 0.0 && sim.rng.random::<f64>() < sim.mutation.rate_copy {
        value = mutation::mutate_opcode(value, sim.config.mut_bit_prop, &mut sim.rng);
        sim.cells[id].demo.mutations += 1;
        sim.events.emit(SimEvent::Mutation {
            kind: MutationKind::Copy,
            cell: Some(id),
        });
    }
    sim.soup.write(dst_addr, value);

    let cell = &mut sim.cells[id];
    let daughter_len = cell.daughter.map_or(0, |region| region.len) as u32;
    if cell.demo.mov_count < daughter_len {
        cell.demo.mov_count += 1;
    }
    cell.cpu.flags.error = false;
}

/// Allocate `cx` bytes of daughter memory. On exhaustion the reaper frees a
/// victim and the allocation retries exactly once.
fn mal(sim: &mut Simulation, id: CellId) {
    let (cx, ax, mother) = {
        let cell = &sim.cells[id];
        (cell.cpu.cx, cell.cpu.ax, cell.mother)
    };
    let requested = if sim.config.mal_sam_siz != 0 {
        mother.len
    } else if cx < 0 {
        sim.cells[id].cpu.flags.error = true;
        return;
    } else {
        cx as usize
    };
    if requested < sim.config.min_cell_size || requested > mother.len * 2 {
        sim.cells[id].cpu.flags.error = true;
        return;
    }

    // A stale daughter region is released before the new attempt.
    if let Some(old) = sim.cells[id].daughter.take() {
        sim.soup.remove_owner(old);
        sim.soup.deallocate(old);
    }

    let policy = AllocPolicy::from_mode(sim.config.mal_mode);
    let size = sim.soup.size();
    let hint = match policy {
        AllocPolicy::NearParent => Some(mother.start),
        AllocPolicy::NearAddress => Some(wrap_address(ax, size)),
        _ => None,
    };
    let mal_tol = sim.config.mal_tol as usize;

    let mut region = sim
        .soup
        .allocate(requested, policy, hint, mal_tol, &mut sim.rng);
    if region.is_none() {
        sim.reap_for_space(hint, id);
        region = sim
            .soup
            .allocate(requested, policy, hint, mal_tol, &mut sim.rng);
    }

    match region {
        Some(region) => {
            sim.soup.add_owner(region, id);
            let cell = &mut sim.cells[id];
            cell.daughter = Some(region);
            cell.cpu.ax = region.start as i32;
            cell.demo.mov_count = 0;
            cell.cpu.flags.error = false;
        }
        None => sim.cells[id].cpu.flags.error = true,
    }
}

/// Turn a filled daughter region into an independent cell.
fn divide(sim: &mut Simulation, id: CellId) {
    let Some(daughter) = sim.cells[id].daughter else {
        sim.cells[id].cpu.flags.error = true;
        return;
    };
    let (mother, mov_count) = {
        let cell = &sim.cells[id];
        (cell.mother, cell.demo.mov_count)
    };

    let filled = f64::from(mov_count);
    let unmet = daughter.len < sim.config.min_cell_size
        || filled < daughter.len as f64 * sim.config.mov_prop_thr_div
        || (sim.config.div_same_siz != 0 && daughter.len != mother.len)
        || (sim.config.div_same_gen != 0
            && crate::genebank::genome_hash(&sim.soup.read_region(daughter))
                != crate::genebank::genome_hash(&sim.soup.read_region(mother)));
    if unmet {
        // The daughter region stays attached and can be reused.
        sim.cells[id].cpu.flags.error = true;
        return;
    }

    mutation::apply_genetic_operators(sim, id);
    // The operators may have resized the region.
    let daughter = sim.cells[id].daughter.expect("daughter survives operators");

    let now = sim.instructions;
    let parent_genotype = sim.cells[id].demo.genotype.clone();
    let mut child = Cell::new(daughter, now);
    child.demo.parent_genotype = parent_genotype.clone();
    let child_id = sim.cells.insert(child);
    sim.soup.transfer_owner(daughter, child_id);
    sim.total_cell_bytes += daughter.len;

    let genome = sim.soup.read_region(daughter);
    let registered = sim.genebank.register(genome, &parent_genotype, now);
    if registered.is_new {
        sim.events.emit(SimEvent::NewGenotype {
            genotype: registered.name.clone(),
        });
    }
    sim.cells[child_id].demo.genotype = registered.name.clone();

    sim.scheduler.push(child_id);
    sim.reaper.push(child_id);
    sim.events.emit(SimEvent::CellBorn {
        cell: child_id,
        parent: id,
        genotype: registered.name,
    });
    sim.last_birth_instruction = now;

    let mother = &mut sim.cells[id];
    mother.daughter = None;
    mother.demo.offspring += 1;
    mother.demo.mov_count = 0;
    mother.demo.last_reproduction_instruction = now;
    mother.cpu.flags.error = false;
}

/// Execute one decoded instruction for `id`. The fetch loop advances the IP
/// afterwards unless the handler moved it.
pub(crate) fn execute(sim: &mut Simulation, id: CellId, op: OpCode) {
    match op {
        OpCode::Nop0 | OpCode::Nop1 => {}
        OpCode::Not0 => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.cx ^= 1 + offset;
            let cx = cpu.cx;
            cpu.set_flags(cx);
        }
        OpCode::Shl => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.cx = cpu.cx.wrapping_shl((1 + offset) as u32);
            let cx = cpu.cx;
            cpu.set_flags(cx);
        }
        OpCode::Zero => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.cx = offset;
            let cx = cpu.cx;
            cpu.set_flags(cx);
        }
        OpCode::Ifz => {
            let size = sim.soup.size();
            let cpu = &mut sim.cells[id].cpu;
            if cpu.cx != 0 {
                // Skip the next instruction.
                cpu.ip = (cpu.ip + 1) % size;
            }
        }
        OpCode::SubCab => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.cx = cpu.ax.wrapping_sub(cpu.bx).wrapping_add(offset);
            let cx = cpu.cx;
            cpu.set_flags(cx);
        }
        OpCode::SubAac => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.ax = cpu.ax.wrapping_sub(cpu.cx).wrapping_add(offset);
            let ax = cpu.ax;
            cpu.set_flags(ax);
        }
        OpCode::IncA => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.ax = cpu.ax.wrapping_add(1 + offset);
            let ax = cpu.ax;
            cpu.set_flags(ax);
        }
        OpCode::IncB => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.bx = cpu.bx.wrapping_add(1 + offset);
            let bx = cpu.bx;
            cpu.set_flags(bx);
        }
        OpCode::DecC => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.cx = cpu.cx.wrapping_sub(1 + offset);
            let cx = cpu.cx;
            cpu.set_flags(cx);
        }
        OpCode::IncC => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.cx = cpu.cx.wrapping_add(1 + offset);
            let cx = cpu.cx;
            cpu.set_flags(cx);
        }
        OpCode::PushA => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            let value = cpu.ax.wrapping_add(offset);
            cpu.push(value);
        }
        OpCode::PushB => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            let value = cpu.bx.wrapping_add(offset);
            cpu.push(value);
        }
        OpCode::PushC => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            let value = cpu.cx.wrapping_add(offset);
            cpu.push(value);
        }
        OpCode::PushD => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            let value = cpu.dx.wrapping_add(offset);
            cpu.push(value);
        }
        OpCode::PopA => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            if let Some(value) = cpu.pop() {
                cpu.ax = value.wrapping_add(offset);
            }
        }
        OpCode::PopB => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            if let Some(value) = cpu.pop() {
                cpu.bx = value.wrapping_add(offset);
            }
        }
        OpCode::PopC => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            if let Some(value) = cpu.pop() {
                cpu.cx = value.wrapping_add(offset);
            }
        }
        OpCode::PopD => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            if let Some(value) = cpu.pop() {
                cpu.dx = value.wrapping_add(offset);
            }
        }
        OpCode::Jmpo => jump(sim, id, SearchDirection::Outward),
        OpCode::Jmpb => jump(sim, id, SearchDirection::Backward),
        OpCode::Call => call(sim, id),
        OpCode::Ret => ret(sim, id),
        OpCode::MovDc => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.dx = cpu.cx.wrapping_add(offset);
            let dx = cpu.dx;
            cpu.set_flags(dx);
        }
        OpCode::MovBa => {
            let offset = flaw(sim, id);
            let cpu = &mut sim.cells[id].cpu;
            cpu.bx = cpu.ax.wrapping_add(offset);
            let bx = cpu.bx;
            cpu.set_flags(bx);
        }
        OpCode::Movii => movii(sim, id),
        OpCode::Adro => address_of(sim, id, SearchDirection::Outward),
        OpCode::Adrb => address_of(sim, id, SearchDirection::Backward),
        OpCode::Adrf => address_of(sim, id, SearchDirection::Forward),
        OpCode::Mal => mal(sim, id),
        OpCode::Divide => divide(sim, id),
    }
}
