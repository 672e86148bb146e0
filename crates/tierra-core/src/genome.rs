//! Genome text format: the line-oriented `.tie` layout used by the disk
//! genebank, plus the classic 80-instruction ancestor.
//!
//! Header lines (`format: ...`, `genotype: ...`) precede a literal `CODE`
//! marker; each following code line carries one mnemonic and an optional
//! `;` comment. Mnemonics are matched case-insensitively.

use std::fmt::Write as _;

use thiserror::Error;

use crate::isa::OpCode;

/// Errors raised while parsing a genome file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenomeParseError {
    /// The `CODE` marker never appeared.
    #[error("genome has no CODE section")]
    MissingCodeMarker,
    /// A code line did not start with a known mnemonic.
    #[error("unknown mnemonic '{mnemonic}' on line {line}")]
    UnknownMnemonic { line: usize, mnemonic: String },
    /// The code section contained no instructions.
    #[error("genome has an empty CODE section")]
    Empty,
}

/// Parse genome text into opcodes. Lines before `CODE` are metadata and
/// ignored; blank lines, comment lines, and `track N:` sub-headers inside
/// the code block are skipped.
pub fn parse_genome(text: &str) -> Result<Vec<u8>, GenomeParseError> {
    let mut opcodes = Vec::new();
    let mut in_code = false;
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if !in_code {
            if line == "CODE" {
                in_code = true;
            }
            continue;
        }
        if line.is_empty() || line.starts_with(';') || line.starts_with("track") {
            continue;
        }
        let mnemonic = line
            .split(';')
            .next()
            .unwrap_or("")
            .split_whitespace()
            .next()
            .unwrap_or("");
        if mnemonic.is_empty() {
            continue;
        }
        match OpCode::from_mnemonic(mnemonic) {
            Some(op) => opcodes.push(op.byte()),
            None => {
                return Err(GenomeParseError::UnknownMnemonic {
                    line: index + 1,
                    mnemonic: mnemonic.to_string(),
                });
            }
        }
    }
    if !in_code {
        return Err(GenomeParseError::MissingCodeMarker);
    }
    if opcodes.is_empty() {
        return Err(GenomeParseError::Empty);
    }
    Ok(opcodes)
}

/// Render a genome in `.tie` layout.
#[must_use]
pub fn format_genome(genome: &[u8], name: &str, parent: &str) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str("format: 3  bits: 0\n");
    let _ = writeln!(out, "genotype: {name}  parent genotype: {parent}");
    out.push_str("\nCODE\n\ntrack 0:\n\n");
    for (offset, &byte) in genome.iter().enumerate() {
        let _ = writeln!(out, "{:<8}; {offset:3}", OpCode::from_byte(byte).mnemonic());
    }
    out.push('\n');
    out
}

/// The classic self-replicating ancestor (genotype `0080aaa`): locates its
/// own bounds via the boundary templates, allocates a daughter with `mal`,
/// copies itself with the `movii` loop, and divides.
pub const ANCESTOR: [u8; 80] = [
    1, 1, 1, 1, // beginning marker
    4,  // zero: cx = 0
    2,  // not0: cx = 1
    3,  // shl: cx = 2
    3,  // shl: cx = 4 (template length)
    24, // movDC: dx = cx
    28, // adrb: find the start marker backward
    0, 0, 0, 0, // complement of the beginning marker
    7,  // subAAC: ax -= cx, ax = own start
    25, // movBA: bx = ax
    29, // adrf: find the end marker forward
    0, 0, 0, 1, // complement of the end marker
    8, // incA: include the trailing instruction
    6, // subCAB: cx = ax - bx = own size
    1, 1, 0, 1, // reproduction loop marker
    30, // mal: allocate cx bytes, daughter start to ax
    22, // call: copy procedure
    0, 0, 1, 1, // complement of the copy procedure marker
    31, // divide
    20, // jmpo: back to the reproduction loop
    0, 0, 1, 0, // complement of the reproduction loop marker
    5, // ifz: spacer between templates
    1, 1, 0, 0, // copy procedure marker
    12, // pushA
    13, // pushB
    14, // pushC
    1, 0, 1, 0, // copy loop marker
    26, // movii: soup[ax] = soup[bx]
    10, // decC
    5,  // ifz: exit the loop when cx reaches zero
    20, // jmpo: to the copy exit
    0, 1, 0, 0, // complement of the copy exit marker
    8,  // incA
    9,  // incB
    21, // jmpb: back to the copy loop
    0, 1, 0, 1, // complement of the copy loop marker
    5, // ifz: spacer
    1, 0, 1, 1, // copy exit marker
    18, // popC
    17, // popB
    16, // popA
    23, // ret
    1, 1, 1, 0, // end marker
    5, // ifz: trailing spacer, keeps creatures separated
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_is_eighty_instructions_of_valid_opcodes() {
        assert_eq!(ANCESTOR.len(), 80);
        assert!(ANCESTOR.iter().all(|&byte| byte < 32));
        // Boundary markers sit where the address templates expect them.
        assert_eq!(&ANCESTOR[0..4], &[1, 1, 1, 1]);
        assert_eq!(&ANCESTOR[75..79], &[1, 1, 1, 0]);
        assert_eq!(ANCESTOR[51], OpCode::Movii.byte());
        assert_eq!(ANCESTOR[27], OpCode::Mal.byte());
        assert_eq!(ANCESTOR[33], OpCode::Divide.byte());
    }

    #[test]
    fn format_then_parse_round_trips() {
        let text = format_genome(&ANCESTOR, "0080aaa", "0666god");
        assert!(text.contains("genotype: 0080aaa"));
        assert!(text.contains("CODE"));
        let parsed = parse_genome(&text).expect("parse");
        assert_eq!(parsed, ANCESTOR);
    }

    #[test]
    fn parser_accepts_mixed_case_and_comments() {
        let text = "\
format: 3  bits: 0
genotype: test  parent genotype: none

CODE

track 0:
NOP1     ; 0
MovII    ; copies a byte
zero
";
        let parsed = parse_genome(text).expect("parse");
        assert_eq!(
            parsed,
            vec![
                OpCode::Nop1.byte(),
                OpCode::Movii.byte(),
                OpCode::Zero.byte()
            ]
        );
    }

    #[test]
    fn parser_rejects_malformed_input() {
        assert_eq!(
            parse_genome("no code marker here"),
            Err(GenomeParseError::MissingCodeMarker)
        );
        assert_eq!(parse_genome("CODE\n\n"), Err(GenomeParseError::Empty));
        let err = parse_genome("CODE\nbogus ; comment\n").unwrap_err();
        assert_eq!(
            err,
            GenomeParseError::UnknownMnemonic {
                line: 2,
                mnemonic: "bogus".into()
            }
        );
    }
}
