//! Byte processors: transformations applied to raw bytes after the read and
//! before the sub-parse (and inverted by the serializer after encoding).
//!
//! The set is closed: `xor`, `rol`/`ror`, `zlib`. Directive arguments are
//! expression sources; the interpreter evaluates them and hands the finished
//! `Processor` here.

use crate::error::{bail, ensure, error, Result};
use flate2::{
    read::ZlibDecoder,
    write::ZlibEncoder,
    Compression,
};
use std::io::{Read, Write};


/// A `process:` directive split into its name and raw argument sources,
/// eg `xor(0x5f)` or `rol(shift_amount)`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub args: Vec<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessKind {
    Xor,
    Rol,
    Ror,
    Zlib,
}

impl ProcessSpec {
    pub fn parse(src: &str) -> Result<Self> {
        let src = src.trim();
        let (name, args) = match src.find('(') {
            None => (src, Vec::new()),
            Some(open) => {
                ensure!(
                    src.ends_with(')'),
                    CompileError,
                    "malformed process directive {:?}",
                    src,
                );
                let inner = &src[open + 1..src.len() - 1];
                let args = split_args(inner);
                (&src[..open], args)
            }
        };
        let kind = match name {
            "xor" => ProcessKind::Xor,
            "rol" => ProcessKind::Rol,
            "ror" => ProcessKind::Ror,
            "zlib" => ProcessKind::Zlib,
            other => bail!(CompileError, "unknown process {:?}", other),
        };
        let want_args = match kind {
            ProcessKind::Xor => 1..=1,
            ProcessKind::Rol | ProcessKind::Ror => 1..=2,
            ProcessKind::Zlib => 0..=0,
        };
        ensure!(
            want_args.contains(&args.len()),
            CompileError,
            "process {:?} takes {:?} arguments, got {}",
            name,
            want_args,
            args.len(),
        );
        Ok(ProcessSpec { kind, args })
    }
}

/// Split comma-separated argument sources, respecting nesting and quotes.
pub(crate) fn split_args(inner: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut in_str: Option<char> = None;
    let mut cur = String::new();
    for c in inner.chars() {
        match in_str {
            Some(q) => {
                cur.push(c);
                if c == q {
                    in_str = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    in_str = Some(c);
                    cur.push(c);
                }
                '(' | '[' => {
                    depth += 1;
                    cur.push(c);
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    cur.push(c);
                }
                ',' if depth == 0 => {
                    args.push(cur.trim().to_owned());
                    cur = String::new();
                }
                _ => cur.push(c),
            },
        }
    }
    if !cur.trim().is_empty() {
        args.push(cur.trim().to_owned());
    }
    args
}


/// A processor with its arguments already evaluated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Processor {
    /// Single-byte or repeating key.
    Xor { key: Vec<u8> },
    Rol { amount: u32, group: u32 },
    Ror { amount: u32, group: u32 },
    Zlib,
}

impl Processor {
    /// Parse-direction transformation.
    pub fn apply(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            &Processor::Xor { ref key } => xor_bytes(data, key),
            &Processor::Rol { amount, group } => rotate(data, amount, group),
            &Processor::Ror { amount, group } => {
                rotate(data, 8 - (amount % 8), group)
            }
            &Processor::Zlib => zlib_decompress(data),
        }
    }

    /// Serialize-direction inverse of `apply`.
    pub fn unapply(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            &Processor::Xor { ref key } => xor_bytes(data, key),
            &Processor::Rol { amount, group } => {
                rotate(data, 8 - (amount % 8), group)
            }
            &Processor::Ror { amount, group } => rotate(data, amount, group),
            &Processor::Zlib => Ok(zlib_compress(data)),
        }
    }
}

fn xor_bytes(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    ensure!(!key.is_empty(), CompileError, "xor key is empty");
    Ok(data
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ key[i % key.len()])
        .collect())
}

/// Rotate each byte left by `amount` bits. Only group size 1 is defined.
fn rotate(data: &[u8], amount: u32, group: u32) -> Result<Vec<u8>> {
    ensure!(
        group == 1,
        CompileError,
        "rotate group size {} not supported, only 1",
        group,
    );
    let amount = amount % 8;
    Ok(data.iter().map(|&b| b.rotate_left(amount)).collect())
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| error!(Io, "zlib inflate failed: {}", e))?;
    Ok(out)
}

fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    // writing to a Vec cannot fail
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}


#[test]
fn test_parse_directives() {
    assert_eq!(
        ProcessSpec::parse("xor(0x5f)").unwrap(),
        ProcessSpec {
            kind: ProcessKind::Xor,
            args: vec!["0x5f".to_owned()],
        },
    );
    assert_eq!(
        ProcessSpec::parse("rol(3)").unwrap().kind,
        ProcessKind::Rol,
    );
    assert_eq!(ProcessSpec::parse("zlib").unwrap().args.len(), 0);
    assert_eq!(
        ProcessSpec::parse("xor([0x10, 0x20])").unwrap().args,
        vec!["[0x10, 0x20]".to_owned()],
    );
    assert!(ProcessSpec::parse("rot13").is_err());
    assert!(ProcessSpec::parse("zlib(1)").is_err());
}

#[test]
fn test_xor_is_self_inverse() {
    let p = Processor::Xor { key: vec![0x5F] };
    let data = b"kaitai".to_vec();
    let once = p.apply(&data).unwrap();
    assert_ne!(once, data);
    assert_eq!(p.unapply(&once).unwrap(), data);

    let p = Processor::Xor { key: vec![1, 2, 3] };
    let once = p.apply(&data).unwrap();
    assert_eq!(p.apply(&once).unwrap(), data);
}

#[test]
fn test_rotate_inverts() {
    let p = Processor::Rol { amount: 3, group: 1 };
    let data = vec![0b1000_0001, 0xFF, 0x00, 0x5A];
    let rolled = p.apply(&data).unwrap();
    assert_eq!(rolled[0], 0b0000_1100);
    assert_eq!(p.unapply(&rolled).unwrap(), data);
}

#[test]
fn test_zlib_round_trip() {
    let p = Processor::Zlib;
    let data = b"hello hello hello hello".to_vec();
    let packed = p.unapply(&data).unwrap();
    assert_eq!(p.apply(&packed).unwrap(), data);
    assert_eq!(
        p.apply(b"not zlib at all").unwrap_err().kind(),
        crate::error::ErrorKind::Io,
    );
}
