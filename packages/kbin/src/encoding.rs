//! String encode/decode for the encodings a schema may name.
//!
//! Encoding names are matched case-insensitively with separators ignored,
//! so `UTF-8`, `utf8` and `Utf_8` all resolve the same way.

use crate::error::{bail, ensure, Result};


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Known {
    Utf8,
    Ascii,
    Latin1,
    Utf16Le,
    Utf16Be,
}

fn lookup(name: &str) -> Result<Known> {
    let norm: String = name
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_uppercase)
        .collect();
    Ok(match norm.as_str() {
        "UTF8" => Known::Utf8,
        "ASCII" | "USASCII" => Known::Ascii,
        "ISO88591" | "LATIN1" => Known::Latin1,
        "UTF16LE" => Known::Utf16Le,
        "UTF16BE" => Known::Utf16Be,
        _ => bail!(CompileError, "unsupported encoding {:?}", name),
    })
}

pub fn decode(bytes: &[u8], encoding: &str) -> Result<String> {
    match lookup(encoding)? {
        Known::Utf8 => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(e) => bail!(RangeError, "invalid UTF-8 at byte {}", e.valid_up_to()),
        },
        Known::Ascii => {
            if let Some(i) = bytes.iter().position(|&b| b > 0x7F) {
                bail!(RangeError, "byte {:#04x} at {} is not ASCII", bytes[i], i);
            }
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
        Known::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        Known::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
        Known::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
    }
}

fn decode_utf16(bytes: &[u8], conv: fn([u8; 2]) -> u16) -> Result<String> {
    ensure!(
        bytes.len() % 2 == 0,
        RangeError,
        "UTF-16 input of odd length {}",
        bytes.len(),
    );
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| conv([c[0], c[1]]))
        .collect();
    match String::from_utf16(&units) {
        Ok(s) => Ok(s),
        Err(_) => bail!(RangeError, "invalid UTF-16 code unit sequence"),
    }
}

pub fn encode(text: &str, encoding: &str) -> Result<Vec<u8>> {
    match lookup(encoding)? {
        Known::Utf8 => Ok(text.as_bytes().to_vec()),
        Known::Ascii => {
            if let Some(c) = text.chars().find(|c| !c.is_ascii()) {
                bail!(RangeError, "character {:?} is not ASCII", c);
            }
            Ok(text.bytes().collect())
        }
        Known::Latin1 => {
            let mut out = Vec::with_capacity(text.len());
            for c in text.chars() {
                let n = c as u32;
                ensure!(
                    n <= 0xFF,
                    RangeError,
                    "character {:?} is outside ISO-8859-1",
                    c,
                );
                out.push(n as u8);
            }
            Ok(out)
        }
        Known::Utf16Le => Ok(text
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect()),
        Known::Utf16Be => Ok(text
            .encode_utf16()
            .flat_map(|u| u.to_be_bytes())
            .collect()),
    }
}


#[test]
fn test_name_normalization() {
    assert_eq!(decode(b"hi", "utf-8").unwrap(), "hi");
    assert_eq!(decode(b"hi", "UTF_8").unwrap(), "hi");
    assert_eq!(decode(b"hi", "us-ascii").unwrap(), "hi");
    assert_eq!(
        decode(b"hi", "EBCDIC").unwrap_err().kind(),
        crate::error::ErrorKind::CompileError,
    );
}

#[test]
fn test_ascii_rejects_high_bytes() {
    assert_eq!(
        decode(&[b'a', 0x80], "ASCII").unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
    assert_eq!(decode(&[0xE9], "latin1").unwrap(), "\u{e9}");
}

#[test]
fn test_utf16_round_trip() {
    let text = "k\u{e4}itai \u{1F600}";
    for enc in ["UTF-16LE", "UTF-16BE"] {
        let bytes = encode(text, enc).unwrap();
        assert_eq!(decode(&bytes, enc).unwrap(), text);
    }
    assert_eq!(
        decode(&[0x00], "UTF-16LE").unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
}

#[test]
fn test_latin1_encode_range() {
    assert_eq!(encode("caf\u{e9}", "ISO-8859-1").unwrap(), b"caf\xe9");
    assert!(encode("\u{4e2d}", "ISO-8859-1").is_err());
}
