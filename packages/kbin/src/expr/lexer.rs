//! Position-preserving lexer for the expression language.

use crate::error::{bail, ensure, Result};


#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i128),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    AmpAmp,
    PipePipe,
    EqEq,
    BangEq,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    Question,
    Colon,
    ColonColon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    /// Byte offset into the source, for error messages.
    pub pos: usize,
}

pub fn lex(src: &str) -> Result<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let c = bytes[i] as char;
        let tok = match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
                continue;
            }
            '0'..='9' => {
                let (tok, next) = lex_number(src, i)?;
                i = next;
                out.push(Token { tok, pos: start });
                continue;
            }
            '"' | '\'' => {
                let (text, next) = lex_string(src, i)?;
                i = next;
                out.push(Token { tok: Tok::Str(text), pos: start });
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_')
                {
                    i += 1;
                }
                out.push(Token {
                    tok: Tok::Ident(src[start..i].to_owned()),
                    pos: start,
                });
                continue;
            }
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '~' => Tok::Tilde,
            '^' => Tok::Caret,
            '?' => Tok::Question,
            '.' => Tok::Dot,
            ',' => Tok::Comma,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    i += 1;
                    Tok::AmpAmp
                } else {
                    Tok::Amp
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    i += 1;
                    Tok::PipePipe
                } else {
                    Tok::Pipe
                }
            }
            '=' => {
                ensure!(
                    bytes.get(i + 1) == Some(&b'='),
                    CompileError,
                    "stray '=' at {} (did you mean '=='?)",
                    start,
                );
                i += 1;
                Tok::EqEq
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 1;
                    Tok::BangEq
                } else {
                    Tok::Bang
                }
            }
            '<' => match bytes.get(i + 1) {
                Some(&b'=') => {
                    i += 1;
                    Tok::Le
                }
                Some(&b'<') => {
                    i += 1;
                    Tok::Shl
                }
                _ => Tok::Lt,
            },
            '>' => match bytes.get(i + 1) {
                Some(&b'=') => {
                    i += 1;
                    Tok::Ge
                }
                Some(&b'>') => {
                    i += 1;
                    Tok::Shr
                }
                _ => Tok::Gt,
            },
            ':' => {
                if bytes.get(i + 1) == Some(&b':') {
                    i += 1;
                    Tok::ColonColon
                } else {
                    Tok::Colon
                }
            }
            other => bail!(
                CompileError,
                "unexpected character {:?} at {}",
                other,
                start,
            ),
        };
        i += 1;
        out.push(Token { tok, pos: start });
    }
    Ok(out)
}

fn lex_number(src: &str, start: usize) -> Result<(Tok, usize)> {
    let bytes = src.as_bytes();
    let mut i = start;

    let radix = if bytes[i] == b'0' && i + 1 < bytes.len() {
        match bytes[i + 1] {
            b'x' | b'X' => 16,
            b'o' | b'O' => 8,
            b'b' | b'B' => 2,
            _ => 10,
        }
    } else {
        10
    };
    if radix != 10 {
        i += 2;
        let digits_start = i;
        while i < bytes.len()
            && ((bytes[i] as char).is_digit(radix) || bytes[i] == b'_')
        {
            i += 1;
        }
        let digits: String = src[digits_start..i]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        ensure!(
            !digits.is_empty(),
            CompileError,
            "number at {} has no digits",
            start,
        );
        let v = i128::from_str_radix(&digits, radix)
            .map_err(|_| {
                crate::error::Error::new(
                    crate::error::ErrorKind::CompileError,
                    format!("number at {} out of range", start),
                )
            })?;
        return Ok((Tok::Int(v), i));
    }

    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_float = false;
    // a '.' only continues the number if a digit follows; `1.to_s` is a
    // method call on an integer
    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            is_float = true;
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text = &src[start..i];
    if is_float {
        match text.parse::<f64>() {
            Ok(v) => Ok((Tok::Float(v), i)),
            Err(_) => bail!(CompileError, "malformed float {:?} at {}", text, start),
        }
    } else {
        match text.parse::<i128>() {
            Ok(v) => Ok((Tok::Int(v), i)),
            Err(_) => bail!(CompileError, "malformed number {:?} at {}", text, start),
        }
    }
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize)> {
    let quote = src.as_bytes()[start] as char;
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();
    while let Some((off, c)) = chars.next() {
        match c {
            c if c == quote => {
                return Ok((out, start + 1 + off + c.len_utf8()));
            }
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((_, '\'')) => out.push('\''),
                Some((_, 'u')) => {
                    let mut code = 0u32;
                    for _ in 0..4 {
                        let digit = match chars.next() {
                            Some((_, d)) => d.to_digit(16),
                            None => None,
                        };
                        match digit {
                            Some(d) => code = code * 16 + d,
                            None => bail!(
                                CompileError,
                                "malformed \\u escape in string at {}",
                                start,
                            ),
                        }
                    }
                    match char::from_u32(code) {
                        Some(c) => out.push(c),
                        None => bail!(
                            CompileError,
                            "\\u{:04x} is not a scalar value",
                            code,
                        ),
                    }
                }
                Some((_, other)) => bail!(
                    CompileError,
                    "unknown escape '\\{}' in string at {}",
                    other,
                    start,
                ),
                None => break,
            },
            c => out.push(c),
        }
    }
    bail!(CompileError, "unterminated string starting at {}", start)
}


#[test]
fn test_lex_numbers() {
    assert_eq!(lex("42").unwrap()[0].tok, Tok::Int(42));
    assert_eq!(lex("0xFF").unwrap()[0].tok, Tok::Int(255));
    assert_eq!(lex("0o17").unwrap()[0].tok, Tok::Int(15));
    assert_eq!(lex("0b101").unwrap()[0].tok, Tok::Int(5));
    assert_eq!(lex("1.5").unwrap()[0].tok, Tok::Float(1.5));
    assert_eq!(lex("2e3").unwrap()[0].tok, Tok::Float(2000.0));
    assert_eq!(lex("1.25e-2").unwrap()[0].tok, Tok::Float(0.0125));
    assert!(lex("0x").is_err());
}

#[test]
fn test_lex_int_dot_is_method_access() {
    let toks = lex("1.to_s").unwrap();
    assert_eq!(toks[0].tok, Tok::Int(1));
    assert_eq!(toks[1].tok, Tok::Dot);
    assert_eq!(toks[2].tok, Tok::Ident("to_s".to_owned()));
}

#[test]
fn test_lex_strings() {
    assert_eq!(
        lex(r#""a\tbA""#).unwrap()[0].tok,
        Tok::Str("a\tbA".to_owned()),
    );
    assert_eq!(lex("'it\\'s'").unwrap()[0].tok, Tok::Str("it's".to_owned()));
    assert!(lex("\"open").is_err());
}

#[test]
fn test_lex_operators_and_positions() {
    let toks = lex("a << 2 >= b_2").unwrap();
    let kinds: Vec<&Tok> = toks.iter().map(|t| &t.tok).collect();
    assert_eq!(
        kinds,
        vec![
            &Tok::Ident("a".to_owned()),
            &Tok::Shl,
            &Tok::Int(2),
            &Tok::Ge,
            &Tok::Ident("b_2".to_owned()),
        ],
    );
    assert_eq!(toks[1].pos, 2);
    assert_eq!(toks[4].pos, 10);
    assert_eq!(
        lex("entry_type::text").unwrap()[1].tok,
        Tok::ColonColon,
    );
}
