//! Recursive-descent parser over the token stream, one function per
//! precedence level.
//!
//! The ladder, loosest binding first: ternary, `||`, `&&`, `|`, `^`, `&`,
//! equality, relational, additive, shift, multiplicative, unary, postfix.
//! Note that shift binds tighter than `+`/`-`.

use crate::error::{bail, ensure, Result};
use super::{
    ast::{BinOp, Expr, UnaryOp},
    lexer::{lex, Tok, Token},
};


pub fn parse(src: &str) -> Result<Expr> {
    let tokens = lex(src)?;
    ensure!(!tokens.is_empty(), CompileError, "empty expression");
    let mut parser = Parser { tokens, idx: 0 };
    let expr = parser.ternary()?;
    ensure!(
        parser.idx == parser.tokens.len(),
        CompileError,
        "trailing input at {} in expression",
        parser.tokens[parser.idx].pos,
    );
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

macro_rules! binop_levels {
    ($($name:ident -> $next:ident { $($tok:ident => $op:ident,)* })*)=>{$(
        fn $name(&mut self) -> Result<Expr> {
            let mut lhs = self.$next()?;
            loop {
                let op = match self.peek() {
                    $(Some(&Tok::$tok) => BinOp::$op,)*
                    _ => break,
                };
                self.idx += 1;
                let rhs = self.$next()?;
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
            }
            Ok(lhs)
        }
    )*};
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.idx).map(|t| &t.tok)
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.idx)
            .or_else(|| self.tokens.last())
            .map(|t| t.pos)
            .unwrap_or(0)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        ensure!(
            self.eat(&tok),
            CompileError,
            "expected {} at {} in expression",
            what,
            self.pos(),
        );
        Ok(())
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(&Tok::Ident(ref name)) => {
                let name = name.clone();
                self.idx += 1;
                Ok(name)
            }
            _ => bail!(
                CompileError,
                "expected {} at {} in expression",
                what,
                self.pos(),
            ),
        }
    }

    fn ternary(&mut self) -> Result<Expr> {
        let cond = self.logical_or()?;
        if !self.eat(&Tok::Question) {
            return Ok(cond);
        }
        let then = self.ternary()?;
        self.expect(Tok::Colon, "':' of ternary")?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    binop_levels!(
        logical_or -> logical_and {
            PipePipe => Or,
        }
        logical_and -> bit_or {
            AmpAmp => And,
        }
        bit_or -> bit_xor {
            Pipe => BitOr,
        }
        bit_xor -> bit_and {
            Caret => BitXor,
        }
        bit_and -> equality {
            Amp => BitAnd,
        }
        equality -> relational {
            EqEq => Eq,
            BangEq => Ne,
        }
        relational -> additive {
            Lt => Lt,
            Gt => Gt,
            Le => Le,
            Ge => Ge,
        }
        additive -> shift {
            Plus => Add,
            Minus => Sub,
        }
        shift -> multiplicative {
            Shl => Shl,
            Shr => Shr,
        }
        multiplicative -> unary {
            Star => Mul,
            Slash => Div,
            Percent => Rem,
        }
    );

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(&Tok::Bang) => Some(UnaryOp::Not),
            Some(&Tok::Minus) => Some(UnaryOp::Neg),
            Some(&Tok::Tilde) => Some(UnaryOp::BitNot),
            _ => None,
        };
        match op {
            Some(op) => {
                self.idx += 1;
                Ok(Expr::Unary(op, Box::new(self.unary()?)))
            }
            None => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let name = self.expect_ident("member name after '.'")?;
                if name == "as" && self.peek() == Some(&Tok::Lt) {
                    self.idx += 1;
                    let target = self.expect_ident("cast target type")?;
                    self.expect(Tok::Gt, "'>' of cast")?;
                    self.expect(Tok::LParen, "'(' of cast")?;
                    self.expect(Tok::RParen, "')' of cast")?;
                    expr = Expr::Cast { recv: Box::new(expr), target };
                } else if self.peek() == Some(&Tok::LParen) {
                    self.idx += 1;
                    let args = self.args()?;
                    expr = Expr::Call {
                        recv: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Field(Box::new(expr), name);
                }
            } else if self.eat(&Tok::LBracket) {
                let index = self.ternary()?;
                self.expect(Tok::RBracket, "']' of index")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    /// Arguments after a consumed '('.
    fn args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(Tok::RParen, "')' of argument list")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let tok = match self.tokens.get(self.idx) {
            Some(t) => t.tok.clone(),
            None => bail!(
                CompileError,
                "expression ends where a value was expected",
            ),
        };
        self.idx += 1;
        Ok(match tok {
            Tok::Int(v) => Expr::Int(v),
            Tok::Float(v) => Expr::Float(v),
            Tok::Str(s) => Expr::Str(s),
            Tok::LParen => {
                let inner = self.ternary()?;
                self.expect(Tok::RParen, "closing ')'")?;
                inner
            }
            Tok::LBracket => {
                let mut elems = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        elems.push(self.ternary()?);
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(Tok::RBracket, "']' of array literal")?;
                        break;
                    }
                }
                Expr::Array(elems)
            }
            Tok::Ident(name) => self.ident_primary(name)?,
            other => bail!(
                CompileError,
                "unexpected {:?} at {} in expression",
                other,
                self.tokens[self.idx - 1].pos,
            ),
        })
    }

    fn ident_primary(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            "null" => return Ok(Expr::Null),
            "_" => return Ok(Expr::SelfVal),
            "_io" => return Ok(Expr::Io),
            "_parent" => return Ok(Expr::Parent),
            "_root" => return Ok(Expr::Root),
            "_index" => return Ok(Expr::IndexVar),
            "_bytes_remaining" => return Ok(Expr::BytesRemaining),
            "sizeof" | "alignof" if self.peek() == Some(&Tok::LParen) => {
                self.idx += 1;
                let inner = self.ternary()?;
                self.expect(Tok::RParen, "')' of sizeof/alignof")?;
                return Ok(if name == "sizeof" {
                    Expr::SizeOf(Box::new(inner))
                } else {
                    Expr::AlignOf(Box::new(inner))
                });
            }
            _ => {}
        }
        // enum constant: ident("::" ident)+
        let mut segments = vec![name];
        while self.peek() == Some(&Tok::ColonColon) {
            self.idx += 1;
            segments.push(self.expect_ident("name after '::'")?);
        }
        if segments.len() == 1 {
            Ok(Expr::Ident(segments.pop().unwrap()))
        } else {
            let label = segments.pop().unwrap();
            Ok(Expr::EnumConst {
                enum_path: segments.join("::"),
                label,
            })
        }
    }
}


#[cfg(test)]
fn b(e: Expr) -> Box<Expr> {
    Box::new(e)
}

#[test]
fn test_precedence_shift_binds_tighter_than_add() {
    assert_eq!(
        parse("1 + 2 << 3").unwrap(),
        Expr::Binary(
            BinOp::Add,
            b(Expr::Int(1)),
            b(Expr::Binary(BinOp::Shl, b(Expr::Int(2)), b(Expr::Int(3)))),
        ),
    );
    assert_eq!(
        parse("a >> 2 + b").unwrap(),
        Expr::Binary(
            BinOp::Add,
            b(Expr::Binary(
                BinOp::Shr,
                b(Expr::Ident("a".to_owned())),
                b(Expr::Int(2)),
            )),
            b(Expr::Ident("b".to_owned())),
        ),
    );
}

#[test]
fn test_precedence_cmp_binds_tighter_than_bitand() {
    // the ladder puts & below ==, so this parses without parentheses
    assert_eq!(
        parse("a == 1 & b == 2").unwrap(),
        Expr::Binary(
            BinOp::BitAnd,
            b(Expr::Binary(
                BinOp::Eq,
                b(Expr::Ident("a".to_owned())),
                b(Expr::Int(1)),
            )),
            b(Expr::Binary(
                BinOp::Eq,
                b(Expr::Ident("b".to_owned())),
                b(Expr::Int(2)),
            )),
        ),
    );
}

#[test]
fn test_ternary_nests_right() {
    let e = parse("a ? 1 : b ? 2 : 3").unwrap();
    match e {
        Expr::Ternary { otherwise, .. } => {
            assert!(matches!(*otherwise, Expr::Ternary { .. }));
        }
        other => panic!("expected ternary, got {:?}", other),
    }
}

#[test]
fn test_postfix_chain() {
    assert_eq!(
        parse("_root.entries[2].name.length").unwrap(),
        Expr::Field(
            b(Expr::Field(
                b(Expr::Index(
                    b(Expr::Field(b(Expr::Root), "entries".to_owned())),
                    b(Expr::Int(2)),
                )),
                "name".to_owned(),
            )),
            "length".to_owned(),
        ),
    );
}

#[test]
fn test_cast_and_calls() {
    assert_eq!(
        parse("x.as<u4>()").unwrap(),
        Expr::Cast {
            recv: b(Expr::Ident("x".to_owned())),
            target: "u4".to_owned(),
        },
    );
    assert_eq!(
        parse("s.substring(1, 1 + 2)").unwrap(),
        Expr::Call {
            recv: b(Expr::Ident("s".to_owned())),
            method: "substring".to_owned(),
            args: vec![
                Expr::Int(1),
                Expr::Binary(BinOp::Add, b(Expr::Int(1)), b(Expr::Int(2))),
            ],
        },
    );
    // a field merely named "as"
    assert_eq!(
        parse("x.as").unwrap(),
        Expr::Field(b(Expr::Ident("x".to_owned())), "as".to_owned()),
    );
}

#[test]
fn test_enum_const_and_array_literal() {
    assert_eq!(
        parse("entry_type::text").unwrap(),
        Expr::EnumConst {
            enum_path: "entry_type".to_owned(),
            label: "text".to_owned(),
        },
    );
    assert_eq!(
        parse("[0x10, 0x20]").unwrap(),
        Expr::Array(vec![Expr::Int(16), Expr::Int(32)]),
    );
}

#[test]
fn test_sizeof_and_errors() {
    assert_eq!(
        parse("sizeof(x)").unwrap(),
        Expr::SizeOf(b(Expr::Ident("x".to_owned()))),
    );
    assert_eq!(
        parse("alignof(x)").unwrap(),
        Expr::AlignOf(b(Expr::Ident("x".to_owned()))),
    );
    assert!(parse("").is_err());
    assert!(parse("1 +").is_err());
    assert!(parse("(1").is_err());
    assert!(parse("1 2").is_err());
}
