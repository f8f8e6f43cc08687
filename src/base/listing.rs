//! Canonical text form of an instruction stream.
//!
//! One instruction per line, `<position>: <Opcode>(<arg>, ...)`; zero-arg
//! instructions omit the parentheses. Arguments are JSON-escaped strings,
//! `true`/`false`, integers, floats (always carrying a decimal point or
//! exponent), constant references `c[i]` and register references `r[i]`.
//! Serialization and parsing round-trip exactly for every value tag.

use logos::Logos;

use super::{InstructionStream, Opcode, RawInstruction, RawValue};

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // Floats always carry a decimal point or an exponent, so integers
    // stay unambiguous.
    #[regex(r"-?[0-9]+\.[0-9]+([eE][-+]?[0-9]+)?|-?[0-9]+[eE][-+]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"-?inf|NaN", |lex| match lex.slice() {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => Some(f64::NAN),
    }, priority = 10)]
    Float(f64),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| serde_json::from_str::<String>(lex.slice()).ok())]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("line {line}: unrecognized token '{snippet}'")]
    Lex { line: usize, snippet: String },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("line {line}: unknown opcode '{name}'")]
    UnknownOpcode { line: usize, name: String },
}

pub type ListingResult<T> = Result<T, ListingError>;

/// Parse a full listing. Blank lines and `//` comments are ignored.
pub fn parse_listing(source: &str) -> ListingResult<InstructionStream> {
    let mut stream = InstructionStream::new();
    for (idx, text) in source.lines().enumerate() {
        let line = idx + 1;
        let tokens = lex_line(text, line)?;
        if tokens.is_empty() {
            continue;
        }
        stream.push(parse_line(&tokens, line)?);
    }
    Ok(stream)
}

fn lex_line(text: &str, line: usize) -> ListingResult<Vec<Token>> {
    let mut lexer = Token::lexer(text);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push(token),
            Err(()) => {
                return Err(ListingError::Lex {
                    line,
                    snippet: lexer.slice().to_string(),
                });
            }
        }
    }
    Ok(tokens)
}

fn parse_line(tokens: &[Token], line: usize) -> ListingResult<(usize, RawInstruction)> {
    let mut cursor = Cursor { tokens, pos: 0, line };

    let position = match cursor.next()? {
        Token::Int(n) if *n >= 0 => *n as usize,
        other => return cursor.fail(format!("expected instruction position, found {:?}", other)),
    };
    cursor.expect(&Token::Colon)?;

    let name = match cursor.next()? {
        Token::Ident(s) => s.clone(),
        other => return cursor.fail(format!("expected opcode name, found {:?}", other)),
    };
    let opcode = Opcode::from_name(&name)
        .ok_or(ListingError::UnknownOpcode { line, name })?;

    let mut params = Vec::new();
    if cursor.peek() == Some(&Token::LParen) {
        cursor.expect(&Token::LParen)?;
        if cursor.peek() != Some(&Token::RParen) {
            loop {
                params.push(parse_value(&mut cursor)?);
                if cursor.peek() == Some(&Token::Comma) {
                    cursor.expect(&Token::Comma)?;
                } else {
                    break;
                }
            }
        }
        cursor.expect(&Token::RParen)?;
    }
    if cursor.pos != cursor.tokens.len() {
        return cursor.fail("trailing tokens after instruction".to_string());
    }

    Ok((position, RawInstruction::new(opcode, params)))
}

fn parse_value(cursor: &mut Cursor) -> ListingResult<RawValue> {
    match cursor.next()? {
        Token::Str(s) => Ok(RawValue::Str(s.clone())),
        Token::True => Ok(RawValue::Boolean(true)),
        Token::False => Ok(RawValue::Boolean(false)),
        Token::Float(f) => Ok(RawValue::Float(*f)),
        Token::Int(n) => {
            let n = *n;
            if n < i32::MIN as i64 || n > i32::MAX as i64 {
                return cursor.fail(format!("integer operand {} out of range", n));
            }
            Ok(RawValue::Integer(n as i32))
        }
        Token::Ident(name) => {
            let make = match name.as_str() {
                "c" => RawValue::Constant as fn(u32) -> RawValue,
                "r" => RawValue::Register as fn(u32) -> RawValue,
                other => {
                    let message = format!("unexpected identifier '{}'", other);
                    return cursor.fail(message);
                }
            };
            cursor.expect(&Token::LBracket)?;
            let index = match cursor.next()? {
                Token::Int(n) if *n >= 0 => *n as u32,
                other => return cursor.fail(format!("expected index, found {:?}", other)),
            };
            cursor.expect(&Token::RBracket)?;
            Ok(make(index))
        }
        other => cursor.fail(format!("expected operand, found {:?}", other)),
    }
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> ListingResult<&'a Token> {
        let token = self.tokens.get(self.pos).ok_or(ListingError::Parse {
            line: self.line,
            message: "unexpected end of line".to_string(),
        })?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, want: &Token) -> ListingResult<()> {
        let found = self.next()?;
        if found == want {
            Ok(())
        } else {
            Err(ListingError::Parse {
                line: self.line,
                message: format!("expected {:?}, found {:?}", want, found),
            })
        }
    }

    fn fail<T>(&self, message: String) -> ListingResult<T> {
        Err(ListingError::Parse { line: self.line, message })
    }
}

// ── Serialization ──

pub fn serialize_listing(stream: &InstructionStream) -> String {
    let mut out = String::new();
    for (position, instruction) in stream {
        out.push_str(&serialize_instruction(*position, instruction));
        out.push('\n');
    }
    out
}

pub fn serialize_instruction(position: usize, instruction: &RawInstruction) -> String {
    let mut out = format!("{}: {}", position, instruction.opcode);
    if !instruction.params.is_empty() {
        out.push('(');
        for (i, param) in instruction.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&serialize_value(param));
        }
        out.push(')');
    }
    out
}

pub fn serialize_value(value: &RawValue) -> String {
    match value {
        // serde_json escaping; matches what the parser un-escapes.
        RawValue::Str(s) => serde_json::to_string(s).unwrap_or_default(),
        RawValue::Boolean(b) => b.to_string(),
        RawValue::Integer(i) => i.to_string(),
        // {:?} keeps a decimal point on whole floats and round-trips exactly.
        RawValue::Float(f) if f.is_nan() => "NaN".to_string(),
        RawValue::Float(f) if f.is_infinite() => {
            if *f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
        }
        RawValue::Float(f) => format!("{:?}", f),
        RawValue::Constant(i) => format!("c[{}]", i),
        RawValue::Register(i) => format!("r[{}]", i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: RawValue) {
        let line = format!("0: Push({})", serialize_value(&value));
        let stream = parse_listing(&line).unwrap();
        assert_eq!(stream[0].1.params[0], value, "via {}", line);
    }

    #[test]
    fn roundtrip_every_tag() {
        roundtrip(RawValue::Str("hello \"quoted\"\nline".into()));
        roundtrip(RawValue::Boolean(true));
        roundtrip(RawValue::Boolean(false));
        roundtrip(RawValue::Integer(-42));
        roundtrip(RawValue::Float(3.25));
        roundtrip(RawValue::Float(42.0));
        roundtrip(RawValue::Float(1.0e300));
        roundtrip(RawValue::Constant(7));
        roundtrip(RawValue::Register(1));
    }

    #[test]
    fn roundtrip_nan_and_infinity() {
        let stream = parse_listing("0: Push(NaN, inf, -inf)").unwrap();
        let params = &stream[0].1.params;
        assert!(matches!(params[0], RawValue::Float(f) if f.is_nan()));
        assert_eq!(params[1], RawValue::Float(f64::INFINITY));
        assert_eq!(params[2], RawValue::Float(f64::NEG_INFINITY));
        let text = serialize_instruction(0, &stream[0].1);
        assert_eq!(text, "0: Push(NaN, inf, -inf)");
    }

    #[test]
    fn float_always_distinct_from_integer() {
        let stream = parse_listing("0: Push(42, 42.0)").unwrap();
        assert_eq!(stream[0].1.params[0], RawValue::Integer(42));
        assert_eq!(stream[0].1.params[1], RawValue::Float(42.0));
    }

    #[test]
    fn zero_arg_instruction_has_no_parens() {
        let text = serialize_instruction(9, &RawInstruction::end());
        assert_eq!(text, "9: End");
        let stream = parse_listing(&text).unwrap();
        assert_eq!(stream[0], (9, RawInstruction::end()));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let source = "\n// header\n0: Push(1)  // trailing\n\n4: End\n";
        let stream = parse_listing(source).unwrap();
        assert_eq!(stream.len(), 2);
        assert_eq!(stream[1].0, 4);
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let err = parse_listing("0: Frobnicate(1)").unwrap_err();
        assert!(matches!(err, ListingError::UnknownOpcode { line: 1, .. }));
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(parse_listing("Push(1)").is_err());
        assert!(parse_listing("0: Push(").is_err());
        assert!(parse_listing("0: Push(1) extra").is_err());
    }

    #[test]
    fn full_listing_roundtrip() {
        let source = "0: Push(\"x\", c[0])\n5: GetVariable\n6: BranchIfTrue(12)\n12: End\n";
        let stream = parse_listing(source).unwrap();
        assert_eq!(serialize_listing(&stream), source);
    }
}
