//! Tokenizer for the expression grammar.
//!
//! Besides the usual literals, identifiers and operators, the lexer
//! recognizes *slot markers*: the substitution phase replaces each resolved
//! `{{path}}` token with `SLOT_OPEN <index> SLOT_CLOSE`, and the lexer turns
//! that back into [`TokenKind::Slot`].  The markers are private-use code
//! points, so they never collide with flow-author text, and slot values are
//! never re-tokenized.

use crate::error::{EvalError, Result};

/// Opens a slot marker emitted by the substitution phase.
pub const SLOT_OPEN: char = '\u{E000}';
/// Closes a slot marker emitted by the substitution phase.
pub const SLOT_CLOSE: char = '\u{E001}';

/// Kinds of token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Slot(usize),
    True,
    False,
    Null,
    Undefined,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eof,
}

/// A token and its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

/// Split `source` into tokens, terminated by [`TokenKind::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == SLOT_OPEN {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && chars[j].1 != SLOT_CLOSE {
                j += 1;
            }
            if j >= chars.len() {
                return Err(EvalError::syntax(pos, "unterminated slot marker"));
            }
            let digits: String = chars[start..j].iter().map(|(_, c)| *c).collect();
            let index = digits
                .parse::<usize>()
                .map_err(|_| EvalError::syntax(pos, "malformed slot marker"))?;
            tokens.push(Token {
                kind: TokenKind::Slot(index),
                pos,
            });
            i = j + 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && peek_is_digit(&chars, i + 1)) {
            let (number, next) = lex_number(&chars, i)?;
            tokens.push(Token {
                kind: TokenKind::Number(number),
                pos,
            });
            i = next;
            continue;
        }

        if c == '"' || c == '\'' {
            let (text, next) = lex_string(&chars, i)?;
            tokens.push(Token {
                kind: TokenKind::Str(text),
                pos,
            });
            i = next;
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_continue(chars[i].1) {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let kind = match word.as_str() {
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "null" => TokenKind::Null,
                "undefined" => TokenKind::Undefined,
                _ => TokenKind::Ident(word),
            };
            tokens.push(Token { kind, pos });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let next2 = chars.get(i + 2).map(|(_, c)| *c);
        let (kind, width) = match (c, next, next2) {
            ('=', Some('='), Some('=')) => (TokenKind::EqEqEq, 3),
            ('=', Some('='), _) => (TokenKind::EqEq, 2),
            ('!', Some('='), Some('=')) => (TokenKind::NotEqEq, 3),
            ('!', Some('='), _) => (TokenKind::NotEq, 2),
            ('<', Some('='), _) => (TokenKind::LtEq, 2),
            ('>', Some('='), _) => (TokenKind::GtEq, 2),
            ('&', Some('&'), _) => (TokenKind::AndAnd, 2),
            ('|', Some('|'), _) => (TokenKind::OrOr, 2),
            ('=', _, _) => return Err(EvalError::blocked("assignment is not permitted")),
            ('(', _, _) => (TokenKind::LParen, 1),
            (')', _, _) => (TokenKind::RParen, 1),
            ('[', _, _) => (TokenKind::LBracket, 1),
            (']', _, _) => (TokenKind::RBracket, 1),
            (',', _, _) => (TokenKind::Comma, 1),
            ('.', _, _) => (TokenKind::Dot, 1),
            ('?', _, _) => (TokenKind::Question, 1),
            (':', _, _) => (TokenKind::Colon, 1),
            ('+', _, _) => (TokenKind::Plus, 1),
            ('-', _, _) => (TokenKind::Minus, 1),
            ('*', _, _) => (TokenKind::Star, 1),
            ('/', _, _) => (TokenKind::Slash, 1),
            ('%', _, _) => (TokenKind::Percent, 1),
            ('!', _, _) => (TokenKind::Bang, 1),
            ('<', _, _) => (TokenKind::Lt, 1),
            ('>', _, _) => (TokenKind::Gt, 1),
            _ => {
                return Err(EvalError::syntax(pos, format!("unexpected character `{c}`")));
            }
        };
        tokens.push(Token { kind, pos });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: source.len(),
    });
    Ok(tokens)
}

/// Identifier start: `[a-zA-Z_$]`.
pub fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

/// Identifier continuation: `[a-zA-Z0-9_$]`.
pub fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn peek_is_digit(chars: &[(usize, char)], i: usize) -> bool {
    chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit())
}

fn lex_number(chars: &[(usize, char)], start: usize) -> Result<(f64, usize)> {
    let mut i = start;
    while i < chars.len() && chars[i].1.is_ascii_digit() {
        i += 1;
    }
    if i < chars.len() && chars[i].1 == '.' && peek_is_digit(chars, i + 1) {
        i += 1;
        while i < chars.len() && chars[i].1.is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
        let mut j = i + 1;
        if j < chars.len() && matches!(chars[j].1, '+' | '-') {
            j += 1;
        }
        if peek_is_digit(chars, j) {
            i = j;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
    let number = text
        .parse::<f64>()
        .map_err(|_| EvalError::syntax(chars[start].0, format!("invalid number `{text}`")))?;
    Ok((number, i))
}

fn lex_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize)> {
    let quote = chars[start].1;
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let Some(&(pos, esc)) = chars.get(i + 1) else {
                break;
            };
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' => out.push(esc),
                'u' => {
                    let hex: String = chars
                        .iter()
                        .skip(i + 2)
                        .take(4)
                        .map(|(_, c)| *c)
                        .collect();
                    let code = u32::from_str_radix(&hex, 16)
                        .ok()
                        .filter(|_| hex.len() == 4)
                        .and_then(char::from_u32)
                        .ok_or_else(|| EvalError::syntax(pos, "invalid unicode escape"))?;
                    out.push(code);
                    i += 4;
                }
                other => out.push(other),
            }
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }
    Err(EvalError::syntax(chars[start].0, "unterminated string literal"))
}
