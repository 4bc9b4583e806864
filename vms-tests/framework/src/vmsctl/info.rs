// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding for the value block printed by `vmsctl info`.
//!
//! The control plane prints its state as a literal mapping, e.g.
//!
//! ```text
//! {'generation': 3, 'memory.target': '0', 'devices': ['vda', 'vdb']}
//! ```
//!
//! This module parses that subset of literal syntax (mappings, lists,
//! tuples, strings, integers, floats, booleans and `None`) into an
//! [`InfoValue`] tree. Nothing here ever evaluates the text.

use std::{collections::BTreeMap, fmt};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed info block at offset {offset}: {reason}")]
pub struct InfoParseError {
    pub offset: usize,
    pub reason: String,
}

/// One node of a decoded info block.
#[derive(Clone, Debug, PartialEq)]
pub enum InfoValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<InfoValue>),
    Map(BTreeMap<String, InfoValue>),
}

impl InfoValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, InfoValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Scalars render the way the control plane prints them, and strings render
/// without quotes, so `to_string()` gives the text to compare expected
/// parameter values against.
impl fmt::Display for InfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt_nested(f)?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{k}': ")?;
                    v.fmt_nested(f)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl InfoValue {
    /// Strings nested in containers keep their quotes.
    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "'{s}'"),
            other => write!(f, "{other}"),
        }
    }
}

/// The decoded result of one `vmsctl info` query. Records are produced fresh
/// for every query and never cached.
#[derive(Clone, Debug, PartialEq)]
pub struct InfoRecord {
    fields: BTreeMap<String, InfoValue>,
}

impl InfoRecord {
    /// Parses a value block, which must be a mapping.
    pub fn parse(text: &str) -> Result<Self, InfoParseError> {
        match parse_value(text)? {
            InfoValue::Map(fields) => Ok(Self { fields }),
            _ => Err(InfoParseError {
                offset: 0,
                reason: "value block is not a mapping".to_string(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&InfoValue> {
        self.fields.get(key)
    }

    /// Looks up a dotted path. A top-level key that contains the whole path
    /// (such as `memory.target`) wins over descending into nested mappings.
    pub fn get_path(&self, path: &str) -> Option<&InfoValue> {
        if let Some(v) = self.fields.get(path) {
            return Some(v);
        }

        let mut segments = path.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Parses a complete literal, rejecting trailing garbage.
pub fn parse_value(text: &str) -> Result<InfoValue, InfoParseError> {
    let mut parser = Parser { text, pos: 0 };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(parser.error("trailing characters after value"));
    }
    Ok(value)
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> InfoParseError {
        InfoParseError { offset: self.pos, reason: reason.into() }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), InfoParseError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(format!("expected '{want}', found '{c}'"))),
            None => Err(self.error(format!("expected '{want}', found end of input"))),
        }
    }

    fn value(&mut self) -> Result<InfoValue, InfoParseError> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.map(),
            Some('[') => self.sequence('[', ']'),
            Some('(') => self.sequence('(', ')'),
            Some('\'') | Some('"') => self.string().map(InfoValue::Str),
            Some(_) if self.at_prefixed_string() => {
                self.bump();
                self.string().map(InfoValue::Str)
            }
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => {
                self.number()
            }
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(c) => Err(self.error(format!("unexpected character '{c}'"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    /// Parses comma-separated items up to `close`, allowing a trailing comma.
    fn items<T>(
        &mut self,
        close: char,
        mut item: impl FnMut(&mut Self) -> Result<T, InfoParseError>,
    ) -> Result<Vec<T>, InfoParseError> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(out);
            }
            out.push(item(self)?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(out),
                Some(c) => {
                    return Err(self.error(format!(
                        "expected ',' or '{close}', found '{c}'"
                    )))
                }
                None => return Err(self.error("unterminated container")),
            }
        }
    }

    fn sequence(
        &mut self,
        open: char,
        close: char,
    ) -> Result<InfoValue, InfoParseError> {
        self.expect(open)?;
        self.items(close, Self::value).map(InfoValue::List)
    }

    fn map(&mut self) -> Result<InfoValue, InfoParseError> {
        self.expect('{')?;
        let entries = self.items('}', |p| {
            let key = match p.value()? {
                InfoValue::Str(s) => s,
                InfoValue::Int(i) => i.to_string(),
                other => {
                    return Err(p.error(format!("unsupported mapping key {other}")))
                }
            };
            p.skip_ws();
            p.expect(':')?;
            let value = p.value()?;
            Ok((key, value))
        })?;
        Ok(InfoValue::Map(entries.into_iter().collect()))
    }

    /// Whether the input starts with a unicode or bytes string literal such
    /// as `u'clone-1'`.
    fn at_prefixed_string(&self) -> bool {
        let mut chars = self.rest().chars();
        matches!(chars.next(), Some('u' | 'U' | 'b' | 'B'))
            && matches!(chars.next(), Some('\'' | '"'))
    }

    fn string(&mut self) -> Result<String, InfoParseError> {
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some(c @ ('\\' | '\'' | '"')) => c,
                        Some(c) => {
                            // Unknown escapes are kept literally.
                            out.push('\\');
                            c
                        }
                        None => return Err(self.error("unterminated string")),
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<InfoValue, InfoParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| {
            c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')
        }) {
            self.bump();
        }
        let literal = &self.text[start..self.pos];

        // Long integers carry an `L` suffix.
        if matches!(self.peek(), Some('L') | Some('l')) {
            self.bump();
        }

        if let Ok(i) = literal.parse::<i64>() {
            return Ok(InfoValue::Int(i));
        }
        literal
            .parse::<f64>()
            .map(InfoValue::Float)
            .map_err(|_| InfoParseError {
                offset: start,
                reason: format!("invalid number '{literal}'"),
            })
    }

    fn keyword(&mut self) -> Result<InfoValue, InfoParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        match &self.text[start..self.pos] {
            "True" => Ok(InfoValue::Bool(true)),
            "False" => Ok(InfoValue::Bool(false)),
            "None" => Ok(InfoValue::None),
            other => Err(InfoParseError {
                offset: start,
                reason: format!("unknown identifier '{other}'"),
            }),
        }
    }
}
