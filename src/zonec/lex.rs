// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Tokenization of the [RFC 1035 § 5] zone-file format.
//!
//! Zone files are line-oriented, but parentheses extend a record
//! across physical lines, leading whitespace is significant (it means
//! "same owner as the previous record"), semicolons start comments,
//! and both quoted strings and `\DDD`/`\c` escapes appear. The
//! [`Lexer`] handles all of that and hands the parser one logical
//! line at a time as a sequence of [`Field`]s.
//!
//! Escape sequences are left intact in unquoted fields, because their
//! interpretation depends on what the field turns out to be (an
//! escaped dot in a domain name must not be confused with a label
//! separator). Quoted fields are always data, so their escapes are
//! decoded immediately.
//!
//! [RFC 1035 § 5]: https://datatracker.ietf.org/doc/html/rfc1035#section-5

use std::fmt;

/// One field of a logical zone-file line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub text: Vec<u8>,
    pub quoted: bool,
}

impl Field {
    /// Decodes the `\DDD` and `\c` escapes of an unquoted field.
    /// Quoted fields were decoded by the lexer already.
    pub fn unescaped(&self) -> Result<Vec<u8>, Error> {
        if self.quoted {
            return Ok(self.text.clone());
        }
        unescape(&self.text)
    }

    /// The field as UTF-8 text, for fields that are naturally ASCII
    /// (numbers, type mnemonics, and the like).
    pub fn as_str(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.text).or(Err(Error::NotText))
    }
}

/// A logical line: its fields, its starting physical line number, and
/// whether it began with whitespace.
#[derive(Debug)]
pub struct Line {
    pub number: usize,
    pub leading_whitespace: bool,
    pub fields: Vec<Field>,
}

/// Tokenizes a zone file held in memory.
pub struct Lexer<'a> {
    input: &'a [u8],
    position: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            position: 0,
            line: 1,
        }
    }

    /// Produces the next logical line with at least one field, or
    /// `None` at end of input.
    pub fn next_line(&mut self) -> Result<Option<Line>, (usize, Error)> {
        loop {
            if self.position >= self.input.len() {
                return Ok(None);
            }
            let number = self.line;
            let leading_whitespace = matches!(self.peek(), Some(b' ' | b'\t'));
            let fields = self.lex_logical_line().map_err(|e| (self.line, e))?;
            if fields.is_empty() {
                continue; // blank or comment-only line
            }
            return Ok(Some(Line {
                number,
                leading_whitespace,
                fields,
            }));
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += 1;
            if c == b'\n' {
                self.line += 1;
            }
        }
        c
    }

    fn lex_logical_line(&mut self) -> Result<Vec<Field>, Error> {
        let mut fields = Vec::new();
        let mut paren_depth = 0usize;
        loop {
            match self.peek() {
                None => {
                    if paren_depth > 0 {
                        return Err(Error::UnbalancedParens);
                    }
                    return Ok(fields);
                }
                Some(b'\n') => {
                    self.bump();
                    if paren_depth == 0 {
                        return Ok(fields);
                    }
                }
                Some(b' ' | b'\t' | b'\r') => {
                    self.bump();
                }
                Some(b';') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                Some(b'(') => {
                    paren_depth += 1;
                    self.bump();
                }
                Some(b')') => {
                    paren_depth = paren_depth.checked_sub(1).ok_or(Error::UnbalancedParens)?;
                    self.bump();
                }
                Some(b'"') => {
                    self.bump();
                    fields.push(self.lex_quoted()?);
                }
                Some(_) => {
                    fields.push(self.lex_unquoted());
                }
            }
        }
    }

    fn lex_quoted(&mut self) -> Result<Field, Error> {
        let mut text = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(Error::UnterminatedString),
                Some(b'"') => {
                    self.bump();
                    return Ok(Field { text, quoted: true });
                }
                Some(b'\\') => {
                    self.bump();
                    text.push(self.unescape_one()?);
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_unquoted(&mut self) -> Field {
        let mut text = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' | b'\n' | b';' | b'(' | b')' | b'"' => break,
                b'\\' => {
                    // Keep the escape for the parser, but consume the
                    // escaped octet so that an escaped delimiter does
                    // not end the field.
                    text.push(c);
                    self.bump();
                    if let Some(escaped) = self.bump() {
                        text.push(escaped);
                        if escaped.is_ascii_digit() {
                            for _ in 0..2 {
                                if let Some(digit) = self.bump() {
                                    text.push(digit);
                                }
                            }
                        }
                    }
                }
                _ => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        Field {
            text,
            quoted: false,
        }
    }

    fn unescape_one(&mut self) -> Result<u8, Error> {
        let first = self.bump().ok_or(Error::BadEscape)?;
        if first.is_ascii_digit() {
            let second = self.bump().ok_or(Error::BadEscape)?;
            let third = self.bump().ok_or(Error::BadEscape)?;
            if !second.is_ascii_digit() || !third.is_ascii_digit() {
                return Err(Error::BadEscape);
            }
            let value =
                (first - b'0') as u16 * 100 + (second - b'0') as u16 * 10 + (third - b'0') as u16;
            u8::try_from(value).or(Err(Error::BadEscape))
        } else {
            Ok(first)
        }
    }
}

/// Decodes `\DDD` and `\c` escapes in a byte string.
pub fn unescape(input: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().copied();
    while let Some(c) = iter.next() {
        if c != b'\\' {
            out.push(c);
            continue;
        }
        let first = iter.next().ok_or(Error::BadEscape)?;
        if first.is_ascii_digit() {
            let second = iter.next().ok_or(Error::BadEscape)?;
            let third = iter.next().ok_or(Error::BadEscape)?;
            if !second.is_ascii_digit() || !third.is_ascii_digit() {
                return Err(Error::BadEscape);
            }
            let value =
                (first - b'0') as u16 * 100 + (second - b'0') as u16 * 10 + (third - b'0') as u16;
            out.push(u8::try_from(value).or(Err(Error::BadEscape))?);
        } else {
            out.push(first);
        }
    }
    Ok(out)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// A tokenization error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    UnbalancedParens,
    UnterminatedString,
    BadEscape,
    NotText,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnbalancedParens => f.write_str("unbalanced parentheses"),
            Self::UnterminatedString => f.write_str("unterminated quoted string"),
            Self::BadEscape => f.write_str("invalid escape sequence"),
            Self::NotText => f.write_str("field is not valid text"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(input: &[u8]) -> Vec<Line> {
        let mut lexer = Lexer::new(input);
        let mut lines = Vec::new();
        while let Some(line) = lexer.next_line().unwrap() {
            lines.push(line);
        }
        lines
    }

    fn texts(line: &Line) -> Vec<&[u8]> {
        line.fields.iter().map(|f| f.text.as_slice()).collect()
    }

    #[test]
    fn fields_and_comments() {
        let lines = lex_all(b"@ IN SOA ns1 admin ; trailing comment\n; whole-line comment\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(
            texts(&lines[0]),
            [&b"@"[..], b"IN", b"SOA", b"ns1", b"admin"]
        );
    }

    #[test]
    fn parentheses_extend_lines() {
        let lines = lex_all(b"@ SOA ns1 admin (\n  1 ; serial\n  3600 900\n  86400 3600 )\nns1 A 10.0.0.1\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].fields.len(), 9);
        assert_eq!(lines[1].number, 5);
        assert!(!lines[1].leading_whitespace);
    }

    #[test]
    fn leading_whitespace_is_reported() {
        let lines = lex_all(b"owner A 10.0.0.1\n    AAAA ::1\n");
        assert!(!lines[0].leading_whitespace);
        assert!(lines[1].leading_whitespace);
    }

    #[test]
    fn quoted_strings_keep_spaces_and_decode_escapes() {
        let lines = lex_all(b"@ TXT \"hello world\" \"semi;colon\" \"esc\\034aped\"\n");
        let fields = &lines[0].fields;
        assert_eq!(fields[1].text, b"hello world");
        assert!(fields[1].quoted);
        assert_eq!(fields[2].text, b"semi;colon");
        assert_eq!(fields[3].text, b"esc\"aped");
    }

    #[test]
    fn unquoted_escapes_are_preserved_for_the_parser() {
        let lines = lex_all(b"a\\.b A 10.0.0.1\n");
        assert_eq!(lines[0].fields[0].text, b"a\\.b");
        assert_eq!(
            lines[0].fields[0].unescaped().unwrap(),
            b"a.b"
        );
    }

    #[test]
    fn errors_are_reported() {
        let mut lexer = Lexer::new(b"@ TXT \"unterminated\n");
        assert!(matches!(
            lexer.next_line(),
            Err((1, Error::UnterminatedString))
        ));
        let mut lexer = Lexer::new(b"@ SOA ( 1 2\n");
        assert!(matches!(lexer.next_line(), Err((_, Error::UnbalancedParens))));
    }
}
