// Copyright 2022 Matthew Ingwersen.
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

//! Implementation of wire-format domain names.
//!
//! The [`Dname`] type owns the uncompressed wire representation of a
//! domain name together with a table of label offsets. The offset table
//! makes the operations that the name database is built on cheap:
//! iterating labels from the root side, counting the labels two names
//! share, and comparing names in canonical DNS order
//! ([RFC 4034 § 6.1]).
//!
//! [`Dname`]'s `Ord` implementation *is* the canonical DNS order; the
//! name tree relies on this to provide predecessor and closest-encloser
//! searches. Equality and hashing are case-insensitive to match.
//!
//! [RFC 4034 § 6.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.1

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use lazy_static::lazy_static;

use crate::util::cmp_caseless;

/// The maximum length of the wire representation of a domain name.
pub const MAX_NAME_LEN: usize = 255;

/// The maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// The maximum number of labels in a domain name, including the root
/// label. (A 255-octet name of single-octet labels has 127 labels plus
/// the root.)
pub const MAX_LABEL_COUNT: usize = 128;

lazy_static! {
    static ref ROOT: Dname = Dname {
        wire: Box::new([0]),
        offsets: Box::new([0]),
    };
}

/// An owned, uncompressed wire-format domain name.
///
/// In addition to the wire octets, a `Dname` records the offset of each
/// of its labels. Offsets are kept in root-first order: offset 0 in the
/// table locates the root label, offset 1 the top-level label, and so
/// on. This mirrors the matching direction of the DNS hierarchy.
#[derive(Clone)]
pub struct Dname {
    wire: Box<[u8]>,
    offsets: Box<[u8]>,
}

impl Dname {
    /// Returns the root domain name.
    pub fn root() -> &'static Dname {
        &ROOT
    }

    /// Returns the wire representation, including the terminating root
    /// label.
    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    /// Returns the length of the wire representation in octets.
    pub fn len(&self) -> usize {
        self.wire.len()
    }

    /// Returns `false` always; even the root name has one octet. This
    /// exists to satisfy the usual `len`/`is_empty` pairing.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the number of labels, counting the root label.
    pub fn label_count(&self) -> usize {
        self.offsets.len()
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// Returns the `index`th label counting *from the root*, so that
    /// index 0 is the (empty) root label.
    pub fn label_from_root(&self, index: usize) -> &[u8] {
        let offset = self.offsets[index] as usize;
        let len = self.wire[offset] as usize;
        &self.wire[offset + 1..offset + 1 + len]
    }

    /// Returns an iterator over the labels in reading order (leftmost
    /// first), excluding the root label.
    pub fn labels(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (1..self.label_count())
            .rev()
            .map(move |index| self.label_from_root(index))
    }

    /// Returns whether the leftmost label is the wildcard label `*`.
    pub fn is_wildcard(&self) -> bool {
        self.label_count() > 1 && self.label_from_root(self.label_count() - 1) == b"*"
    }

    /// Counts the labels (including the root label) that `self` and
    /// `other` share, starting from the root.
    pub fn label_match_count(&self, other: &Dname) -> usize {
        let max = self.label_count().min(other.label_count());
        let mut count = 1;
        while count < max {
            if cmp_caseless(self.label_from_root(count), other.label_from_root(count))
                != Ordering::Equal
            {
                break;
            }
            count += 1;
        }
        count
    }

    /// Returns whether `self` equals `other` or is a subdomain of it.
    pub fn eq_or_subdomain_of(&self, other: &Dname) -> bool {
        self.label_match_count(other) == other.label_count()
    }

    /// Returns whether `self` is a proper subdomain of `other`.
    pub fn is_subdomain_of(&self, other: &Dname) -> bool {
        self.label_count() > other.label_count() && self.eq_or_subdomain_of(other)
    }

    /// Returns the name consisting of the rightmost `label_count`
    /// labels of `self` (counting the root label). Passing
    /// `self.label_count()` returns a copy of `self`; passing 1 returns
    /// the root name.
    pub fn suffix(&self, label_count: usize) -> Dname {
        assert!(label_count >= 1 && label_count <= self.label_count());
        let offset = self.offsets[label_count - 1] as usize;
        let wire: Box<[u8]> = self.wire[offset..].into();
        let offsets = self.offsets[..label_count]
            .iter()
            .map(|o| o - offset as u8)
            .collect();
        Dname { wire, offsets }
    }

    /// Constructs a name by prepending `label` to `self`.
    pub fn prepend(&self, label: &[u8]) -> Result<Dname, Error> {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::BadLabel);
        }
        if self.len() + label.len() + 1 > MAX_NAME_LEN || self.label_count() >= MAX_LABEL_COUNT {
            return Err(Error::TooLong);
        }
        let mut wire = Vec::with_capacity(self.len() + label.len() + 1);
        wire.push(label.len() as u8);
        wire.extend_from_slice(label);
        wire.extend_from_slice(&self.wire);
        let shift = (label.len() + 1) as u8;
        let mut offsets = Vec::with_capacity(self.offsets.len() + 1);
        offsets.extend(self.offsets.iter().map(|o| o + shift));
        offsets.push(0);
        Ok(Dname {
            wire: wire.into(),
            offsets: offsets.into(),
        })
    }

    /// Constructs a name from a sequence of labels (in reading order)
    /// followed by the labels of `suffix`.
    pub fn concatenate(labels: &[&[u8]], suffix: &Dname) -> Result<Dname, Error> {
        let mut name = suffix.clone();
        for label in labels.iter().rev() {
            name = name.prepend(label)?;
        }
        Ok(name)
    }

    /// Parses an uncompressed wire-format name from the beginning of
    /// `octets`, returning the name and the number of octets it
    /// occupies.
    pub fn from_wire_uncompressed(octets: &[u8]) -> Result<(Dname, usize), Error> {
        let mut offsets_ltr = Vec::new();
        let mut position = 0;
        loop {
            let len = *octets.get(position).ok_or(Error::Truncated)? as usize;
            if len == 0 {
                offsets_ltr.push(position as u8);
                position += 1;
                break;
            } else if len > MAX_LABEL_LEN {
                return Err(Error::BadLabel);
            } else if position + 1 + len >= MAX_NAME_LEN {
                return Err(Error::TooLong);
            }
            offsets_ltr.push(position as u8);
            position += 1 + len;
        }
        if offsets_ltr.len() > MAX_LABEL_COUNT {
            return Err(Error::TooLong);
        }
        offsets_ltr.reverse();
        Ok((
            Dname {
                wire: octets[..position].into(),
                offsets: offsets_ltr.into(),
            },
            position,
        ))
    }

    /// Like [`Dname::from_wire_uncompressed`], but requires the name to
    /// occupy the entirety of `octets`.
    pub fn from_wire_uncompressed_all(octets: &[u8]) -> Result<Dname, Error> {
        let (name, len) = Self::from_wire_uncompressed(octets)?;
        if len == octets.len() {
            Ok(name)
        } else {
            Err(Error::TrailingData)
        }
    }

    /// Parses a textual domain name relative to `origin`. A name ending
    /// in a dot is absolute; otherwise the origin's labels are
    /// appended. The `@` shorthand produces the origin itself. Escapes
    /// of the forms `\X` and `\DDD` are processed.
    pub fn from_text(text: &str, origin: Option<&Dname>) -> Result<Dname, Error> {
        let bytes = text.as_bytes();
        if bytes == b"@" {
            return origin.cloned().ok_or(Error::RelativeWithoutOrigin);
        }
        if bytes == b"." {
            return Ok(Self::root().clone());
        }

        let mut labels: Vec<Vec<u8>> = Vec::new();
        let mut label: Vec<u8> = Vec::new();
        let mut absolute = false;
        let mut iter = bytes.iter().copied().peekable();
        while let Some(c) = iter.next() {
            match c {
                b'.' => {
                    if label.is_empty() {
                        return Err(Error::BadLabel);
                    }
                    labels.push(std::mem::take(&mut label));
                    if iter.peek().is_none() {
                        absolute = true;
                    }
                }
                b'\\' => {
                    let first = iter.next().ok_or(Error::BadEscape)?;
                    if first.is_ascii_digit() {
                        let second = iter.next().ok_or(Error::BadEscape)?;
                        let third = iter.next().ok_or(Error::BadEscape)?;
                        if !second.is_ascii_digit() || !third.is_ascii_digit() {
                            return Err(Error::BadEscape);
                        }
                        let value = (first - b'0') as u16 * 100
                            + (second - b'0') as u16 * 10
                            + (third - b'0') as u16;
                        if value > 255 {
                            return Err(Error::BadEscape);
                        }
                        label.push(value as u8);
                    } else {
                        label.push(first);
                    }
                }
                _ => label.push(c),
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::BadLabel);
            }
        }
        if !label.is_empty() {
            labels.push(label);
        }

        let suffix = if absolute {
            Self::root().clone()
        } else {
            origin.cloned().ok_or(Error::RelativeWithoutOrigin)?
        };
        let label_refs: Vec<&[u8]> = labels.iter().map(|l| l.as_slice()).collect();
        Self::concatenate(&label_refs, &suffix)
    }
}

impl PartialEq for Dname {
    fn eq(&self, other: &Self) -> bool {
        self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl Eq for Dname {}

impl PartialOrd for Dname {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dname {
    /// Canonical DNS ordering: labels are compared from the root side,
    /// caselessly; where one name is a proper suffix of another, the
    /// shorter sorts first.
    fn cmp(&self, other: &Self) -> Ordering {
        let max = self.label_count().min(other.label_count());
        for index in 1..max {
            match cmp_caseless(self.label_from_root(index), other.label_from_root(index)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.label_count().cmp(&other.label_count())
    }
}

impl Hash for Dname {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for octet in self.wire.iter() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

impl FromStr for Dname {
    type Err = Error;

    /// Parses an absolute textual domain name (one ending in a dot).
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::from_text(text, None)
    }
}

impl fmt::Display for Dname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels() {
            for &octet in label {
                match octet {
                    b'.' | b'\\' | b'"' | b';' | b'(' | b')' => {
                        write!(f, "\\{}", octet as char)?
                    }
                    0x21..=0x7e => write!(f, "{}", octet as char)?,
                    _ => write!(f, "\\{:03}", octet)?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Dname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dname({})", self)
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error produced when parsing or constructing a domain name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The name would exceed 255 octets or 128 labels.
    TooLong,

    /// A label is empty, exceeds 63 octets, or is otherwise invalid.
    BadLabel,

    /// An escape sequence is malformed.
    BadEscape,

    /// The wire data ended in the middle of the name.
    Truncated,

    /// There were octets remaining after the name.
    TrailingData,

    /// A relative name was given without an origin to complete it.
    RelativeWithoutOrigin,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooLong => f.write_str("domain name is too long"),
            Self::BadLabel => f.write_str("invalid label"),
            Self::BadEscape => f.write_str("invalid escape sequence"),
            Self::Truncated => f.write_str("domain name is truncated"),
            Self::TrailingData => f.write_str("trailing data after domain name"),
            Self::RelativeWithoutOrigin => {
                f.write_str("relative domain name used without an origin")
            }
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

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    #[test]
    fn parsing_and_display_round_trip() {
        for text in ["example.", "ns1.example.", "a.b.c.d.e.f."] {
            assert_eq!(name(text).to_string(), text);
        }
        assert_eq!(Dname::root().to_string(), ".");
    }

    #[test]
    fn parsing_handles_escapes() {
        let escaped = name("a\\.b.example.");
        assert_eq!(escaped.label_count(), 3);
        assert_eq!(escaped.label_from_root(2), b"a.b");
        let numeric = name("a\\032b.example.");
        assert_eq!(numeric.label_from_root(2), b"a b");
        assert!("a\\31.example.".parse::<Dname>().is_err());
    }

    #[test]
    fn relative_names_require_an_origin() {
        let origin = name("example.");
        let www = Dname::from_text("www", Some(&origin)).unwrap();
        assert_eq!(www, name("www.example."));
        assert_eq!(Dname::from_text("@", Some(&origin)).unwrap(), origin);
        assert!(Dname::from_text("www", None).is_err());
    }

    #[test]
    fn wire_parsing_validates() {
        let (parsed, len) = Dname::from_wire_uncompressed(b"\x03www\x07example\x00xx").unwrap();
        assert_eq!(len, 13);
        assert_eq!(parsed, name("www.example."));
        assert!(Dname::from_wire_uncompressed(b"\x03ww").is_err());
        assert!(Dname::from_wire_uncompressed_all(b"\x00\x00").is_err());
    }

    #[test]
    fn maximum_length_names_are_accepted() {
        // Four 62-octet labels plus a 1-octet label and the root label
        // come to exactly 255 octets on the wire.
        let l62 = "a".repeat(62);
        let text = format!("{0}.{0}.{0}.{0}.a.", l62);
        let parsed: Dname = text.parse().unwrap();
        assert_eq!(parsed.len(), 255);
        let too_long = format!("{0}.{0}.{0}.{0}.aa.", l62);
        assert_eq!(too_long.parse::<Dname>(), Err(Error::TooLong));
    }

    #[test]
    fn canonical_order_follows_rfc_4034() {
        // The ordered example from RFC 4034 § 6.1.
        let ordered = [
            "example.",
            "a.example.",
            "yljkjljk.a.example.",
            "Z.a.example.",
            "zABC.a.EXAMPLE.",
            "z.example.",
            "\\001.z.example.",
            "*.z.example.",
            "\\200.z.example.",
        ];
        for pair in ordered.windows(2) {
            assert!(
                name(pair[0]) < name(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1],
            );
        }
    }

    #[test]
    fn equality_ignores_case() {
        assert_eq!(name("EXAMPLE."), name("example."));
        assert_ne!(name("example."), name("example.com."));
    }

    #[test]
    fn label_match_count_counts_from_root() {
        let a = name("x.y.example.");
        let b = name("z.y.example.");
        assert_eq!(a.label_match_count(&b), 3);
        assert_eq!(a.label_match_count(Dname::root()), 1);
        assert!(a.is_subdomain_of(&name("example.")));
        assert!(!a.is_subdomain_of(&name("ample.")));
    }

    #[test]
    fn suffix_and_prepend_work() {
        let full = name("a.b.example.");
        assert_eq!(full.suffix(3), name("b.example."));
        assert_eq!(full.suffix(1), *Dname::root());
        let wild = name("example.").prepend(b"*").unwrap();
        assert_eq!(wild, name("*.example."));
        assert!(wild.is_wildcard());
    }
}
