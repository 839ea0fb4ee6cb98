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

//! The static type-descriptor table.
//!
//! For every RR type Belfry understands, the table records the
//! wire-format layout of each RDATA field. The zone compiler consults
//! it to decode textual record data into typed atoms, the message
//! layer to decode wire records and to know which embedded domain
//! names may be compressed, and the database image to know which atoms
//! are stored as domain-number references.
//!
//! The layout language follows [RFC 1035 § 3.3] and the later RFCs
//! defining each type. Per [RFC 3597 § 4], only RR types defined in
//! RFC 1035 itself use compressed domain names in their RDATA.
//!
//! [RFC 1035 § 3.3]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.3
//! [RFC 3597 § 4]: https://datatracker.ietf.org/doc/html/rfc3597#section-4

use super::Type;

/// The wire format of a single RDATA field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RdataKind {
    /// A domain name that may be compressed on the wire. Stored as a
    /// domain reference into the name tree.
    CompressedDname,

    /// A domain name that must never be compressed. Also stored as a
    /// domain reference.
    UncompressedDname,

    /// A domain name carried verbatim as octets (never a tree
    /// reference); used where the octets are covered by a signature,
    /// such as the RRSIG signer name and the NSEC next name.
    LiteralDname,

    /// An unsigned 8-bit integer.
    Byte,

    /// An unsigned 16-bit integer.
    Short,

    /// An unsigned 32-bit integer.
    Long,

    /// An IPv4 address (four octets).
    A,

    /// An IPv6 address (sixteen octets).
    Aaaa,

    /// A `<character-string>`: one length octet followed by that many
    /// octets of text.
    Text,

    /// One length octet followed by that many octets of binary data
    /// (NSEC3 salts and hashes).
    BinaryLenByte,

    /// All remaining octets of the RDATA.
    Binary,
}

impl RdataKind {
    /// Returns whether a field of this kind is stored as a domain
    /// reference into the name tree.
    pub fn is_domain(self) -> bool {
        matches!(self, Self::CompressedDname | Self::UncompressedDname)
    }
}

/// The maximum number of RDATA atoms a single record may carry. This
/// bounds the repeated fields of TXT-like types.
pub const MAX_RDATA_ATOMS: usize = 64;

/// Describes the RDATA layout of one RR type.
#[derive(Debug)]
pub struct Descriptor {
    /// The field layout. If `repeat_last` is set, the final entry may
    /// occur any number of times (up to [`MAX_RDATA_ATOMS`]).
    pub wire: &'static [RdataKind],

    /// Whether the last field repeats (TXT and SPF strings).
    pub repeat_last: bool,
}

impl Descriptor {
    /// Returns the kind of the field at `index`, accounting for a
    /// repeating final field. `None` means the record has too many
    /// fields for its type.
    pub fn kind(&self, index: usize) -> Option<RdataKind> {
        if index < self.wire.len() {
            Some(self.wire[index])
        } else if self.repeat_last && index < MAX_RDATA_ATOMS {
            self.wire.last().copied()
        } else {
            None
        }
    }

    /// The maximum number of fields a record of this type may have.
    pub fn maximum(&self) -> usize {
        if self.repeat_last {
            MAX_RDATA_ATOMS
        } else {
            self.wire.len()
        }
    }
}

macro_rules! descriptor {
    ([$($kind:ident),*]) => {
        Descriptor { wire: &[$(RdataKind::$kind),*], repeat_last: false }
    };
    ([$($kind:ident),*], repeat) => {
        Descriptor { wire: &[$(RdataKind::$kind),*], repeat_last: true }
    };
}

static COMPRESSED_DNAME: Descriptor = descriptor!([CompressedDname]);
static UNCOMPRESSED_DNAME: Descriptor = descriptor!([UncompressedDname]);
static TWO_COMPRESSED_DNAMES: Descriptor = descriptor!([CompressedDname, CompressedDname]);
static A: Descriptor = descriptor!([A]);
static AAAA: Descriptor = descriptor!([Aaaa]);
static SOA: Descriptor =
    descriptor!([CompressedDname, CompressedDname, Long, Long, Long, Long, Long]);
static WKS: Descriptor = descriptor!([A, Byte, Binary]);
static HINFO: Descriptor = descriptor!([Text, Text]);
static MX: Descriptor = descriptor!([Short, CompressedDname]);
static TXT: Descriptor = descriptor!([Text], repeat);
static RP: Descriptor = descriptor!([UncompressedDname, UncompressedDname]);
static AFSDB: Descriptor = descriptor!([Short, UncompressedDname]);
static SIG: Descriptor =
    descriptor!([Short, Byte, Byte, Long, Long, Long, Short, LiteralDname, Binary]);
static KEY: Descriptor = descriptor!([Short, Byte, Byte, Binary]);
static LOC: Descriptor = descriptor!([Binary]);
static NXT: Descriptor = descriptor!([UncompressedDname, Binary]);
static SRV: Descriptor = descriptor!([Short, Short, Short, UncompressedDname]);
static NAPTR: Descriptor = descriptor!([Short, Short, Text, Text, Text, UncompressedDname]);
static KX: Descriptor = descriptor!([Short, UncompressedDname]);
static CERT: Descriptor = descriptor!([Short, Short, Byte, Binary]);
static DS: Descriptor = descriptor!([Short, Byte, Byte, Binary]);
static SSHFP: Descriptor = descriptor!([Byte, Byte, Binary]);
static NSEC: Descriptor = descriptor!([LiteralDname, Binary]);
static NSEC3: Descriptor = descriptor!([Byte, Byte, Short, BinaryLenByte, BinaryLenByte, Binary]);
static NSEC3PARAM: Descriptor = descriptor!([Byte, Byte, Short, BinaryLenByte]);
static TLSA: Descriptor = descriptor!([Byte, Byte, Byte, Binary]);
static SVCB: Descriptor = descriptor!([Short, UncompressedDname, Binary]);
static TSIG: Descriptor = descriptor!([LiteralDname, Binary]);
static GENERIC: Descriptor = descriptor!([Binary]);

/// Looks up the descriptor for `rr_type`. Unknown types fall back to a
/// single opaque field covering the whole RDATA, per [RFC 3597 § 3].
///
/// [RFC 3597 § 3]: https://datatracker.ietf.org/doc/html/rfc3597#section-3
pub fn descriptor_by_type(rr_type: Type) -> &'static Descriptor {
    match rr_type {
        Type::A => &A,
        Type::NS
        | Type::MD
        | Type::MF
        | Type::CNAME
        | Type::MB
        | Type::MG
        | Type::MR
        | Type::PTR => &COMPRESSED_DNAME,
        Type::SOA => &SOA,
        Type::WKS => &WKS,
        Type::HINFO => &HINFO,
        Type::MINFO => &TWO_COMPRESSED_DNAMES,
        Type::MX => &MX,
        Type::TXT | Type::SPF => &TXT,
        Type::RP => &RP,
        Type::AFSDB => &AFSDB,
        Type::SIG | Type::RRSIG => &SIG,
        Type::KEY | Type::DNSKEY => &KEY,
        Type::AAAA => &AAAA,
        Type::LOC => &LOC,
        Type::NXT => &NXT,
        Type::SRV => &SRV,
        Type::NAPTR => &NAPTR,
        Type::KX => &KX,
        Type::CERT => &CERT,
        Type::DNAME => &UNCOMPRESSED_DNAME,
        Type::DS => &DS,
        Type::SSHFP => &SSHFP,
        Type::NSEC => &NSEC,
        Type::NSEC3 => &NSEC3,
        Type::NSEC3PARAM => &NSEC3PARAM,
        Type::TLSA => &TLSA,
        Type::SVCB | Type::HTTPS => &SVCB,
        Type::TSIG => &TSIG,
        _ => &GENERIC,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soa_layout_matches_rfc_1035() {
        let soa = descriptor_by_type(Type::SOA);
        assert_eq!(soa.wire.len(), 7);
        assert!(soa.wire[0].is_domain());
        assert!(soa.wire[1].is_domain());
        assert_eq!(soa.kind(2), Some(RdataKind::Long));
        assert_eq!(soa.kind(7), None);
    }

    #[test]
    fn txt_strings_repeat() {
        let txt = descriptor_by_type(Type::TXT);
        assert_eq!(txt.kind(0), Some(RdataKind::Text));
        assert_eq!(txt.kind(17), Some(RdataKind::Text));
        assert_eq!(txt.maximum(), MAX_RDATA_ATOMS);
    }

    #[test]
    fn post_rfc1035_names_are_uncompressed() {
        assert_eq!(
            descriptor_by_type(Type::SRV).kind(3),
            Some(RdataKind::UncompressedDname)
        );
        // But signature-covered names are not tree references at all.
        assert_eq!(
            descriptor_by_type(Type::RRSIG).kind(7),
            Some(RdataKind::LiteralDname)
        );
    }

    #[test]
    fn unknown_types_fall_back_to_opaque_rdata() {
        let descriptor = descriptor_by_type(Type::from(731));
        assert_eq!(descriptor.kind(0), Some(RdataKind::Binary));
        assert_eq!(descriptor.maximum(), 1);
    }
}
