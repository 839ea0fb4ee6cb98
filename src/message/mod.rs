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

//! Wire-format DNS messages: reading, writing, and TSIG.

use std::fmt;

use crate::class::Class;
use crate::name::Dname;
use crate::rr::Type;

pub mod reader;
pub mod tsig;
pub mod writer;

pub use reader::Reader;
pub use writer::Writer;

////////////////////////////////////////////////////////////////////////
// HEADER LAYOUT                                                      //
////////////////////////////////////////////////////////////////////////

/// The size of the DNS message header.
pub const HEADER_SIZE: usize = 12;

pub(crate) const ID_START: usize = 0;
pub(crate) const FLAGS_BYTE_0: usize = 2;
pub(crate) const FLAGS_BYTE_1: usize = 3;
pub(crate) const QDCOUNT_START: usize = 4;
pub(crate) const ANCOUNT_START: usize = 6;
pub(crate) const NSCOUNT_START: usize = 8;
pub(crate) const ARCOUNT_START: usize = 10;

pub(crate) const QR_MASK: u8 = 0x80;
pub(crate) const OPCODE_MASK: u8 = 0x78;
pub(crate) const OPCODE_SHIFT: u8 = 3;
pub(crate) const AA_MASK: u8 = 0x04;
pub(crate) const TC_MASK: u8 = 0x02;
pub(crate) const RD_MASK: u8 = 0x01;
pub(crate) const RA_MASK: u8 = 0x80;
pub(crate) const CD_MASK: u8 = 0x10;
pub(crate) const RCODE_MASK: u8 = 0x0f;

/// The maximum number of compression-pointer hops tolerated when
/// decoding a name, to defuse hostile messages.
pub const MAX_POINTER_HOPS: usize = 10;

////////////////////////////////////////////////////////////////////////
// OPCODES AND RCODES                                                 //
////////////////////////////////////////////////////////////////////////

/// A DNS opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    Query,
    IQuery,
    Status,
    Notify,
    Update,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(raw: u8) -> Self {
        match raw & 0x0f {
            0 => Self::Query,
            1 => Self::IQuery,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            other => Self::Other(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Other(raw) => raw & 0x0f,
        }
    }
}

/// A basic (4-bit) RCODE.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    NotAuth,
    Other(u8),
}

impl From<u8> for Rcode {
    fn from(raw: u8) -> Self {
        match raw & 0x0f {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            9 => Self::NotAuth,
            other => Self::Other(other),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(rcode: Rcode) -> Self {
        match rcode {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::NotAuth => 9,
            Rcode::Other(raw) => raw & 0x0f,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoError => f.write_str("NOERROR"),
            Self::FormErr => f.write_str("FORMERR"),
            Self::ServFail => f.write_str("SERVFAIL"),
            Self::NxDomain => f.write_str("NXDOMAIN"),
            Self::NotImp => f.write_str("NOTIMP"),
            Self::Refused => f.write_str("REFUSED"),
            Self::NotAuth => f.write_str("NOTAUTH"),
            Self::Other(raw) => write!(f, "RCODE{}", raw),
        }
    }
}

/// A 12-bit extended RCODE as used with EDNS and TSIG. The values
/// beyond 15 are TSIG/EDNS error codes ([RFC 8945 § 3]).
///
/// [RFC 8945 § 3]: https://datatracker.ietf.org/doc/html/rfc8945#section-3
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtendedRcode(pub u16);

impl ExtendedRcode {
    pub const NOERROR: ExtendedRcode = ExtendedRcode(0);
    pub const BADVERS: ExtendedRcode = ExtendedRcode(16);
    pub const BADSIG: ExtendedRcode = ExtendedRcode(16);
    pub const BADKEY: ExtendedRcode = ExtendedRcode(17);
    pub const BADTIME: ExtendedRcode = ExtendedRcode(18);
}

////////////////////////////////////////////////////////////////////////
// QUESTIONS                                                          //
////////////////////////////////////////////////////////////////////////

/// The question section entry of a DNS message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub qname: Dname,
    pub qtype: Type,
    pub qclass: Class,
}

/// The QCLASS `*` (ANY) wire value.
pub const QCLASS_ANY: u16 = 255;
