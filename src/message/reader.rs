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

//! Reading wire-format DNS messages.
//!
//! A [`Reader`] wraps a received message and hands out the header
//! fields, the question, and resource records in order. Name
//! decompression is bounded to [`MAX_POINTER_HOPS`] hops and pointers
//! must point backward, so hostile messages cannot loop the parser.

use std::fmt;

use crate::class::Class;
use crate::name::{Dname, MAX_LABEL_LEN, MAX_NAME_LEN};
use crate::rr::{Ttl, Type};

use super::{
    Opcode, Question, Rcode, ANCOUNT_START, ARCOUNT_START, HEADER_SIZE, ID_START, MAX_POINTER_HOPS,
    NSCOUNT_START, OPCODE_MASK, OPCODE_SHIFT, QDCOUNT_START, QR_MASK, RCODE_MASK, RD_MASK, TC_MASK,
};

/// A resource record read from a message.
#[derive(Clone, Debug)]
pub struct ReadRr<'a> {
    pub owner: Dname,
    pub rr_type: Type,
    pub class: u16,
    pub ttl: Ttl,
    pub rdata: &'a [u8],
    /// The offset of the record's first octet in the message.
    pub start: usize,
}

/// Reads a DNS message sequentially.
#[derive(Clone)]
pub struct Reader<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> TryFrom<&'a [u8]> for Reader<'a> {
    type Error = Error;

    fn try_from(octets: &'a [u8]) -> Result<Self, Error> {
        if octets.len() < HEADER_SIZE {
            Err(Error::Truncated)
        } else {
            Ok(Self {
                octets,
                position: HEADER_SIZE,
            })
        }
    }
}

impl<'a> Reader<'a> {
    pub fn octets(&self) -> &'a [u8] {
        self.octets
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn at_end(&self) -> bool {
        self.position == self.octets.len()
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes(self.octets[ID_START..ID_START + 2].try_into().unwrap())
    }

    pub fn qr(&self) -> bool {
        self.octets[2] & QR_MASK != 0
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from((self.octets[2] & OPCODE_MASK) >> OPCODE_SHIFT)
    }

    pub fn tc(&self) -> bool {
        self.octets[2] & TC_MASK != 0
    }

    pub fn rd(&self) -> bool {
        self.octets[2] & RD_MASK != 0
    }

    pub fn cd(&self) -> bool {
        self.octets[3] & super::CD_MASK != 0
    }

    pub fn rcode(&self) -> Rcode {
        Rcode::from(self.octets[3] & RCODE_MASK)
    }

    pub fn qdcount(&self) -> u16 {
        u16::from_be_bytes(self.octets[QDCOUNT_START..QDCOUNT_START + 2].try_into().unwrap())
    }

    pub fn ancount(&self) -> u16 {
        u16::from_be_bytes(self.octets[ANCOUNT_START..ANCOUNT_START + 2].try_into().unwrap())
    }

    pub fn nscount(&self) -> u16 {
        u16::from_be_bytes(self.octets[NSCOUNT_START..NSCOUNT_START + 2].try_into().unwrap())
    }

    pub fn arcount(&self) -> u16 {
        u16::from_be_bytes(self.octets[ARCOUNT_START..ARCOUNT_START + 2].try_into().unwrap())
    }

    /// Reads the question. Compression pointers are not allowed in the
    /// question section.
    pub fn read_question(&mut self) -> Result<Question, Error> {
        let (qname, consumed) = Dname::from_wire_uncompressed(&self.octets[self.position..])
            .map_err(|_| Error::BadName)?;
        self.position += consumed;
        let qtype = Type::from(self.read_u16()?);
        let qclass_raw = self.read_u16()?;
        Ok(Question {
            qname,
            qtype,
            qclass: Class::from(qclass_raw),
        })
    }

    /// Reads the next resource record.
    pub fn read_rr(&mut self) -> Result<ReadRr<'a>, Error> {
        let start = self.position;
        let (owner, after_owner) = read_name_at(self.octets, self.position)?;
        self.position = after_owner;
        let rr_type = Type::from(self.read_u16()?);
        let class = self.read_u16()?;
        let ttl = Ttl::from(self.read_u32()?);
        let rdlength = self.read_u16()? as usize;
        let rdata = self
            .octets
            .get(self.position..self.position + rdlength)
            .ok_or(Error::Truncated)?;
        self.position += rdlength;
        Ok(ReadRr {
            owner,
            rr_type,
            class,
            ttl,
            rdata,
            start,
        })
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        let octets = self
            .octets
            .get(self.position..self.position + 2)
            .ok_or(Error::Truncated)?;
        self.position += 2;
        Ok(u16::from_be_bytes(octets.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let octets = self
            .octets
            .get(self.position..self.position + 4)
            .ok_or(Error::Truncated)?;
        self.position += 4;
        Ok(u32::from_be_bytes(octets.try_into().unwrap()))
    }
}

/// Decodes a possibly compressed name starting at `start`, returning
/// the name and the position just after it in the original record.
/// Pointers must point backward and chains are bounded.
pub fn read_name_at(octets: &[u8], start: usize) -> Result<(Dname, usize), Error> {
    let mut wire = Vec::new();
    let mut position = start;
    let mut after: Option<usize> = None;
    let mut hops = 0;
    loop {
        let len = *octets.get(position).ok_or(Error::Truncated)? as usize;
        if len & 0xc0 == 0xc0 {
            let second = *octets.get(position + 1).ok_or(Error::Truncated)? as usize;
            let target = ((len & 0x3f) << 8) | second;
            if target >= position {
                return Err(Error::BadPointer);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(Error::BadPointer);
            }
            after.get_or_insert(position + 2);
            position = target;
        } else if len == 0 {
            wire.push(0);
            after.get_or_insert(position + 1);
            break;
        } else if len > MAX_LABEL_LEN {
            return Err(Error::BadName);
        } else {
            let label = octets
                .get(position..position + 1 + len)
                .ok_or(Error::Truncated)?;
            wire.extend_from_slice(label);
            if wire.len() + 1 > MAX_NAME_LEN {
                return Err(Error::BadName);
            }
            position += 1 + len;
        }
    }
    let name = Dname::from_wire_uncompressed_all(&wire).map_err(|_| Error::BadName)?;
    Ok((name, after.unwrap()))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// A message-parsing error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    Truncated,
    BadName,
    BadPointer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("message is truncated"),
            Self::BadName => f.write_str("invalid domain name"),
            Self::BadPointer => f.write_str("invalid compression pointer"),
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

    fn sample_query() -> Vec<u8> {
        let mut msg = vec![
            0x12, 0x34, // ID
            0x01, 0x00, // RD set
            0, 1, 0, 0, 0, 0, 0, 0, // counts
        ];
        msg.extend_from_slice(b"\x03www\x07example\x00");
        msg.extend_from_slice(&[0, 1, 0, 1]); // A IN
        msg
    }

    #[test]
    fn header_and_question_parse() {
        let msg = sample_query();
        let mut reader = Reader::try_from(msg.as_slice()).unwrap();
        assert_eq!(reader.id(), 0x1234);
        assert!(!reader.qr());
        assert!(reader.rd());
        assert_eq!(reader.opcode(), Opcode::Query);
        assert_eq!(reader.qdcount(), 1);

        let question = reader.read_question().unwrap();
        assert_eq!(question.qname, "www.example.".parse().unwrap());
        assert_eq!(question.qtype, Type::A);
        assert_eq!(question.qclass, Class::IN);
        assert!(reader.at_end());
    }

    #[test]
    fn compressed_names_resolve() {
        // A name at offset 12, then an RR whose owner is a pointer to
        // offset 14 ("example.").
        let mut msg = sample_query();
        msg[7] = 0; // qdcount 0 for clarity of the test
        let rr_start = msg.len();
        msg.extend_from_slice(&[0xc0, 16]); // pointer to "example."
        msg.extend_from_slice(&[0, 2, 0, 1]); // NS IN
        msg.extend_from_slice(&[0, 0, 14, 16]); // TTL 3600
        msg.extend_from_slice(&[0, 2, 0xc0, 12]); // RDATA: pointer to www.example.

        let (owner, after) = read_name_at(&msg, rr_start).unwrap();
        assert_eq!(owner, "example.".parse().unwrap());
        assert_eq!(after, rr_start + 2);
        let (in_rdata, _) = read_name_at(&msg, msg.len() - 2).unwrap();
        assert_eq!(in_rdata, "www.example.".parse().unwrap());
    }

    #[test]
    fn forward_pointers_are_rejected() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[0xc0, 14]); // points at itself/forward
        assert_eq!(read_name_at(&msg, 12), Err(Error::BadPointer));
    }

    #[test]
    fn pointer_chains_are_bounded() {
        // A chain of pointers, each pointing one step back.
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x01a\x00"); // a. at offset 12
        for i in 0..12 {
            let target = if i == 0 { 12 } else { 15 + 2 * (i - 1) };
            msg.extend_from_slice(&[0xc0, target as u8]);
        }
        let last = msg.len() - 2;
        assert_eq!(read_name_at(&msg, last), Err(Error::BadPointer));
    }
}
