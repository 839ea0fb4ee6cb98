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

//! Transfer-protocol plumbing: SOA snapshots, request construction,
//! and serial arithmetic.

use rand::Rng;

use crate::class::Class;
use crate::message::reader::{read_name_at, ReadRr};
use crate::message::writer::Section;
use crate::message::{Opcode, Question, Writer};
use crate::name::Dname;
use crate::rr::{Ttl, Type};

/// A SOA record as the coordinator tracks it: the timers it schedules
/// by plus enough material to reproduce the record in requests and
/// NOTIFY messages.
#[derive(Clone, Debug)]
pub struct XfrdSoa {
    pub mname: Dname,
    pub rname: Dname,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
    pub ttl: u32,
}

impl XfrdSoa {
    /// Parses a SOA out of a record read from `message`. Returns
    /// `None` when the record is not an IN SOA or is malformed.
    pub fn parse(message: &[u8], rr: &ReadRr, rdata_offset: usize) -> Option<Self> {
        if rr.rr_type != Type::SOA || rr.class != u16::from(Class::IN) {
            return None;
        }
        let (mname, after_mname) = read_name_at(message, rdata_offset).ok()?;
        let (rname, after_rname) = read_name_at(message, after_mname).ok()?;
        let fixed = message.get(after_rname..after_rname + 20)?;
        let field = |i: usize| u32::from_be_bytes(fixed[i * 4..i * 4 + 4].try_into().unwrap());
        Some(Self {
            mname,
            rname,
            serial: field(0),
            refresh: field(1),
            retry: field(2),
            expire: field(3),
            minimum: field(4),
            ttl: u32::from(rr.ttl),
        })
    }

    /// The record's uncompressed rdata.
    pub fn rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(self.mname.len() + self.rname.len() + 20);
        rdata.extend_from_slice(self.mname.wire());
        rdata.extend_from_slice(self.rname.wire());
        for value in [self.serial, self.refresh, self.retry, self.expire, self.minimum] {
            rdata.extend_from_slice(&value.to_be_bytes());
        }
        rdata
    }
}

/// Builds an outgoing query of `qtype` for `apex`. For IXFR, the
/// current SOA goes in the authority section ([RFC 1995 § 2]).
/// Returns the message and its (random) ID.
///
/// [RFC 1995 § 2]: https://datatracker.ietf.org/doc/html/rfc1995#section-2
pub fn build_request(apex: &Dname, qtype: Type, soa: Option<&XfrdSoa>) -> (Vec<u8>, u16) {
    let id: u16 = rand::thread_rng().gen();
    let mut writer = Writer::new(u16::MAX as usize);
    writer.set_id(id);
    writer
        .add_question(&Question {
            qname: apex.clone(),
            qtype,
            qclass: Class::IN,
        })
        .expect("a request question always fits");
    if let Some(soa) = soa {
        writer
            .add_raw_rr(
                Section::Authority,
                apex,
                Type::SOA,
                u16::from(Class::IN),
                Ttl::from(soa.ttl),
                &soa.rdata(),
            )
            .expect("a request SOA always fits");
    }
    (writer.finish(), id)
}

/// Builds an outgoing NOTIFY ([RFC 1996 § 3]) for `apex`, announcing
/// `soa`'s serial when known.
///
/// [RFC 1996 § 3]: https://datatracker.ietf.org/doc/html/rfc1996#section-3
pub fn build_notify(apex: &Dname, soa: Option<&XfrdSoa>) -> (Vec<u8>, u16) {
    let id: u16 = rand::thread_rng().gen();
    let mut writer = Writer::new(u16::MAX as usize);
    writer.set_id(id);
    writer.set_opcode(Opcode::Notify);
    writer.set_aa(true);
    writer
        .add_question(&Question {
            qname: apex.clone(),
            qtype: Type::SOA,
            qclass: Class::IN,
        })
        .expect("a notify question always fits");
    if let Some(soa) = soa {
        writer
            .add_raw_rr(
                Section::Answer,
                apex,
                Type::SOA,
                u16::from(Class::IN),
                Ttl::from(soa.ttl),
                &soa.rdata(),
            )
            .expect("a notify SOA always fits");
    }
    (writer.finish(), id)
}

/// Compares serials under [RFC 1982] sequence-space arithmetic:
/// whether `a` is strictly newer than `b`.
///
/// [RFC 1982]: https://datatracker.ietf.org/doc/html/rfc1982
pub fn serial_newer(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) as i32) > 0
}

/// Extracts the coordinator's view of a zone's SOA from the database.
pub fn soa_from_db(db: &crate::db::Namedb, zone: crate::db::ZoneId) -> Option<XfrdSoa> {
    let rrset = db.soa(zone)?;
    let rr = rrset.rrs.first()?;
    let mname = db.tree.node(rr.atoms.first()?.as_domain()?).name().clone();
    let rname = db.tree.node(rr.atoms.get(1)?.as_domain()?).name().clone();
    Some(XfrdSoa {
        mname,
        rname,
        serial: rr.u32_field(2)?,
        refresh: rr.u32_field(3)?,
        retry: rr.u32_field(4)?,
        expire: rr.u32_field(5)?,
        minimum: rr.u32_field(6)?,
        ttl: u32::from(rrset.ttl),
    })
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Reader;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn sample_soa(serial: u32) -> XfrdSoa {
        XfrdSoa {
            mname: name("ns1.example."),
            rname: name("admin.example."),
            serial,
            refresh: 3600,
            retry: 900,
            expire: 86400,
            minimum: 300,
            ttl: 3600,
        }
    }

    #[test]
    fn serial_arithmetic_wraps() {
        assert!(serial_newer(2, 1));
        assert!(!serial_newer(1, 2));
        assert!(!serial_newer(5, 5));
        // Wraparound: 1 is newer than 0xffffffff.
        assert!(serial_newer(1, 0xffff_ffff));
        assert!(!serial_newer(0xffff_ffff, 1));
    }

    #[test]
    fn ixfr_requests_carry_the_current_soa() {
        let soa = sample_soa(41);
        let (request, id) = build_request(&name("example."), Type::IXFR, Some(&soa));
        let mut reader = Reader::try_from(request.as_slice()).unwrap();
        assert_eq!(reader.id(), id);
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.nscount(), 1);
        let question = reader.read_question().unwrap();
        assert_eq!(question.qtype, Type::IXFR);
        let rr = reader.read_rr().unwrap();
        assert_eq!(rr.rr_type, Type::SOA);
        let rdata_offset = request.len() - rr.rdata.len();
        let parsed = XfrdSoa::parse(&request, &rr, rdata_offset).unwrap();
        assert_eq!(parsed.serial, 41);
        assert_eq!(parsed.mname, name("ns1.example."));
    }

    #[test]
    fn notifies_are_flagged_and_carry_the_serial() {
        let soa = sample_soa(7);
        let (notify, _) = build_notify(&name("example."), Some(&soa));
        let mut reader = Reader::try_from(notify.as_slice()).unwrap();
        assert_eq!(reader.opcode(), Opcode::Notify);
        assert_eq!(reader.ancount(), 1);
        reader.read_question().unwrap();
        let rr = reader.read_rr().unwrap();
        assert_eq!(rr.rr_type, Type::SOA);
    }

    #[test]
    fn soa_round_trips_through_rdata() {
        let soa = sample_soa(1234);
        let rdata = soa.rdata();
        assert_eq!(&rdata[rdata.len() - 20..][0..4], &1234u32.to_be_bytes());
    }
}
