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

//! Serving outbound zone transfers ([RFC 5936]).
//!
//! A transfer is a sequence of ordinary DNS messages on one TCP
//! connection: the zone's SOA, every record of the zone, and the SOA
//! again. Records are packed into messages of a comfortable size and
//! handed to the caller one message at a time.
//!
//! [RFC 5936]: https://datatracker.ietf.org/doc/html/rfc5936

use std::io;

use crate::db::{Namedb, Rr, Rrset, ZoneId};
use crate::message::writer::Section;
use crate::message::{Question, Writer};
use crate::rr::Type;

/// The message size transfers are packed to. Staying well under the
/// 64 KiB ceiling keeps per-message compression effective without
/// degenerate packing.
const MESSAGE_SIZE: usize = 16384;

/// Streams an AXFR of `zone`, passing each wire message to `emit`.
/// Returns `Ok(false)` when the zone is not servable (no SOA), in
/// which case nothing was emitted.
pub fn write_axfr(
    db: &Namedb,
    zone: ZoneId,
    id: u16,
    question: &Question,
    emit: &mut dyn FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<bool> {
    let soa = match db.soa(zone) {
        Some(soa) => soa.clone(),
        None => return Ok(false),
    };
    let apex_name = db.apex_name(zone).clone();

    let mut stream = Stream {
        db,
        id,
        question: Some(question.clone()),
        writer: None,
        emit,
    };

    // The stream opens and closes with the zone's SOA.
    stream.add(&apex_name, &soa)?;
    for node in db.tree.iter_subtree(db.zone(zone).apex()) {
        let owner = db.tree.node(node).name().clone();
        for rrset in db.tree.node(node).rrsets() {
            if rrset.zone != zone || (rrset.rr_type == Type::SOA && owner == apex_name) {
                continue;
            }
            stream.add(&owner, rrset)?;
        }
    }
    stream.add(&apex_name, &soa)?;
    stream.flush()?;
    Ok(true)
}

struct Stream<'a> {
    db: &'a Namedb,
    id: u16,
    question: Option<Question>,
    writer: Option<Writer>,
    emit: &'a mut dyn FnMut(&[u8]) -> io::Result<()>,
}

impl Stream<'_> {
    fn new_writer(&mut self) -> Writer {
        let mut writer = Writer::new(MESSAGE_SIZE);
        writer.set_id(self.id);
        writer.set_qr(true);
        writer.set_aa(true);
        // Only the first message carries the question.
        if let Some(question) = self.question.take() {
            writer
                .add_question(&question)
                .expect("an AXFR question always fits in an empty message");
        }
        writer
    }

    /// Adds an RRset to the stream, starting a new message whenever
    /// the current one is full. Oversized sets are split record by
    /// record.
    fn add(&mut self, owner: &crate::name::Dname, rrset: &Rrset) -> io::Result<()> {
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.new_writer(),
        };
        if writer
            .add_rrset(Section::Answer, owner, self.db, rrset, None)
            .is_ok()
        {
            self.writer = Some(writer);
            return Ok(());
        }
        for rr in &rrset.rrs {
            let mut single = Rrset::new(rrset.zone, rrset.rr_type, rrset.ttl);
            single.rrs.push(Rr::new(rr.atoms.clone()));
            if writer
                .add_rrset(Section::Answer, owner, self.db, &single, None)
                .is_err()
            {
                (self.emit)(&writer.finish())?;
                writer = self.new_writer();
                writer
                    .add_rrset(Section::Answer, owner, self.db, &single, None)
                    .expect("a single record fits in an empty transfer message");
            }
        }
        self.writer = Some(writer);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            (self.emit)(&writer.finish())?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::db::Atom;
    use crate::message::Reader;
    use crate::name::Dname;
    use crate::rr::Ttl;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn build_zone(extra_hosts: usize) -> (Namedb, ZoneId) {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let ns1 = db.tree.insert(&name("ns1.example."));
        let admin = db.tree.insert(&name("admin.example."));
        let soa = Rr::new(vec![
            Atom::Domain(ns1),
            Atom::Domain(admin),
            Atom::Blob(Box::new(7u32.to_be_bytes())),
            Atom::Blob(Box::new(3600u32.to_be_bytes())),
            Atom::Blob(Box::new(900u32.to_be_bytes())),
            Atom::Blob(Box::new(86400u32.to_be_bytes())),
            Atom::Blob(Box::new(300u32.to_be_bytes())),
        ]);
        db.add_rr(zone, &name("example."), Type::SOA, Ttl::from(3600), soa)
            .unwrap();
        for i in 0..extra_hosts {
            let owner = name(&format!("host{}.example.", i));
            let rr = Rr::new(vec![Atom::Blob(Box::new([10, 0, 1, (i % 250) as u8]))]);
            db.add_rr(zone, &owner, Type::A, Ttl::from(300), rr).unwrap();
        }
        (db, zone)
    }

    fn run_axfr(db: &Namedb, zone: ZoneId) -> Vec<Vec<u8>> {
        let question = Question {
            qname: db.apex_name(zone).clone(),
            qtype: Type::AXFR,
            qclass: Class::IN,
        };
        let mut messages = Vec::new();
        let mut emit = |m: &[u8]| {
            messages.push(m.to_vec());
            Ok(())
        };
        assert!(write_axfr(db, zone, 0x7777, &question, &mut emit).unwrap());
        messages
    }

    #[test]
    fn transfers_open_and_close_with_the_soa() {
        let (db, zone) = build_zone(3);
        let messages = run_axfr(&db, zone);
        assert_eq!(messages.len(), 1);

        let mut reader = Reader::try_from(messages[0].as_slice()).unwrap();
        assert_eq!(reader.id(), 0x7777);
        assert_eq!(reader.qdcount(), 1);
        reader.read_question().unwrap();
        let mut types = Vec::new();
        for _ in 0..reader.ancount() {
            types.push(reader.read_rr().unwrap().rr_type);
        }
        assert_eq!(types.first(), Some(&Type::SOA));
        assert_eq!(types.last(), Some(&Type::SOA));
        // SOA + 3 hosts + SOA.
        assert_eq!(types.len(), 5);
    }

    #[test]
    fn large_zones_split_into_multiple_messages() {
        let (db, zone) = build_zone(2000);
        let messages = run_axfr(&db, zone);
        assert!(messages.len() > 1);
        for message in &messages {
            assert!(message.len() <= super::MESSAGE_SIZE);
        }
        // Only the first message has the question; every message is a
        // response with the same ID.
        for (index, message) in messages.iter().enumerate() {
            let reader = Reader::try_from(message.as_slice()).unwrap();
            assert_eq!(reader.id(), 0x7777);
            assert_eq!(reader.qdcount(), if index == 0 { 1 } else { 0 });
        }
        // The last record of the last message is the closing SOA.
        let last = messages.last().unwrap();
        let mut reader = Reader::try_from(last.as_slice()).unwrap();
        let mut last_type = None;
        for _ in 0..reader.ancount() {
            last_type = Some(reader.read_rr().unwrap().rr_type);
        }
        assert_eq!(last_type, Some(Type::SOA));
    }
}
