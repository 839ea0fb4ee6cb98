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

//! Applying committed zone transfers to the database.
//!
//! A transfer arrives as a sequence of DNS messages whose answer
//! sections, concatenated, form either an AXFR (new SOA, the whole
//! zone, new SOA again) or an IXFR (new SOA, then alternating
//! deletion and addition runs bracketed by SOA markers, ending with
//! the new SOA). This module walks that record stream and mutates the
//! database accordingly, decoding record data into typed atoms under
//! the descriptor table as it goes.

use std::fmt;

use log::warn;

use crate::db::{Atom, Namedb, Rr, ZoneId};
use crate::message::reader::{read_name_at, Reader};
use crate::name::Dname;
use crate::rr::{descriptor_by_type, RdataKind, Ttl, Type};

/// Applies the parts of one committed transfer to `db`. On success,
/// returns the zone's new serial.
pub fn apply_transfer(db: &mut Namedb, zone: ZoneId, parts: &[Vec<u8>]) -> Result<u32, Error> {
    let mut state = Applier {
        db,
        zone,
        mode: Mode::Start,
        new_serial: 0,
        pending_soa: None,
        done: false,
    };
    for part in parts {
        state.apply_part(part)?;
    }
    if !state.done {
        return Err(Error::MissingFinalSoa);
    }
    Ok(state.new_serial)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    /// Waiting for the leading SOA.
    Start,

    /// Saw the leading SOA; the next record decides AXFR vs IXFR.
    AfterFirstSoa,

    /// Plain full transfer: every record is added.
    Axfr,

    /// Incremental transfer, currently deleting.
    IxfrDel,

    /// Incremental transfer, currently adding.
    IxfrAdd,
}

struct Applier<'a> {
    db: &'a mut Namedb,
    zone: ZoneId,
    mode: Mode,
    new_serial: u32,
    /// The leading SOA, held as (TTL, decompressed rdata) until it is
    /// known whether the stream is an AXFR (which must clear the zone
    /// before the SOA can be installed).
    pending_soa: Option<(Ttl, Vec<u8>)>,
    done: bool,
}

impl Applier<'_> {
    fn apply_part(&mut self, part: &[u8]) -> Result<(), Error> {
        let mut reader = Reader::try_from(part).map_err(|_| Error::Malformed)?;
        for _ in 0..reader.qdcount() {
            reader.read_question().map_err(|_| Error::Malformed)?;
        }
        for _ in 0..reader.ancount() {
            let rr = reader.read_rr().map_err(|_| Error::Malformed)?;
            let rdata_offset = reader.position() - rr.rdata.len();
            self.apply_rr(part, rr.owner, rr.rr_type, rr.ttl, rdata_offset, rr.rdata.len())?;
        }
        Ok(())
    }

    fn apply_rr(
        &mut self,
        message: &[u8],
        owner: Dname,
        rr_type: Type,
        ttl: Ttl,
        rdata_offset: usize,
        rdata_len: usize,
    ) -> Result<(), Error> {
        if self.done {
            return Err(Error::TrailingRecords);
        }
        if !owner.eq_or_subdomain_of(self.db.apex_name(self.zone)) {
            return Err(Error::OutOfZone);
        }

        let serial = if rr_type == Type::SOA {
            soa_serial_at(message, rdata_offset)
        } else {
            None
        };

        match self.mode {
            Mode::Start => {
                let serial = serial.ok_or(Error::MissingLeadingSoa)?;
                if owner != *self.db.apex_name(self.zone) {
                    return Err(Error::OutOfZone);
                }
                self.new_serial = serial;
                self.pending_soa = Some((
                    ttl,
                    decompressed_soa_rdata(message, rdata_offset).ok_or(Error::Malformed)?,
                ));
                self.mode = Mode::AfterFirstSoa;
                Ok(())
            }
            Mode::AfterFirstSoa => {
                if let Some(serial) = serial {
                    if serial != self.new_serial {
                        // An old-serial SOA starts the deletions of an
                        // incremental transfer.
                        self.mode = Mode::IxfrDel;
                        return Ok(());
                    }
                    // SOA with the new serial right away: an AXFR of a
                    // zone holding only its SOA.
                    self.start_axfr()?;
                    self.done = true;
                    return Ok(());
                }
                // Any other record: this is an AXFR.
                self.start_axfr()?;
                self.mode = Mode::Axfr;
                self.add_record(message, owner, rr_type, ttl, rdata_offset, rdata_len)
            }
            Mode::Axfr => {
                if serial == Some(self.new_serial) {
                    self.done = true;
                    return Ok(());
                }
                self.add_record(message, owner, rr_type, ttl, rdata_offset, rdata_len)
            }
            Mode::IxfrDel => {
                if serial.is_some() {
                    // The SOA marker flips to additions; it also
                    // becomes the zone's SOA.
                    self.replace_soa(message, owner, ttl, rdata_offset, rdata_len)?;
                    self.mode = Mode::IxfrAdd;
                    return Ok(());
                }
                self.remove_record(message, owner, rr_type, rdata_offset, rdata_len)
            }
            Mode::IxfrAdd => {
                if let Some(serial) = serial {
                    if serial == self.new_serial {
                        // The closing SOA (already installed as the
                        // zone SOA by the last marker).
                        self.done = true;
                        return Ok(());
                    }
                    // An old SOA: the next deletion run begins.
                    self.mode = Mode::IxfrDel;
                    return Ok(());
                }
                self.add_record(message, owner, rr_type, ttl, rdata_offset, rdata_len)
            }
        }
    }

    /// AXFR startup: clear the zone and install the buffered SOA.
    fn start_axfr(&mut self) -> Result<(), Error> {
        let (ttl, rdata) = self.pending_soa.take().ok_or(Error::Internal)?;
        self.db.clear_zone(self.zone);
        let apex = self.db.apex_name(self.zone).clone();
        self.add_record(&rdata, apex, Type::SOA, ttl, 0, rdata.len())
    }

    fn add_record(
        &mut self,
        message: &[u8],
        owner: Dname,
        rr_type: Type,
        ttl: Ttl,
        rdata_offset: usize,
        rdata_len: usize,
    ) -> Result<(), Error> {
        let rr = decode_rdata(self.db, message, rr_type, rdata_offset, rdata_len)?;
        match self.db.add_rr(self.zone, &owner, rr_type, ttl, rr) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("transfer record at {} rejected: {}", owner, e);
                Ok(()) // mirror compile behavior: count and continue
            }
        }
    }

    fn remove_record(
        &mut self,
        message: &[u8],
        owner: Dname,
        rr_type: Type,
        rdata_offset: usize,
        rdata_len: usize,
    ) -> Result<(), Error> {
        let rr = decode_rdata(self.db, message, rr_type, rdata_offset, rdata_len)?;
        if !self.db.remove_rr(self.zone, &owner, rr_type, &rr) {
            warn!("transfer deletes a record not present at {}", owner);
        }
        Ok(())
    }

    /// Installs the SOA carried by an IXFR add-marker, replacing the
    /// current one.
    fn replace_soa(
        &mut self,
        message: &[u8],
        owner: Dname,
        ttl: Ttl,
        rdata_offset: usize,
        rdata_len: usize,
    ) -> Result<(), Error> {
        let apex = self.db.apex_name(self.zone).clone();
        if owner != apex {
            return Err(Error::OutOfZone);
        }
        if let Some(old) = self.db.soa(self.zone) {
            let old_rrs: Vec<Rr> = old.rrs.clone();
            for rr in old_rrs {
                self.db.remove_rr(self.zone, &apex, Type::SOA, &rr);
            }
        }
        self.add_record(message, apex, Type::SOA, ttl, rdata_offset, rdata_len)
    }
}

/// Decodes wire record data into atoms, resolving compressed names
/// against the containing message.
pub fn decode_rdata(
    db: &mut Namedb,
    message: &[u8],
    rr_type: Type,
    rdata_offset: usize,
    rdata_len: usize,
) -> Result<Rr, Error> {
    let descriptor = descriptor_by_type(rr_type);
    let end = rdata_offset + rdata_len;
    let mut atoms = Vec::new();
    let mut position = rdata_offset;
    let mut index = 0;
    while position < end {
        let kind = descriptor.kind(index).ok_or(Error::Malformed)?;
        match kind {
            RdataKind::CompressedDname | RdataKind::UncompressedDname => {
                let (name, after) = read_name_at(message, position).map_err(|_| Error::Malformed)?;
                atoms.push(Atom::Domain(db.tree.insert(&name)));
                position = after;
            }
            RdataKind::LiteralDname => {
                let (name, after) = read_name_at(message, position).map_err(|_| Error::Malformed)?;
                atoms.push(Atom::Blob(name.wire().into()));
                position = after;
            }
            RdataKind::Byte => {
                atoms.push(Atom::Blob(fixed(message, position, 1, end)?));
                position += 1;
            }
            RdataKind::Short => {
                atoms.push(Atom::Blob(fixed(message, position, 2, end)?));
                position += 2;
            }
            RdataKind::Long | RdataKind::A => {
                atoms.push(Atom::Blob(fixed(message, position, 4, end)?));
                position += 4;
            }
            RdataKind::Aaaa => {
                atoms.push(Atom::Blob(fixed(message, position, 16, end)?));
                position += 16;
            }
            RdataKind::Text | RdataKind::BinaryLenByte => {
                let len = *message.get(position).ok_or(Error::Malformed)? as usize;
                atoms.push(Atom::Blob(fixed(message, position, 1 + len, end)?));
                position += 1 + len;
            }
            RdataKind::Binary => {
                atoms.push(Atom::Blob(
                    message.get(position..end).ok_or(Error::Malformed)?.into(),
                ));
                position = end;
            }
        }
        index += 1;
    }
    Ok(Rr::new(atoms))
}

fn fixed(message: &[u8], position: usize, len: usize, end: usize) -> Result<Box<[u8]>, Error> {
    if position + len > end {
        return Err(Error::Malformed);
    }
    Ok(message
        .get(position..position + len)
        .ok_or(Error::Malformed)?
        .into())
}

/// Reads the serial of a SOA whose rdata starts at `rdata_offset`.
pub fn soa_serial_at(message: &[u8], rdata_offset: usize) -> Option<u32> {
    let (_, after_mname) = read_name_at(message, rdata_offset).ok()?;
    let (_, after_rname) = read_name_at(message, after_mname).ok()?;
    let serial = message.get(after_rname..after_rname + 4)?;
    Some(u32::from_be_bytes(serial.try_into().unwrap()))
}

/// Rewrites SOA rdata with its names decompressed, so it can be kept
/// independently of the message it arrived in.
fn decompressed_soa_rdata(message: &[u8], rdata_offset: usize) -> Option<Vec<u8>> {
    let (mname, after_mname) = read_name_at(message, rdata_offset).ok()?;
    let (rname, after_rname) = read_name_at(message, after_mname).ok()?;
    let fixed = message.get(after_rname..after_rname + 20)?;
    let mut rdata = Vec::with_capacity(mname.len() + rname.len() + 20);
    rdata.extend_from_slice(mname.wire());
    rdata.extend_from_slice(rname.wire());
    rdata.extend_from_slice(fixed);
    Some(rdata)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    Malformed,
    MissingLeadingSoa,
    MissingFinalSoa,
    TrailingRecords,
    OutOfZone,
    Internal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed transfer message"),
            Self::MissingLeadingSoa => f.write_str("transfer does not begin with a SOA"),
            Self::MissingFinalSoa => f.write_str("transfer does not end with the new SOA"),
            Self::TrailingRecords => f.write_str("records after the final SOA"),
            Self::OutOfZone => f.write_str("record outside the zone"),
            Self::Internal => f.write_str("internal transfer-application error"),
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
    use crate::class::Class;
    use crate::message::{Question, Writer};
    use crate::query::axfr::write_axfr;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn soa_rdata(serial: u32) -> Vec<u8> {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(name("ns1.example.").wire());
        rdata.extend_from_slice(name("admin.example.").wire());
        for value in [serial, 3600, 900, 86400, 300] {
            rdata.extend_from_slice(&value.to_be_bytes());
        }
        rdata
    }

    /// Builds a one-message transfer stream from (owner, type, rdata)
    /// triples.
    fn build_stream(records: &[(&str, Type, Vec<u8>)]) -> Vec<Vec<u8>> {
        let mut writer = Writer::new(u16::MAX as usize);
        writer.set_qr(true);
        for (owner, rr_type, rdata) in records {
            writer
                .add_raw_rr(
                    crate::message::writer::Section::Answer,
                    &name(owner),
                    *rr_type,
                    u16::from(Class::IN),
                    Ttl::from(300),
                    rdata,
                )
                .unwrap();
        }
        vec![writer.finish()]
    }

    fn fresh_secondary() -> (Namedb, ZoneId) {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        (db, zone)
    }

    #[test]
    fn axfr_streams_install_the_zone() {
        let (mut db, zone) = fresh_secondary();
        let stream = build_stream(&[
            ("example.", Type::SOA, soa_rdata(4)),
            ("example.", Type::NS, name("ns1.example.").wire().to_vec()),
            ("ns1.example.", Type::A, vec![10, 0, 0, 1]),
            ("example.", Type::SOA, soa_rdata(4)),
        ]);
        let serial = apply_transfer(&mut db, zone, &stream).unwrap();
        assert_eq!(serial, 4);
        assert_eq!(db.soa_serial(zone), Some(4));
        let ns1 = db.tree.find(&name("ns1.example.")).unwrap();
        assert!(db.tree.node(ns1).find_rrset(zone, Type::A).is_some());
    }

    #[test]
    fn ixfr_streams_patch_the_zone() {
        let (mut db, zone) = fresh_secondary();
        // Install version 4 first.
        let full = build_stream(&[
            ("example.", Type::SOA, soa_rdata(4)),
            ("old.example.", Type::A, vec![10, 0, 0, 4]),
            ("keep.example.", Type::A, vec![10, 0, 0, 7]),
            ("example.", Type::SOA, soa_rdata(4)),
        ]);
        apply_transfer(&mut db, zone, &full).unwrap();

        // IXFR 4 -> 5: delete old.example., add new.example.
        let incremental = build_stream(&[
            ("example.", Type::SOA, soa_rdata(5)),
            ("example.", Type::SOA, soa_rdata(4)),
            ("old.example.", Type::A, vec![10, 0, 0, 4]),
            ("example.", Type::SOA, soa_rdata(5)),
            ("new.example.", Type::A, vec![10, 0, 0, 5]),
            ("example.", Type::SOA, soa_rdata(5)),
        ]);
        let serial = apply_transfer(&mut db, zone, &incremental).unwrap();
        assert_eq!(serial, 5);
        assert_eq!(db.soa_serial(zone), Some(5));
        assert!(db.tree.find(&name("old.example.")).is_none());
        assert!(db.tree.find(&name("new.example.")).is_some());
        assert!(db.tree.find(&name("keep.example.")).is_some());
    }

    #[test]
    fn axfr_equals_ixfr_for_the_same_end_state() {
        // Apply an AXFR of version 5 to one database and the IXFR
        // 4 -> 5 to another; the record stores must agree.
        let (mut via_axfr, zone_a) = fresh_secondary();
        let axfr = build_stream(&[
            ("example.", Type::SOA, soa_rdata(5)),
            ("keep.example.", Type::A, vec![10, 0, 0, 7]),
            ("new.example.", Type::A, vec![10, 0, 0, 5]),
            ("example.", Type::SOA, soa_rdata(5)),
        ]);
        apply_transfer(&mut via_axfr, zone_a, &axfr).unwrap();

        let (mut via_ixfr, zone_b) = fresh_secondary();
        let full = build_stream(&[
            ("example.", Type::SOA, soa_rdata(4)),
            ("old.example.", Type::A, vec![10, 0, 0, 4]),
            ("keep.example.", Type::A, vec![10, 0, 0, 7]),
            ("example.", Type::SOA, soa_rdata(4)),
        ]);
        apply_transfer(&mut via_ixfr, zone_b, &full).unwrap();
        let incremental = build_stream(&[
            ("example.", Type::SOA, soa_rdata(5)),
            ("example.", Type::SOA, soa_rdata(4)),
            ("old.example.", Type::A, vec![10, 0, 0, 4]),
            ("example.", Type::SOA, soa_rdata(5)),
            ("new.example.", Type::A, vec![10, 0, 0, 5]),
            ("example.", Type::SOA, soa_rdata(5)),
        ]);
        apply_transfer(&mut via_ixfr, zone_b, &incremental).unwrap();

        // Compare by serving both back out as AXFRs.
        let question = Question {
            qname: name("example."),
            qtype: Type::AXFR,
            qclass: Class::IN,
        };
        let dump = |db: &Namedb, zone: ZoneId| {
            let mut messages = Vec::new();
            let mut emit = |m: &[u8]| {
                messages.push(m.to_vec());
                Ok(())
            };
            write_axfr(db, zone, 1, &question, &mut emit).unwrap();
            messages
        };
        assert_eq!(dump(&via_axfr, zone_a), dump(&via_ixfr, zone_b));
    }

    #[test]
    fn out_of_zone_records_are_rejected() {
        let (mut db, zone) = fresh_secondary();
        let stream = build_stream(&[
            ("example.", Type::SOA, soa_rdata(4)),
            ("elsewhere.test.", Type::A, vec![10, 0, 0, 1]),
            ("example.", Type::SOA, soa_rdata(4)),
        ]);
        assert_eq!(apply_transfer(&mut db, zone, &stream), Err(Error::OutOfZone));
    }

    #[test]
    fn transfers_must_terminate_with_the_new_soa() {
        let (mut db, zone) = fresh_secondary();
        let stream = build_stream(&[
            ("example.", Type::SOA, soa_rdata(4)),
            ("ns1.example.", Type::A, vec![10, 0, 0, 1]),
        ]);
        assert_eq!(
            apply_transfer(&mut db, zone, &stream),
            Err(Error::MissingFinalSoa)
        );
    }
}
