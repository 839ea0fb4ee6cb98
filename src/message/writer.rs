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

//! Writing wire-format DNS messages.
//!
//! The [`Writer`] builds a message section by section. All owner
//! names, and the compressible names that type descriptors identify
//! inside record data, share one compression table. Entries record
//! how many pointer hops a reader needs from that position, and names
//! are never written in a way that would take a reader more than
//! [`MAX_POINTER_HOPS`](super::MAX_POINTER_HOPS) hops or forward in
//! the message.
//!
//! Every RRset is written transactionally: if it does not fit within
//! the message size limit, the writer rolls the message back to its
//! state before the set and reports [`Error::Truncation`], so the
//! caller can decide between dropping the set and setting TC.

use std::fmt;

use crate::class::Class;
use crate::db::{Atom, Namedb, Rr, Rrset};
use crate::name::Dname;
use crate::rr::{descriptor_by_type, RdataKind, Ttl, Type};

use super::{
    ExtendedRcode, Opcode, Question, Rcode, AA_MASK, ANCOUNT_START, ARCOUNT_START, FLAGS_BYTE_0,
    FLAGS_BYTE_1, HEADER_SIZE, ID_START, NSCOUNT_START, OPCODE_MASK, OPCODE_SHIFT, QDCOUNT_START,
    QR_MASK, RA_MASK, RCODE_MASK, RD_MASK, TC_MASK,
};

/// The sections of a message body, in writing order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

/// Space held back for the OPT record when EDNS is in use.
const OPT_RECORD_SIZE: usize = 11;

/// A compression-table entry: a position where (a suffix of) a name
/// was written, and the pointer depth a reader starting there incurs.
#[derive(Clone, Copy, Debug)]
struct NameEntry {
    offset: u16,
    depth: u8,
}

#[derive(Clone, Copy, Debug)]
struct Edns {
    udp_payload_size: u16,
    extended_rcode_upper_bits: u8,
    do_bit: bool,
}

/// Serializes one DNS message.
pub struct Writer {
    octets: Vec<u8>,
    limit: usize,
    reserved: usize,
    section: Section,
    counts: [u16; 3],
    qdcount: u16,
    names: Vec<NameEntry>,
    edns: Option<Edns>,
}

impl Writer {
    /// Creates a `Writer` with the given total message size limit.
    pub fn new(limit: usize) -> Self {
        Self {
            octets: vec![0; HEADER_SIZE],
            limit: limit.max(HEADER_SIZE),
            reserved: 0,
            section: Section::Answer,
            counts: [0; 3],
            qdcount: 0,
            names: Vec::new(),
            edns: None,
        }
    }

    /// Adjusts the size limit (e.g. to the client's EDNS payload
    /// size). The limit never drops below what is already written.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(self.octets.len() + self.reserved);
    }

    pub fn len(&self) -> usize {
        self.octets.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    ////////////////////////////////////////////////////////////////////
    // HEADER FIELDS                                                  //
    ////////////////////////////////////////////////////////////////////

    pub fn id(&self) -> u16 {
        u16::from_be_bytes(self.octets[ID_START..ID_START + 2].try_into().unwrap())
    }

    pub fn set_id(&mut self, id: u16) {
        self.octets[ID_START..ID_START + 2].copy_from_slice(&id.to_be_bytes());
    }

    pub fn set_qr(&mut self, qr: bool) {
        self.set_flag(FLAGS_BYTE_0, QR_MASK, qr);
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.octets[FLAGS_BYTE_0] &= !OPCODE_MASK;
        self.octets[FLAGS_BYTE_0] |= u8::from(opcode) << OPCODE_SHIFT;
    }

    pub fn aa(&self) -> bool {
        self.octets[FLAGS_BYTE_0] & AA_MASK != 0
    }

    pub fn set_aa(&mut self, aa: bool) {
        self.set_flag(FLAGS_BYTE_0, AA_MASK, aa);
    }

    pub fn set_tc(&mut self, tc: bool) {
        self.set_flag(FLAGS_BYTE_0, TC_MASK, tc);
    }

    pub fn set_rd(&mut self, rd: bool) {
        self.set_flag(FLAGS_BYTE_0, RD_MASK, rd);
    }

    pub fn set_ra(&mut self, ra: bool) {
        self.set_flag(FLAGS_BYTE_1, RA_MASK, ra);
    }

    pub fn set_cd(&mut self, cd: bool) {
        self.set_flag(FLAGS_BYTE_1, super::CD_MASK, cd);
    }

    pub fn rcode(&self) -> Rcode {
        Rcode::from(self.octets[FLAGS_BYTE_1] & RCODE_MASK)
    }

    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.octets[FLAGS_BYTE_1] &= !RCODE_MASK;
        self.octets[FLAGS_BYTE_1] |= u8::from(rcode);
        if let Some(ref mut edns) = self.edns {
            edns.extended_rcode_upper_bits = 0;
        }
    }

    /// Sets a 12-bit extended RCODE. Values above 15 require EDNS.
    pub fn set_extended_rcode(&mut self, rcode: ExtendedRcode) -> Result<()> {
        let upper = (rcode.0 >> 4) as u8;
        if upper != 0 && self.edns.is_none() {
            return Err(Error::NotEdns);
        }
        self.octets[FLAGS_BYTE_1] &= !RCODE_MASK;
        self.octets[FLAGS_BYTE_1] |= (rcode.0 & 0x0f) as u8;
        if let Some(ref mut edns) = self.edns {
            edns.extended_rcode_upper_bits = upper;
        }
        Ok(())
    }

    fn set_flag(&mut self, byte: usize, mask: u8, value: bool) {
        if value {
            self.octets[byte] |= mask;
        } else {
            self.octets[byte] &= !mask;
        }
    }

    ////////////////////////////////////////////////////////////////////
    // EDNS                                                           //
    ////////////////////////////////////////////////////////////////////

    /// Turns the message into an EDNS message. Space for the OPT
    /// record is reserved; the record itself is added by
    /// [`Writer::finish`].
    pub fn set_edns(&mut self, udp_payload_size: u16, do_bit: bool) -> Result<()> {
        if self.edns.is_none() {
            if self.octets.len() + self.reserved + OPT_RECORD_SIZE > self.limit {
                return Err(Error::Truncation);
            }
            self.reserved += OPT_RECORD_SIZE;
        }
        self.edns = Some(Edns {
            udp_payload_size,
            extended_rcode_upper_bits: self
                .edns
                .map(|e| e.extended_rcode_upper_bits)
                .unwrap_or(0),
            do_bit,
        });
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////
    // QUESTIONS AND RECORDS                                          //
    ////////////////////////////////////////////////////////////////////

    /// Adds the question. Must precede any resource record.
    pub fn add_question(&mut self, question: &Question) -> Result<()> {
        if self.qdcount > 0 || self.counts.iter().any(|&c| c > 0) {
            return Err(Error::OutOfOrder);
        }
        let checkpoint = self.checkpoint();
        self.write_name(&question.qname, true);
        self.write_u16(u16::from(question.qtype));
        self.write_u16(u16::from(question.qclass));
        if self.over_budget() {
            self.rollback(checkpoint);
            return Err(Error::Truncation);
        }
        self.qdcount = 1;
        Ok(())
    }

    /// Adds a whole RRset to `section`, rolling back on truncation.
    /// `ttl` overrides the set's TTL when given (negative-caching SOA
    /// records use the SOA MINIMUM).
    pub fn add_rrset(
        &mut self,
        section: Section,
        owner: &Dname,
        db: &Namedb,
        rrset: &Rrset,
        ttl: Option<Ttl>,
    ) -> Result<()> {
        self.enter_section(section)?;
        let checkpoint = self.checkpoint();
        let ttl = ttl.unwrap_or(rrset.ttl);
        for rr in &rrset.rrs {
            self.write_rr(owner, rrset.rr_type, Class::IN, ttl, db, rr);
        }
        if self.over_budget() {
            self.rollback(checkpoint);
            return Err(Error::Truncation);
        }
        self.bump_count(section, rrset.rrs.len() as u16);
        Ok(())
    }

    /// Adds a single record with pre-encoded (and pointer-free)
    /// record data.
    pub fn add_raw_rr(
        &mut self,
        section: Section,
        owner: &Dname,
        rr_type: Type,
        class_value: u16,
        ttl: Ttl,
        rdata: &[u8],
    ) -> Result<()> {
        self.enter_section(section)?;
        let checkpoint = self.checkpoint();
        self.write_name(owner, true);
        self.write_u16(u16::from(rr_type));
        self.write_u16(class_value);
        self.write_u32(u32::from(ttl));
        self.write_u16(rdata.len() as u16);
        self.octets.extend_from_slice(rdata);
        if self.over_budget() {
            self.rollback(checkpoint);
            return Err(Error::Truncation);
        }
        self.bump_count(section, 1);
        Ok(())
    }

    fn write_rr(
        &mut self,
        owner: &Dname,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        db: &Namedb,
        rr: &Rr,
    ) {
        self.write_name(owner, true);
        self.write_u16(u16::from(rr_type));
        self.write_u16(u16::from(class));
        self.write_u32(u32::from(ttl));
        let rdlength_at = self.octets.len();
        self.write_u16(0);

        let descriptor = descriptor_by_type(rr_type);
        for (index, atom) in rr.atoms.iter().enumerate() {
            match atom {
                Atom::Domain(node) => {
                    let compressible =
                        descriptor.kind(index) == Some(RdataKind::CompressedDname);
                    let name = db.tree.node(*node).name().clone();
                    self.write_name(&name, compressible);
                }
                Atom::Blob(octets) => self.octets.extend_from_slice(octets),
            }
        }

        let rdlength = (self.octets.len() - rdlength_at - 2) as u16;
        self.octets[rdlength_at..rdlength_at + 2].copy_from_slice(&rdlength.to_be_bytes());
    }

    fn enter_section(&mut self, section: Section) -> Result<()> {
        if section < self.section {
            return Err(Error::OutOfOrder);
        }
        self.section = section;
        Ok(())
    }

    fn bump_count(&mut self, section: Section, by: u16) {
        self.counts[section as usize] += by;
    }

    ////////////////////////////////////////////////////////////////////
    // NAME COMPRESSION                                               //
    ////////////////////////////////////////////////////////////////////

    /// Writes `name`, compressing against the table when allowed.
    /// Uncompressed names still populate the table so that later
    /// names can point at them.
    fn write_name(&mut self, name: &Dname, compress: bool) {
        let label_count = name.label_count();

        // Find the longest previously written suffix.
        let mut best: Option<(usize, NameEntry)> = None; // (labels skipped, entry)
        if compress {
            for skip in 0..label_count.saturating_sub(1) {
                if let Some(entry) = self.find_suffix(name, skip) {
                    best = Some((skip, entry));
                    break;
                }
            }
        }

        match best {
            Some((skip, entry)) => {
                // Literal labels, then a pointer.
                let mut offsets = Vec::with_capacity(skip);
                for label in name.labels().take(skip) {
                    offsets.push(self.octets.len());
                    self.octets.push(label.len() as u8);
                    self.octets.extend_from_slice(label);
                }
                self.octets
                    .extend_from_slice(&(0xc000u16 | entry.offset).to_be_bytes());
                // Record the literal prefix positions, with one more
                // hop than the pointer target.
                if entry.depth + 1 < super::MAX_POINTER_HOPS as u8 {
                    for offset in offsets {
                        if offset < 0x4000 {
                            self.names.push(NameEntry {
                                offset: offset as u16,
                                depth: entry.depth + 1,
                            });
                        }
                    }
                }
            }
            None => {
                // Fully literal. Record the position of every suffix.
                for label in name.labels() {
                    let offset = self.octets.len();
                    if offset < 0x4000 {
                        self.names.push(NameEntry {
                            offset: offset as u16,
                            depth: 0,
                        });
                    }
                    self.octets.push(label.len() as u8);
                    self.octets.extend_from_slice(label);
                }
                self.octets.push(0);
            }
        }
    }

    /// Looks for a table entry whose name equals `name` minus its
    /// first `skip` labels.
    fn find_suffix(&self, name: &Dname, skip: usize) -> Option<NameEntry> {
        'entries: for &entry in &self.names {
            let mut position = entry.offset as usize;
            let mut hops = 0usize;
            let mut labels = name.labels().skip(skip);
            loop {
                let len = self.octets[position] as usize;
                if len & 0xc0 == 0xc0 {
                    hops += 1;
                    if hops > super::MAX_POINTER_HOPS {
                        continue 'entries;
                    }
                    position = (((len & 0x3f) << 8) | self.octets[position + 1] as usize) & 0x3fff;
                } else if len == 0 {
                    if labels.next().is_none() {
                        return Some(entry);
                    }
                    continue 'entries;
                } else {
                    let written = &self.octets[position + 1..position + 1 + len];
                    match labels.next() {
                        Some(label) if label.eq_ignore_ascii_case(written) => {
                            position += 1 + len;
                        }
                        _ => continue 'entries,
                    }
                }
            }
        }
        None
    }

    ////////////////////////////////////////////////////////////////////
    // TRANSACTIONS AND FINISHING                                     //
    ////////////////////////////////////////////////////////////////////

    fn checkpoint(&self) -> (usize, usize) {
        (self.octets.len(), self.names.len())
    }

    fn rollback(&mut self, checkpoint: (usize, usize)) {
        self.octets.truncate(checkpoint.0);
        self.names.truncate(checkpoint.1);
    }

    fn over_budget(&self) -> bool {
        self.octets.len() + self.reserved > self.limit
    }

    /// Drops every resource record, keeping the header and question.
    /// Used when the response must be reduced to TC + question.
    pub fn clear_rrs(&mut self) {
        let mut reader_position = HEADER_SIZE;
        if self.qdcount == 1 {
            // The question is qname + 4 octets.
            while self.octets[reader_position] != 0 {
                reader_position += 1 + self.octets[reader_position] as usize;
            }
            reader_position += 1 + 4;
        }
        self.octets.truncate(reader_position);
        self.counts = [0; 3];
        self.section = Section::Answer;
        // Table entries pointing into removed records are gone.
        self.names
            .retain(|entry| (entry.offset as usize) < reader_position);
    }

    fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    /// Finalizes the message: appends the OPT record if EDNS is in
    /// use, fills in the counts, and returns the octets.
    pub fn finish(mut self) -> Vec<u8> {
        let mut arcount = self.counts[Section::Additional as usize];
        if let Some(edns) = self.edns {
            self.octets.push(0); // root owner
            self.octets.extend_from_slice(&u16::from(Type::OPT).to_be_bytes());
            self.octets.extend_from_slice(&edns.udp_payload_size.to_be_bytes());
            let ttl = ((edns.extended_rcode_upper_bits as u32) << 24)
                | ((edns.do_bit as u32) << 15);
            self.octets.extend_from_slice(&ttl.to_be_bytes());
            self.octets.extend_from_slice(&0u16.to_be_bytes());
            arcount += 1;
        }
        self.octets[QDCOUNT_START..QDCOUNT_START + 2]
            .copy_from_slice(&self.qdcount.to_be_bytes());
        self.octets[ANCOUNT_START..ANCOUNT_START + 2]
            .copy_from_slice(&self.counts[Section::Answer as usize].to_be_bytes());
        self.octets[NSCOUNT_START..NSCOUNT_START + 2]
            .copy_from_slice(&self.counts[Section::Authority as usize].to_be_bytes());
        self.octets[ARCOUNT_START..ARCOUNT_START + 2].copy_from_slice(&arcount.to_be_bytes());
        self.octets
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The item does not fit within the size limit.
    Truncation,

    /// Sections were written out of order.
    OutOfOrder,

    /// The operation requires EDNS, which is not enabled.
    NotEdns,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncation => f.write_str("message size limit exceeded"),
            Self::OutOfOrder => f.write_str("sections written out of order"),
            Self::NotEdns => f.write_str("not an EDNS message"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::reader::read_name_at;
    use crate::message::Reader;
    use crate::rr::Ttl;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn question(qname: &str) -> Question {
        Question {
            qname: name(qname),
            qtype: Type::A,
            qclass: Class::IN,
        }
    }

    #[test]
    fn owner_names_compress_to_the_qname() {
        let mut writer = Writer::new(512);
        writer.add_question(&question("www.example.")).unwrap();
        writer
            .add_raw_rr(
                Section::Answer,
                &name("www.example."),
                Type::A,
                u16::from(Class::IN),
                Ttl::from(300),
                &[10, 0, 0, 1],
            )
            .unwrap();
        let octets = writer.finish();

        // The owner must be a single pointer to offset 12.
        let owner_at = HEADER_SIZE + name("www.example.").len() + 4;
        assert_eq!(octets[owner_at], 0xc0);
        assert_eq!(octets[owner_at + 1], 12);
        let (owner, after) = read_name_at(&octets, owner_at).unwrap();
        assert_eq!(owner, name("www.example."));
        assert_eq!(after, owner_at + 2);
    }

    #[test]
    fn partial_suffix_matches_use_literal_prefixes() {
        let mut writer = Writer::new(512);
        writer.add_question(&question("www.example.")).unwrap();
        writer
            .add_raw_rr(
                Section::Answer,
                &name("mail.example."),
                Type::A,
                u16::from(Class::IN),
                Ttl::from(300),
                &[10, 0, 0, 2],
            )
            .unwrap();
        let octets = writer.finish();

        let owner_at = HEADER_SIZE + name("www.example.").len() + 4;
        // "mail" literal (5 octets), then a pointer to "example." at
        // offset 16.
        assert_eq!(&octets[owner_at..owner_at + 5], b"\x04mail");
        assert_eq!(octets[owner_at + 5], 0xc0);
        assert_eq!(octets[owner_at + 6], 16);
        let (owner, _) = read_name_at(&octets, owner_at).unwrap();
        assert_eq!(owner, name("mail.example."));
    }

    #[test]
    fn counts_are_written_on_finish() {
        let mut writer = Writer::new(512);
        writer.add_question(&question("a.example.")).unwrap();
        for i in 0..3u8 {
            writer
                .add_raw_rr(
                    Section::Answer,
                    &name("a.example."),
                    Type::A,
                    u16::from(Class::IN),
                    Ttl::from(300),
                    &[10, 0, 0, i],
                )
                .unwrap();
        }
        let octets = writer.finish();
        let reader = Reader::try_from(octets.as_slice()).unwrap();
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.ancount(), 3);
        assert_eq!(reader.nscount(), 0);
        assert_eq!(reader.arcount(), 0);
    }

    #[test]
    fn truncation_rolls_the_message_back() {
        let mut writer = Writer::new(64);
        writer.add_question(&question("www.example.")).unwrap();
        let before = writer.len();
        let big_rdata = [0u8; 64];
        let result = writer.add_raw_rr(
            Section::Answer,
            &name("www.example."),
            Type::TXT,
            u16::from(Class::IN),
            Ttl::from(300),
            &big_rdata,
        );
        assert_eq!(result, Err(Error::Truncation));
        assert_eq!(writer.len(), before);
        let octets = writer.finish();
        let reader = Reader::try_from(octets.as_slice()).unwrap();
        assert_eq!(reader.ancount(), 0);
    }

    #[test]
    fn sections_enforce_order() {
        let mut writer = Writer::new(512);
        writer.add_question(&question("www.example.")).unwrap();
        writer
            .add_raw_rr(
                Section::Additional,
                &name("ns.example."),
                Type::A,
                u16::from(Class::IN),
                Ttl::from(300),
                &[10, 0, 0, 1],
            )
            .unwrap();
        let result = writer.add_raw_rr(
            Section::Answer,
            &name("www.example."),
            Type::A,
            u16::from(Class::IN),
            Ttl::from(300),
            &[10, 0, 0, 1],
        );
        assert_eq!(result, Err(Error::OutOfOrder));
    }

    #[test]
    fn edns_opt_is_appended() {
        let mut writer = Writer::new(512);
        writer.add_question(&question("www.example.")).unwrap();
        writer.set_edns(1232, true).unwrap();
        writer
            .set_extended_rcode(ExtendedRcode::BADVERS)
            .unwrap();
        let octets = writer.finish();
        let reader = Reader::try_from(octets.as_slice()).unwrap();
        assert_eq!(reader.arcount(), 1);
        // The OPT record is the last 11 octets.
        let opt = &octets[octets.len() - OPT_RECORD_SIZE..];
        assert_eq!(opt[0], 0); // root
        assert_eq!(u16::from_be_bytes(opt[1..3].try_into().unwrap()), 41);
        assert_eq!(u16::from_be_bytes(opt[3..5].try_into().unwrap()), 1232);
        assert_eq!(opt[5], 1); // extended RCODE upper bits
        assert_eq!(opt[7] & 0x80, 0x80); // DO
    }

    #[test]
    fn clear_rrs_keeps_the_question() {
        let mut writer = Writer::new(512);
        writer.add_question(&question("www.example.")).unwrap();
        writer
            .add_raw_rr(
                Section::Answer,
                &name("www.example."),
                Type::A,
                u16::from(Class::IN),
                Ttl::from(300),
                &[10, 0, 0, 1],
            )
            .unwrap();
        writer.clear_rrs();
        writer.set_tc(true);
        let octets = writer.finish();
        let mut reader = Reader::try_from(octets.as_slice()).unwrap();
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.ancount(), 0);
        assert!(reader.tc());
        let q = reader.read_question().unwrap();
        assert_eq!(q.qname, name("www.example."));
        assert!(reader.at_end());
    }
}
