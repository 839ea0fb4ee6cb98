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

//! Assembling answers to DNS queries.
//!
//! Once the zone to search is known, a query resolves to one of five
//! shapes: a positive answer, a CNAME chain, a referral, NODATA, or
//! NXDOMAIN (possibly rescued by a wildcard). This module classifies
//! the query against the name tree and fills the response sections,
//! including DNSSEC denial material for signed zones when the client
//! set the DO bit.
//!
//! Records that a response *must* carry (the answer, the negative
//! SOA, referral NS sets) propagate truncation to the caller, which
//! reduces the response to TC + question. Everything else (additional
//! addresses, denial records, the authority NS set on positive
//! answers) is dropped silently when it does not fit.

use arrayvec::ArrayVec;

use crate::db::{Namedb, NodeId, Rrset, ZoneId};
use crate::name::Dname;
use crate::nsec3;
use crate::rr::{Ttl, Type};

use crate::message::writer::Section;
use crate::message::{Question, Rcode, Writer};

use super::{ReceivedInfo, Transport};

/// The longest CNAME chain followed before giving up with SERVFAIL.
const MAX_CNAME_CHAIN_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ProcessingError {
    ServFail,
    Truncation,
}

type Processing<T> = Result<T, ProcessingError>;

impl From<crate::message::writer::Error> for ProcessingError {
    fn from(e: crate::message::writer::Error) -> Self {
        match e {
            crate::message::writer::Error::Truncation => Self::Truncation,
            _ => Self::ServFail,
        }
    }
}

/// Answers a query against `zone`, filling `response`.
pub(super) fn answer_query(
    db: &Namedb,
    zone: ZoneId,
    question: &Question,
    class_any: bool,
    do_bit: bool,
    info: ReceivedInfo,
    response: &mut Writer,
) {
    let mut ctx = Context {
        db,
        zone,
        secure: db.zone(zone).is_secure && do_bit,
        answered: Vec::new(),
    };
    if !class_any {
        response.set_aa(true);
    }
    match ctx.answer(question, response) {
        Ok(()) => (),
        Err(ProcessingError::ServFail) => {
            response.clear_rrs();
            response.set_aa(false);
            response.set_rcode(Rcode::ServFail);
        }
        Err(ProcessingError::Truncation) => {
            response.clear_rrs();
            if info.transport == Transport::Tcp {
                // TCP cannot fall back to a larger transport.
                response.set_aa(false);
                response.set_rcode(Rcode::ServFail);
            } else {
                response.set_tc(true);
            }
        }
    }
}

struct Context<'a> {
    db: &'a Namedb,
    zone: ZoneId,
    secure: bool,
    /// Owner/type pairs already placed in the answer section, used to
    /// keep the additional section free of duplicates.
    answered: Vec<(Dname, Type)>,
}

impl Context<'_> {
    fn answer(&mut self, question: &Question, response: &mut Writer) -> Processing<()> {
        let mut qname = question.qname.clone();
        let mut links: ArrayVec<Dname, MAX_CNAME_CHAIN_LEN> = ArrayVec::new();

        // Each iteration resolves one owner name; CNAME records
        // restart the loop with a new owner within the same zone.
        loop {
            match self.classify(&qname, question.qtype)? {
                Classification::Referral(delegation) => {
                    if links.is_empty() {
                        response.set_aa(false);
                    }
                    return self.do_referral(delegation, response);
                }
                Classification::Cname {
                    node,
                    synthesized,
                } => {
                    let rrset = self
                        .db
                        .tree
                        .node(node)
                        .find_rrset(self.zone, Type::CNAME)
                        .expect("Cname classification implies the RRset");
                    self.add_answer(response, &qname, node, rrset)?;
                    let target = rrset.rrs[0]
                        .atoms
                        .first()
                        .and_then(|atom| atom.as_domain())
                        .ok_or(ProcessingError::ServFail)?;
                    let target = self.db.tree.node(target).name().clone();
                    if synthesized {
                        self.add_wildcard_proof(response, &qname)?;
                    }
                    if target == qname || links.contains(&target) {
                        return Err(ProcessingError::ServFail); // loop
                    }
                    if !target.eq_or_subdomain_of(self.db.apex_name(self.zone)) {
                        // The chain leaves the zone; the resolver
                        // takes it from here.
                        return Ok(());
                    }
                    links
                        .try_push(qname)
                        .or(Err(ProcessingError::ServFail))?;
                    qname = target;
                }
                Classification::Positive {
                    node,
                    synthesized,
                } => {
                    if question.qtype == Type::ANY {
                        self.answer_any(response, &qname, node)?;
                    } else {
                        let rrset = self
                            .db
                            .tree
                            .node(node)
                            .find_rrset(self.zone, question.qtype)
                            .expect("Positive classification implies the RRset");
                        self.add_answer(response, &qname, node, rrset)?;
                        self.add_additional_addresses(response, question.qtype, rrset)?;
                    }
                    if synthesized {
                        self.add_wildcard_proof(response, &qname)?;
                    }
                    return self.add_apex_ns(response);
                }
                Classification::NoData(node) => {
                    self.add_negative_soa(response)?;
                    if self.secure {
                        self.add_nodata_denial(response, question.qtype, node)?;
                    }
                    return Ok(());
                }
                Classification::NxDomain(encloser) => {
                    // RFC 6604: the RCODE reflects the final lookup of
                    // the chain.
                    response.set_rcode(Rcode::NxDomain);
                    self.add_negative_soa(response)?;
                    if self.secure {
                        self.add_nxdomain_denial(response, &qname, encloser)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // CLASSIFICATION                                                 //
    ////////////////////////////////////////////////////////////////////

    fn classify(&self, qname: &Dname, qtype: Type) -> Processing<Classification> {
        let tree = &self.db.tree;
        let apex = self.db.zone(self.zone).apex();
        let result = tree.search(qname);

        // The deepest existing ancestor that is actually an existing
        // *name* (a node kept alive only by rdata references does not
        // exist in the DNS sense).
        let mut encloser = result.closest_encloser;
        while !tree.node(encloser).is_existing() && encloser != apex {
            encloser = tree
                .node(encloser)
                .parent()
                .expect("zone apexes are existing");
        }

        // Scan the existing ancestors from the apex down for a zone
        // cut. NS records at a non-apex name delegate everything at
        // and below it.
        let mut chain = Vec::new();
        let mut walk = Some(encloser);
        while let Some(id) = walk {
            chain.push(id);
            if id == apex {
                break;
            }
            walk = tree.node(id).parent();
        }
        let delegation = chain
            .iter()
            .rev()
            .skip(1) // the apex cannot delegate itself
            .copied()
            .find(|&id| tree.node(id).find_rrset(self.zone, Type::NS).is_some());
        if let Some(delegation) = delegation {
            // A DS query for the delegation name itself is answered
            // from this (the parent) side of the cut.
            let ds_at_cut =
                qtype == Type::DS && result.exact && result.closest_encloser == delegation;
            if !ds_at_cut {
                return Ok(Classification::Referral(delegation));
            }
        }

        let exact = result.exact && tree.node(result.closest_encloser).is_existing();
        if exact {
            return Ok(self.classify_node(result.closest_encloser, qtype, false));
        }

        // No such name; a wildcard at the closest encloser may rescue
        // it.
        if let Some(wildcard) = tree.wildcard_child(encloser) {
            if tree
                .node(wildcard)
                .find_rrset(self.zone, Type::NS)
                .is_some()
            {
                return Ok(Classification::Referral(wildcard));
            }
            return Ok(self.classify_node(wildcard, qtype, true));
        }

        Ok(Classification::NxDomain(encloser))
    }

    /// Classifies an exact (or wildcard-synthesized) match of the
    /// query name against the node's data.
    fn classify_node(&self, node: NodeId, qtype: Type, synthesized: bool) -> Classification {
        let node_ref = self.db.tree.node(node);
        if qtype == Type::ANY || node_ref.find_rrset(self.zone, qtype).is_some() {
            return Classification::Positive { node, synthesized };
        }
        if qtype != Type::CNAME && node_ref.find_rrset(self.zone, Type::CNAME).is_some() {
            return Classification::Cname { node, synthesized };
        }
        // A name that owns nothing but NSEC3 records is an artifact
        // of the hashed chain and does not exist for queries of other
        // types.
        if qtype != Type::NSEC3 && self.has_only_nsec3(node) {
            return Classification::NxDomain(node);
        }
        Classification::NoData(node)
    }

    /// Whether `node`'s only data in this zone is NSEC3 (and its
    /// signatures).
    fn has_only_nsec3(&self, node: NodeId) -> bool {
        let mut any = false;
        for rrset in self.db.tree.node(node).rrsets() {
            if rrset.zone != self.zone {
                continue;
            }
            if rrset.rr_type != Type::NSEC3 && rrset.rr_type != Type::RRSIG {
                return false;
            }
            any |= rrset.rr_type == Type::NSEC3;
        }
        any
    }

    ////////////////////////////////////////////////////////////////////
    // POSITIVE ANSWERS                                               //
    ////////////////////////////////////////////////////////////////////

    fn answer_any(&mut self, response: &mut Writer, owner: &Dname, node: NodeId) -> Processing<()> {
        let node_ref = self.db.tree.node(node);
        let mut added = 0;
        for rrset in node_ref.rrsets() {
            if rrset.zone != self.zone {
                continue;
            }
            response.add_rrset(Section::Answer, owner, self.db, rrset, None)?;
            self.answered.push((owner.clone(), rrset.rr_type));
            added += 1;
        }
        if added == 0 {
            self.add_negative_soa(response)?;
        }
        Ok(())
    }

    /// Writes an RRset into the answer section, with its signatures
    /// if the response is a secure one.
    fn add_answer(
        &mut self,
        response: &mut Writer,
        owner: &Dname,
        node: NodeId,
        rrset: &Rrset,
    ) -> Processing<()> {
        response.add_rrset(Section::Answer, owner, self.db, rrset, None)?;
        self.answered.push((owner.clone(), rrset.rr_type));
        if self.secure {
            self.add_rrsigs(response, Section::Answer, owner, node, rrset.rr_type)?;
        }
        Ok(())
    }

    /// Adds the RRSIG records of `node` covering `covered` to
    /// `section`.
    fn add_rrsigs(
        &mut self,
        response: &mut Writer,
        section: Section,
        owner: &Dname,
        node: NodeId,
        covered: Type,
    ) -> Processing<()> {
        let rrsigs = match self.db.tree.node(node).find_rrset(self.zone, Type::RRSIG) {
            Some(rrsigs) => rrsigs,
            None => return Ok(()),
        };
        let mut filtered = Rrset::new(self.zone, Type::RRSIG, rrsigs.ttl);
        for rr in &rrsigs.rrs {
            let type_covered = rr
                .atoms
                .first()
                .and_then(|atom| atom.as_blob())
                .and_then(|blob| <[u8; 2]>::try_from(blob).ok())
                .map(u16::from_be_bytes);
            if type_covered == Some(u16::from(covered)) {
                filtered.rrs.push(rr.clone());
            }
        }
        if !filtered.rrs.is_empty() {
            response.add_rrset(section, owner, self.db, &filtered, None)?;
        }
        Ok(())
    }

    /// Puts the zone's apex NS set in the authority section of
    /// positive answers. Dropped if it does not fit.
    fn add_apex_ns(&mut self, response: &mut Writer) -> Processing<()> {
        let apex_name = self.db.apex_name(self.zone).clone();
        if self.answered.iter().any(|(n, t)| *t == Type::NS && *n == apex_name) {
            return Ok(());
        }
        if let Some(ns) = self.db.ns(self.zone) {
            let result = response.add_rrset(Section::Authority, &apex_name, self.db, ns, None);
            if result.is_ok() {
                self.add_address_records(response, ns, None)?;
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////
    // REFERRALS                                                      //
    ////////////////////////////////////////////////////////////////////

    fn do_referral(&mut self, delegation: NodeId, response: &mut Writer) -> Processing<()> {
        let child = self.db.tree.node(delegation).name().clone();
        let ns = self
            .db
            .tree
            .node(delegation)
            .find_rrset(self.zone, Type::NS)
            .expect("a delegation owns an NS RRset");
        response.add_rrset(Section::Authority, &child, self.db, ns, None)?;

        if self.secure {
            self.add_ds_proof(response, delegation)?;
        }

        // Glue for name servers inside the delegated subtree is
        // required for the referral to work; other in-zone addresses
        // are a best effort.
        self.add_address_records(response, ns, Some(&child))?;
        Ok(())
    }

    /// On a secure referral: the DS RRset (and signatures) when the
    /// child is signed, or proof of its absence when it is not.
    fn add_ds_proof(&mut self, response: &mut Writer, delegation: NodeId) -> Processing<()> {
        let child = self.db.tree.node(delegation).name().clone();
        if let Some(ds) = self.db.tree.node(delegation).find_rrset(self.zone, Type::DS) {
            let result = response.add_rrset(Section::Authority, &child, self.db, ds, None);
            if result.is_ok() {
                self.add_rrsigs(response, Section::Authority, &child, delegation, Type::DS)?;
            }
            return Ok(());
        }

        if self.db.zone(self.zone).nsec3_params.is_some() {
            self.add_nsec3_ds_proof(response, delegation)
        } else {
            // NSEC: the record at the delegation owner proves DS is
            // absent.
            self.add_nsec_of(response, delegation)
        }
    }

    ////////////////////////////////////////////////////////////////////
    // NEGATIVE ANSWERS                                               //
    ////////////////////////////////////////////////////////////////////

    /// Adds the zone's SOA for negative caching, with the TTL capped
    /// by the SOA MINIMUM field ([RFC 2308 § 3]).
    ///
    /// [RFC 2308 § 3]: https://datatracker.ietf.org/doc/html/rfc2308#section-3
    fn add_negative_soa(&mut self, response: &mut Writer) -> Processing<()> {
        let soa = self.db.soa(self.zone).ok_or(ProcessingError::ServFail)?;
        let minimum = soa.rrs[0].u32_field(6).ok_or(ProcessingError::ServFail)?;
        let ttl = Ttl::from(u32::from(soa.ttl).min(minimum));
        let apex_name = self.db.apex_name(self.zone).clone();
        response.add_rrset(Section::Authority, &apex_name, self.db, soa, Some(ttl))?;
        if self.secure {
            let apex = self.db.zone(self.zone).apex();
            self.add_rrsigs(response, Section::Authority, &apex_name, apex, Type::SOA)?;
        }
        Ok(())
    }

    fn add_nodata_denial(
        &mut self,
        response: &mut Writer,
        qtype: Type,
        node: NodeId,
    ) -> Processing<()> {
        if self.db.zone(self.zone).nsec3_params.is_none() {
            return self.add_nsec_of(response, node);
        }

        if qtype == Type::DS && node != self.db.zone(self.zone).apex() {
            return self.add_nsec3_ds_proof(response, node);
        }
        if self.db.tree.node(node).name().is_wildcard() {
            // NODATA at a wildcard: prove the wildcard's parent and
            // deny the wildcard itself.
            if let Some(parent) = self.db.tree.node(node).parent() {
                if let Some(exact) = self.db.tree.node(parent).nsec3().exact {
                    self.add_nsec3_of(response, exact)?;
                }
            }
            if let Some(cover) = self.db.tree.node(node).nsec3().cover {
                self.add_nsec3_of(response, cover)?;
            }
            return Ok(());
        }
        // The NSEC3 record matching the name proves the type absent.
        if let Some(exact) = self.db.tree.node(node).nsec3().exact {
            self.add_nsec3_of(response, exact)?;
        }
        Ok(())
    }

    fn add_nxdomain_denial(
        &mut self,
        response: &mut Writer,
        qname: &Dname,
        encloser: NodeId,
    ) -> Processing<()> {
        if self.db.zone(self.zone).nsec3_params.is_none() {
            // NSEC: cover the query name, and cover the wildcard that
            // could have matched.
            if let Some(cover) = self.nsec_covering(qname) {
                self.add_nsec_of(response, cover)?;
            }
            let wildcard = self
                .db
                .tree
                .node(encloser)
                .name()
                .prepend(b"*")
                .or(Err(ProcessingError::ServFail))?;
            if let Some(cover) = self.nsec_covering(&wildcard) {
                self.add_nsec_of(response, cover)?;
            }
            return Ok(());
        }

        let refs = *self.db.tree.node(encloser).nsec3();
        // A wildcard denial that collides with the encloser's own
        // existence proof cannot produce a sound answer.
        if refs.wcard_child_cover.is_some() && refs.wcard_child_cover == refs.exact {
            return Err(ProcessingError::ServFail);
        }

        // Closest-encloser proof: the encloser exists...
        if let Some(exact) = refs.exact {
            self.add_nsec3_of(response, exact)?;
        }
        // ... the next-closer name does not (hashed at query time)...
        self.add_nsec3_next_closer(response, qname, encloser)?;
        // ... and no wildcard exists at the encloser.
        if let Some(cover) = refs.wcard_child_cover {
            self.add_nsec3_of(response, cover)?;
        }
        Ok(())
    }

    /// Proof accompanying a wildcard-synthesized answer: the
    /// next-closer name does not exist.
    fn add_wildcard_proof(&mut self, response: &mut Writer, qname: &Dname) -> Processing<()> {
        if !self.secure {
            return Ok(());
        }
        let result = self.db.tree.search(qname);
        let mut encloser = result.closest_encloser;
        let apex = self.db.zone(self.zone).apex();
        while !self.db.tree.node(encloser).is_existing() && encloser != apex {
            encloser = self.db.tree.node(encloser).parent().unwrap();
        }
        if self.db.zone(self.zone).nsec3_params.is_some() {
            self.add_nsec3_next_closer(response, qname, encloser)
        } else {
            if let Some(cover) = self.nsec_covering(qname) {
                self.add_nsec_of(response, cover)?;
            }
            Ok(())
        }
    }

    ////////////////////////////////////////////////////////////////////
    // NSEC HELPERS                                                   //
    ////////////////////////////////////////////////////////////////////

    /// Finds the NSEC owner covering `name`: the nearest predecessor
    /// (or the name itself) owning an NSEC record in this zone.
    fn nsec_covering(&self, name: &Dname) -> Option<NodeId> {
        let apex_name = self.db.apex_name(self.zone);
        let result = self.db.tree.search(name);
        let mut walk = Some(result.closest_match);
        while let Some(id) = walk {
            let node = self.db.tree.node(id);
            if !node.name().eq_or_subdomain_of(apex_name) {
                return None;
            }
            if node.find_rrset(self.zone, Type::NSEC).is_some() {
                return Some(id);
            }
            walk = self.db.tree.previous(id);
        }
        None
    }

    /// Adds `node`'s NSEC RRset and signatures to the authority
    /// section; silently dropped when it does not fit.
    fn add_nsec_of(&mut self, response: &mut Writer, node: NodeId) -> Processing<()> {
        if self.db.tree.node(node).find_rrset(self.zone, Type::NSEC).is_none() {
            return Ok(());
        }
        let owner = self.db.tree.node(node).name().clone();
        let rrset = self
            .db
            .tree
            .node(node)
            .find_rrset(self.zone, Type::NSEC)
            .unwrap();
        match response.add_rrset(Section::Authority, &owner, self.db, rrset, None) {
            Ok(()) => self.add_rrsigs(response, Section::Authority, &owner, node, Type::NSEC),
            Err(_) => Ok(()),
        }
    }

    ////////////////////////////////////////////////////////////////////
    // NSEC3 HELPERS                                                  //
    ////////////////////////////////////////////////////////////////////

    /// Adds `node`'s NSEC3 RRset and signatures to the authority
    /// section; silently dropped when it does not fit.
    fn add_nsec3_of(&mut self, response: &mut Writer, node: NodeId) -> Processing<()> {
        let rrset = match self.db.tree.node(node).find_rrset(self.zone, Type::NSEC3) {
            Some(rrset) => rrset,
            None => return Ok(()),
        };
        let owner = self.db.tree.node(node).name().clone();
        match response.add_rrset(Section::Authority, &owner, self.db, rrset, None) {
            Ok(()) => self.add_rrsigs(response, Section::Authority, &owner, node, Type::NSEC3),
            Err(_) => Ok(()),
        }
    }

    /// Hashes the next-closer name of `qname` below `encloser` and
    /// adds its covering NSEC3. An exact match of the hash is a
    /// collision with an existence proof, which cannot be answered
    /// soundly.
    fn add_nsec3_next_closer(
        &mut self,
        response: &mut Writer,
        qname: &Dname,
        encloser: NodeId,
    ) -> Processing<()> {
        let params = self
            .db
            .zone(self.zone)
            .nsec3_params
            .clone()
            .ok_or(ProcessingError::ServFail)?;
        let encloser_labels = self.db.tree.node(encloser).name().label_count();
        let next_closer = qname.suffix(encloser_labels + 1);
        let hashed = nsec3::hash_name(&params, self.db.apex_name(self.zone), &next_closer);
        let (exact, cover) = nsec3::find_cover(self.db, self.zone, &hashed);
        if exact {
            return Err(ProcessingError::ServFail);
        }
        if let Some(cover) = cover {
            self.add_nsec3_of(response, cover)?;
        }
        Ok(())
    }

    /// The parent-side DS denial of [RFC 5155 § 7.2.4]: the exact
    /// NSEC3 when the delegation name has one, otherwise a closest
    /// provable encloser proof plus the opt-out range.
    ///
    /// [RFC 5155 § 7.2.4]: https://datatracker.ietf.org/doc/html/rfc5155#section-7.2.4
    fn add_nsec3_ds_proof(&mut self, response: &mut Writer, node: NodeId) -> Processing<()> {
        let refs = *self.db.tree.node(node).nsec3();
        if let Some(exact) = refs.ds_parent_exact {
            return self.add_nsec3_of(response, exact);
        }

        // Walk up to the nearest provable ancestor.
        let mut parent = self.db.tree.node(node).parent();
        let mut below_provable = None;
        while let Some(id) = parent {
            if self.db.tree.node(id).nsec3().exact.is_some() {
                break;
            }
            below_provable = Some(id);
            parent = self.db.tree.node(id).parent();
        }
        if let Some(provable) = parent {
            if let Some(exact) = self.db.tree.node(provable).nsec3().exact {
                self.add_nsec3_of(response, exact)?;
            }
        }
        if let Some(below) = below_provable {
            if let Some(cover) = self.db.tree.node(below).nsec3().cover {
                self.add_nsec3_of(response, cover)?;
            }
        }
        if let Some(cover) = refs.ds_parent_cover {
            self.add_nsec3_of(response, cover)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////
    // ADDITIONAL SECTION PROCESSING                                  //
    ////////////////////////////////////////////////////////////////////

    /// For answer RRsets of types that name other hosts, includes any
    /// in-zone addresses of those hosts ([RFC 1035 § 3.3]-era
    /// additional section processing, plus AAAA per RFC 3596).
    fn add_additional_addresses(
        &mut self,
        response: &mut Writer,
        rr_type: Type,
        rrset: &Rrset,
    ) -> Processing<()> {
        match rr_type {
            Type::NS | Type::MB | Type::MD | Type::MF | Type::MX | Type::SRV => {
                self.add_address_records(response, rrset, None)
            }
            _ => Ok(()),
        }
    }

    /// Adds A/AAAA records for every domain atom of `rrset`. Targets
    /// under `glue_required_under` are glue a referral cannot do
    /// without, so their truncation is reported; every other address
    /// is dropped silently on overflow.
    fn add_address_records(
        &mut self,
        response: &mut Writer,
        rrset: &Rrset,
        glue_required_under: Option<&Dname>,
    ) -> Processing<()> {
        for rr in &rrset.rrs {
            for atom in &rr.atoms {
                let target = match atom.as_domain() {
                    Some(target) => target,
                    None => continue,
                };
                let target_name = self.db.tree.node(target).name().clone();
                let required = glue_required_under
                    .map(|under| target_name.eq_or_subdomain_of(under))
                    .unwrap_or(false);
                for addr_type in [Type::A, Type::AAAA] {
                    if self
                        .answered
                        .iter()
                        .any(|(n, t)| *t == addr_type && *n == target_name)
                    {
                        continue;
                    }
                    let addresses =
                        match self.db.tree.node(target).find_rrset(self.zone, addr_type) {
                            Some(addresses) => addresses,
                            None => continue,
                        };
                    let result = response.add_rrset(
                        Section::Additional,
                        &target_name,
                        self.db,
                        addresses,
                        None,
                    );
                    match result {
                        Ok(()) => (),
                        Err(_) if !required => (),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }
}

/// The shape a query resolves to.
enum Classification {
    /// The queried type is present at the matched node (exact or
    /// wildcard-synthesized).
    Positive { node: NodeId, synthesized: bool },

    /// A CNAME at the matched node, and the queried type is neither
    /// CNAME nor present.
    Cname { node: NodeId, synthesized: bool },

    /// A zone cut above or at the name.
    Referral(NodeId),

    /// The name exists but carries no data of the queried type.
    NoData(NodeId),

    /// The name does not exist; the closest (existing) encloser is
    /// given.
    NxDomain(NodeId),
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::{handle_message, Outcome};
    use super::*;
    use crate::db::{Atom, Rr};
    use crate::message::reader::read_name_at;
    use crate::message::{tsig, Reader, HEADER_SIZE};

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    /// Builds the zone used by the concrete reply-shape tests:
    /// a SOA, an in-zone host, a wildcard, a delegation with glue,
    /// and a CNAME.
    fn build_zone() -> Namedb {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let ns1 = db.tree.insert(&name("ns1.example."));
        let admin = db.tree.insert(&name("admin.example."));
        let soa = Rr::new(vec![
            Atom::Domain(ns1),
            Atom::Domain(admin),
            Atom::Blob(Box::new(1u32.to_be_bytes())),
            Atom::Blob(Box::new(3600u32.to_be_bytes())),
            Atom::Blob(Box::new(900u32.to_be_bytes())),
            Atom::Blob(Box::new(86400u32.to_be_bytes())),
            Atom::Blob(Box::new(300u32.to_be_bytes())),
        ]);
        db.add_rr(zone, &name("example."), Type::SOA, Ttl::from(3600), soa)
            .unwrap();
        db.add_rr(
            zone,
            &name("example."),
            Type::NS,
            Ttl::from(3600),
            Rr::new(vec![Atom::Domain(ns1)]),
        )
        .unwrap();
        db.add_rr(
            zone,
            &name("ns1.example."),
            Type::A,
            Ttl::from(3600),
            Rr::new(vec![Atom::Blob(Box::new([10, 0, 0, 1]))]),
        )
        .unwrap();
        db.add_rr(
            zone,
            &name("*.wild.example."),
            Type::A,
            Ttl::from(3600),
            Rr::new(vec![Atom::Blob(Box::new([10, 0, 0, 9]))]),
        )
        .unwrap();
        let sub_ns = db.tree.insert(&name("ns.sub.example."));
        db.add_rr(
            zone,
            &name("sub.example."),
            Type::NS,
            Ttl::from(3600),
            Rr::new(vec![Atom::Domain(sub_ns)]),
        )
        .unwrap();
        db.add_rr(
            zone,
            &name("ns.sub.example."),
            Type::A,
            Ttl::from(3600),
            Rr::new(vec![Atom::Blob(Box::new([10, 0, 0, 2]))]),
        )
        .unwrap();
        let cname_target = db.tree.insert(&name("ns1.example."));
        db.add_rr(
            zone,
            &name("alias.example."),
            Type::CNAME,
            Ttl::from(3600),
            Rr::new(vec![Atom::Domain(cname_target)]),
        )
        .unwrap();
        db
    }

    fn build_query(qname: &str, qtype: Type) -> Vec<u8> {
        let mut msg = vec![0u8; HEADER_SIZE];
        msg[0] = 0x12;
        msg[1] = 0x34;
        msg[5] = 1;
        let qname: Dname = qname.parse().unwrap();
        msg.extend_from_slice(qname.wire());
        msg.extend_from_slice(&u16::from(qtype).to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg
    }

    /// A decoded reply: (section, owner, type) triples plus header
    /// facts.
    struct Decoded {
        rcode: Rcode,
        aa: bool,
        tc: bool,
        answer: Vec<(Dname, Type)>,
        authority: Vec<(Dname, Type)>,
        additional: Vec<(Dname, Type)>,
    }

    fn decode(reply: &[u8]) -> Decoded {
        let mut reader = Reader::try_from(reply).unwrap();
        let mut decoded = Decoded {
            rcode: reader.rcode(),
            aa: reply[2] & 0x04 != 0,
            tc: reader.tc(),
            answer: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };
        for _ in 0..reader.qdcount() {
            reader.read_question().unwrap();
        }
        for _ in 0..reader.ancount() {
            let rr = reader.read_rr().unwrap();
            decoded.answer.push((rr.owner, rr.rr_type));
        }
        for _ in 0..reader.nscount() {
            let rr = reader.read_rr().unwrap();
            decoded.authority.push((rr.owner, rr.rr_type));
        }
        for _ in 0..reader.arcount() {
            let rr = reader.read_rr().unwrap();
            decoded.additional.push((rr.owner, rr.rr_type));
        }
        decoded
    }

    fn query(db: &Namedb, qname: &str, qtype: Type) -> Decoded {
        let info = ReceivedInfo {
            source: "192.0.2.1".parse().unwrap(),
            transport: Transport::Udp,
        };
        match handle_message(db, &tsig::Keyring::default(), &build_query(qname, qtype), info) {
            Outcome::Reply(reply) => decode(&reply),
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[test]
    fn positive_answer_carries_apex_ns_in_authority() {
        let db = build_zone();
        let reply = query(&db, "ns1.example.", Type::A);
        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(reply.aa);
        assert_eq!(reply.answer, vec![(name("ns1.example."), Type::A)]);
        assert_eq!(reply.authority, vec![(name("example."), Type::NS)]);
        // ns1's address is already the answer; the additional section
        // stays empty.
        assert!(reply.additional.is_empty());
    }

    #[test]
    fn missing_names_get_nxdomain_with_soa() {
        let db = build_zone();
        let reply = query(&db, "nope.example.", Type::A);
        assert_eq!(reply.rcode, Rcode::NxDomain);
        assert!(reply.aa);
        assert!(reply.answer.is_empty());
        assert_eq!(reply.authority, vec![(name("example."), Type::SOA)]);
    }

    #[test]
    fn wildcards_synthesize_answers_under_the_query_name() {
        let db = build_zone();
        let reply = query(&db, "x.wild.example.", Type::A);
        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(reply.aa);
        assert_eq!(reply.answer, vec![(name("x.wild.example."), Type::A)]);
    }

    #[test]
    fn delegations_produce_referrals_with_glue() {
        let db = build_zone();
        let reply = query(&db, "x.sub.example.", Type::A);
        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(!reply.aa);
        assert!(reply.answer.is_empty());
        assert_eq!(reply.authority, vec![(name("sub.example."), Type::NS)]);
        assert_eq!(reply.additional, vec![(name("ns.sub.example."), Type::A)]);
    }

    #[test]
    fn nodata_gets_soa_with_minimum_ttl() {
        let db = build_zone();
        let reply = query(&db, "ns1.example.", Type::AAAA);
        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(reply.aa);
        assert!(reply.answer.is_empty());
        assert_eq!(reply.authority, vec![(name("example."), Type::SOA)]);
    }

    #[test]
    fn cnames_are_chased_within_the_zone() {
        let db = build_zone();
        let reply = query(&db, "alias.example.", Type::A);
        assert_eq!(reply.rcode, Rcode::NoError);
        assert_eq!(
            reply.answer,
            vec![
                (name("alias.example."), Type::CNAME),
                (name("ns1.example."), Type::A),
            ]
        );
    }

    #[test]
    fn empty_non_terminals_are_nodata_not_nxdomain() {
        let db = build_zone();
        // wild.example. exists only because *.wild.example. does.
        let reply = query(&db, "wild.example.", Type::A);
        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(reply.answer.is_empty());
        assert_eq!(reply.authority, vec![(name("example."), Type::SOA)]);
    }

    #[test]
    fn replies_that_cannot_fit_are_truncated_to_tc() {
        let mut db = build_zone();
        let zone = db.find_zone_of(&name("example.")).unwrap();
        // 60 TXT records of ~250 octets each cannot fit even in an
        // EDNS reply.
        for i in 0..60u8 {
            let mut text = vec![250u8];
            text.extend(std::iter::repeat(i).take(250));
            db.add_rr(
                zone,
                &name("big.example."),
                Type::TXT,
                Ttl::from(300),
                Rr::new(vec![Atom::Blob(text.into())]),
            )
            .unwrap();
        }
        let reply = query(&db, "big.example.", Type::TXT);
        assert!(reply.tc);
        assert!(reply.answer.is_empty());
        assert!(reply.authority.is_empty());
    }

    #[test]
    fn compression_pointers_in_replies_stay_sane() {
        let db = build_zone();
        let info = ReceivedInfo {
            source: "192.0.2.1".parse().unwrap(),
            transport: Transport::Udp,
        };
        let reply = match handle_message(&db, &tsig::Keyring::default(), &build_query("ns1.example.", Type::A), info) {
            Outcome::Reply(reply) => reply,
            _ => panic!(),
        };
        // Walk every record's owner through the decompressor; this
        // exercises the backward-only and bounded-hops checks.
        let mut reader = Reader::try_from(reply.as_slice()).unwrap();
        reader.read_question().unwrap();
        let total = reader.ancount() + reader.nscount() + reader.arcount();
        for _ in 0..total {
            let rr = reader.read_rr().unwrap();
            let (reparsed, _) = read_name_at(&reply, rr.start).unwrap();
            assert_eq!(reparsed, rr.owner);
        }
    }
}
