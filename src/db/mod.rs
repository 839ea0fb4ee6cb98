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

//! The in-memory name database: the name tree, the RR store, and the
//! zones compiled into them.
//!
//! A [`Namedb`] is produced by the zone compiler (see
//! [`crate::zonec`]) or read back from a database image (see
//! [`image`]), and is then served read-only by the query engine.
//! The transfer coordinator applies committed zone transfers to it
//! through [`Namedb::add_rr`] and [`Namedb::remove_rr`].

pub mod image;
pub mod nametree;
mod rrstore;

use std::fmt;

use crate::name::Dname;
use crate::rr::{Ttl, Type};

pub use nametree::{NameTree, Node, NodeId, Nsec3Refs, SearchResult};
pub use rrstore::{Atom, Rr, Rrset, MAX_RRS_PER_RRSET};

////////////////////////////////////////////////////////////////////////
// ZONES                                                              //
////////////////////////////////////////////////////////////////////////

/// Identifies a zone in a [`Namedb`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ZoneId(u32);

impl ZoneId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// NSEC3 parameters in force for a signed zone, extracted from the
/// apex NSEC3 RRset by the denial precomputation.
#[derive(Clone, Debug)]
pub struct Nsec3Params {
    pub algorithm: u8,
    pub iterations: u32,
    pub salt: Box<[u8]>,
}

/// A zone held in the database.
#[derive(Debug)]
pub struct Zone {
    apex: NodeId,
    number: u32,
    pub is_secure: bool,
    pub nsec3_params: Option<Nsec3Params>,
    pub nsec3_last: Option<NodeId>,
}

impl Zone {
    pub fn apex(&self) -> NodeId {
        self.apex
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

////////////////////////////////////////////////////////////////////////
// THE DATABASE                                                       //
////////////////////////////////////////////////////////////////////////

/// The name database.
pub struct Namedb {
    pub tree: NameTree,
    zones: Vec<Zone>,
}

impl Namedb {
    pub fn new() -> Self {
        Self {
            tree: NameTree::new(),
            zones: Vec::new(),
        }
    }

    /// Creates a zone with the given apex name. The apex node is
    /// created if necessary and marked.
    pub fn add_zone(&mut self, apex_name: &Dname) -> ZoneId {
        let apex = self.tree.insert(apex_name);
        let id = ZoneId(self.zones.len() as u32);
        self.zones.push(Zone {
            apex,
            number: id.0 + 1,
            is_secure: false,
            nsec3_params: None,
            nsec3_last: None,
        });
        let node = self.tree.node_mut(apex);
        node.is_apex = true;
        node.zone = Some(id);
        node.usage += 1; // apexes are pinned while their zone lives
        id
    }

    pub fn zone(&self, id: ZoneId) -> &Zone {
        &self.zones[id.index()]
    }

    pub fn zone_mut(&mut self, id: ZoneId) -> &mut Zone {
        &mut self.zones[id.index()]
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = ZoneId> {
        (0..self.zones.len() as u32).map(ZoneId)
    }

    pub fn apex_name(&self, id: ZoneId) -> &Dname {
        self.tree.node(self.zone(id).apex).name()
    }

    /// Finds the zone whose apex is the longest suffix of `name`
    /// (including `name` itself).
    pub fn find_zone_of(&self, name: &Dname) -> Option<ZoneId> {
        let result = self.tree.search(name);
        let mut walk = Some(result.closest_encloser);
        while let Some(id) = walk {
            let node = self.tree.node(id);
            if node.is_apex {
                return node.zone;
            }
            walk = node.parent();
        }
        None
    }

    /// Finds the zone that `node` belongs to, walking up to the
    /// nearest apex.
    pub fn zone_of_node(&self, node: NodeId) -> Option<ZoneId> {
        let mut walk = Some(node);
        while let Some(id) = walk {
            let node = self.tree.node(id);
            if node.is_apex {
                return node.zone;
            }
            walk = node.parent();
        }
        None
    }

    /// The zone's SOA RRset, if loaded.
    pub fn soa(&self, zone: ZoneId) -> Option<&Rrset> {
        self.tree
            .node(self.zone(zone).apex)
            .find_rrset(zone, Type::SOA)
    }

    /// The zone's apex NS RRset, if present.
    pub fn ns(&self, zone: ZoneId) -> Option<&Rrset> {
        self.tree
            .node(self.zone(zone).apex)
            .find_rrset(zone, Type::NS)
    }

    /// The serial of the zone's SOA, if loaded.
    pub fn soa_serial(&self, zone: ZoneId) -> Option<u32> {
        self.soa(zone)?.rrs.first()?.u32_field(2)
    }

    /// Adds a record to the database, creating the owner node and the
    /// RRset as needed. Implements the record-processing contract:
    /// the TTL of a new record must match its RRset, and records
    /// already present are silently discarded.
    pub fn add_rr(
        &mut self,
        zone: ZoneId,
        owner: &Dname,
        rr_type: Type,
        ttl: Ttl,
        rr: Rr,
    ) -> Result<AddStatus, AddError> {
        let node_id = self.tree.insert(owner);
        let node = self.tree.node(node_id);
        let status = match node
            .rrsets
            .iter()
            .position(|rrset| rrset.zone == zone && rrset.rr_type == rr_type)
        {
            Some(index) => {
                let rrset = &self.tree.node(node_id).rrsets[index];
                if rrset.ttl != ttl {
                    return Err(AddError::TtlMismatch);
                } else if rrset.contains(&rr) {
                    return Ok(AddStatus::DroppedDuplicate);
                } else if rrset.rrs.len() >= MAX_RRS_PER_RRSET {
                    return Err(AddError::TooManyRrs);
                }
                self.bump_usage(&rr, 1);
                self.tree.node_mut(node_id).rrsets[index].rrs.push(rr);
                AddStatus::Added
            }
            None => {
                self.bump_usage(&rr, 1);
                let mut rrset = Rrset::new(zone, rr_type, ttl);
                rrset.rrs.push(rr);
                // Append, preserving insertion order, and mark the
                // node and its ancestors as existing.
                self.tree.node_mut(node_id).rrsets.push(rrset);
                let mut walk = Some(node_id);
                while let Some(id) = walk {
                    let node = self.tree.node_mut(id);
                    if node.is_existing {
                        break;
                    }
                    node.is_existing = true;
                    walk = node.parent;
                }
                AddStatus::CreatedRrset
            }
        };
        Ok(status)
    }

    /// Removes a record (compared by atom equality). Returns whether a
    /// record was removed. Empty RRsets are dropped and the owner node
    /// is deleted if it became removable.
    pub fn remove_rr(&mut self, zone: ZoneId, owner: &Dname, rr_type: Type, rr: &Rr) -> bool {
        let node_id = match self.tree.find(owner) {
            Some(id) => id,
            None => return false,
        };
        let node = self.tree.node(node_id);
        let set_index = match node
            .rrsets
            .iter()
            .position(|rrset| rrset.zone == zone && rrset.rr_type == rr_type)
        {
            Some(index) => index,
            None => return false,
        };
        let rr_index = match self.tree.node(node_id).rrsets[set_index]
            .rrs
            .iter()
            .position(|existing| existing == rr)
        {
            Some(index) => index,
            None => return false,
        };

        let removed = self.tree.node_mut(node_id).rrsets[set_index]
            .rrs
            .remove(rr_index);
        self.bump_usage(&removed, -1);
        if self.tree.node(node_id).rrsets[set_index].rrs.is_empty() {
            self.tree.node_mut(node_id).rrsets.remove(set_index);
        }
        if self.tree.node(node_id).rrsets.is_empty() {
            self.refresh_existing(node_id);
            self.tree.delete(node_id);
        }
        true
    }

    /// Removes every record of `zone`, leaving the zone entry itself
    /// in place (a transfer application refills it).
    pub fn clear_zone(&mut self, zone: ZoneId) {
        let apex = self.zone(zone).apex;
        let subtree: Vec<NodeId> = self.tree.iter_subtree(apex).collect();
        for &id in &subtree {
            let mut kept = Vec::new();
            for rrset in std::mem::take(&mut self.tree.node_mut(id).rrsets) {
                if rrset.zone == zone {
                    for rr in &rrset.rrs {
                        self.bump_usage(rr, -1);
                    }
                } else {
                    kept.push(rrset);
                }
            }
            self.tree.node_mut(id).rrsets = kept;
        }
        // Recompute is_existing across the subtree, children first
        // (reverse canonical order), then fix up the ancestors above
        // the apex.
        for &id in &subtree {
            self.tree.node_mut(id).is_existing = false;
        }
        for &id in subtree.iter().rev() {
            let node = self.tree.node(id);
            if !node.rrsets().is_empty() || node.is_existing() {
                self.tree.node_mut(id).is_existing = true;
                if let Some(parent) = self.tree.node(id).parent() {
                    self.tree.node_mut(parent).is_existing = true;
                }
            }
        }
        self.refresh_existing(apex);

        // Drop now-empty nodes, leaves first. A delete may cascade and
        // take ancestors with it, so check liveness as we go.
        for &id in subtree.iter().rev() {
            if id != apex && self.tree.contains(id) {
                self.tree.delete(id);
            }
        }
        self.zone_mut(zone).is_secure = false;
        self.zone_mut(zone).nsec3_params = None;
        self.zone_mut(zone).nsec3_last = None;
    }

    /// Adjusts the usage counters of the nodes referenced by `rr`'s
    /// domain atoms.
    fn bump_usage(&mut self, rr: &Rr, delta: i32) {
        for atom in &rr.atoms {
            if let Atom::Domain(id) = atom {
                let usage = &mut self.tree.node_mut(*id).usage;
                *usage = usage.checked_add_signed(delta).expect("usage underflow");
            }
        }
    }

    /// Recomputes `is_existing` for `id` and, while names keep turning
    /// out empty, its ancestors. A node with data leaves its ancestors
    /// untouched (they were already marked when the data was added).
    fn refresh_existing(&mut self, id: NodeId) {
        let mut walk = Some(id);
        while let Some(current) = walk {
            let has_data =
                !self.tree.node(current).rrsets.is_empty() || self.subtree_has_data(current);
            let node = self.tree.node_mut(current);
            node.is_existing = has_data;
            if has_data {
                break;
            }
            walk = node.parent;
        }
    }

    /// Whether any proper descendant of `id` owns records.
    fn subtree_has_data(&self, id: NodeId) -> bool {
        self.tree
            .iter_subtree(id)
            .skip(1)
            .any(|descendant| !self.tree.node(descendant).rrsets.is_empty())
    }
}

impl Default for Namedb {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Namedb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Namedb({} zones, {} names)",
            self.zones.len(),
            self.tree.len(),
        )
    }
}

/// What [`Namedb::add_rr`] did with the record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddStatus {
    /// The record started a new RRset.
    CreatedRrset,

    /// The record joined an existing RRset.
    Added,

    /// An equal record was already present; the new one was discarded.
    DroppedDuplicate,
}

/// Why [`Namedb::add_rr`] rejected the record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddError {
    /// The record's TTL differs from its RRset's TTL.
    TtlMismatch,

    /// The RRset already holds 65,535 records.
    TooManyRrs,
}

impl fmt::Display for AddError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TtlMismatch => f.write_str("TTL does not match the TTL of the RRset"),
            Self::TooManyRrs => f.write_str("too many records in the RRset"),
        }
    }
}

impl std::error::Error for AddError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn a_rr(octets: [u8; 4]) -> Rr {
        Rr::new(vec![Atom::Blob(Box::new(octets))])
    }

    #[test]
    fn add_rr_groups_records_into_rrsets() {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let owner = name("ns1.example.");
        assert_eq!(
            db.add_rr(zone, &owner, Type::A, Ttl::from(3600), a_rr([10, 0, 0, 1])),
            Ok(AddStatus::CreatedRrset)
        );
        assert_eq!(
            db.add_rr(zone, &owner, Type::A, Ttl::from(3600), a_rr([10, 0, 0, 2])),
            Ok(AddStatus::Added)
        );
        let node = db.tree.find(&owner).unwrap();
        let rrset = db.tree.node(node).find_rrset(zone, Type::A).unwrap();
        assert_eq!(rrset.rrs.len(), 2);
        assert!(db.tree.node(node).is_existing());
        // Ancestors became existing too.
        let apex = db.tree.find(&name("example.")).unwrap();
        assert!(db.tree.node(apex).is_existing());
    }

    #[test]
    fn add_rr_enforces_ttl_and_drops_duplicates() {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let owner = name("ns1.example.");
        db.add_rr(zone, &owner, Type::A, Ttl::from(3600), a_rr([10, 0, 0, 1]))
            .unwrap();
        assert_eq!(
            db.add_rr(zone, &owner, Type::A, Ttl::from(7200), a_rr([10, 0, 0, 2])),
            Err(AddError::TtlMismatch)
        );
        assert_eq!(
            db.add_rr(zone, &owner, Type::A, Ttl::from(3600), a_rr([10, 0, 0, 1])),
            Ok(AddStatus::DroppedDuplicate)
        );
    }

    #[test]
    fn remove_rr_cleans_up_nodes() {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let owner = name("a.b.example.");
        db.add_rr(zone, &owner, Type::A, Ttl::from(300), a_rr([10, 0, 0, 1]))
            .unwrap();
        assert!(db.remove_rr(zone, &owner, Type::A, &a_rr([10, 0, 0, 1])));
        assert!(!db.remove_rr(zone, &owner, Type::A, &a_rr([10, 0, 0, 1])));
        // The owner node and the empty interior node are gone.
        assert!(db.tree.find(&owner).is_none());
        assert!(db.tree.find(&name("b.example.")).is_none());
        // The apex survives (it is pinned by its zone).
        assert!(db.tree.find(&name("example.")).is_some());
    }

    #[test]
    fn usage_pins_nodes_referenced_from_rdata() {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let target = db.tree.insert(&name("host.example."));
        let mx = Rr::new(vec![
            Atom::Blob(Box::new([0, 10])),
            Atom::Domain(target),
        ]);
        db.add_rr(zone, &name("example."), Type::MX, Ttl::from(300), mx.clone())
            .unwrap();

        // The target owns no records, but the MX rdata pins it.
        db.tree.delete(target);
        assert!(db.tree.find(&name("host.example.")).is_some());

        // Removing the MX unpins and deletes it.
        db.remove_rr(zone, &name("example."), Type::MX, &mx);
        assert!(db.tree.find(&name("host.example.")).is_none());
    }

    #[test]
    fn clear_zone_removes_only_that_zones_data() {
        let mut db = Namedb::new();
        let parent = db.add_zone(&name("example."));
        let child = db.add_zone(&name("sub.example."));
        db.add_rr(
            parent,
            &name("example."),
            Type::A,
            Ttl::from(300),
            a_rr([10, 0, 0, 1]),
        )
        .unwrap();
        db.add_rr(
            child,
            &name("www.sub.example."),
            Type::A,
            Ttl::from(300),
            a_rr([10, 0, 0, 2]),
        )
        .unwrap();

        db.clear_zone(child);
        assert!(db.tree.find(&name("www.sub.example.")).is_none());
        assert!(db.soa(parent).is_none()); // no SOA was added, sanity
        let apex = db.tree.find(&name("example.")).unwrap();
        assert!(db.tree.node(apex).find_rrset(parent, Type::A).is_some());
    }

    #[test]
    fn find_zone_of_picks_the_longest_suffix() {
        let mut db = Namedb::new();
        let parent = db.add_zone(&name("example."));
        let child = db.add_zone(&name("sub.example."));
        assert_eq!(db.find_zone_of(&name("www.sub.example.")), Some(child));
        assert_eq!(db.find_zone_of(&name("www.example.")), Some(parent));
        assert_eq!(db.find_zone_of(&name("example.")), Some(parent));
        assert_eq!(db.find_zone_of(&name("other.")), None);
    }
}
