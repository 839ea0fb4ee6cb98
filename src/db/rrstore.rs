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

//! Typed record data and RRsets.
//!
//! Record data is stored decomposed into atoms under the control of
//! the type-descriptor table (see [`crate::rr::descriptor_by_type`]).
//! An atom is either a reference to a node in the name tree (for
//! domain-name fields) or an opaque run of octets. Storing embedded
//! domain names as tree references is what lets the query engine
//! compress them and chase them without re-parsing, and what lets two
//! records be compared for equality without worrying about case.

use crate::rr::{Ttl, Type};

use super::nametree::NodeId;
use super::ZoneId;

/// The largest number of records one RRset may hold. RR counts are
/// 16-bit quantities both in the database image and in transfers.
pub const MAX_RRS_PER_RRSET: usize = u16::MAX as usize;

/// One field of a record's data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Atom {
    /// A domain-name field, referring to a node in the name tree.
    /// Compared by node identity.
    Domain(NodeId),

    /// Any other field, kept as its wire-format octets. Compared by
    /// octet equality.
    Blob(Box<[u8]>),
}

impl Atom {
    pub fn as_domain(&self) -> Option<NodeId> {
        match self {
            Self::Domain(id) => Some(*id),
            Self::Blob(_) => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Domain(_) => None,
            Self::Blob(octets) => Some(octets),
        }
    }
}

/// The data of a single resource record: an ordered list of atoms.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rr {
    pub atoms: Vec<Atom>,
}

impl Rr {
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self { atoms }
    }

    /// Reads the atom at `index` as a big-endian `u32`, if it is a
    /// four-octet blob. SOA timer fields are accessed this way.
    pub fn u32_field(&self, index: usize) -> Option<u32> {
        let blob = self.atoms.get(index)?.as_blob()?;
        let array: [u8; 4] = blob.try_into().ok()?;
        Some(u32::from_be_bytes(array))
    }
}

/// A set of records sharing one owner, zone, type, and TTL
/// ([RFC 2181 § 5]). The owner is implied by the node whose RRset list
/// this set is part of.
///
/// [RFC 2181 § 5]: https://datatracker.ietf.org/doc/html/rfc2181#section-5
#[derive(Clone, Debug)]
pub struct Rrset {
    pub zone: ZoneId,
    pub rr_type: Type,
    pub ttl: Ttl,
    pub rrs: Vec<Rr>,
}

impl Rrset {
    pub fn new(zone: ZoneId, rr_type: Type, ttl: Ttl) -> Self {
        Self {
            zone,
            rr_type,
            ttl,
            rrs: Vec::new(),
        }
    }

    /// Returns whether the set already contains a record equal to
    /// `rr` (same atom sequence; domain atoms by node identity, blob
    /// atoms by octets).
    pub fn contains(&self, rr: &Rr) -> bool {
        self.rrs.iter().any(|existing| existing == rr)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rr_equality_follows_atom_rules() {
        let a = Rr::new(vec![
            Atom::Blob(Box::new([0, 10])),
            Atom::Domain(fake_node(7)),
        ]);
        let same = Rr::new(vec![
            Atom::Blob(Box::new([0, 10])),
            Atom::Domain(fake_node(7)),
        ]);
        let other_node = Rr::new(vec![
            Atom::Blob(Box::new([0, 10])),
            Atom::Domain(fake_node(8)),
        ]);
        assert_eq!(a, same);
        assert_ne!(a, other_node);
    }

    #[test]
    fn u32_field_reads_big_endian_blobs() {
        let rr = Rr::new(vec![Atom::Blob(Box::new([0, 0, 0x0e, 0x10]))]);
        assert_eq!(rr.u32_field(0), Some(3600));
        assert_eq!(rr.u32_field(1), None);
    }

    // NodeId's constructor is private to the nametree module; conjure
    // ids through a real tree.
    fn fake_node(depth: usize) -> NodeId {
        use crate::db::nametree::NameTree;
        use crate::name::Dname;
        let mut tree = NameTree::new();
        let mut name: Dname = "test.".parse().unwrap();
        for _ in 0..depth {
            name = name.prepend(b"x").unwrap();
        }
        tree.insert(&name)
    }
}
