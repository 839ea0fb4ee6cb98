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

//! NSEC3 ([RFC 5155]) denial-of-existence precomputation.
//!
//! Hashing every query name at answer time would make NXDOMAIN
//! responses expensive, so after a zone is loaded we walk it once and
//! store, on every node, references to the NSEC3 records that deny
//! it: the record covering the hash of the name itself, the record
//! covering the hash of `*.<name>` (for wildcard denial), and, for
//! delegations with a DS record, the same pair under the parent
//! zone's hash parameters. The query engine then assembles denial
//! proofs by following these references.
//!
//! A zone is treated as NSEC3-signed when some node in it owns an
//! NSEC3 RRset whose first record has the SOA bit set in its type
//! bitmap; that record also supplies the hash parameters, and its
//! owner must equal the hash of the apex.
//!
//! [RFC 5155]: https://datatracker.ietf.org/doc/html/rfc5155

use log::{error, info, warn};
use sha1::{Digest, Sha1};

use crate::db::{Namedb, NodeId, Nsec3Params, ZoneId};
use crate::name::Dname;
use crate::rr::Type;
use crate::util::base32hex_encode;

/// The SHA-1 hash algorithm number ([RFC 5155 § 11]).
///
/// [RFC 5155 § 11]: https://datatracker.ietf.org/doc/html/rfc5155#section-11
pub const HASH_ALGORITHM_SHA1: u8 = 1;

////////////////////////////////////////////////////////////////////////
// HASHING                                                            //
////////////////////////////////////////////////////////////////////////

/// Computes the iterated NSEC3 hash ([RFC 5155 § 5]) of a name. The
/// name is hashed in lowercased wire form.
///
/// [RFC 5155 § 5]: https://datatracker.ietf.org/doc/html/rfc5155#section-5
pub fn hash(params: &Nsec3Params, name: &Dname) -> [u8; 20] {
    let mut lowered = name.wire().to_vec();
    lowered.make_ascii_lowercase();

    let mut hasher = Sha1::new();
    hasher.update(&lowered);
    hasher.update(&params.salt);
    let mut digest: [u8; 20] = hasher.finalize().into();
    for _ in 0..params.iterations {
        let mut hasher = Sha1::new();
        hasher.update(digest);
        hasher.update(&params.salt);
        digest = hasher.finalize().into();
    }
    digest
}

/// Produces the owner name a record with the given hash would have:
/// the base32hex hash as a single label under the zone apex.
pub fn hash_name(params: &Nsec3Params, apex: &Dname, name: &Dname) -> Dname {
    let label = base32hex_encode(&hash(params, name));
    apex.prepend(&label)
        .expect("a base32hex SHA-1 label always fits under a zone apex")
}

////////////////////////////////////////////////////////////////////////
// COVER SEARCH                                                       //
////////////////////////////////////////////////////////////////////////

/// Finds the NSEC3 record covering `hashed` in `zone`: the exact
/// owner if one exists, otherwise the nearest predecessor owning an
/// NSEC3 RRset, wrapping around to the zone's last NSEC3 owner when
/// `hashed` sorts before the first. Returns `(exact, node)`.
pub fn find_cover(db: &Namedb, zone: ZoneId, hashed: &Dname) -> (bool, Option<NodeId>) {
    let apex_name = db.apex_name(zone);
    let result = db.tree.search(hashed);
    if result.exact
        && db
            .tree
            .node(result.closest_encloser)
            .find_rrset(zone, Type::NSEC3)
            .is_some()
    {
        return (true, Some(result.closest_encloser));
    }

    let mut walk = Some(result.closest_match);
    while let Some(id) = walk {
        let node = db.tree.node(id);
        if !node.name().eq_or_subdomain_of(apex_name) {
            break;
        }
        if node.find_rrset(zone, Type::NSEC3).is_some() {
            return (false, Some(id));
        }
        walk = db.tree.previous(id);
    }

    // The hash sorts before the first NSEC3 owner; the last NSEC3
    // owner covers the wraparound in hash space.
    (false, db.zone(zone).nsec3_last)
}

////////////////////////////////////////////////////////////////////////
// PRECOMPUTATION                                                     //
////////////////////////////////////////////////////////////////////////

/// Runs denial precomputation (and the `is_secure` determination) for
/// every zone in the database. Call after loading and after applying
/// a transfer.
pub fn prehash(db: &mut Namedb) {
    for zone in db.zone_ids().collect::<Vec<_>>() {
        prehash_zone(db, zone);
    }
}

/// Runs denial precomputation for one zone.
pub fn prehash_zone(db: &mut Namedb, zone: ZoneId) {
    let apex = db.zone(zone).apex();
    db.zone_mut(zone).is_secure = db
        .tree
        .node(apex)
        .find_rrset(zone, Type::RRSIG)
        .is_some();

    db.zone_mut(zone).nsec3_params = detect_params(db, zone);
    db.zone_mut(zone).nsec3_last = if db.zone(zone).nsec3_params.is_some() {
        find_last(db, zone)
    } else {
        None
    };

    let subtree: Vec<NodeId> = db.tree.iter_subtree(apex).collect();
    for &node in &subtree {
        if db.zone_of_node(node) == Some(zone) {
            prehash_node(db, zone, node);
        }
        // Parent-side NSEC3 data for DS queries at delegations. The DS
        // RRset lives in this (the parent) zone, below which authority
        // is delegated away.
        if node != apex && db.tree.node(node).find_rrset(zone, Type::DS).is_some() {
            prehash_ds(db, zone, node);
        }
    }
}

/// Finds the NSEC3 RRset that turns NSEC3 on for the zone: the first
/// one (in canonical order) whose first record has the SOA bit set in
/// its type bitmap. Validates that its owner is the hash of the apex.
fn detect_params(db: &Namedb, zone: ZoneId) -> Option<Nsec3Params> {
    let apex = db.zone(zone).apex();
    let apex_name = db.apex_name(zone).clone();
    for node in db.tree.iter_subtree(apex) {
        let rrset = match db.tree.node(node).find_rrset(zone, Type::NSEC3) {
            Some(rrset) => rrset,
            None => continue,
        };
        let first = match rrset.rrs.first() {
            Some(first) => first,
            None => continue,
        };
        if !bitmap_has_soa(first.atoms.get(5).and_then(|a| a.as_blob()).unwrap_or(&[])) {
            continue;
        }

        let algorithm = first.atoms.first()?.as_blob()?.first().copied()?;
        let iterations = {
            let blob = first.atoms.get(2)?.as_blob()?;
            u16::from_be_bytes(blob.try_into().ok()?) as u32
        };
        let salt = {
            let blob = first.atoms.get(3)?.as_blob()?;
            blob.get(1..1 + *blob.first()? as usize)?.to_vec()
        };
        let params = Nsec3Params {
            algorithm,
            iterations,
            salt: salt.into(),
        };
        info!(
            "detected NSEC3 for zone {} saltlen={} iter={}",
            apex_name,
            params.salt.len(),
            params.iterations,
        );

        // The NSEC3 that enables the chain must be the apex's own
        // hash; anything else means the chain belongs to some other
        // name and cannot be trusted.
        let check = hash_name(&params, &apex_name, &apex_name);
        if db.tree.node(node).name() != &check {
            error!(
                "NSEC3 record with SOA bit on {} is bad: name != hash(zone); \
                 disabling NSEC3 for zone {}",
                db.tree.node(node).name(),
                apex_name,
            );
            return None;
        }
        return Some(params);
    }
    None
}

/// Whether a type bitmap has the SOA bit (window 0, type 6) set.
fn bitmap_has_soa(bitmap: &[u8]) -> bool {
    // Window block 0 must come first; SOA is bit 6 of the first octet
    // run, i.e. 0x02 in octet 0.
    bitmap.len() >= 3 && bitmap[0] == 0 && bitmap[1] >= 1 && (bitmap[2] & 0x02) != 0
}

/// Finds the canonically last NSEC3 owner of the zone, which covers
/// the hash-order wraparound.
fn find_last(db: &Namedb, zone: ZoneId) -> Option<NodeId> {
    let apex = db.zone(zone).apex();
    let mut last = None;
    for node in db.tree.iter_subtree(apex) {
        if db.tree.node(node).find_rrset(zone, Type::NSEC3).is_some() {
            last = Some(node);
        }
    }
    last
}

fn prehash_node(db: &mut Namedb, zone: ZoneId, node: NodeId) {
    let params = match db.zone(zone).nsec3_params.clone() {
        Some(params) => params,
        None => {
            // NSEC3 may have been removed by an update; clear any
            // leftovers.
            let mut refs = *db.tree.node(node).nsec3();
            refs.cover = None;
            refs.wcard_child_cover = None;
            refs.exact = None;
            db.tree.set_nsec3(node, refs);
            return;
        }
    };
    let apex_name = db.apex_name(zone).clone();
    let name = db.tree.node(node).name().clone();

    let mut refs = *db.tree.node(node).nsec3();
    let hashed = hash_name(&params, &apex_name, &name);
    let (exact, cover) = find_cover(db, zone, &hashed);
    refs.cover = cover;
    refs.exact = if exact { cover } else { None };

    // The cover for *.<name>, for wildcard denial.
    let wcard = name
        .prepend(b"*")
        .expect("a one-octet label fits under any node name");
    let hashed = hash_name(&params, &apex_name, &wcard);
    let (exact, cover) = find_cover(db, zone, &hashed);
    refs.wcard_child_cover = cover;
    db.tree.set_nsec3(node, refs);

    if exact && db.tree.wildcard_child(node).is_none() {
        warn!(
            "prehash: collision of wildcard denial for {}. \
             Sign the zone with a different salt to remove the collision.",
            name,
        );
    }
}

/// Precomputes the parent-side references used to answer DS queries
/// at `node`, which carries a DS RRset in `zone` (the parent side of
/// a zone cut).
fn prehash_ds(db: &mut Namedb, zone: ZoneId, node: NodeId) {
    let mut refs = *db.tree.node(node).nsec3();
    let params = match db.zone(zone).nsec3_params.clone() {
        Some(params) => params,
        None => {
            refs.ds_parent_cover = None;
            refs.ds_parent_exact = None;
            db.tree.set_nsec3(node, refs);
            return;
        }
    };
    let apex_name = db.apex_name(zone).clone();
    let name = db.tree.node(node).name().clone();

    // Hash again even if the child zone was processed: the parent
    // zone may use different parameters.
    let hashed = hash_name(&params, &apex_name, &name);
    let (exact, cover) = find_cover(db, zone, &hashed);
    refs.ds_parent_cover = cover;
    refs.ds_parent_exact = if exact { cover } else { None };
    db.tree.set_nsec3(node, refs);
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Atom, Rr};
    use crate::rr::Ttl;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    #[test]
    fn hash_matches_the_rfc_5155_test_vector() {
        // RFC 5155 Appendix A: example. with salt aabbccdd and 12
        // iterations hashes to 0p9mhaveqvm6t7vbl5lop2u3t2rp3tom.
        let params = Nsec3Params {
            algorithm: HASH_ALGORITHM_SHA1,
            iterations: 12,
            salt: vec![0xaa, 0xbb, 0xcc, 0xdd].into(),
        };
        let hashed = hash(&params, &name("example."));
        assert_eq!(
            base32hex_encode(&hashed),
            b"0p9mhaveqvm6t7vbl5lop2u3t2rp3tom"
        );
    }

    #[test]
    fn hashing_is_case_insensitive() {
        let params = Nsec3Params {
            algorithm: HASH_ALGORITHM_SHA1,
            iterations: 0,
            salt: Box::new([]),
        };
        assert_eq!(
            hash(&params, &name("Example.")),
            hash(&params, &name("example."))
        );
    }

    /// Builds a small NSEC3-signed zone: the apex and `x.example.`
    /// exist, each with an NSEC3 record at its hashed owner name.
    fn build_signed_zone() -> (Namedb, ZoneId, Nsec3Params) {
        let params = Nsec3Params {
            algorithm: HASH_ALGORITHM_SHA1,
            iterations: 1,
            salt: vec![0xab].into(),
        };
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));

        let soa = Rr::new(vec![
            Atom::Domain(db.tree.insert(&name("ns1.example."))),
            Atom::Domain(db.tree.insert(&name("admin.example."))),
            Atom::Blob(Box::new(1u32.to_be_bytes())),
            Atom::Blob(Box::new(3600u32.to_be_bytes())),
            Atom::Blob(Box::new(900u32.to_be_bytes())),
            Atom::Blob(Box::new(86400u32.to_be_bytes())),
            Atom::Blob(Box::new(300u32.to_be_bytes())),
        ]);
        db.add_rr(zone, &name("example."), Type::SOA, Ttl::from(3600), soa)
            .unwrap();

        // An RRSIG at the apex marks the zone secure. The contents do
        // not matter for these tests.
        let rrsig = Rr::new(vec![
            Atom::Blob(u16::from(Type::SOA).to_be_bytes().into()),
            Atom::Blob(Box::new([8])),
            Atom::Blob(Box::new([1])),
            Atom::Blob(Box::new(3600u32.to_be_bytes())),
            Atom::Blob(Box::new(0u32.to_be_bytes())),
            Atom::Blob(Box::new(0u32.to_be_bytes())),
            Atom::Blob(Box::new(0u16.to_be_bytes())),
            Atom::Blob(name("example.").wire().into()),
            Atom::Blob(Box::new([0; 16])),
        ]);
        db.add_rr(zone, &name("example."), Type::RRSIG, Ttl::from(3600), rrsig)
            .unwrap();

        for owner in [name("example."), name("x.example.")] {
            let hashed_owner = hash_name(&params, &name("example."), &owner);
            let nsec3 = Rr::new(vec![
                Atom::Blob(Box::new([HASH_ALGORITHM_SHA1])),
                Atom::Blob(Box::new([0])),
                Atom::Blob((params.iterations as u16).to_be_bytes().into()),
                Atom::Blob({
                    let mut salt = vec![params.salt.len() as u8];
                    salt.extend_from_slice(&params.salt);
                    salt.into()
                }),
                Atom::Blob({
                    let mut next = vec![20u8];
                    next.extend_from_slice(&hash(&params, &owner));
                    next.into()
                }),
                // Window 0, 1 octet, SOA bit.
                Atom::Blob(Box::new([0, 1, 0x02])),
            ]);
            db.add_rr(zone, &hashed_owner, Type::NSEC3, Ttl::from(300), nsec3)
                .unwrap();
        }

        let x = Rr::new(vec![Atom::Blob(Box::new([10, 0, 0, 1]))]);
        db.add_rr(zone, &name("x.example."), Type::A, Ttl::from(300), x)
            .unwrap();

        (db, zone, params)
    }

    #[test]
    fn prehash_detects_parameters_and_marks_covers() {
        let (mut db, zone, params) = build_signed_zone();
        prehash_zone(&mut db, zone);

        assert!(db.zone(zone).is_secure);
        let detected = db.zone(zone).nsec3_params.as_ref().unwrap();
        assert_eq!(detected.iterations, params.iterations);
        assert_eq!(&detected.salt[..], &params.salt[..]);
        assert!(db.zone(zone).nsec3_last.is_some());

        // Every name of the zone got a cover, and names whose hash
        // has its own NSEC3 got an exact reference.
        let x = db.tree.find(&name("x.example.")).unwrap();
        assert!(db.tree.node(x).nsec3().cover.is_some());
        assert!(db.tree.node(x).nsec3().exact.is_some());
        assert!(db.tree.node(x).nsec3().wcard_child_cover.is_some());
        let apex = db.tree.find(&name("example.")).unwrap();
        assert!(db.tree.node(apex).nsec3().exact.is_some());
    }

    #[test]
    fn find_cover_wraps_around_to_the_last_owner() {
        let (mut db, zone, params) = build_signed_zone();
        prehash_zone(&mut db, zone);

        // A hashed name before every NSEC3 owner: the all-zeros label
        // sorts first among the hash labels.
        let early = name("example.").prepend(b"00000000000000000000000000000000").unwrap();
        let (exact, cover) = find_cover(&db, zone, &early);
        assert!(!exact);
        assert_eq!(cover, db.zone(zone).nsec3_last);
        let _ = params;
    }

    #[test]
    fn unsigned_zones_get_no_parameters() {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("plain."));
        prehash_zone(&mut db, zone);
        assert!(!db.zone(zone).is_secure);
        assert!(db.zone(zone).nsec3_params.is_none());
        assert!(db.zone(zone).nsec3_last.is_none());
    }
}
