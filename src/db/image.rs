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

//! The compiled database image.
//!
//! The zone compiler serializes the database it builds so that the
//! server can start without re-parsing zone files. The layout is:
//!
//! ```text
//! magic "NSDdbV06"
//! zone count (u32), then each zone's apex name
//! domain count (u32), then each domain name, in tree order
//! RRsets: (domain number, zone number, type, class, TTL, RR count,
//!          then for each RR its atom count and atoms)
//! u32 zero terminator
//! ```
//!
//! Domain-name fields of record data are written as the referenced
//! domain's number; every other atom is written as a length-prefixed
//! octet run. Domains are numbered 1, 2, 3, … in tree order at dump
//! time, so loading reverses the numbering by inserting names in file
//! order. The image is always written to a temporary file and moved
//! into place with `rename(2)`.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;

use crate::name::Dname;
use crate::rr::{descriptor_by_type, Ttl, Type};

use super::{Atom, Namedb, NodeId, Rr, Rrset};

/// The first eight octets of a database image.
pub const MAGIC: &[u8; 8] = b"NSDdbV06";

////////////////////////////////////////////////////////////////////////
// DUMPING                                                            //
////////////////////////////////////////////////////////////////////////

/// Writes the database image for `db` to `path`, atomically.
pub fn dump(db: &Namedb, path: &Path) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path)?;
    let mut out = BufWriter::new(file);
    dump_to(db, &mut out)?;
    out.flush()?;
    drop(out);
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn dump_to(db: &Namedb, out: &mut impl Write) -> io::Result<()> {
    out.write_all(MAGIC)?;

    out.write_all(&(db.zone_count() as u32).to_be_bytes())?;
    for zone in db.zone_ids() {
        write_dname(out, db.apex_name(zone))?;
    }

    // Number the domains in tree order.
    let tree_order: Vec<NodeId> = db.tree.iter().collect();
    let mut numbers: HashMap<NodeId, u32> = HashMap::with_capacity(tree_order.len());
    for (index, &id) in tree_order.iter().enumerate() {
        numbers.insert(id, index as u32 + 1);
    }

    out.write_all(&(tree_order.len() as u32).to_be_bytes())?;
    for &id in &tree_order {
        write_dname(out, db.tree.node(id).name())?;
    }
    debug!("dumping {} domain names", tree_order.len());

    for &id in &tree_order {
        for rrset in db.tree.node(id).rrsets() {
            write_rrset(out, db, &numbers, numbers[&id], rrset)?;
        }
    }
    out.write_all(&0u32.to_be_bytes())?;
    Ok(())
}

fn write_dname(out: &mut impl Write, name: &Dname) -> io::Result<()> {
    out.write_all(&[name.len() as u8])?;
    out.write_all(name.wire())
}

fn write_rrset(
    out: &mut impl Write,
    db: &Namedb,
    numbers: &HashMap<NodeId, u32>,
    domain_number: u32,
    rrset: &Rrset,
) -> io::Result<()> {
    out.write_all(&domain_number.to_be_bytes())?;
    out.write_all(&db.zone(rrset.zone).number().to_be_bytes())?;
    out.write_all(&u16::from(rrset.rr_type).to_be_bytes())?;
    out.write_all(&u16::from(crate::class::Class::IN).to_be_bytes())?;
    out.write_all(&u32::from(rrset.ttl).to_be_bytes())?;
    out.write_all(&(rrset.rrs.len() as u16).to_be_bytes())?;
    for rr in &rrset.rrs {
        out.write_all(&(rr.atoms.len() as u16).to_be_bytes())?;
        for atom in &rr.atoms {
            match atom {
                Atom::Domain(id) => out.write_all(&numbers[id].to_be_bytes())?,
                Atom::Blob(octets) => {
                    out.write_all(&(octets.len() as u16).to_be_bytes())?;
                    out.write_all(octets)?;
                }
            }
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// LOADING                                                            //
////////////////////////////////////////////////////////////////////////

/// Reads a database image back from `path`.
pub fn load(path: &Path) -> Result<Namedb, Error> {
    let file = File::open(path).map_err(Error::Io)?;
    load_from(&mut BufReader::new(file))
}

fn load_from(input: &mut impl Read) -> Result<Namedb, Error> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).map_err(Error::Io)?;
    if &magic != MAGIC {
        return Err(Error::BadMagic);
    }

    let mut db = Namedb::new();

    let zone_count = read_u32(input)?;
    for _ in 0..zone_count {
        let apex = read_dname(input)?;
        db.add_zone(&apex);
    }

    let domain_count = read_u32(input)? as usize;
    let mut by_number: Vec<NodeId> = Vec::with_capacity(domain_count);
    for _ in 0..domain_count {
        let name = read_dname(input)?;
        by_number.push(db.tree.insert(&name));
    }

    loop {
        let domain_number = read_u32(input)?;
        if domain_number == 0 {
            break;
        }
        let owner = *by_number
            .get(domain_number as usize - 1)
            .ok_or(Error::Corrupt("RRset references an unknown domain"))?;
        let zone_number = read_u32(input)?;
        let zone = db
            .zone_ids()
            .nth(zone_number as usize - 1)
            .ok_or(Error::Corrupt("RRset references an unknown zone"))?;
        let rr_type = Type::from(read_u16(input)?);
        let class = read_u16(input)?;
        if class != u16::from(crate::class::Class::IN) {
            return Err(Error::Corrupt("RRset has a class other than IN"));
        }
        let ttl = Ttl::from(read_u32(input)?);
        let rr_count = read_u16(input)?;
        let descriptor = descriptor_by_type(rr_type);
        let mut rrset = Rrset::new(zone, rr_type, ttl);
        for _ in 0..rr_count {
            let atom_count = read_u16(input)? as usize;
            if atom_count > descriptor.maximum() {
                return Err(Error::Corrupt("record has too many atoms for its type"));
            }
            let mut atoms = Vec::with_capacity(atom_count);
            for index in 0..atom_count {
                let kind = descriptor
                    .kind(index)
                    .ok_or(Error::Corrupt("record has too many atoms for its type"))?;
                if kind.is_domain() {
                    let number = read_u32(input)?;
                    let id = *by_number
                        .get(number as usize - 1)
                        .ok_or(Error::Corrupt("rdata references an unknown domain"))?;
                    atoms.push(Atom::Domain(id));
                } else {
                    let size = read_u16(input)? as usize;
                    let mut octets = vec![0u8; size];
                    input.read_exact(&mut octets).map_err(Error::Io)?;
                    atoms.push(Atom::Blob(octets.into()));
                }
            }
            rrset.rrs.push(Rr::new(atoms));
        }
        install_rrset(&mut db, owner, rrset);
    }

    Ok(db)
}

/// Attaches a fully built RRset to its owner, updating usage counters
/// and existence flags the way incremental insertion would.
fn install_rrset(db: &mut Namedb, owner: NodeId, rrset: Rrset) {
    for rr in &rrset.rrs {
        for atom in &rr.atoms {
            if let Atom::Domain(id) = atom {
                db.tree.node_mut(*id).usage += 1;
            }
        }
    }
    db.tree.node_mut(owner).rrsets.push(rrset);
    let mut walk = Some(owner);
    while let Some(id) = walk {
        let node = db.tree.node_mut(id);
        if node.is_existing {
            break;
        }
        node.is_existing = true;
        walk = node.parent;
    }
}

fn read_u16(input: &mut impl Read) -> Result<u16, Error> {
    let mut octets = [0u8; 2];
    input.read_exact(&mut octets).map_err(Error::Io)?;
    Ok(u16::from_be_bytes(octets))
}

fn read_u32(input: &mut impl Read) -> Result<u32, Error> {
    let mut octets = [0u8; 4];
    input.read_exact(&mut octets).map_err(Error::Io)?;
    Ok(u32::from_be_bytes(octets))
}

fn read_dname(input: &mut impl Read) -> Result<Dname, Error> {
    let mut len = [0u8; 1];
    input.read_exact(&mut len).map_err(Error::Io)?;
    let mut wire = vec![0u8; len[0] as usize];
    input.read_exact(&mut wire).map_err(Error::Io)?;
    Dname::from_wire_uncompressed_all(&wire).or(Err(Error::Corrupt("invalid domain name")))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while loading a database image.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BadMagic,
    Corrupt(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::BadMagic => f.write_str("not a database image (bad magic)"),
            Self::Corrupt(what) => write!(f, "corrupt database image: {}", what),
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
    use crate::db::AddStatus;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn build_sample_db() -> Namedb {
        let mut db = Namedb::new();
        let zone = db.add_zone(&name("example."));
        let mname = db.tree.insert(&name("ns1.example."));
        let rname = db.tree.insert(&name("hostmaster.example."));
        let soa = Rr::new(vec![
            Atom::Domain(mname),
            Atom::Domain(rname),
            Atom::Blob(Box::new(1u32.to_be_bytes())),
            Atom::Blob(Box::new(3600u32.to_be_bytes())),
            Atom::Blob(Box::new(900u32.to_be_bytes())),
            Atom::Blob(Box::new(86400u32.to_be_bytes())),
            Atom::Blob(Box::new(300u32.to_be_bytes())),
        ]);
        db.add_rr(zone, &name("example."), Type::SOA, Ttl::from(3600), soa)
            .unwrap();
        let ns = Rr::new(vec![Atom::Domain(mname)]);
        db.add_rr(zone, &name("example."), Type::NS, Ttl::from(3600), ns)
            .unwrap();
        let a = Rr::new(vec![Atom::Blob(Box::new([10, 0, 0, 1]))]);
        assert_eq!(
            db.add_rr(zone, &name("ns1.example."), Type::A, Ttl::from(3600), a),
            Ok(AddStatus::CreatedRrset)
        );
        db
    }

    #[test]
    fn dump_and_load_round_trip() {
        let db = build_sample_db();
        let mut image = Vec::new();
        dump_to(&db, &mut image).unwrap();
        assert_eq!(&image[0..8], MAGIC);

        let loaded = load_from(&mut image.as_slice()).unwrap();
        assert_eq!(loaded.zone_count(), 1);
        let zone = loaded.zone_ids().next().unwrap();
        assert_eq!(loaded.apex_name(zone), &name("example."));
        assert_eq!(loaded.soa_serial(zone), Some(1));

        let ns1 = loaded.tree.find(&name("ns1.example.")).unwrap();
        let a_rrset = loaded.tree.node(ns1).find_rrset(zone, Type::A).unwrap();
        assert_eq!(a_rrset.rrs[0].atoms[0].as_blob(), Some(&[10, 0, 0, 1][..]));
        assert_eq!(u32::from(a_rrset.ttl), 3600);

        // The SOA's MNAME survives as a domain reference to the same
        // name.
        let soa = loaded.soa(zone).unwrap();
        let mname = soa.rrs[0].atoms[0].as_domain().unwrap();
        assert_eq!(loaded.tree.node(mname).name(), &name("ns1.example."));
    }

    #[test]
    fn load_rejects_bad_magic() {
        let mut image = Vec::new();
        dump_to(&build_sample_db(), &mut image).unwrap();
        image[0] ^= 0xff;
        assert!(matches!(
            load_from(&mut image.as_slice()),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn truncated_images_are_detected() {
        let mut image = Vec::new();
        dump_to(&build_sample_db(), &mut image).unwrap();
        let truncated = &image[..image.len() - 5];
        assert!(load_from(&mut &truncated[..]).is_err());
    }
}
