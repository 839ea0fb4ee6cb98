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

//! The transfer journal.
//!
//! Every message of a zone transfer is appended to an on-disk journal
//! before it counts, framed with the zone, the serials, the query ID,
//! and a sequence number. A commit record seals a transfer; parts
//! without a commit are rolled back when the journal is replayed on
//! restart. The journal has a single writer (the transfer
//! coordinator) and is only ever appended to.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use log::{info, warn};

use crate::name::Dname;

const TAG_PART: u8 = b'P';
const TAG_COMMIT: u8 = b'C';

/// An append-only journal file.
pub struct Journal {
    file: File,
}

impl Journal {
    /// Opens (creating if needed) the journal at `path` for
    /// appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Appends one received transfer message.
    pub fn write_part(
        &mut self,
        zone: &Dname,
        serial_old: u32,
        serial_new: u32,
        query_id: u16,
        seq_nr: u32,
        part: &[u8],
    ) -> io::Result<()> {
        let mut record = Vec::with_capacity(part.len() + 64);
        record.push(TAG_PART);
        push_frame_header(&mut record, zone, serial_old, serial_new, query_id);
        record.extend_from_slice(&seq_nr.to_be_bytes());
        record.extend_from_slice(&(part.len() as u32).to_be_bytes());
        record.extend_from_slice(part);
        self.file.write_all(&record)?;
        self.file.sync_data()
    }

    /// Appends a commit (or rollback, with `ok == false`) record
    /// sealing the transfer described.
    pub fn write_commit(
        &mut self,
        zone: &Dname,
        serial_old: u32,
        serial_new: u32,
        query_id: u16,
        num_parts: u32,
        ok: bool,
        log: &str,
    ) -> io::Result<()> {
        let mut record = Vec::with_capacity(log.len() + 64);
        record.push(TAG_COMMIT);
        push_frame_header(&mut record, zone, serial_old, serial_new, query_id);
        record.extend_from_slice(&num_parts.to_be_bytes());
        record.push(ok as u8);
        record.extend_from_slice(&(log.len() as u16).to_be_bytes());
        record.extend_from_slice(log.as_bytes());
        self.file.write_all(&record)?;
        self.file.sync_data()
    }
}

fn push_frame_header(
    record: &mut Vec<u8>,
    zone: &Dname,
    serial_old: u32,
    serial_new: u32,
    query_id: u16,
) {
    record.push(zone.len() as u8);
    record.extend_from_slice(zone.wire());
    record.extend_from_slice(&serial_old.to_be_bytes());
    record.extend_from_slice(&serial_new.to_be_bytes());
    record.extend_from_slice(&query_id.to_be_bytes());
}

/// A committed transfer reassembled from the journal.
#[derive(Debug)]
pub struct CommittedTransfer {
    pub zone: Dname,
    pub serial_old: u32,
    pub serial_new: u32,
    pub parts: Vec<Vec<u8>>,
}

/// Replays the journal at `path`, calling `apply` for each committed
/// transfer in file order. Uncommitted or rolled-back parts are
/// discarded, as is a truncated tail (the normal aftermath of a
/// crash mid-append).
pub fn replay(path: &Path, apply: &mut dyn FnMut(CommittedTransfer)) -> io::Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut input = BufReader::new(file);

    // Transfers in flight, keyed by zone, query id and target serial.
    let mut pending: HashMap<(Dname, u16, u32), Vec<Vec<u8>>> = HashMap::new();
    let mut committed = 0usize;

    loop {
        let mut tag = [0u8; 1];
        match input.read_exact(&mut tag) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let header = match read_frame_header(&mut input) {
            Ok(header) => header,
            Err(_) => {
                warn!("journal has a truncated tail; discarding it");
                break;
            }
        };
        let (zone, serial_old, serial_new, query_id) = header;

        match tag[0] {
            TAG_PART => {
                let (seq_nr, part) = match read_part_body(&mut input) {
                    Ok(body) => body,
                    Err(_) => {
                        warn!("journal has a truncated part record; discarding the tail");
                        break;
                    }
                };
                let parts = pending
                    .entry((zone.clone(), query_id, serial_new))
                    .or_default();
                if parts.len() as u32 != seq_nr {
                    // Out-of-sequence parts belong to an abandoned
                    // attempt.
                    parts.clear();
                    if seq_nr == 0 {
                        parts.push(part);
                    }
                } else {
                    parts.push(part);
                }
            }
            TAG_COMMIT => {
                let (num_parts, ok) = match read_commit_body(&mut input) {
                    Ok(body) => body,
                    Err(_) => {
                        warn!("journal has a truncated commit record; discarding the tail");
                        break;
                    }
                };
                let parts = pending
                    .remove(&(zone.clone(), query_id, serial_new))
                    .unwrap_or_default();
                if ok && parts.len() as u32 == num_parts {
                    committed += 1;
                    apply(CommittedTransfer {
                        zone,
                        serial_old,
                        serial_new,
                        parts,
                    });
                }
            }
            _ => {
                warn!("journal has an unknown record tag; discarding the tail");
                break;
            }
        }
    }

    if committed > 0 {
        info!("replayed {} committed transfers from the journal", committed);
    }
    Ok(())
}

type FrameHeader = (Dname, u32, u32, u16);

fn read_frame_header(input: &mut impl Read) -> io::Result<FrameHeader> {
    let mut len = [0u8; 1];
    input.read_exact(&mut len)?;
    let mut wire = vec![0u8; len[0] as usize];
    input.read_exact(&mut wire)?;
    let zone = Dname::from_wire_uncompressed_all(&wire)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad zone name"))?;
    let mut fixed = [0u8; 10];
    input.read_exact(&mut fixed)?;
    Ok((
        zone,
        u32::from_be_bytes(fixed[0..4].try_into().unwrap()),
        u32::from_be_bytes(fixed[4..8].try_into().unwrap()),
        u16::from_be_bytes(fixed[8..10].try_into().unwrap()),
    ))
}

fn read_part_body(input: &mut impl Read) -> io::Result<(u32, Vec<u8>)> {
    let mut fixed = [0u8; 8];
    input.read_exact(&mut fixed)?;
    let seq_nr = u32::from_be_bytes(fixed[0..4].try_into().unwrap());
    let len = u32::from_be_bytes(fixed[4..8].try_into().unwrap()) as usize;
    let mut part = vec![0u8; len];
    input.read_exact(&mut part)?;
    Ok((seq_nr, part))
}

fn read_commit_body(input: &mut impl Read) -> io::Result<(u32, bool)> {
    let mut fixed = [0u8; 7];
    input.read_exact(&mut fixed)?;
    let num_parts = u32::from_be_bytes(fixed[0..4].try_into().unwrap());
    let ok = fixed[4] != 0;
    let log_len = u16::from_be_bytes(fixed[5..7].try_into().unwrap()) as usize;
    let mut log = vec![0u8; log_len];
    input.read_exact(&mut log)?;
    Ok((num_parts, ok))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_journal() -> PathBuf {
        std::env::temp_dir().join(format!(
            "belfry-journal-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn replay_all(path: &Path) -> Vec<CommittedTransfer> {
        let mut out = Vec::new();
        replay(path, &mut |t| out.push(t)).unwrap();
        out
    }

    #[test]
    fn committed_transfers_replay_in_order() {
        let path = temp_journal();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .write_part(&name("example."), 1, 2, 77, 0, b"part-a")
                .unwrap();
            journal
                .write_part(&name("example."), 1, 2, 77, 1, b"part-b")
                .unwrap();
            journal
                .write_commit(&name("example."), 1, 2, 77, 2, true, "test commit")
                .unwrap();
            journal
                .write_part(&name("other."), 5, 6, 78, 0, b"other-part")
                .unwrap();
            journal
                .write_commit(&name("other."), 5, 6, 78, 1, true, "second commit")
                .unwrap();
        }

        let transfers = replay_all(&path);
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].zone, name("example."));
        assert_eq!(transfers[0].serial_new, 2);
        assert_eq!(transfers[0].parts, vec![b"part-a".to_vec(), b"part-b".to_vec()]);
        assert_eq!(transfers[1].zone, name("other."));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn uncommitted_parts_are_rolled_back() {
        let path = temp_journal();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .write_part(&name("example."), 1, 2, 77, 0, b"dangling")
                .unwrap();
        }
        assert!(replay_all(&path).is_empty());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn explicit_rollbacks_are_honored() {
        let path = temp_journal();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .write_part(&name("example."), 1, 2, 77, 0, b"reverted")
                .unwrap();
            journal
                .write_commit(&name("example."), 1, 2, 77, 1, false, "rollback")
                .unwrap();
        }
        assert!(replay_all(&path).is_empty());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn truncated_tails_are_discarded() {
        let path = temp_journal();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .write_part(&name("example."), 1, 2, 77, 0, b"good")
                .unwrap();
            journal
                .write_commit(&name("example."), 1, 2, 77, 1, true, "good commit")
                .unwrap();
        }
        // Append a second, torn transfer by hand.
        let mut raw = std::fs::read(&path).unwrap();
        let cut = raw.len();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .write_part(&name("example."), 2, 3, 78, 0, b"torn")
                .unwrap();
        }
        raw = std::fs::read(&path).unwrap();
        raw.truncate(cut + 10);
        std::fs::write(&path, &raw).unwrap();

        let transfers = replay_all(&path);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].serial_new, 2);
        std::fs::remove_file(&path).unwrap();
    }
}
