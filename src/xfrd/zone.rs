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

//! The per-zone transfer state machine.
//!
//! Each secondary zone cycles between three states: `ok` (fresh data,
//! waiting for the refresh timer), `refreshing` (a newer version may
//! exist; probing masters), and `expired` (the data outlived the SOA
//! expire interval and must not be served). SOA timers, NOTIFY
//! messages, and transfer results drive the transitions; masters are
//! tried in rounds, and every timer is jittered so that a fleet of
//! secondaries does not stampede its master.
//!
//! The machine tracks three SOA snapshots: `soa_nsd` (what the
//! serving database holds), `soa_disk` (the most recently committed
//! transfer), and `soa_notified` (the serial a NOTIFY promised).

use std::collections::HashMap;
use std::net::SocketAddr;

use log::{info, warn};
use rand::Rng;

use crate::message::tsig::{self, StreamVerifier};
use crate::message::Reader;
use crate::name::Dname;
use crate::rr::Type;

use super::journal::Journal;
use super::packet::{build_request, serial_newer, XfrdSoa};

/// Timeout used to pace probes when no SOA is known yet (the actual
/// wait is between one and two times this).
pub const TRANSFER_TIMEOUT: i64 = 10;

/// Seconds before an idle transfer TCP connection is dropped.
pub const TCP_TIMEOUT: i64 = 120;

/// Seconds before a UDP probe times out.
pub const UDP_TIMEOUT: i64 = 10;

/// The smallest accepted refresh interval.
pub const LOWERBOUND_REFRESH: i64 = 1;

/// The smallest accepted retry interval.
pub const LOWERBOUND_RETRY: i64 = 1;

/// Full passes over the master list before the retry timer is
/// honored.
pub const MAX_ROUNDS: i32 = 3;

/// One master of a secondary zone.
#[derive(Clone, Debug)]
pub struct Master {
    pub addr: SocketAddr,
    pub key: Option<String>,
    pub use_axfr_only: bool,
}

/// The zone's freshness state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneState {
    Expired,
    Refreshing,
    Ok,
}

/// What a received transfer packet amounted to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketResult {
    /// The master's serial equals ours; the lease was renewed.
    NewLease,

    /// The stream completed and was committed to the journal.
    Transfer,

    /// More packets of the stream are expected (TCP only).
    More,

    /// The reply requires retrying over TCP.
    Tcp,

    /// The packet was bad; try the next master.
    Bad,
}

/// The incremental-transfer detection stage of the current stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IxfrStage {
    /// Nothing decided yet (assume AXFR).
    Unknown,

    /// The second record was an old-serial SOA: this is an IXFR.
    Detected,

    /// The middle SOA of the IXFR has been seen.
    MiddleSeen,
}

/// The transfer state machine of one secondary zone.
pub struct XfrdZone {
    pub apex: Dname,
    pub masters: Vec<Master>,
    pub notify_targets: Vec<SocketAddr>,
    pub state: ZoneState,

    // Master cycling.
    pub master_num: usize,
    pub next_master: Option<usize>,
    pub round_num: i32,

    // SOA snapshots and their acquisition times.
    pub soa_nsd: Option<(XfrdSoa, i64)>,
    pub soa_disk: Option<(XfrdSoa, i64)>,
    pub soa_notified: Option<(Option<u32>, i64)>,

    /// The absolute time of the next timeout event.
    pub timeout: Option<i64>,

    // In-flight request state.
    pub udp: Option<std::net::UdpSocket>,
    pub tcp_conn: Option<usize>,
    pub tcp_waiting: bool,
    pub query_id: u16,
    msg_seq_nr: u32,
    msg_rr_count: u32,
    msg_old_serial: u32,
    msg_new_serial: u32,
    msg_is_ixfr: IxfrStage,
    tsig: Option<StreamVerifier>,

    // Outbound NOTIFY state.
    pub notify_current: Option<usize>,
    pub notify_retry: u32,
    pub notify_timeout: Option<i64>,
    pub notify_udp: Option<std::net::UdpSocket>,
    pub notify_query_id: u16,
    pub notify_key: Option<String>,
}

impl XfrdZone {
    pub fn new(apex: Dname, masters: Vec<Master>, notify_targets: Vec<SocketAddr>) -> Self {
        Self {
            apex,
            masters,
            notify_targets,
            state: ZoneState::Expired,
            master_num: 0,
            next_master: None,
            round_num: 0,
            soa_nsd: None,
            soa_disk: None,
            soa_notified: None,
            timeout: None,
            udp: None,
            tcp_conn: None,
            tcp_waiting: false,
            query_id: 0,
            msg_seq_nr: 0,
            msg_rr_count: 0,
            msg_old_serial: 0,
            msg_new_serial: 0,
            msg_is_ixfr: IxfrStage::Unknown,
            tsig: None,
            notify_current: None,
            notify_retry: 0,
            notify_timeout: None,
            notify_udp: None,
            notify_query_id: 0,
            notify_key: None,
        }
    }

    pub fn current_master(&self) -> Option<&Master> {
        self.masters.get(self.master_num)
    }

    ////////////////////////////////////////////////////////////////////
    // TIMERS                                                         //
    ////////////////////////////////////////////////////////////////////

    /// Schedules the next timeout for the absolute time `t`. Values
    /// more than ten seconds out are jittered into the 90–100 % range
    /// so that timers do not line up; never later, so zones cannot
    /// expire late.
    pub fn set_timer(&mut self, t: i64, now: i64) {
        let t = if t > now + 10 {
            let extra = t - now;
            let base = extra * 9 / 10;
            now + base + rand::thread_rng().gen_range(0..=(extra - base))
        } else {
            t
        };
        self.timeout = Some(t);
    }

    pub fn set_refresh_now(&mut self, now: i64) {
        self.timeout = Some(now);
    }

    /// Timer for the refresh (or expire, whichever is earlier) of a
    /// zone in the `ok` state.
    pub fn set_timer_refresh(&mut self, now: i64) {
        let (soa, acquired) = match (&self.soa_disk, self.state) {
            (Some((soa, acquired)), ZoneState::Ok) => (soa.clone(), *acquired),
            _ => return self.set_timer_retry(now),
        };
        let refresh = acquired + soa.refresh as i64;
        let expire = acquired + soa.expire as i64;
        let at = refresh.min(expire).max(acquired + LOWERBOUND_REFRESH);
        self.set_timer(at, now);
    }

    /// Timer for the next retry, bounded by the expire time.
    pub fn set_timer_retry(&mut self, now: i64) {
        match &self.soa_disk {
            None => {
                let wait = TRANSFER_TIMEOUT + rand::thread_rng().gen_range(0..TRANSFER_TIMEOUT);
                self.timeout = Some(now + wait);
            }
            Some((soa, acquired)) => {
                let retry = (soa.retry as i64).max(LOWERBOUND_RETRY);
                if self.state == ZoneState::Expired
                    || now + retry < acquired + soa.expire as i64
                {
                    self.set_timer(now + retry, now);
                } else {
                    let expire = (soa.expire as i64).max(LOWERBOUND_RETRY);
                    self.set_timer(acquired + expire, now);
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STATE                                                          //
    ////////////////////////////////////////////////////////////////////

    pub fn set_state(&mut self, state: ZoneState) {
        if state != self.state {
            let was_expired = self.state == ZoneState::Expired || state == ZoneState::Expired;
            self.state = state;
            if was_expired {
                info!(
                    "zone {} is now {}",
                    self.apex,
                    match state {
                        ZoneState::Expired => "expired",
                        ZoneState::Refreshing => "refreshing",
                        ZoneState::Ok => "ok",
                    }
                );
            }
        }
    }

    /// The timeout handler: check expiry and refresh deadlines, then
    /// make a new request.
    pub fn handle_timeout(&mut self, now: i64) -> TimeoutAction {
        if self.tcp_waiting {
            warn!("zone {} skips retry, TCP connections full", self.apex);
            self.set_timer_retry(now);
            return TimeoutAction::None;
        }

        if let Some((soa, acquired)) = &self.soa_disk {
            let soa = soa.clone();
            let acquired = *acquired;
            if self.state != ZoneState::Expired && now >= acquired + soa.expire as i64 {
                warn!("zone {} has expired", self.apex);
                self.set_state(ZoneState::Expired);
            } else if self.state == ZoneState::Ok && now >= acquired + soa.refresh as i64 {
                self.set_state(ZoneState::Refreshing);
            }
        }
        TimeoutAction::MakeRequest
    }

    /// Cycles to the master to query next. Returns `false` when a
    /// full set of rounds is exhausted and the zone should wait for
    /// the retry timer instead.
    pub fn cycle_master(&mut self, now: i64) -> bool {
        if let Some(next) = self.next_master.take() {
            self.master_num = if next < self.masters.len() { next } else { 0 };
            self.round_num = 0; // fresh rounds after a notify
            return true;
        }
        if self.round_num >= 0 && self.master_num + 1 < self.masters.len() {
            self.master_num += 1;
        } else {
            self.master_num = 0;
            self.round_num += 1;
        }
        if self.round_num >= MAX_ROUNDS {
            self.round_num = -1;
            self.set_timer_retry(now);
            return false;
        }
        true
    }

    ////////////////////////////////////////////////////////////////////
    // REQUESTS                                                       //
    ////////////////////////////////////////////////////////////////////

    /// Starts a fresh stream state for a new request with `query_id`,
    /// arming TSIG verification when the master is keyed.
    pub fn begin_stream(
        &mut self,
        query_id: u16,
        request_mac: Option<(tsig::Key, Vec<u8>)>,
    ) {
        self.query_id = query_id;
        self.msg_seq_nr = 0;
        self.msg_rr_count = 0;
        self.msg_is_ixfr = IxfrStage::Unknown;
        self.tsig = request_mac.map(|(key, mac)| StreamVerifier::new(key, mac));
    }

    /// Sends an IXFR probe over UDP. Returns the socket to poll for
    /// the reply.
    pub fn send_ixfr_request_udp(
        &mut self,
        keys: &HashMap<String, tsig::Key>,
        now: i64,
    ) -> std::io::Result<()> {
        let master = self.current_master().cloned().expect("a master is selected");
        let soa = self.soa_disk.as_ref().map(|(soa, _)| soa.clone());
        let (mut request, query_id) = build_request(&self.apex, Type::IXFR, soa.as_ref());

        let mac = match master.key.as_deref().and_then(|name| keys.get(name)) {
            Some(key) => {
                let mac = tsig::sign_request(&mut request, key, now as u64);
                Some((key.clone(), mac))
            }
            None => None,
        };
        self.begin_stream(query_id, mac);

        let socket = match master.addr {
            SocketAddr::V4(_) => std::net::UdpSocket::bind(("0.0.0.0", 0))?,
            SocketAddr::V6(_) => std::net::UdpSocket::bind(("::", 0))?,
        };
        socket.set_nonblocking(true)?;
        socket.send_to(&request, master.addr)?;
        info!(
            "zone {} sent udp request for ixfr={} to {}",
            self.apex,
            soa.map(|s| s.serial).unwrap_or(0),
            master.addr,
        );
        self.udp = Some(socket);
        Ok(())
    }

    /// Builds the request for a TCP transfer: AXFR when nothing is on
    /// disk or the master insists, IXFR otherwise.
    pub fn build_tcp_request(&mut self, keys: &HashMap<String, tsig::Key>, now: i64) -> Vec<u8> {
        let master = self.current_master().cloned().expect("a master is selected");
        let use_axfr = self.soa_disk.is_none() || master.use_axfr_only;
        let soa = if use_axfr {
            None
        } else {
            self.soa_disk.as_ref().map(|(soa, _)| soa.clone())
        };
        let qtype = if use_axfr { Type::AXFR } else { Type::IXFR };
        let (mut request, query_id) = build_request(&self.apex, qtype, soa.as_ref());
        let mac = match master.key.as_deref().and_then(|name| keys.get(name)) {
            Some(key) => {
                let mac = tsig::sign_request(&mut request, key, now as u64);
                Some((key.clone(), mac))
            }
            None => None,
        };
        self.begin_stream(query_id, mac);
        request
    }

    ////////////////////////////////////////////////////////////////////
    // REPLY PROCESSING                                               //
    ////////////////////////////////////////////////////////////////////

    /// Handles one received transfer packet: validate it, stream it
    /// to the journal, and commit when the stream completes.
    pub fn handle_received_xfr_packet(
        &mut self,
        packet: &mut Vec<u8>,
        via_tcp: bool,
        journal: &mut Journal,
        now: i64,
    ) -> PacketResult {
        let mut soa = None;
        let result = self.parse_received_xfr_packet(packet, via_tcp, now, &mut soa);
        match result {
            PacketResult::More | PacketResult::Transfer => (),
            PacketResult::NewLease | PacketResult::Tcp => return result,
            PacketResult::Bad => {
                if self.msg_seq_nr > 0 {
                    // Roll back the parts written for this stream.
                    let log = format!(
                        "zone {} xfr rollback serial {} at time {} of {} parts",
                        self.apex, self.msg_new_serial, now, self.msg_seq_nr,
                    );
                    if let Err(e) = journal.write_commit(
                        &self.apex,
                        self.msg_old_serial,
                        self.msg_new_serial,
                        self.query_id,
                        self.msg_seq_nr,
                        false,
                        &log,
                    ) {
                        warn!("zone {}: journal rollback failed: {}", self.apex, e);
                    }
                    info!("zone {} xfr reverted", self.apex);
                }
                return PacketResult::Bad;
            }
        }

        // Persist this part.
        if let Err(e) = journal.write_part(
            &self.apex,
            self.msg_old_serial,
            self.msg_new_serial,
            self.query_id,
            self.msg_seq_nr,
            packet,
        ) {
            warn!("zone {}: journal write failed: {}", self.apex, e);
            return PacketResult::Bad;
        }
        self.msg_seq_nr += 1;
        if result == PacketResult::More {
            return PacketResult::More;
        }

        // The stream is complete; seal it.
        let log = format!(
            "zone {} received update to serial {} at time {} in {} parts",
            self.apex, self.msg_new_serial, now, self.msg_seq_nr,
        );
        if let Err(e) = journal.write_commit(
            &self.apex,
            self.msg_old_serial,
            self.msg_new_serial,
            self.query_id,
            self.msg_seq_nr,
            true,
            &log,
        ) {
            warn!("zone {}: journal commit failed: {}", self.apex, e);
            return PacketResult::Bad;
        }
        info!("zone {} committed \"{}\"", self.apex, log);

        let soa = soa.expect("a completed transfer carries its SOA");
        self.soa_disk = Some((soa, now));
        if let Some((notified_serial, _)) = self.soa_notified {
            let answered = match notified_serial {
                None => true,
                Some(serial) => !serial_newer(serial, self.msg_new_serial),
            };
            if answered {
                self.soa_notified = None;
            }
        }
        if self.soa_notified.is_none() {
            // An expired zone stays expired until the new data is
            // actually loaded; serving would hand out stale records.
            if self.state != ZoneState::Expired {
                self.set_state(ZoneState::Ok);
            }
            self.round_num = -1;
            self.set_timer_refresh(now);
            PacketResult::Transfer
        } else {
            // An even newer serial was promised; keep querying.
            PacketResult::Bad
        }
    }

    fn parse_received_xfr_packet(
        &mut self,
        packet: &mut Vec<u8>,
        via_tcp: bool,
        now: i64,
        soa_out: &mut Option<XfrdSoa>,
    ) -> PacketResult {
        let reader = match Reader::try_from(packet.as_slice()) {
            Ok(reader) => reader,
            Err(_) => return PacketResult::Bad,
        };
        if reader.id() != self.query_id {
            warn!("zone {} received bad query id, dropped", self.apex);
            return PacketResult::Bad;
        }
        if reader.rcode() != crate::message::Rcode::NoError {
            warn!(
                "zone {} received error code {} from master",
                self.apex,
                reader.rcode(),
            );
            return PacketResult::Bad;
        }
        let tc = reader.tc();

        // TSIG: verify and strip, keeping the rolling digest.
        if let Some(verifier) = self.tsig.as_mut() {
            if let Err(e) = verifier.process(packet, now as u64) {
                warn!("zone {}: dropping xfr reply due to TSIG: {}", self.apex, e);
                return PacketResult::Bad;
            }
        }

        let mut reader = match Reader::try_from(packet.as_slice()) {
            Ok(reader) => reader,
            Err(_) => return PacketResult::Bad,
        };
        for _ in 0..reader.qdcount() {
            if reader.read_question().is_err() {
                return PacketResult::Bad;
            }
        }
        let ancount = reader.ancount() as usize;
        if ancount == 0 {
            info!("zone {}: too short xfr packet: no answer", self.apex);
            return PacketResult::Bad;
        }
        let mut ancount_todo = ancount;

        if self.msg_rr_count == 0 {
            // The first record of the stream must be the new SOA.
            let rr = match reader.read_rr() {
                Ok(rr) => rr,
                Err(_) => return PacketResult::Bad,
            };
            let rdata_offset = reader.position() - rr.rdata.len();
            let soa = match XfrdSoa::parse(packet, &rr, rdata_offset) {
                Some(soa) if rr.owner == self.apex => soa,
                _ => {
                    warn!("zone {}: no SOA begins the answer section", self.apex);
                    return PacketResult::Bad;
                }
            };

            if let Some((disk, _)) = &self.soa_disk {
                if self.state != ZoneState::Expired && serial_newer(disk.serial, soa.serial) {
                    info!("zone {} ignoring old serial from master", self.apex);
                    return PacketResult::Bad;
                }
                if disk.serial == soa.serial {
                    info!("zone {} got update indicating current serial", self.apex);
                    if self.soa_notified.is_none() {
                        // A new lease on the current version.
                        let serial = soa.serial;
                        self.soa_disk = Some((soa, now));
                        if let Some((nsd, acquired)) = &mut self.soa_nsd {
                            if nsd.serial == serial {
                                *acquired = now;
                            }
                        }
                        self.set_state(ZoneState::Ok);
                        self.round_num = -1;
                        self.set_timer_refresh(now);
                        return PacketResult::NewLease;
                    }
                    return PacketResult::Bad; // chase the notified serial
                }
            }

            self.msg_new_serial = soa.serial;
            self.msg_old_serial = self.soa_disk.as_ref().map(|(s, _)| s.serial).unwrap_or(0);
            self.msg_rr_count = 1;
            self.msg_is_ixfr = IxfrStage::Unknown;
            *soa_out = Some(soa);
            ancount_todo = ancount - 1;
        }

        if !via_tcp && tc {
            info!("zone {} received TC; retrying over tcp", self.apex);
            return PacketResult::Tcp;
        }
        if !via_tcp && ancount < 2 {
            // Too short to carry transfer data; the serial is newer,
            // so go and fetch it over TCP.
            info!("zone {}: udp reply is short, trying tcp", self.apex);
            return PacketResult::Tcp;
        }

        let mut done = false;
        if !self.check_xfr_rrs(packet, &mut reader, ancount_todo, &mut done, soa_out) {
            info!("zone {} sent a bad xfr reply", self.apex);
            return PacketResult::Bad;
        }
        if !via_tcp && !done {
            // IXFR over UDP larger than one datagram: fall back to
            // TCP rather than waiting for packets that cannot come.
            info!("zone {}: udp reply incomplete, trying tcp", self.apex);
            return PacketResult::Tcp;
        }
        if !done {
            return PacketResult::More;
        }
        if let Some(verifier) = &self.tsig {
            if !verifier.last_was_signed() {
                info!("zone {}: last packet of reply has no TSIG", self.apex);
                return PacketResult::Bad;
            }
        }
        PacketResult::Transfer
    }

    /// Validates the remaining records of a transfer packet, tracking
    /// the AXFR/IXFR shape of the stream.
    fn check_xfr_rrs(
        &mut self,
        packet: &[u8],
        reader: &mut Reader,
        count: usize,
        done: &mut bool,
        soa_out: &mut Option<XfrdSoa>,
    ) -> bool {
        for _ in 0..count {
            let rr = match reader.read_rr() {
                Ok(rr) => rr,
                Err(_) => return false,
            };
            if !rr.owner.eq_or_subdomain_of(&self.apex) {
                return false;
            }
            if rr.rr_type == Type::SOA {
                let rdata_offset = reader.position() - rr.rdata.len();
                let soa = match XfrdSoa::parse(packet, &rr, rdata_offset) {
                    Some(soa) => soa,
                    None => return false,
                };
                if self.msg_rr_count == 1 && soa.serial != self.msg_new_serial {
                    // The second record is an older SOA: an IXFR.
                    self.msg_is_ixfr = IxfrStage::Detected;
                    match &self.soa_disk {
                        None => return false, // got IXFR but need AXFR
                        Some((disk, _)) if disk.serial != soa.serial => return false,
                        _ => (),
                    }
                    self.msg_old_serial = soa.serial;
                } else if soa.serial == self.msg_new_serial {
                    if self.msg_is_ixfr == IxfrStage::Detected {
                        self.msg_is_ixfr = IxfrStage::MiddleSeen;
                    } else {
                        *done = true;
                        *soa_out = Some(soa);
                    }
                }
            }
            self.msg_rr_count += 1;
        }
        true
    }

    ////////////////////////////////////////////////////////////////////
    // NOTIFY                                                         //
    ////////////////////////////////////////////////////////////////////

    /// Handles an incoming NOTIFY. Returns whether a transfer should
    /// be started right away.
    pub fn handle_incoming_notify(&mut self, soa_serial: Option<u32>, now: i64) -> bool {
        if let (Some(serial), Some((disk, _))) = (soa_serial, &self.soa_disk) {
            if self.state != ZoneState::Expired && !serial_newer(serial, disk.serial) {
                return false; // old news; our data is valid
            }
        }
        match soa_serial {
            None => self.soa_notified = Some((None, now)),
            Some(serial) => {
                let update = match self.soa_notified {
                    Some((Some(existing), _)) => serial_newer(serial, existing),
                    Some((None, _)) | None => true,
                };
                if update {
                    self.soa_notified = Some((Some(serial), now));
                } else if let Some((existing, _)) = self.soa_notified.take() {
                    self.soa_notified = Some((existing, now));
                }
            }
        }
        if self.state == ZoneState::Ok {
            self.set_state(ZoneState::Refreshing);
        }
        true
    }

    /// Starts the outbound NOTIFY sequence toward all configured
    /// targets.
    pub fn send_notify(&mut self, now: i64) {
        if self.notify_targets.is_empty() {
            return;
        }
        self.notify_retry = 0;
        self.notify_current = Some(0);
        self.notify_timeout = Some(now);
    }

    pub fn notify_disable(&mut self) {
        self.notify_current = None;
        self.notify_timeout = None;
        self.notify_udp = None;
    }

    /// Advances to the next NOTIFY target, or stops when the list is
    /// exhausted.
    pub fn notify_next(&mut self) {
        self.notify_retry = 0;
        match self.notify_current {
            Some(index) if index + 1 < self.notify_targets.len() => {
                self.notify_current = Some(index + 1);
            }
            _ => self.notify_disable(),
        }
    }
}

/// What a zone timeout asks the coordinator to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutAction {
    None,
    MakeRequest,
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::message::writer::Section;
    use crate::message::{Question, Writer};
    use crate::rr::Ttl;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn temp_journal() -> (Journal, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "belfry-xfrd-zone-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        (Journal::open(&path).unwrap(), path)
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

    fn test_zone() -> XfrdZone {
        XfrdZone::new(
            name("example."),
            vec![Master {
                addr: "192.0.2.1:53".parse().unwrap(),
                key: None,
                use_axfr_only: false,
            }],
            vec![],
        )
    }

    /// Builds a transfer reply with the given answer records.
    fn build_reply(id: u16, records: &[(&str, Type, Vec<u8>)]) -> Vec<u8> {
        let mut writer = Writer::new(u16::MAX as usize);
        writer.set_id(id);
        writer.set_qr(true);
        writer
            .add_question(&Question {
                qname: name("example."),
                qtype: Type::IXFR,
                qclass: Class::IN,
            })
            .unwrap();
        for (owner, rr_type, rdata) in records {
            writer
                .add_raw_rr(
                    Section::Answer,
                    &name(owner),
                    *rr_type,
                    u16::from(Class::IN),
                    Ttl::from(300),
                    rdata,
                )
                .unwrap();
        }
        writer.finish()
    }

    fn soa_rdata(serial: u32) -> Vec<u8> {
        sample_soa(serial).rdata()
    }

    #[test]
    fn timers_are_jittered_downward_only() {
        let mut zone = test_zone();
        for _ in 0..50 {
            zone.set_timer(1000, 0);
            let t = zone.timeout.unwrap();
            assert!(t <= 1000, "timers must never fire later than asked");
            assert!(t >= 900, "jitter stays within 90-100%");
        }
        // Near-term timers are not jittered.
        zone.set_timer(5, 0);
        assert_eq!(zone.timeout, Some(5));
    }

    #[test]
    fn rounds_over_masters_end_in_a_retry_wait() {
        let mut zone = test_zone();
        zone.masters.push(Master {
            addr: "192.0.2.2:53".parse().unwrap(),
            key: None,
            use_axfr_only: false,
        });
        zone.soa_disk = Some((sample_soa(1), 0));

        let mut requests = 0;
        while zone.cycle_master(100) {
            requests += 1;
            assert!(requests <= 16, "master cycling must terminate");
        }
        // Two masters, three rounds.
        assert_eq!(zone.round_num, -1);
        assert!(zone.timeout.is_some());
    }

    #[test]
    fn notifies_pin_the_state_and_serial() {
        let mut zone = test_zone();
        zone.soa_disk = Some((sample_soa(10), 0));
        zone.state = ZoneState::Ok;

        // An old serial is ignored.
        assert!(!zone.handle_incoming_notify(Some(9), 100));
        assert_eq!(zone.state, ZoneState::Ok);

        // A newer serial moves the zone to refreshing.
        assert!(zone.handle_incoming_notify(Some(11), 100));
        assert_eq!(zone.state, ZoneState::Refreshing);
        assert_eq!(zone.soa_notified, Some((Some(11), 100)));

        // A notify without a SOA is always acted upon.
        let mut zone = test_zone();
        zone.state = ZoneState::Ok;
        assert!(zone.handle_incoming_notify(None, 100));
        assert_eq!(zone.soa_notified, Some((None, 100)));
    }

    #[test]
    fn equal_serial_reply_renews_the_lease() {
        let (mut journal, path) = temp_journal();
        let mut zone = test_zone();
        zone.state = ZoneState::Refreshing;
        zone.soa_disk = Some((sample_soa(5), 0));
        zone.begin_stream(42, None);

        let mut reply = build_reply(42, &[("example.", Type::SOA, soa_rdata(5))]);
        let result = zone.handle_received_xfr_packet(&mut reply, false, &mut journal, 500);
        assert_eq!(result, PacketResult::NewLease);
        assert_eq!(zone.state, ZoneState::Ok);
        assert_eq!(zone.soa_disk.as_ref().unwrap().1, 500);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn single_soa_with_newer_serial_falls_back_to_tcp() {
        let (mut journal, path) = temp_journal();
        let mut zone = test_zone();
        zone.state = ZoneState::Refreshing;
        zone.soa_disk = Some((sample_soa(5), 0));
        zone.begin_stream(42, None);

        let mut reply = build_reply(42, &[("example.", Type::SOA, soa_rdata(6))]);
        let result = zone.handle_received_xfr_packet(&mut reply, false, &mut journal, 500);
        assert_eq!(result, PacketResult::Tcp);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn a_complete_axfr_reply_commits() {
        let (mut journal, path) = temp_journal();
        let mut zone = test_zone();
        zone.state = ZoneState::Refreshing;
        zone.soa_disk = Some((sample_soa(5), 0));
        zone.begin_stream(42, None);

        let mut reply = build_reply(
            42,
            &[
                ("example.", Type::SOA, soa_rdata(6)),
                ("ns1.example.", Type::A, vec![10, 0, 0, 1]),
                ("example.", Type::SOA, soa_rdata(6)),
            ],
        );
        let result = zone.handle_received_xfr_packet(&mut reply, false, &mut journal, 500);
        assert_eq!(result, PacketResult::Transfer);
        assert_eq!(zone.soa_disk.as_ref().unwrap().0.serial, 6);
        assert_eq!(zone.state, ZoneState::Ok);

        // The journal holds exactly one committed transfer.
        let mut committed = Vec::new();
        super::super::journal::replay(&path, &mut |t| committed.push(t)).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].serial_new, 6);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn mismatched_query_ids_are_dropped() {
        let (mut journal, path) = temp_journal();
        let mut zone = test_zone();
        zone.soa_disk = Some((sample_soa(5), 0));
        zone.begin_stream(42, None);

        let mut reply = build_reply(43, &[("example.", Type::SOA, soa_rdata(6))]);
        let result = zone.handle_received_xfr_packet(&mut reply, false, &mut journal, 500);
        assert_eq!(result, PacketResult::Bad);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn out_of_zone_records_spoil_the_stream() {
        let (mut journal, path) = temp_journal();
        let mut zone = test_zone();
        zone.state = ZoneState::Refreshing;
        zone.begin_stream(42, None);

        let mut reply = build_reply(
            42,
            &[
                ("example.", Type::SOA, soa_rdata(6)),
                ("evil.test.", Type::A, vec![10, 0, 0, 66]),
                ("example.", Type::SOA, soa_rdata(6)),
            ],
        );
        let result = zone.handle_received_xfr_packet(&mut reply, true, &mut journal, 500);
        assert_eq!(result, PacketResult::Bad);
        std::fs::remove_file(&path).unwrap();
    }
}
