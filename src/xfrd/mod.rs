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

//! The transfer coordinator.
//!
//! One single-threaded event loop drives every secondary zone's
//! state machine (see [`zone`]): SOA refresh and retry timers, UDP
//! IXFR probes with TCP fallback, the shared TCP slot pool, inbound
//! NOTIFY messages forwarded by the query workers, outbound NOTIFY
//! fan-out, and the transfer journal. The loop blocks in `poll(2)`
//! until the next socket event or timer.
//!
//! The coordinator never touches the serving database directly. It
//! appends verified transfer messages to the journal and asks the
//! server supervisor to reload; the supervisor replays the journal
//! into a fresh snapshot and reports the loaded SOAs back through
//! [`XfrdHandle`].

pub mod apply;
pub mod journal;
pub mod packet;
pub mod tcp;
pub mod zone;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use crate::message::tsig;
use crate::message::Reader;
use crate::name::Dname;

use journal::Journal;
use packet::{build_notify, XfrdSoa};
use tcp::{TcpIo, TcpSet};
use zone::{Master, PacketResult, TimeoutAction, XfrdZone, ZoneState, TCP_TIMEOUT, UDP_TIMEOUT};

/// Seconds between NOTIFY retries toward one target.
const NOTIFY_RETRY_TIMEOUT: i64 = 15;

/// Attempts per NOTIFY target before giving up on it.
const NOTIFY_MAX_RETRY: u32 = 5;

/// The wait between reload requests to the server supervisor, so a
/// burst of transfers coalesces into one reload.
const RELOAD_TIMEOUT: i64 = 10;

/// Configuration of one secondary (or notifying master) zone.
#[derive(Clone, Debug)]
pub struct XfrdZoneConfig {
    pub apex: Dname,
    pub masters: Vec<Master>,
    pub notify: Vec<std::net::SocketAddr>,
    pub notify_key: Option<String>,
}

/// Coordinator-wide configuration.
pub struct XfrdConfig {
    pub zones: Vec<XfrdZoneConfig>,
    pub journal_path: PathBuf,
    pub keys: HashMap<String, tsig::Key>,
}

/// A message for the coordinator, sent through an [`XfrdHandle`].
pub enum XfrdMsg {
    /// A NOTIFY arrived at a query worker.
    Notify {
        apex: Dname,
        serial: Option<u32>,
        source: IpAddr,
    },

    /// The supervisor finished (re)loading; this is the SOA that the
    /// serving database now holds for the zone.
    ZoneLoaded {
        apex: Dname,
        soa: Option<XfrdSoa>,
    },

    /// Stop the loop.
    Shutdown,
}

/// The sending side of the coordinator's message queue. A byte is
/// written to a self-pipe with each message to wake the poll loop.
#[derive(Clone)]
pub struct XfrdHandle {
    sender: Sender<XfrdMsg>,
    wake: Arc<OwnedFd>,
}

impl XfrdHandle {
    pub fn send(&self, msg: XfrdMsg) {
        if self.sender.send(msg).is_ok() {
            let byte = [0u8];
            unsafe {
                libc::write(self.wake.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1);
            }
        }
    }
}

/// The transfer coordinator.
pub struct Xfrd {
    zones: Vec<XfrdZone>,
    index: BTreeMap<Dname, usize>,
    tcp: TcpSet,
    journal: Journal,
    keys: HashMap<String, tsig::Key>,
    rx: Receiver<XfrdMsg>,
    wake_rx: OwnedFd,
    reload_tx: Sender<()>,
    reload_at: Option<i64>,
    reload_wait_until: i64,
    shutdown: Arc<AtomicBool>,
}

/// The coordinator's notion of now: seconds since the epoch.
pub fn xfrd_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Xfrd {
    /// Builds the coordinator and its handle. `reload_tx` receives a
    /// unit message whenever the serving database should pick up
    /// committed transfers.
    pub fn new(
        config: XfrdConfig,
        reload_tx: Sender<()>,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<(Self, XfrdHandle)> {
        let journal = Journal::open(&config.journal_path)?;
        let (wake_rx, wake_tx) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        let (wake_rx, wake_tx) = (unsafe { OwnedFd::from_raw_fd(wake_rx) }, unsafe {
            OwnedFd::from_raw_fd(wake_tx)
        });
        unsafe {
            let flags = libc::fcntl(wake_rx.as_raw_fd(), libc::F_GETFL);
            libc::fcntl(wake_rx.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let (sender, rx) = std::sync::mpsc::channel();
        let mut zones = Vec::new();
        let mut index = BTreeMap::new();
        let now = xfrd_time();
        for zone_config in config.zones {
            if zone_config.masters.is_empty() && zone_config.notify.is_empty() {
                continue;
            }
            let mut zone = XfrdZone::new(
                zone_config.apex.clone(),
                zone_config.masters,
                zone_config.notify,
            );
            zone.notify_key = zone_config.notify_key;
            if !zone.masters.is_empty() {
                // Probe right away; the loaded SOA message that
                // follows startup refines the timers.
                zone.set_refresh_now(now);
            }
            index.insert(zone_config.apex, zones.len());
            zones.push(zone);
        }
        info!("xfrd started with {} zones", zones.len());

        Ok((
            Self {
                zones,
                index,
                tcp: TcpSet::new(),
                journal,
                keys: config.keys,
                rx,
                wake_rx,
                reload_tx,
                reload_at: None,
                reload_wait_until: 0,
                shutdown,
            },
            XfrdHandle {
                sender,
                wake: Arc::new(wake_tx),
            },
        ))
    }

    /// Runs the event loop until shutdown.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = xfrd_time();
            if !self.dispatch(now) {
                break;
            }
        }
        info!("xfrd shutdown");
    }

    /// One round of poll-and-dispatch. Returns `false` on shutdown.
    fn dispatch(&mut self, now: i64) -> bool {
        // Collect the descriptors of interest.
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut tags: Vec<PollTag> = Vec::new();
        fds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        tags.push(PollTag::Wake);
        for (zi, zone) in self.zones.iter().enumerate() {
            if let Some(udp) = &zone.udp {
                fds.push(libc::pollfd {
                    fd: udp.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
                tags.push(PollTag::ZoneUdp(zi));
            }
            if let Some(notify_udp) = &zone.notify_udp {
                fds.push(libc::pollfd {
                    fd: notify_udp.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
                tags.push(PollTag::ZoneNotify(zi));
            }
        }
        for slot in 0..self.tcp.slot_count() {
            if let Some(fd) = self.tcp.fd(slot) {
                let events = if self.tcp.wants_write(slot) {
                    libc::POLLOUT
                } else {
                    libc::POLLIN
                };
                fds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                tags.push(PollTag::TcpSlot(slot));
            }
        }

        // The nearest timer bounds the poll.
        let mut next: Option<i64> = self.reload_at;
        for zone in &self.zones {
            for candidate in [zone.timeout, zone.notify_timeout] {
                if let Some(t) = candidate {
                    next = Some(next.map_or(t, |n: i64| n.min(t)));
                }
            }
        }
        let timeout_ms = match next {
            Some(t) => ((t - now).max(0) * 1000).min(i32::MAX as i64) as i32,
            None => -1,
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() != std::io::ErrorKind::Interrupted {
                error!("xfrd poll failed: {}", e);
            }
            return !self.shutdown.load(Ordering::SeqCst);
        }

        let now = xfrd_time();
        for (fd, tag) in fds.iter().zip(tags.iter()) {
            if fd.revents == 0 {
                continue;
            }
            match *tag {
                PollTag::Wake => {
                    let mut drain = [0u8; 64];
                    loop {
                        let n = unsafe {
                            libc::read(
                                self.wake_rx.as_raw_fd(),
                                drain.as_mut_ptr() as *mut libc::c_void,
                                drain.len(),
                            )
                        };
                        if n <= 0 {
                            break;
                        }
                    }
                    if !self.drain_messages(now) {
                        return false;
                    }
                }
                PollTag::ZoneUdp(zi) => self.zone_udp_read(zi, now),
                PollTag::ZoneNotify(zi) => self.zone_notify_read(zi, now),
                PollTag::TcpSlot(slot) => self.tcp_io(slot, now),
            }
        }

        self.run_timers(now);
        true
    }

    ////////////////////////////////////////////////////////////////////
    // MESSAGES FROM OUTSIDE                                          //
    ////////////////////////////////////////////////////////////////////

    fn drain_messages(&mut self, now: i64) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(XfrdMsg::Notify {
                    apex,
                    serial,
                    source,
                }) => self.handle_notify_msg(&apex, serial, source, now),
                Ok(XfrdMsg::ZoneLoaded { apex, soa }) => {
                    self.handle_zone_loaded(&apex, soa, now)
                }
                Ok(XfrdMsg::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// An inbound NOTIFY: check the source against the master list,
    /// fold the serial in, and pin the notifying master for the next
    /// request.
    fn handle_notify_msg(&mut self, apex: &Dname, serial: Option<u32>, source: IpAddr, now: i64) {
        let zi = match self.index.get(apex) {
            Some(&zi) => zi,
            None => {
                info!("notify for unknown zone {}", apex);
                return;
            }
        };
        let zone = &mut self.zones[zi];
        let master_index = zone.masters.iter().position(|m| m.addr.ip() == source);
        if zone.masters.is_empty() || master_index.is_none() {
            warn!("zone {}: notify from unauthorized source {}", apex, source);
            return;
        }
        if zone.handle_incoming_notify(serial, now) {
            // Re-probe only after a running transfer finishes; the
            // folded-in serial takes care of the rest.
            if zone.tcp_conn.is_none() && zone.udp.is_none() {
                zone.set_refresh_now(now);
            }
        }
        zone.next_master = master_index;
    }

    /// The supervisor loaded a database snapshot; `soa` is what it
    /// now serves for the zone.
    fn handle_zone_loaded(&mut self, apex: &Dname, soa: Option<XfrdSoa>, now: i64) {
        let zi = match self.index.get(apex) {
            Some(&zi) => zi,
            None => return,
        };
        let zone = &mut self.zones[zi];
        let soa = match soa {
            Some(soa) => soa,
            None => {
                zone.soa_nsd = None;
                zone.set_state(ZoneState::Refreshing);
                zone.set_refresh_now(now);
                return;
            }
        };
        if let Some((nsd, _)) = &zone.soa_nsd {
            if nsd.serial == soa.serial {
                return;
            }
        }

        if let Some((disk, disk_acquired)) = zone.soa_disk.clone() {
            if disk.serial == soa.serial {
                // The committed transfer is now being served.
                info!(
                    "zone {} serial {} is loaded",
                    zone.apex, soa.serial
                );
                zone.soa_nsd = Some((disk.clone(), disk_acquired));
                if now - disk_acquired < disk.refresh as i64 {
                    zone.set_state(ZoneState::Ok);
                    zone.round_num = -1;
                    zone.set_timer_refresh(now);
                } else if now - disk_acquired < disk.expire as i64 {
                    zone.set_state(ZoneState::Refreshing);
                    zone.set_refresh_now(now);
                } else {
                    zone.set_state(ZoneState::Expired);
                    zone.set_refresh_now(now);
                }
                if let Some((notified, _)) = zone.soa_notified {
                    let answered = match notified {
                        None => true,
                        Some(serial) => !packet::serial_newer(serial, disk.serial),
                    };
                    if answered {
                        zone.soa_notified = None;
                    } else if zone.state == ZoneState::Ok {
                        zone.set_state(ZoneState::Refreshing);
                        zone.set_refresh_now(now);
                    }
                }
                zone.send_notify(now);
                return;
            }
        }

        // Zone data from some other source (an operator-provided
        // file); accept it and go look for anything newer.
        info!(
            "zone {} serial {} from unknown source; refreshing",
            zone.apex, soa.serial
        );
        zone.soa_nsd = Some((soa.clone(), now));
        zone.soa_disk = Some((soa, now));
        if let Some((notified, _)) = zone.soa_notified {
            let disk_serial = zone.soa_disk.as_ref().unwrap().0.serial;
            let answered = match notified {
                None => true,
                Some(serial) => !packet::serial_newer(serial, disk_serial),
            };
            if answered {
                zone.soa_notified = None;
            }
        }
        if !zone.masters.is_empty() {
            zone.set_state(ZoneState::Refreshing);
            zone.set_refresh_now(now);
        } else {
            zone.set_state(ZoneState::Ok);
        }
        zone.send_notify(now);
    }

    ////////////////////////////////////////////////////////////////////
    // TRANSFER I/O                                                   //
    ////////////////////////////////////////////////////////////////////

    fn zone_udp_read(&mut self, zi: usize, now: i64) {
        let mut buf = vec![0u8; 65535];
        let packet = {
            let zone = &mut self.zones[zi];
            let socket = match zone.udp.take() {
                Some(socket) => socket,
                None => return,
            };
            match socket.recv(&mut buf) {
                Ok(received) => {
                    buf.truncate(received);
                    buf
                }
                Err(e) => {
                    warn!("zone {}: udp recv failed: {}", zone.apex, e);
                    return;
                }
            }
        };
        // A fresh answer arrived; reset the probe pacing.
        self.zones[zi].set_refresh_now(now);
        self.handle_zone_packet(zi, packet, false, now);
    }

    fn handle_zone_packet(&mut self, zi: usize, mut packet: Vec<u8>, via_tcp: bool, now: i64) {
        let result = self.zones[zi].handle_received_xfr_packet(
            &mut packet,
            via_tcp,
            &mut self.journal,
            now,
        );
        match result {
            PacketResult::Tcp => {
                self.zones[zi].set_timer(now + TCP_TIMEOUT, now);
                self.tcp_obtain(zi, now);
            }
            PacketResult::Transfer => {
                self.release_tcp_of(zi);
                self.schedule_reload(now);
            }
            PacketResult::NewLease => {
                self.release_tcp_of(zi);
            }
            PacketResult::More => (),
            PacketResult::Bad => {
                self.release_tcp_of(zi);
                self.make_request(zi, now);
            }
        }
    }

    fn tcp_io(&mut self, slot: usize, now: i64) {
        let zi = match self.tcp.slot(slot) {
            Some(conn) => conn.zone_index,
            None => return,
        };
        match self.tcp.handle_io(slot) {
            TcpIo::Progress => {
                self.zones[zi].set_timer(now + TCP_TIMEOUT, now);
            }
            TcpIo::Messages(messages) => {
                self.zones[zi].set_timer(now + TCP_TIMEOUT, now);
                for message in messages {
                    if self.zones[zi].tcp_conn != Some(slot) {
                        break; // the transfer finished or failed
                    }
                    self.handle_zone_packet(zi, message, true, now);
                }
            }
            TcpIo::Closed => {
                warn!("zone {}: transfer connection closed", self.zones[zi].apex);
                self.release_tcp_of(zi);
                self.make_request(zi, now);
            }
        }
    }

    /// Sends the next request for a zone, cycling masters.
    fn make_request(&mut self, zi: usize, now: i64) {
        if self.zones[zi].masters.is_empty() {
            return;
        }
        if !self.zones[zi].cycle_master(now) {
            info!("zone {} waits for its retry timer", self.zones[zi].apex);
            return;
        }

        let use_tcp = {
            let zone = &self.zones[zi];
            zone.soa_disk.is_none()
                || zone
                    .current_master()
                    .map(|m| m.use_axfr_only)
                    .unwrap_or(false)
        };
        if use_tcp {
            self.zones[zi].set_timer(now + TCP_TIMEOUT, now);
            self.tcp_obtain(zi, now);
        } else {
            self.zones[zi].set_timer(now + UDP_TIMEOUT, now);
            if let Err(e) = self.zones[zi].send_ixfr_request_udp(&self.keys, now) {
                warn!("zone {}: udp request failed: {}", self.zones[zi].apex, e);
                self.make_request(zi, now);
            }
        }
    }

    fn tcp_obtain(&mut self, zi: usize, now: i64) {
        let request = self.zones[zi].build_tcp_request(&self.keys, now);
        let addr = match self.zones[zi].current_master() {
            Some(master) => master.addr,
            None => return,
        };
        match self.tcp.obtain(zi, addr, &request) {
            Ok(Some(slot)) => {
                self.zones[zi].tcp_conn = Some(slot);
                self.zones[zi].tcp_waiting = false;
            }
            Ok(None) => {
                self.zones[zi].tcp_waiting = true;
            }
            Err(e) => {
                warn!("zone {}: tcp connect failed: {}", self.zones[zi].apex, e);
                self.make_request(zi, now);
            }
        }
    }

    /// Releases the zone's TCP slot, if any, and hands the slot to a
    /// waiting zone.
    fn release_tcp_of(&mut self, zi: usize) {
        let slot = match self.zones[zi].tcp_conn.take() {
            Some(slot) => slot,
            None => return,
        };
        self.tcp.release(slot);
        let now = xfrd_time();
        if let Some(waiting) = (0..self.zones.len()).find(|&i| self.zones[i].tcp_waiting) {
            self.zones[waiting].tcp_waiting = false;
            self.tcp_obtain(waiting, now);
        }
    }

    ////////////////////////////////////////////////////////////////////
    // TIMERS                                                         //
    ////////////////////////////////////////////////////////////////////

    fn run_timers(&mut self, now: i64) {
        for zi in 0..self.zones.len() {
            if let Some(t) = self.zones[zi].timeout {
                if now >= t {
                    self.zones[zi].timeout = None;
                    self.zone_timeout(zi, now);
                }
            }
            if let Some(t) = self.zones[zi].notify_timeout {
                if now >= t {
                    self.zone_notify_timeout(zi, now);
                }
            }
        }
        if let Some(t) = self.reload_at {
            if now >= t {
                self.reload_at = None;
                self.reload_wait_until = now + RELOAD_TIMEOUT;
                let _ = self.reload_tx.send(());
            }
        }
    }

    fn zone_timeout(&mut self, zi: usize, now: i64) {
        // An in-flight TCP transfer timing out closes the connection
        // and retries like a failure.
        if self.zones[zi].tcp_conn.is_some() {
            warn!("zone {}: tcp transfer timed out", self.zones[zi].apex);
            self.release_tcp_of(zi);
        }
        // A stale UDP probe is cancelled implicitly; a late reply is
        // dropped by its stale query ID.
        self.zones[zi].udp = None;

        match self.zones[zi].handle_timeout(now) {
            TimeoutAction::None => (),
            TimeoutAction::MakeRequest => self.make_request(zi, now),
        }
    }

    fn schedule_reload(&mut self, now: i64) {
        if self.reload_at.is_some() {
            return;
        }
        if now >= self.reload_wait_until {
            self.reload_wait_until = now + RELOAD_TIMEOUT;
            let _ = self.reload_tx.send(());
        } else {
            self.reload_at = Some(self.reload_wait_until);
        }
    }

    ////////////////////////////////////////////////////////////////////
    // OUTBOUND NOTIFY                                                //
    ////////////////////////////////////////////////////////////////////

    fn zone_notify_timeout(&mut self, zi: usize, now: i64) {
        let zone = &mut self.zones[zi];
        if zone.notify_current.is_none() {
            zone.notify_timeout = None;
            return;
        }
        if zone.notify_udp.is_some() {
            // We were waiting for an acknowledgement.
            zone.notify_retry += 1;
            if zone.notify_retry >= NOTIFY_MAX_RETRY {
                warn!(
                    "zone {}: notify target unreachable after {} attempts",
                    zone.apex, NOTIFY_MAX_RETRY,
                );
                zone.notify_next();
            }
        }
        self.notify_send_current(zi, now);
    }

    fn notify_send_current(&mut self, zi: usize, now: i64) {
        let zone = &mut self.zones[zi];
        let target = match zone.notify_current.and_then(|i| zone.notify_targets.get(i)) {
            Some(&target) => target,
            None => {
                zone.notify_disable();
                return;
            }
        };
        let soa = zone.soa_nsd.as_ref().map(|(soa, _)| soa.clone());
        let (mut message, query_id) = build_notify(&zone.apex, soa.as_ref());
        if let Some(key) = zone.notify_key.as_deref().and_then(|name| self.keys.get(name)) {
            tsig::sign_request(&mut message, key, now as u64);
        }
        zone.notify_query_id = query_id;
        zone.notify_timeout = Some(now + NOTIFY_RETRY_TIMEOUT);

        let socket = match target {
            std::net::SocketAddr::V4(_) => std::net::UdpSocket::bind(("0.0.0.0", 0)),
            std::net::SocketAddr::V6(_) => std::net::UdpSocket::bind(("::", 0)),
        };
        let socket = match socket.and_then(|s| {
            s.set_nonblocking(true)?;
            s.send_to(&message, target)?;
            Ok(s)
        }) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("zone {}: could not send notify to {}: {}", zone.apex, target, e);
                zone.notify_udp = None;
                return;
            }
        };
        info!(
            "zone {}: sent notify #{} to {}",
            zone.apex, zone.notify_retry, target,
        );
        zone.notify_udp = Some(socket);
    }

    fn zone_notify_read(&mut self, zi: usize, now: i64) {
        let done = {
            let zone = &mut self.zones[zi];
            let socket = match &zone.notify_udp {
                Some(socket) => socket,
                None => return,
            };
            let mut buf = [0u8; 4096];
            let received = match socket.recv(&mut buf) {
                Ok(received) => received,
                Err(_) => return,
            };
            notify_reply_is_done(&buf[..received], zone.notify_query_id, &zone.apex)
        };
        if done {
            self.zones[zi].notify_next();
        }
        if self.zones[zi].notify_current.is_some() {
            self.notify_send_current(zi, now);
        } else {
            self.zones[zi].notify_udp = None;
        }
    }
}

/// Decides whether a NOTIFY acknowledgement finishes the current
/// target. NOTIMP counts as done, per [RFC 1996 § 4.7].
///
/// [RFC 1996 § 4.7]: https://datatracker.ietf.org/doc/html/rfc1996#section-4.7
fn notify_reply_is_done(reply: &[u8], query_id: u16, apex: &Dname) -> bool {
    let reader = match Reader::try_from(reply) {
        Ok(reader) => reader,
        Err(_) => return false,
    };
    if !reader.qr() || reader.opcode() != crate::message::Opcode::Notify {
        warn!("zone {}: received bad notify reply opcode/flags", apex);
        return false;
    }
    if reader.id() != query_id {
        warn!("zone {}: received notify-ack with bad ID", apex);
        return false;
    }
    match reader.rcode() {
        crate::message::Rcode::NoError => {
            info!("zone {}: host acknowledges notify", apex);
            true
        }
        crate::message::Rcode::NotImp => true,
        rcode => {
            warn!("zone {}: notify response error {}", apex, rcode);
            false
        }
    }
}

#[derive(Clone, Copy)]
enum PollTag {
    Wake,
    ZoneUdp(usize),
    ZoneNotify(usize),
    TcpSlot(usize),
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_reply_rules_follow_rfc_1996() {
        let apex: Dname = "example.".parse().unwrap();
        let mut reply = vec![0u8; 12];
        reply[0] = 0x12;
        reply[1] = 0x34;
        reply[2] = 0x80 | (4 << 3); // QR + NOTIFY

        assert!(notify_reply_is_done(&reply, 0x1234, &apex));

        // NOTIMP also finishes the target.
        reply[3] = 4;
        assert!(notify_reply_is_done(&reply, 0x1234, &apex));

        // Other errors mean retry.
        reply[3] = 2; // SERVFAIL
        assert!(!notify_reply_is_done(&reply, 0x1234, &apex));

        // Bad ID is ignored.
        reply[3] = 0;
        assert!(!notify_reply_is_done(&reply, 0x9999, &apex));

        // A plain query (no QR) is not an acknowledgement.
        reply[2] = 4 << 3;
        assert!(!notify_reply_is_done(&reply, 0x1234, &apex));
    }
}
