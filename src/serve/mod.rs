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

//! The network-facing worker loops.
//!
//! Each worker thread owns its own UDP socket and TCP listener (bound
//! with `SO_REUSEPORT` so the kernel spreads the load) and serves
//! queries against an immutable database snapshot. A reload installs
//! a fresh snapshot behind a pointer swap: queries already in flight
//! finish against the old one, new queries see the new one.
//!
//! TCP connections honor pipelined queries: every complete
//! length-prefixed message on the connection is answered in order.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::db::Namedb;
use crate::message::tsig;
use crate::query::{self, Outcome, ReceivedInfo, Transport};
use crate::xfrd::{XfrdHandle, XfrdMsg};

/// How long a TCP connection may sit idle before the worker drops it.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The shared, swappable database snapshot, plus the TSIG keys the
/// server answers signed requests with.
pub struct Server {
    db: RwLock<Arc<Namedb>>,
    keys: tsig::Keyring,
}

impl Server {
    pub fn new(db: Arc<Namedb>, keys: tsig::Keyring) -> Self {
        Self {
            db: RwLock::new(db),
            keys,
        }
    }

    /// The snapshot to answer the next query from.
    pub fn snapshot(&self) -> Arc<Namedb> {
        self.db.read().expect("snapshot lock poisoned").clone()
    }

    /// Installs a new snapshot. In-flight queries keep the `Arc` they
    /// already cloned.
    pub fn swap(&self, db: Arc<Namedb>) {
        *self.db.write().expect("snapshot lock poisoned") = db;
    }
}

/// Spawns `count` worker threads serving `addr`.
pub fn spawn_workers(
    server: Arc<Server>,
    xfrd: Option<XfrdHandle>,
    addr: SocketAddr,
    count: usize,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let udp = bind_udp_reuseport(addr)?;
        let tcp = bind_tcp_reuseport(addr)?;
        let server = server.clone();
        let xfrd = xfrd.clone();
        let shutdown = shutdown.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("serve-{}", index))
                .spawn(move || worker_loop(server, xfrd, udp, tcp, shutdown))?,
        );
    }
    info!("started {} query workers on {}", count, addr);
    Ok(handles)
}

/// `SO_REUSEPORT` must be set before bind, which the std constructors
/// do not allow, so the sockets are built with nix and handed to std.
fn bind_udp_reuseport(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let fd = reuseport_socket(addr, nix::sys::socket::SockType::Datagram)?;
    let socket = unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_tcp_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let fd = reuseport_socket(addr, nix::sys::socket::SockType::Stream)?;
    nix::sys::socket::listen(&fd, 128).map_err(std::io::Error::from)?;
    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn reuseport_socket(
    addr: SocketAddr,
    kind: nix::sys::socket::SockType,
) -> std::io::Result<std::os::fd::OwnedFd> {
    use nix::sys::socket::{
        bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockaddrStorage,
    };
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(family, kind, SockFlag::empty(), None).map_err(std::io::Error::from)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(std::io::Error::from)?;
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd",
                     target_os = "netbsd", target_os = "macos"))] {
            setsockopt(&fd, sockopt::ReusePort, &true).map_err(std::io::Error::from)?;
        }
    }
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).map_err(std::io::Error::from)?;
    Ok(fd)
}

fn worker_loop(
    server: Arc<Server>,
    xfrd: Option<XfrdHandle>,
    udp: UdpSocket,
    tcp: TcpListener,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 65535];
    while !shutdown.load(Ordering::SeqCst) {
        let mut fds = [
            libc::pollfd {
                fd: udp.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: tcp.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 500) };
        if rc <= 0 {
            continue;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            loop {
                match udp.recv_from(&mut buf) {
                    Ok((len, peer)) => {
                        handle_udp(&server, &xfrd, &udp, &buf[..len], peer);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("udp recv failed: {}", e);
                        break;
                    }
                }
            }
        }
        if fds[1].revents & libc::POLLIN != 0 {
            loop {
                match tcp.accept() {
                    Ok((stream, peer)) => {
                        // Connections are serviced inline: each worker
                        // handles one connection at a time, and more
                        // workers give more parallelism.
                        if let Err(e) = handle_tcp(&server, &xfrd, stream, peer) {
                            debug!("tcp connection from {} ended: {}", peer, e);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("tcp accept failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("worker exiting");
}

fn handle_udp(
    server: &Arc<Server>,
    xfrd: &Option<XfrdHandle>,
    socket: &UdpSocket,
    received: &[u8],
    peer: SocketAddr,
) {
    let db = server.snapshot();
    let info = ReceivedInfo {
        source: peer.ip(),
        transport: Transport::Udp,
    };
    match query::handle_message(&db, &server.keys, received, info) {
        Outcome::Reply(reply) => {
            let _ = socket.send_to(&reply, peer);
        }
        Outcome::Notify {
            reply,
            apex,
            serial,
            source,
        } => {
            let _ = socket.send_to(&reply, peer);
            if let Some(xfrd) = xfrd {
                xfrd.send(XfrdMsg::Notify {
                    apex,
                    serial,
                    source,
                });
            }
        }
        Outcome::Axfr { .. } | Outcome::Ignore => (),
    }
}

fn handle_tcp(
    server: &Arc<Server>,
    xfrd: &Option<XfrdHandle>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(TCP_IDLE_TIMEOUT))?;
    stream.set_write_timeout(Some(TCP_IDLE_TIMEOUT))?;

    // Serve pipelined queries until the peer closes or goes idle.
    loop {
        let mut length = [0u8; 2];
        match stream.read_exact(&mut length) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let length = u16::from_be_bytes(length) as usize;
        let mut received = vec![0u8; length];
        stream.read_exact(&mut received)?;

        let db = server.snapshot();
        let info = ReceivedInfo {
            source: peer.ip(),
            transport: Transport::Tcp,
        };
        match query::handle_message(&db, &server.keys, &received, info) {
            Outcome::Reply(reply) => write_frame(&mut stream, &reply)?,
            Outcome::Axfr {
                zone,
                question,
                id,
                tsig,
            } => {
                // A transfer answering a signed request signs every
                // message of the stream.
                let mut tsig = tsig;
                let now = tsig::unix_now();
                let mut emit = |message: &[u8]| {
                    if let Some(state) = tsig.as_mut() {
                        let mut signed = message.to_vec();
                        state.sign(&mut signed, now);
                        write_frame(&mut stream, &signed)
                    } else {
                        write_frame(&mut stream, message)
                    }
                };
                if !query::axfr::write_axfr(&db, zone, id, &question, &mut emit)? {
                    error!("axfr of {} failed: zone has no SOA", question.qname);
                    return Ok(());
                }
            }
            Outcome::Notify {
                reply,
                apex,
                serial,
                source,
            } => {
                write_frame(&mut stream, &reply)?;
                if let Some(xfrd) = xfrd {
                    xfrd.send(XfrdMsg::Notify {
                        apex,
                        serial,
                        source,
                    });
                }
            }
            Outcome::Ignore => (),
        }
    }
}

fn write_frame(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(message.len() as u16).to_be_bytes())?;
    stream.write_all(message)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
