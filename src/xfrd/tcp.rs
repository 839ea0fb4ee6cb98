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

//! The TCP slot pool for transfers.
//!
//! A fixed number of nonblocking TCP connections is shared across all
//! zones; zones that cannot get a slot are marked waiting and retried
//! when one frees up. Each connection writes one length-prefixed
//! request and then reads length-prefixed reply messages until the
//! zone's state machine declares the transfer finished.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, SockaddrStorage};

/// The size of the TCP slot pool.
pub const MAX_TCP: usize = 10;

/// One active transfer connection.
pub struct TcpConn {
    stream: TcpStream,
    pub zone_index: usize,
    /// The framed request still being written, with its progress.
    write: Option<(Vec<u8>, usize)>,
    read_buf: Vec<u8>,
}

/// What servicing a connection produced.
pub enum TcpIo {
    /// Nothing complete yet; keep polling.
    Progress,

    /// Complete reply messages arrived.
    Messages(Vec<Vec<u8>>),

    /// The peer closed or the connection failed.
    Closed,
}

/// The shared pool of transfer connections.
pub struct TcpSet {
    slots: Vec<Option<TcpConn>>,
}

impl TcpSet {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_TCP).map(|_| None).collect(),
        }
    }

    pub fn slot(&self, index: usize) -> Option<&TcpConn> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether the connection in `index` still has request octets to
    /// write (and therefore needs write-readiness).
    pub fn wants_write(&self, index: usize) -> bool {
        self.slots[index]
            .as_ref()
            .map(|conn| conn.write.is_some())
            .unwrap_or(false)
    }

    pub fn fd(&self, index: usize) -> Option<RawFd> {
        self.slots[index].as_ref().map(|conn| conn.stream.as_raw_fd())
    }

    /// Starts a transfer connection to `addr` carrying `request`.
    /// Returns the slot index, or `None` when the pool is full.
    pub fn obtain(
        &mut self,
        zone_index: usize,
        addr: SocketAddr,
        request: &[u8],
    ) -> io::Result<Option<usize>> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => return Ok(None),
        };

        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
            .map_err(io::Error::from)?;
        match connect(fd.as_raw_fd(), &SockaddrStorage::from(addr)) {
            Ok(()) => (),
            Err(nix::errno::Errno::EINPROGRESS) => (),
            Err(e) => return Err(io::Error::from(e)),
        }
        let stream = unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) };

        let mut framed = Vec::with_capacity(request.len() + 2);
        framed.extend_from_slice(&(request.len() as u16).to_be_bytes());
        framed.extend_from_slice(request);

        self.slots[index] = Some(TcpConn {
            stream,
            zone_index,
            write: Some((framed, 0)),
            read_buf: Vec::new(),
        });
        Ok(Some(index))
    }

    /// Drops the connection in `index`.
    pub fn release(&mut self, index: usize) {
        self.slots[index] = None;
    }

    /// Services the connection in `index` after poll readiness.
    pub fn handle_io(&mut self, index: usize) -> TcpIo {
        let conn = match self.slots[index].as_mut() {
            Some(conn) => conn,
            None => return TcpIo::Closed,
        };

        // Finish writing the request first.
        if let Some((framed, written)) = conn.write.as_mut() {
            loop {
                match conn.stream.write(&framed[*written..]) {
                    Ok(0) => return TcpIo::Closed,
                    Ok(n) => {
                        *written += n;
                        if *written == framed.len() {
                            conn.write = None;
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TcpIo::Progress,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return TcpIo::Closed,
                }
            }
        }

        // Read whatever is available and cut complete messages out of
        // the buffer.
        let mut chunk = [0u8; 8192];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => return TcpIo::Closed,
                Ok(n) => conn.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return TcpIo::Closed,
            }
        }

        let mut messages = Vec::new();
        loop {
            if conn.read_buf.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([conn.read_buf[0], conn.read_buf[1]]) as usize;
            if conn.read_buf.len() < 2 + len {
                break;
            }
            let message = conn.read_buf[2..2 + len].to_vec();
            conn.read_buf.drain(..2 + len);
            messages.push(message);
        }
        if messages.is_empty() {
            TcpIo::Progress
        } else {
            TcpIo::Messages(messages)
        }
    }
}

impl Default for TcpSet {
    fn default() -> Self {
        Self::new()
    }
}
