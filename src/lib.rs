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

//! The Belfry authoritative DNS server.
//!
//! Belfry answers queries for zones it is configured to serve and keeps
//! secondary zones synchronized with their masters through zone
//! transfers. It never recurses on behalf of clients.
//!
//! The crate is organized around a compiled, in-memory name database:
//!
//! * [`name`] implements wire-format domain names and the canonical
//!   DNS ordering that the database is indexed by.
//! * [`rr`] implements RR types, TTLs, and record data decomposed into
//!   typed atoms under the control of a static type-descriptor table.
//! * [`db`] implements the name tree and RR store, as well as the
//!   on-disk database image.
//! * [`zonec`] compiles textual zone files into the database.
//! * [`nsec3`] precomputes NSEC3 denial-of-existence links for signed
//!   zones.
//! * [`message`] reads and writes wire-format DNS messages, including
//!   name compression, EDNS, and TSIG.
//! * [`query`] resolves queries against a database snapshot and builds
//!   replies.
//! * [`xfrd`] is the transfer coordinator: one state machine per
//!   secondary zone, driving SOA refresh, NOTIFY, IXFR/AXFR, and the
//!   on-disk transfer journal.
//! * [`serve`] runs the network-facing worker loops.

pub mod class;
pub mod db;
pub mod message;
pub mod name;
pub mod nsec3;
pub mod query;
pub mod rr;
pub mod serve;
pub mod util;
pub mod xfrd;
pub mod zonec;
