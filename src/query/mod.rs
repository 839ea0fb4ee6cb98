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

//! The query engine.
//!
//! [`handle_message`] takes one received message and a database
//! snapshot, and produces either a reply, an instruction to stream a
//! zone transfer, a NOTIFY to forward to the transfer coordinator, or
//! nothing (for messages that must be dropped on the floor).
//!
//! Requests signed with a key from the server's keyring are verified
//! up front, and every message answering a verified request is signed
//! in turn (transfer streams chain their MACs; see
//! [`tsig::ServerTsig`]).
//!
//! The answering logic proper lives in the [`answer`] submodule; AXFR
//! serving in [`axfr`].

pub mod answer;
pub mod axfr;

use std::net::IpAddr;

use crate::db::{Namedb, ZoneId};
use crate::name::Dname;
use crate::rr::Type;

use crate::message::{
    reader, tsig, ExtendedRcode, Opcode, Question, Rcode, Reader, Writer, QCLASS_ANY,
};

/// How a message reached the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Network information about a received message.
#[derive(Clone, Copy, Debug)]
pub struct ReceivedInfo {
    pub source: IpAddr,
    pub transport: Transport,
}

/// What the caller must do with a handled message.
#[derive(Debug)]
pub enum Outcome {
    /// Send this reply.
    Reply(Vec<u8>),

    /// Send nothing.
    Ignore,

    /// Stream a zone transfer of `zone` on this TCP connection,
    /// signing every message when the request was signed.
    Axfr {
        zone: ZoneId,
        question: Question,
        id: u16,
        tsig: Option<tsig::ServerTsig>,
    },

    /// Send `reply`, then hand the NOTIFY to the transfer
    /// coordinator.
    Notify {
        reply: Vec<u8>,
        apex: Dname,
        serial: Option<u32>,
        source: IpAddr,
    },
}

/// The standard non-EDNS maximum reply size over UDP.
const MAX_UDP_PLAIN: usize = 512;

/// Handles one received DNS message against a database snapshot.
/// `keys` holds the TSIG keys the server answers signed requests
/// with.
pub fn handle_message(
    db: &Namedb,
    keys: &tsig::Keyring,
    received: &[u8],
    info: ReceivedInfo,
) -> Outcome {
    let received = match Reader::try_from(received) {
        Ok(reader) => reader,
        Err(_) => return Outcome::Ignore,
    };
    if received.qr() {
        return Outcome::Ignore;
    }

    let now = tsig::unix_now();
    let mut limit = match info.transport {
        Transport::Tcp => u16::MAX as usize,
        Transport::Udp => MAX_UDP_PLAIN,
    };

    let new_response = |limit: usize| {
        let mut response = Writer::new(limit);
        response.set_id(received.id());
        response.set_qr(true);
        response.set_opcode(received.opcode());
        if received.opcode() == Opcode::Query {
            response.set_rd(received.rd());
            response.set_cd(received.cd());
        }
        response
    };

    // A signed request is verified before anything else; a signed
    // reply needs room reserved for its TSIG RR.
    let mut server_tsig = None;
    match tsig::verify_request(received.octets(), keys, now) {
        Ok(tsig::RequestVerification::Unsigned) => (),
        Ok(tsig::RequestVerification::Signed(state)) => {
            limit = limit.saturating_sub(state.reserved_len());
            server_tsig = Some(state);
        }
        Ok(tsig::RequestVerification::Failed(failed)) => {
            let mut response = new_response(limit);
            let mut rewind = received.clone();
            if rewind.qdcount() == 1 {
                if let Ok(question) = rewind.read_question() {
                    let _ = response.add_question(&question);
                }
            }
            response.set_rcode(Rcode::NotAuth);
            let mut reply = response.finish();
            tsig::append_unsigned(&mut reply, &failed, now);
            return Outcome::Reply(reply);
        }
        Err(_) => {
            let mut response = new_response(limit);
            response.set_rcode(Rcode::FormErr);
            return Outcome::Reply(response.finish());
        }
    }

    let response = new_response(limit);
    let tsig_reserve = server_tsig.as_ref().map(|s| s.reserved_len()).unwrap_or(0);
    let outcome = match received.opcode() {
        Opcode::Query => handle_query(db, received, info, tsig_reserve, response),
        Opcode::Notify => handle_notify(db, received, info, response),
        _ => {
            let mut response = response;
            response.set_rcode(Rcode::NotImp);
            Outcome::Reply(response.finish())
        }
    };

    // Sign whatever goes back on a verified transaction.
    match (outcome, server_tsig) {
        (Outcome::Reply(mut reply), Some(mut state)) => {
            state.sign(&mut reply, now);
            Outcome::Reply(reply)
        }
        (
            Outcome::Notify {
                mut reply,
                apex,
                serial,
                source,
            },
            Some(mut state),
        ) => {
            state.sign(&mut reply, now);
            Outcome::Notify {
                reply,
                apex,
                serial,
                source,
            }
        }
        (
            Outcome::Axfr {
                zone,
                question,
                id,
                tsig: _,
            },
            state,
        ) => Outcome::Axfr {
            zone,
            question,
            id,
            tsig: state,
        },
        (outcome, _) => outcome,
    }
}

fn handle_query(
    db: &Namedb,
    mut received: Reader,
    info: ReceivedInfo,
    tsig_reserve: usize,
    mut response: Writer,
) -> Outcome {
    // One question, nothing else (except one OPT, and the TSIG that
    // was already verified and must sit last).
    if received.qdcount() != 1 {
        response.set_rcode(Rcode::FormErr);
        return Outcome::Reply(response.finish());
    }
    if received.ancount() != 0 || received.nscount() != 0 || received.arcount() > 2 {
        response.set_rcode(Rcode::FormErr);
        return Outcome::Reply(response.finish());
    }

    // The question section must not use compression, which
    // read_question enforces; an over-long qname fails name parsing.
    let question = match received.read_question() {
        Ok(question) => question,
        Err(_) => {
            response.set_rcode(Rcode::FormErr);
            return Outcome::Reply(response.finish());
        }
    };
    if response.add_question(&question).is_err() {
        response.set_rcode(Rcode::ServFail);
        return Outcome::Reply(response.finish());
    }

    let mut do_bit = false;
    let mut seen_opt = false;
    let arcount = received.arcount();
    for index in 0..arcount {
        let rr = match received.read_rr() {
            Ok(rr) => rr,
            Err(_) => {
                response.set_rcode(Rcode::FormErr);
                return Outcome::Reply(response.finish());
            }
        };
        if rr.rr_type == Type::TSIG {
            // Verification already accepted it; it must be the last
            // record (anything else means it did not verify at all).
            if index + 1 != arcount || tsig_reserve == 0 {
                response.set_rcode(Rcode::FormErr);
                return Outcome::Reply(response.finish());
            }
        } else if rr.rr_type == Type::OPT && rr.owner.is_root() && !seen_opt {
            seen_opt = true;

            // Once an OPT is seen, the reply is an EDNS reply, even
            // if the OPT is unusable (RFC 6891 § 7).
            do_bit = u32::from(rr.ttl) & 0x8000 != 0;
            let payload = rr.class.max(MAX_UDP_PLAIN as u16);
            if response.set_edns(MAX_UDP_PLAIN as u16, do_bit).is_err() {
                response.set_rcode(Rcode::ServFail);
                return Outcome::Reply(response.finish());
            }
            if info.transport == Transport::Udp {
                response.set_limit((payload as usize).saturating_sub(tsig_reserve));
            }
            let version = (u32::from(rr.ttl) >> 16) as u8;
            if version != 0 {
                let _ = response.set_extended_rcode(ExtendedRcode::BADVERS);
                return Outcome::Reply(response.finish());
            }
        } else {
            response.set_rcode(Rcode::FormErr);
            return Outcome::Reply(response.finish());
        }
    }
    if !received.at_end() {
        response.set_rcode(Rcode::FormErr);
        return Outcome::Reply(response.finish());
    }

    // QTYPE and QCLASS screening.
    let qclass_raw = u16::from(question.qclass);
    let class_any = qclass_raw == QCLASS_ANY;
    if !class_any && question.qclass != crate::class::Class::IN {
        response.set_rcode(Rcode::Refused);
        return Outcome::Reply(response.finish());
    }
    match question.qtype {
        Type::AXFR | Type::IXFR => {
            return match info.transport {
                Transport::Udp => {
                    response.set_rcode(Rcode::FormErr);
                    Outcome::Reply(response.finish())
                }
                Transport::Tcp => match db.find_zone_of(&question.qname) {
                    Some(zone) if db.apex_name(zone) == &question.qname => Outcome::Axfr {
                        zone,
                        id: response.id(),
                        question,
                        tsig: None, // filled in by handle_message
                    },
                    _ => {
                        response.set_rcode(Rcode::Refused);
                        Outcome::Reply(response.finish())
                    }
                },
            };
        }
        Type::MAILA | Type::MAILB => {
            response.set_rcode(Rcode::NotImp);
            return Outcome::Reply(response.finish());
        }
        _ => (),
    }

    // Zone resolution: the longest-suffix apex over the qname.
    let zone = match db.find_zone_of(&question.qname) {
        Some(zone) => zone,
        None => {
            response.set_rcode(Rcode::Refused);
            return Outcome::Reply(response.finish());
        }
    };

    answer::answer_query(db, zone, &question, class_any, do_bit, info, &mut response);
    Outcome::Reply(response.finish())
}

/// Handles a NOTIFY ([RFC 1996]): acknowledge it and pass it on to
/// the transfer coordinator, which knows which sources are allowed.
///
/// [RFC 1996]: https://datatracker.ietf.org/doc/html/rfc1996
fn handle_notify(
    db: &Namedb,
    mut received: Reader,
    info: ReceivedInfo,
    mut response: Writer,
) -> Outcome {
    if received.qdcount() != 1 {
        response.set_rcode(Rcode::FormErr);
        return Outcome::Reply(response.finish());
    }
    let question = match received.read_question() {
        Ok(question) => question,
        Err(_) => {
            response.set_rcode(Rcode::FormErr);
            return Outcome::Reply(response.finish());
        }
    };
    let _ = response.add_question(&question);

    if db.find_zone_of(&question.qname).map(|z| db.apex_name(z)) != Some(&question.qname) {
        response.set_rcode(Rcode::Refused);
        return Outcome::Reply(response.finish());
    }

    // RFC 1996 requires accepting records in any section; the only
    // one that matters is a SOA in the answer section, which carries
    // the master's serial.
    let serial = if received.ancount() >= 1 {
        match received.read_rr() {
            Ok(rr) if rr.rr_type == Type::SOA => {
                let rdata_offset = received.position() - rr.rdata.len();
                parse_soa_serial(received.octets(), rdata_offset)
            }
            _ => None,
        }
    } else {
        None
    };

    response.set_aa(true);
    Outcome::Notify {
        reply: response.finish(),
        apex: question.qname,
        serial,
        source: info.source,
    }
}

/// Extracts the serial from SOA record data starting at
/// `rdata_offset` in `message` (the embedded names may be
/// compressed).
fn parse_soa_serial(message: &[u8], rdata_offset: usize) -> Option<u32> {
    let (_, after_mname) = reader::read_name_at(message, rdata_offset).ok()?;
    let (_, after_rname) = reader::read_name_at(message, after_mname).ok()?;
    let serial = message.get(after_rname..after_rname + 4)?;
    Some(u32::from_be_bytes(serial.try_into().unwrap()))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HEADER_SIZE;

    fn info(transport: Transport) -> ReceivedInfo {
        ReceivedInfo {
            source: "10.0.0.53".parse().unwrap(),
            transport,
        }
    }

    fn build_query(qname: &str, qtype: Type, qclass: u16) -> Vec<u8> {
        let mut msg = vec![0u8; HEADER_SIZE];
        msg[0] = 0xab;
        msg[1] = 0xcd;
        msg[5] = 1; // QDCOUNT
        let name: Dname = qname.parse().unwrap();
        msg.extend_from_slice(name.wire());
        msg.extend_from_slice(&u16::from(qtype).to_be_bytes());
        msg.extend_from_slice(&qclass.to_be_bytes());
        msg
    }

    #[test]
    fn responses_are_ignored() {
        let db = Namedb::new();
        let mut msg = build_query("example.", Type::A, 1);
        msg[2] |= 0x80; // QR
        assert!(matches!(
            handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)),
            Outcome::Ignore
        ));
    }

    #[test]
    fn unknown_zones_are_refused() {
        let db = Namedb::new();
        let msg = build_query("www.example.", Type::A, 1);
        match handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)) {
            Outcome::Reply(reply) => {
                let reader = Reader::try_from(reply.as_slice()).unwrap();
                assert_eq!(reader.rcode(), Rcode::Refused);
                assert_eq!(reader.id(), 0xabcd);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn chaos_class_is_refused() {
        let mut db = Namedb::new();
        db.add_zone(&"example.".parse().unwrap());
        let msg = build_query("example.", Type::A, 3);
        match handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)) {
            Outcome::Reply(reply) => {
                let reader = Reader::try_from(reply.as_slice()).unwrap();
                assert_eq!(reader.rcode(), Rcode::Refused);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn axfr_over_udp_is_formerr_but_tcp_streams() {
        let mut db = Namedb::new();
        db.add_zone(&"example.".parse().unwrap());
        let msg = build_query("example.", Type::AXFR, 1);
        match handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)) {
            Outcome::Reply(reply) => {
                let reader = Reader::try_from(reply.as_slice()).unwrap();
                assert_eq!(reader.rcode(), Rcode::FormErr);
            }
            _ => panic!("expected a reply"),
        }
        assert!(matches!(
            handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Tcp)),
            Outcome::Axfr { .. }
        ));
    }

    #[test]
    fn unsupported_opcodes_get_notimp() {
        let db = Namedb::new();
        let mut msg = build_query("example.", Type::A, 1);
        msg[2] |= 5 << 3; // UPDATE
        match handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)) {
            Outcome::Reply(reply) => {
                let reader = Reader::try_from(reply.as_slice()).unwrap();
                assert_eq!(reader.rcode(), Rcode::NotImp);
            }
            _ => panic!("expected a reply"),
        }
    }

    fn test_key() -> tsig::Key {
        tsig::Key {
            name: "transfer-key.".parse().unwrap(),
            algorithm: tsig::Algorithm::HmacSha256,
            secret: b"shared secret".to_vec(),
        }
    }

    #[test]
    fn signed_queries_get_signed_replies() {
        let mut db = Namedb::new();
        db.add_zone(&"example.".parse().unwrap());
        let mut keyring = tsig::Keyring::new();
        keyring.insert(test_key());

        let now = tsig::unix_now();
        let mut msg = build_query("example.", Type::SOA, 1);
        let mac = tsig::sign_request(&mut msg, &test_key(), now);

        match handle_message(&db, &keyring, &msg, info(Transport::Udp)) {
            Outcome::Reply(mut reply) => {
                let mut verifier = tsig::StreamVerifier::new(test_key(), mac);
                assert_eq!(
                    verifier.process(&mut reply, now),
                    Ok(tsig::Verdict::Signed)
                );
            }
            _ => panic!("expected a reply"),
        }

        // A signed transfer request hands the signing state to the
        // stream writer.
        let mut axfr = build_query("example.", Type::AXFR, 1);
        tsig::sign_request(&mut axfr, &test_key(), now);
        assert!(matches!(
            handle_message(&db, &keyring, &axfr, info(Transport::Tcp)),
            Outcome::Axfr { tsig: Some(_), .. }
        ));
    }

    #[test]
    fn signatures_by_unknown_keys_get_notauth() {
        let mut db = Namedb::new();
        db.add_zone(&"example.".parse().unwrap());
        let mut msg = build_query("example.", Type::SOA, 1);
        tsig::sign_request(&mut msg, &test_key(), tsig::unix_now());

        match handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)) {
            Outcome::Reply(reply) => {
                let reader = Reader::try_from(reply.as_slice()).unwrap();
                assert_eq!(reader.rcode(), Rcode::NotAuth);
                assert_eq!(reader.arcount(), 1); // the unsigned error TSIG
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn notifies_are_acknowledged_and_forwarded() {
        let mut db = Namedb::new();
        db.add_zone(&"example.".parse().unwrap());
        let mut msg = build_query("example.", Type::SOA, 1);
        msg[2] |= 4 << 3; // NOTIFY
        match handle_message(&db, &tsig::Keyring::default(), &msg, info(Transport::Udp)) {
            Outcome::Notify {
                reply,
                apex,
                serial,
                ..
            } => {
                assert_eq!(apex, "example.".parse().unwrap());
                assert_eq!(serial, None);
                let reader = Reader::try_from(reply.as_slice()).unwrap();
                assert_eq!(reader.rcode(), Rcode::NoError);
                assert_eq!(reader.opcode(), Opcode::Notify);
            }
            _ => panic!("expected a notify outcome"),
        }
    }
}
