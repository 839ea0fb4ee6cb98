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

//! Secret Key Transaction Authentication (TSIG, [RFC 8945]).
//!
//! Both directions are covered. The transfer coordinator signs its
//! SOA/IXFR/AXFR/NOTIFY requests and verifies the replies with a
//! [`StreamVerifier`]; the query workers verify signed requests
//! against the server's [`Keyring`] and sign everything sent back
//! through a [`ServerTsig`]. Multi-message transfer streams keep a
//! rolling MAC: the first and last message of a stream must be
//! signed, a bounded number of unsigned messages in between is
//! tolerated (each still entering the digest of the next signed one),
//! and the prior MAC always enters the digest with its two-octet
//! length.
//!
//! [RFC 8945]: https://datatracker.ietf.org/doc/html/rfc8945

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use sha1::Sha1;
use sha2::Sha256;

use crate::name::Dname;
use crate::rr::Type;

use super::reader::{self, Reader};
use super::{ExtendedRcode, ARCOUNT_START};

/// The number of consecutive unsigned messages tolerated inside a
/// signed transfer stream. [RFC 8945 § 5.3.1] recommends requiring a
/// signature at least every 100 messages; a little slack is left for
/// off-by-one interpretations on the far side.
///
/// [RFC 8945 § 5.3.1]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.3.1
pub const MAX_UNSIGNED_PACKETS: usize = 103;

/// The fudge window, in seconds, put in signed requests.
pub const FUDGE: u16 = 300;

/// The current time as TSIG reckons it: seconds since the epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

lazy_static! {
    static ref HMAC_SHA1_NAME: Dname = "hmac-sha1.".parse().unwrap();
    static ref HMAC_SHA256_NAME: Dname = "hmac-sha256.".parse().unwrap();
}

////////////////////////////////////////////////////////////////////////
// ALGORITHMS AND KEYS                                                //
////////////////////////////////////////////////////////////////////////

/// A supported TSIG algorithm: the two required by [RFC 8945 § 6].
///
/// [RFC 8945 § 6]: https://datatracker.ietf.org/doc/html/rfc8945#section-6
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Algorithm {
    HmacSha1,
    HmacSha256,
}

impl Algorithm {
    /// The domain name identifying this algorithm.
    pub fn name(&self) -> &'static Dname {
        match self {
            Self::HmacSha1 => &HMAC_SHA1_NAME,
            Self::HmacSha256 => &HMAC_SHA256_NAME,
        }
    }

    /// Finds a supported algorithm by its name.
    pub fn from_name(name: &Dname) -> Option<Self> {
        if name == &*HMAC_SHA1_NAME {
            Some(Self::HmacSha1)
        } else if name == &*HMAC_SHA256_NAME {
            Some(Self::HmacSha256)
        } else {
            None
        }
    }

    /// The size of the MAC this algorithm produces.
    pub fn output_size(&self) -> usize {
        match self {
            Self::HmacSha1 => 20,
            Self::HmacSha256 => 32,
        }
    }

    fn compute(&self, secret: &[u8], chunks: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                    .expect("HMAC accepts keys of any length");
                for chunk in chunks {
                    mac.update(chunk);
                }
                mac.finalize().into_bytes().to_vec()
            }
            Self::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .expect("HMAC accepts keys of any length");
                for chunk in chunks {
                    mac.update(chunk);
                }
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = &'static str;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.eq_ignore_ascii_case("hmac-sha1") {
            Ok(Self::HmacSha1)
        } else if text.eq_ignore_ascii_case("hmac-sha256") {
            Ok(Self::HmacSha256)
        } else {
            Err("unsupported TSIG algorithm")
        }
    }
}

/// A shared TSIG key.
#[derive(Clone, Debug)]
pub struct Key {
    pub name: Dname,
    pub algorithm: Algorithm,
    pub secret: Vec<u8>,
}

/// The keys a server accepts, looked up by key name.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    keys: HashMap<Dname, Key>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Key) {
        self.keys.insert(key.name.clone(), key);
    }

    pub fn get(&self, name: &Dname) -> Option<&Key> {
        self.keys.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////
// SIGNING                                                            //
////////////////////////////////////////////////////////////////////////

/// Signs a request message in place: computes the MAC over the
/// message and the TSIG variables, appends the TSIG RR, and bumps
/// ARCOUNT. Returns the MAC (needed to verify the response).
pub fn sign_request(message: &mut Vec<u8>, key: &Key, now: u64) -> Vec<u8> {
    let variables = tsig_variables(key, now);
    let mac = key.algorithm.compute(&key.secret, &[message, &variables]);
    append_tsig_rr(message, key, now, &mac);
    mac
}

/// Signs a response message in place, given the MAC of the request
/// ([RFC 8945 § 5.3]).
///
/// [RFC 8945 § 5.3]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.3
pub fn sign_response(message: &mut Vec<u8>, key: &Key, request_mac: &[u8], now: u64) -> Vec<u8> {
    let variables = tsig_variables(key, now);
    let length = (request_mac.len() as u16).to_be_bytes();
    let mac = key
        .algorithm
        .compute(&key.secret, &[&length, request_mac, message, &variables]);
    append_tsig_rr(message, key, now, &mac);
    mac
}

/// Signs a non-first message of a multi-message response, given the
/// prior MAC and the unsigned messages sent since it. The prior MAC
/// enters the digest with its two-octet length, for every message of
/// the stream ([RFC 8945 § 5.3.1]).
///
/// [RFC 8945 § 5.3.1]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.3.1
pub fn sign_subsequent(
    message: &mut Vec<u8>,
    key: &Key,
    prior_mac: &[u8],
    intervening: &[u8],
    now: u64,
) -> Vec<u8> {
    let timers = tsig_timers(now);
    let length = (prior_mac.len() as u16).to_be_bytes();
    let mac = key
        .algorithm
        .compute(&key.secret, &[&length, prior_mac, intervening, message, &timers]);
    append_tsig_rr(message, key, now, &mac);
    mac
}

/// The TSIG variables of [RFC 8945 § 4.3.3], for a NOERROR record
/// with no other data.
fn tsig_variables(key: &Key, now: u64) -> Vec<u8> {
    let mut data = Vec::new();
    let mut owner = key.name.wire().to_vec();
    owner.make_ascii_lowercase();
    data.extend_from_slice(&owner);
    data.extend_from_slice(&255u16.to_be_bytes()); // class ANY
    data.extend_from_slice(&0u32.to_be_bytes()); // TTL 0
    data.extend_from_slice(key.algorithm.name().wire());
    data.extend_from_slice(&tsig_timers(now));
    data.extend_from_slice(&0u16.to_be_bytes()); // error
    data.extend_from_slice(&0u16.to_be_bytes()); // other length
    data
}

fn tsig_timers(now: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&now.to_be_bytes()[2..8]); // 48-bit time
    data.extend_from_slice(&FUDGE.to_be_bytes());
    data
}

fn append_tsig_rr(message: &mut Vec<u8>, key: &Key, now: u64, mac: &[u8]) {
    message.extend_from_slice(key.name.wire());
    message.extend_from_slice(&u16::from(Type::TSIG).to_be_bytes());
    message.extend_from_slice(&255u16.to_be_bytes()); // class ANY
    message.extend_from_slice(&0u32.to_be_bytes()); // TTL 0

    let algorithm = key.algorithm.name().wire();
    let rdlength = algorithm.len() + 6 + 2 + 2 + mac.len() + 2 + 2 + 2;
    message.extend_from_slice(&(rdlength as u16).to_be_bytes());
    message.extend_from_slice(algorithm);
    message.extend_from_slice(&now.to_be_bytes()[2..8]);
    message.extend_from_slice(&FUDGE.to_be_bytes());
    message.extend_from_slice(&(mac.len() as u16).to_be_bytes());
    message.extend_from_slice(mac);
    let original_id = [message[0], message[1]];
    message.extend_from_slice(&original_id);
    message.extend_from_slice(&0u16.to_be_bytes()); // error
    message.extend_from_slice(&0u16.to_be_bytes()); // other length

    bump_arcount(message, 1);
}

fn bump_arcount(message: &mut [u8], delta: i32) {
    let arcount =
        u16::from_be_bytes([message[ARCOUNT_START], message[ARCOUNT_START + 1]]) as i32 + delta;
    message[ARCOUNT_START..ARCOUNT_START + 2]
        .copy_from_slice(&(arcount as u16).to_be_bytes());
}

////////////////////////////////////////////////////////////////////////
// STREAM VERIFICATION                                                //
////////////////////////////////////////////////////////////////////////

/// The verdict on one message of a stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The message carried a valid TSIG, which has been stripped.
    Signed,

    /// The message carried no TSIG; it was buffered into the rolling
    /// digest.
    Unsigned,
}

/// Verifies the response stream of a signed request.
pub struct StreamVerifier {
    key: Key,
    prior_mac: Vec<u8>,
    buffered: Vec<u8>,
    unsigned_count: usize,
    any_verified: bool,
}

impl StreamVerifier {
    /// Starts verification, with `request_mac` being the MAC that
    /// [`sign_request`] placed on the outgoing request.
    pub fn new(key: Key, request_mac: Vec<u8>) -> Self {
        Self {
            key,
            prior_mac: request_mac,
            buffered: Vec::new(),
            unsigned_count: 0,
            any_verified: false,
        }
    }

    /// Whether the most recent message of the stream was signed. The
    /// final message of a transfer must leave this true.
    pub fn last_was_signed(&self) -> bool {
        self.unsigned_count == 0 && self.any_verified
    }

    /// Processes one message. If it carries a TSIG RR, the signature
    /// is verified and the RR is stripped from `message` (ARCOUNT is
    /// decremented); otherwise the message is folded into the rolling
    /// digest for the next signed one.
    pub fn process(&mut self, message: &mut Vec<u8>, now: u64) -> Result<Verdict, Error> {
        let tsig = match find_tsig(message)? {
            Some(tsig) => tsig,
            None => {
                if !self.any_verified {
                    return Err(Error::FirstUnsigned);
                }
                self.unsigned_count += 1;
                if self.unsigned_count > MAX_UNSIGNED_PACKETS {
                    return Err(Error::TooManyUnsigned);
                }
                self.buffered.extend_from_slice(message);
                return Ok(Verdict::Unsigned);
            }
        };

        if tsig.key_name != self.key.name {
            return Err(Error::BadKey);
        }
        if Algorithm::from_name(&tsig.algorithm) != Some(self.key.algorithm) {
            return Err(Error::BadKey);
        }

        // The digested form of the message: TSIG stripped, ARCOUNT
        // decremented.
        let mut stripped = message[..tsig.start].to_vec();
        bump_arcount(&mut stripped, -1);

        // The prior MAC (the request's, or the previous signed
        // message's) is always digested with its two-octet length.
        let length = (self.prior_mac.len() as u16).to_be_bytes();
        let expected = if !self.any_verified {
            let variables = verify_variables(&tsig);
            self.key.algorithm.compute(
                &self.key.secret,
                &[&length, &self.prior_mac, &stripped, &variables],
            )
        } else {
            let mut timers = Vec::with_capacity(8);
            timers.extend_from_slice(&tsig.time_signed);
            timers.extend_from_slice(&tsig.fudge.to_be_bytes());
            self.key.algorithm.compute(
                &self.key.secret,
                &[&length, &self.prior_mac, &self.buffered, &stripped, &timers],
            )
        };

        if expected != tsig.mac {
            return Err(Error::BadSignature);
        }

        let mut time = [0u8; 8];
        time[2..8].copy_from_slice(&tsig.time_signed);
        let time_signed = u64::from_be_bytes(time);
        if now.abs_diff(time_signed) > tsig.fudge as u64 {
            return Err(Error::BadTime);
        }

        self.prior_mac = tsig.mac;
        self.buffered.clear();
        self.unsigned_count = 0;
        self.any_verified = true;
        message.truncate(tsig.start);
        bump_arcount(message, -1);
        Ok(Verdict::Signed)
    }
}

////////////////////////////////////////////////////////////////////////
// REQUEST VERIFICATION (SERVER SIDE)                                 //
////////////////////////////////////////////////////////////////////////

/// What [`verify_request`] found on a received request.
#[derive(Debug)]
pub enum RequestVerification {
    /// The request carries no TSIG RR.
    Unsigned,

    /// The request's TSIG verified; every message of the response
    /// must be signed through the returned state.
    Signed(ServerTsig),

    /// The request's TSIG did not verify. Per [RFC 8945 § 5.2] the
    /// response is NOTAUTH with an unsigned TSIG RR naming the error
    /// (see [`append_unsigned`]).
    ///
    /// [RFC 8945 § 5.2]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.2
    Failed(FailedTsig),
}

/// The identifying material of a TSIG that failed verification,
/// echoed back in the unsigned error TSIG.
#[derive(Debug)]
pub struct FailedTsig {
    pub key_name: Dname,
    pub algorithm: Dname,
    pub error: ExtendedRcode,
}

/// Verifies the TSIG RR of a received request, if one is present.
/// `Err` means the message could not be parsed at all (a FORMERR for
/// the caller).
pub fn verify_request(
    message: &[u8],
    keyring: &Keyring,
    now: u64,
) -> Result<RequestVerification, Error> {
    let tsig = match find_tsig(message)? {
        Some(tsig) => tsig,
        None => return Ok(RequestVerification::Unsigned),
    };

    let key = match keyring.get(&tsig.key_name) {
        Some(key) if Algorithm::from_name(&tsig.algorithm) == Some(key.algorithm) => key.clone(),
        _ => {
            return Ok(RequestVerification::Failed(FailedTsig {
                key_name: tsig.key_name,
                algorithm: tsig.algorithm,
                error: ExtendedRcode::BADKEY,
            }))
        }
    };

    // The digested form: TSIG stripped, ARCOUNT decremented, and the
    // original message ID restored.
    let mut stripped = message[..tsig.start].to_vec();
    stripped[0..2].copy_from_slice(&tsig.original_id.to_be_bytes());
    bump_arcount(&mut stripped, -1);
    let variables = verify_variables(&tsig);
    let expected = key.algorithm.compute(&key.secret, &[&stripped, &variables]);
    if expected != tsig.mac {
        return Ok(RequestVerification::Failed(FailedTsig {
            key_name: tsig.key_name,
            algorithm: tsig.algorithm,
            error: ExtendedRcode::BADSIG,
        }));
    }

    let mut time = [0u8; 8];
    time[2..8].copy_from_slice(&tsig.time_signed);
    if now.abs_diff(u64::from_be_bytes(time)) > tsig.fudge as u64 {
        return Ok(RequestVerification::Failed(FailedTsig {
            key_name: tsig.key_name,
            algorithm: tsig.algorithm,
            error: ExtendedRcode::BADTIME,
        }));
    }

    Ok(RequestVerification::Signed(ServerTsig {
        key,
        prior_mac: tsig.mac,
        responded: false,
    }))
}

/// Signs the messages answering one verified request: the first with
/// the request MAC in the digest, any further transfer messages
/// chained off the previous MAC.
#[derive(Debug)]
pub struct ServerTsig {
    key: Key,
    prior_mac: Vec<u8>,
    responded: bool,
}

impl ServerTsig {
    /// The key the request was signed with.
    pub fn key_name(&self) -> &Dname {
        &self.key.name
    }

    /// The space the TSIG RR takes on a signed response, so that the
    /// response body can be budgeted to leave room for it.
    pub fn reserved_len(&self) -> usize {
        self.key.name.len() + 10 + self.key.algorithm.name().len() + 16
            + self.key.algorithm.output_size()
    }

    /// Signs the next message of the response in place.
    pub fn sign(&mut self, message: &mut Vec<u8>, now: u64) {
        let mac = if !self.responded {
            sign_response(message, &self.key, &self.prior_mac, now)
        } else {
            sign_subsequent(message, &self.key, &self.prior_mac, &[], now)
        };
        self.prior_mac = mac;
        self.responded = true;
    }
}

/// Appends the unsigned TSIG RR of a [RFC 8945 § 5.2] error response.
/// BADTIME responses carry the server's clock in the other-data field
/// so the client can tell how far apart the two are.
///
/// [RFC 8945 § 5.2]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.2
pub fn append_unsigned(message: &mut Vec<u8>, failed: &FailedTsig, now: u64) {
    let other: Vec<u8> = if failed.error == ExtendedRcode::BADTIME {
        now.to_be_bytes()[2..8].to_vec()
    } else {
        Vec::new()
    };

    message.extend_from_slice(failed.key_name.wire());
    message.extend_from_slice(&u16::from(Type::TSIG).to_be_bytes());
    message.extend_from_slice(&255u16.to_be_bytes()); // class ANY
    message.extend_from_slice(&0u32.to_be_bytes()); // TTL 0

    let algorithm = failed.algorithm.wire();
    let rdlength = algorithm.len() + 6 + 2 + 2 + 2 + 2 + 2 + other.len();
    message.extend_from_slice(&(rdlength as u16).to_be_bytes());
    message.extend_from_slice(algorithm);
    message.extend_from_slice(&now.to_be_bytes()[2..8]);
    message.extend_from_slice(&FUDGE.to_be_bytes());
    message.extend_from_slice(&0u16.to_be_bytes()); // empty MAC
    let original_id = [message[0], message[1]];
    message.extend_from_slice(&original_id);
    message.extend_from_slice(&failed.error.0.to_be_bytes());
    message.extend_from_slice(&(other.len() as u16).to_be_bytes());
    message.extend_from_slice(&other);

    bump_arcount(message, 1);
}

/// The TSIG variables of a *received* record, for verification.
fn verify_variables(tsig: &FoundTsig) -> Vec<u8> {
    let mut data = Vec::new();
    let mut owner = tsig.key_name.wire().to_vec();
    owner.make_ascii_lowercase();
    data.extend_from_slice(&owner);
    data.extend_from_slice(&255u16.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    let mut algorithm = tsig.algorithm.wire().to_vec();
    algorithm.make_ascii_lowercase();
    data.extend_from_slice(&algorithm);
    data.extend_from_slice(&tsig.time_signed);
    data.extend_from_slice(&tsig.fudge.to_be_bytes());
    data.extend_from_slice(&tsig.error.to_be_bytes());
    data.extend_from_slice(&(tsig.other.len() as u16).to_be_bytes());
    data.extend_from_slice(&tsig.other);
    data
}

/// A parsed TSIG RR found at the end of a message.
struct FoundTsig {
    start: usize,
    key_name: Dname,
    algorithm: Dname,
    time_signed: [u8; 6],
    fudge: u16,
    mac: Vec<u8>,
    original_id: u16,
    error: u16,
    other: Vec<u8>,
}

/// Locates and parses the TSIG RR, which must be the last record of
/// the additional section.
fn find_tsig(message: &[u8]) -> Result<Option<FoundTsig>, Error> {
    let mut reader = Reader::try_from(message).map_err(|_| Error::Malformed)?;
    for _ in 0..reader.qdcount() {
        reader.read_question().map_err(|_| Error::Malformed)?;
    }
    let rr_count =
        reader.ancount() as usize + reader.nscount() as usize + reader.arcount() as usize;
    let mut last: Option<reader::ReadRr> = None;
    for _ in 0..rr_count {
        last = Some(reader.read_rr().map_err(|_| Error::Malformed)?);
    }
    let rr = match last {
        Some(rr) if rr.rr_type == Type::TSIG => rr,
        _ => return Ok(None),
    };

    let rdata = rr.rdata;
    let (algorithm, consumed) =
        Dname::from_wire_uncompressed(rdata).map_err(|_| Error::Malformed)?;
    let fixed = rdata.get(consumed..consumed + 10).ok_or(Error::Malformed)?;
    let time_signed: [u8; 6] = fixed[0..6].try_into().unwrap();
    let fudge = u16::from_be_bytes(fixed[6..8].try_into().unwrap());
    let mac_size = u16::from_be_bytes(fixed[8..10].try_into().unwrap()) as usize;
    let mac = rdata
        .get(consumed + 10..consumed + 10 + mac_size)
        .ok_or(Error::Malformed)?
        .to_vec();
    let tail = rdata
        .get(consumed + 10 + mac_size..)
        .ok_or(Error::Malformed)?;
    if tail.len() < 6 {
        return Err(Error::Malformed);
    }
    let original_id = u16::from_be_bytes(tail[0..2].try_into().unwrap());
    let error = u16::from_be_bytes(tail[2..4].try_into().unwrap());
    let other_len = u16::from_be_bytes(tail[4..6].try_into().unwrap()) as usize;
    let other = tail.get(6..6 + other_len).ok_or(Error::Malformed)?.to_vec();

    Ok(Some(FoundTsig {
        start: rr.start,
        key_name: rr.owner,
        algorithm,
        time_signed,
        fudge,
        mac,
        original_id,
        error,
        other,
    }))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The message could not be parsed while looking for a TSIG RR.
    Malformed,

    /// The key name or algorithm does not match the configured key.
    BadKey,

    /// The MAC does not verify.
    BadSignature,

    /// The signing time is outside the fudge window.
    BadTime,

    /// The first message of the stream was not signed.
    FirstUnsigned,

    /// Too many consecutive unsigned messages.
    TooManyUnsigned,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed TSIG record"),
            Self::BadKey => f.write_str("unknown key or algorithm"),
            Self::BadSignature => f.write_str("bad TSIG signature"),
            Self::BadTime => f.write_str("TSIG time outside the fudge window"),
            Self::FirstUnsigned => f.write_str("first message of the stream is unsigned"),
            Self::TooManyUnsigned => {
                f.write_str("too many consecutive messages without TSIG")
            }
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
