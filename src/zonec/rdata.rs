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

//! Decoding of textual record data into typed atoms.
//!
//! Each RR type's presentation format is converted into the atom
//! sequence its type descriptor prescribes. Domain-name fields become
//! references into the name tree (creating nodes as needed); all other
//! fields become wire-format octet runs. The [RFC 3597 § 5] generic
//! `\#` form is accepted for every type.
//!
//! [RFC 3597 § 5]: https://datatracker.ietf.org/doc/html/rfc3597#section-5

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::db::{Atom, Namedb, Rr};
use crate::name::Dname;
use crate::rr::Type;
use crate::util::{base32hex_decode, base64_decode, hex_decode};

use super::lex::Field;

/// A record-data decoding error, carrying a human-readable reason in
/// the manner of a compiler diagnostic.
#[derive(Debug, Eq, PartialEq)]
pub struct Error(pub String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Error {}

fn err<T>(message: impl Into<String>) -> Result<T> {
    Err(Error(message.into()))
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// ENTRY POINT                                                        //
////////////////////////////////////////////////////////////////////////

/// Decodes the rdata fields of a record of `rr_type`, producing the
/// record's atoms. Relative domain names are completed with `origin`.
pub fn parse_rdata(
    db: &mut Namedb,
    origin: &Dname,
    rr_type: Type,
    fields: &[Field],
) -> Result<Rr> {
    // RFC 3597 generic encoding is accepted for any type.
    if fields.first().map(|f| f.text.as_slice()) == Some(b"\\#") {
        return parse_generic(rr_type, &fields[1..]);
    }

    let atoms = match rr_type {
        Type::A => vec![a(field(fields, 0)?)?],
        Type::NS
        | Type::MD
        | Type::MF
        | Type::CNAME
        | Type::MB
        | Type::MG
        | Type::MR
        | Type::PTR => vec![domain(db, origin, field(fields, 0)?)?],
        Type::SOA => vec![
            domain(db, origin, field(fields, 0)?)?,
            domain(db, origin, field(fields, 1)?)?,
            long(field(fields, 2)?)?,
            period(field(fields, 3)?)?,
            period(field(fields, 4)?)?,
            period(field(fields, 5)?)?,
            period(field(fields, 6)?)?,
        ],
        Type::WKS => parse_wks(fields)?,
        Type::HINFO => vec![text(field(fields, 0)?)?, text(field(fields, 1)?)?],
        Type::MINFO | Type::RP => vec![
            domain(db, origin, field(fields, 0)?)?,
            domain(db, origin, field(fields, 1)?)?,
        ],
        Type::MX | Type::AFSDB | Type::KX => vec![
            short(field(fields, 0)?)?,
            domain(db, origin, field(fields, 1)?)?,
        ],
        Type::TXT | Type::SPF => {
            if fields.is_empty() {
                return err("text record needs at least one string");
            }
            fields.iter().map(text).collect::<Result<Vec<_>>>()?
        }
        Type::SIG | Type::RRSIG => vec![
            type_value(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            byte(field(fields, 2)?)?,
            period(field(fields, 3)?)?,
            time_or_long(field(fields, 4)?)?,
            time_or_long(field(fields, 5)?)?,
            short(field(fields, 6)?)?,
            literal_dname(origin, field(fields, 7)?)?,
            base64(&fields[8.min(fields.len())..])?,
        ],
        Type::KEY | Type::DNSKEY => vec![
            short(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            byte(field(fields, 2)?)?,
            base64(&fields[3.min(fields.len())..])?,
        ],
        Type::AAAA => vec![aaaa(field(fields, 0)?)?],
        Type::LOC => vec![parse_loc(fields)?],
        Type::NXT => vec![
            domain(db, origin, field(fields, 0)?)?,
            nxt_bitmap(&fields[1..])?,
        ],
        Type::SRV => vec![
            short(field(fields, 0)?)?,
            short(field(fields, 1)?)?,
            short(field(fields, 2)?)?,
            domain(db, origin, field(fields, 3)?)?,
        ],
        Type::NAPTR => vec![
            short(field(fields, 0)?)?,
            short(field(fields, 1)?)?,
            text(field(fields, 2)?)?,
            text(field(fields, 3)?)?,
            text(field(fields, 4)?)?,
            domain(db, origin, field(fields, 5)?)?,
        ],
        Type::CERT => vec![
            short(field(fields, 0)?)?,
            short(field(fields, 1)?)?,
            byte(field(fields, 2)?)?,
            base64(&fields[3.min(fields.len())..])?,
        ],
        Type::DNAME => vec![domain(db, origin, field(fields, 0)?)?],
        Type::DS => vec![
            short(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            byte(field(fields, 2)?)?,
            hex(&fields[3.min(fields.len())..])?,
        ],
        Type::SSHFP => vec![
            byte(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            hex(&fields[2.min(fields.len())..])?,
        ],
        Type::NSEC => vec![
            literal_dname(origin, field(fields, 0)?)?,
            type_bitmap(&fields[1..])?,
        ],
        Type::NSEC3 => vec![
            byte(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            short(field(fields, 2)?)?,
            salt(field(fields, 3)?)?,
            next_hashed(field(fields, 4)?)?,
            type_bitmap(&fields[5..])?,
        ],
        Type::NSEC3PARAM => vec![
            byte(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            short(field(fields, 2)?)?,
            salt(field(fields, 3)?)?,
        ],
        Type::TLSA => vec![
            byte(field(fields, 0)?)?,
            byte(field(fields, 1)?)?,
            byte(field(fields, 2)?)?,
            hex(&fields[3.min(fields.len())..])?,
        ],
        Type::SVCB | Type::HTTPS => parse_svcb(db, origin, fields)?,
        _ => return err(format!("type {} has no presentation format, use \\#", rr_type)),
    };
    Ok(Rr::new(atoms))
}

/// Parses the [RFC 3597 § 5] generic form: `\# <length> <hex...>`.
fn parse_generic(rr_type: Type, fields: &[Field]) -> Result<Rr> {
    let length: usize = match field(fields, 0)?.as_str().ok().and_then(|s| s.parse().ok()) {
        Some(length) => length,
        None => return err("generic rdata length is expected"),
    };
    let data = if length == 0 {
        Vec::new()
    } else {
        let concatenated: Vec<u8> = fields[1..]
            .iter()
            .flat_map(|f| f.text.iter().copied())
            .collect();
        hex_decode(&concatenated).ok_or(Error("invalid hex in generic rdata".into()))?
    };
    if data.len() != length {
        return err("generic rdata length does not match the data");
    }

    // Even in generic form, domain-name fields of known types must
    // become tree references so that the record compares and dumps
    // correctly. For simplicity (and like the original server) the
    // generic form is only accepted for types without domain-name
    // fields.
    let descriptor = crate::rr::descriptor_by_type(rr_type);
    if descriptor.wire.iter().any(|kind| kind.is_domain()) {
        return err("generic rdata is not supported for types with domain-name fields");
    }
    Ok(Rr::new(vec![Atom::Blob(data.into())]))
}

////////////////////////////////////////////////////////////////////////
// FIELD PARSERS                                                      //
////////////////////////////////////////////////////////////////////////

fn field<'a>(fields: &'a [Field], index: usize) -> Result<&'a Field> {
    fields
        .get(index)
        .ok_or_else(|| Error("missing rdata field".into()))
}

fn number(f: &Field) -> Result<u64> {
    f.as_str()
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error("decimal value is expected".into()))
}

fn byte(f: &Field) -> Result<Atom> {
    let value = number(f)?;
    if value > u8::MAX as u64 {
        return err("unsigned byte value is expected");
    }
    Ok(Atom::Blob(Box::new([value as u8])))
}

fn short(f: &Field) -> Result<Atom> {
    let value = number(f)?;
    if value > u16::MAX as u64 {
        return err("unsigned short value is expected");
    }
    Ok(Atom::Blob((value as u16).to_be_bytes().into()))
}

fn long(f: &Field) -> Result<Atom> {
    let value = number(f)?;
    if value > u32::MAX as u64 {
        return err("long decimal value is expected");
    }
    Ok(Atom::Blob((value as u32).to_be_bytes().into()))
}

/// Parses a time period with optional `s/m/h/d/w` unit suffixes, e.g.
/// `1h30m`.
pub fn parse_period(text: &str) -> Option<u32> {
    let mut seconds: u64 = 0;
    let mut current: u64 = 0;
    let mut saw_digit = false;
    for c in text.chars() {
        match c {
            '0'..='9' => {
                saw_digit = true;
                current = current * 10 + (c as u64 - '0' as u64);
            }
            's' | 'S' => {
                seconds += current;
                current = 0;
            }
            'm' | 'M' => {
                seconds += current * 60;
                current = 0;
            }
            'h' | 'H' => {
                seconds += current * 3600;
                current = 0;
            }
            'd' | 'D' => {
                seconds += current * 86400;
                current = 0;
            }
            'w' | 'W' => {
                seconds += current * 604800;
                current = 0;
            }
            _ => return None,
        }
    }
    seconds += current;
    if !saw_digit || seconds > u32::MAX as u64 {
        None
    } else {
        Some(seconds as u32)
    }
}

fn period(f: &Field) -> Result<Atom> {
    let value = f
        .as_str()
        .ok()
        .and_then(parse_period)
        .ok_or_else(|| Error("time period is expected".into()))?;
    Ok(Atom::Blob(value.to_be_bytes().into()))
}

/// Parses a `YYYYMMDDHHMMSS` timestamp into seconds since the epoch.
pub fn parse_timestamp(text: &str) -> Option<u32> {
    if text.len() != 14 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = |range: std::ops::Range<usize>| text[range].parse::<i64>().unwrap();
    let (year, month, day) = (number(0..4), number(4..6), number(6..8));
    let (hour, minute, second) = (number(8..10), number(10..12), number(12..14));
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    // Days since the epoch, by the days-from-civil construction.
    let year_adjusted = if month <= 2 { year - 1 } else { year };
    let era = year_adjusted.div_euclid(400);
    let year_of_era = year_adjusted - era * 400;
    let month_shifted = if month > 2 { month - 3 } else { month + 9 };
    let day_of_year = (153 * month_shifted + 2) / 5 + day - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    let days = era * 146097 + day_of_era - 719468;

    let seconds = days * 86400 + hour * 3600 + minute * 60 + second;
    u32::try_from(seconds).ok()
}

/// RRSIG expiration/inception fields: a timestamp or a plain number
/// ([RFC 4034 § 3.2]).
///
/// [RFC 4034 § 3.2]: https://datatracker.ietf.org/doc/html/rfc4034#section-3.2
fn time_or_long(f: &Field) -> Result<Atom> {
    let text = f.as_str().or(Err(Error("timestamp is expected".into())))?;
    if let Some(value) = parse_timestamp(text) {
        Ok(Atom::Blob(value.to_be_bytes().into()))
    } else {
        long(f)
    }
}

fn a(f: &Field) -> Result<Atom> {
    let address: Ipv4Addr = f
        .as_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error("invalid ip address".into()))?;
    Ok(Atom::Blob(address.octets().into()))
}

fn aaaa(f: &Field) -> Result<Atom> {
    let address: Ipv6Addr = f
        .as_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error("invalid ipv6 address".into()))?;
    Ok(Atom::Blob(address.octets().into()))
}

fn domain(db: &mut Namedb, origin: &Dname, f: &Field) -> Result<Atom> {
    let name = parse_name(origin, f)?;
    Ok(Atom::Domain(db.tree.insert(&name)))
}

fn literal_dname(origin: &Dname, f: &Field) -> Result<Atom> {
    let name = parse_name(origin, f)?;
    Ok(Atom::Blob(name.wire().into()))
}

fn parse_name(origin: &Dname, f: &Field) -> Result<Dname> {
    let text = f
        .as_str()
        .or(Err(Error("domain name is expected".into())))?;
    Dname::from_text(text, Some(origin)).map_err(|e| Error(format!("bad domain name: {}", e)))
}

fn text(f: &Field) -> Result<Atom> {
    let data = f.unescaped().map_err(|e| Error(e.to_string()))?;
    if data.len() > 255 {
        return err("text string is longer than 255 octets, try splitting it in two");
    }
    let mut wire = Vec::with_capacity(data.len() + 1);
    wire.push(data.len() as u8);
    wire.extend_from_slice(&data);
    Ok(Atom::Blob(wire.into()))
}

fn base64(fields: &[Field]) -> Result<Atom> {
    if fields.is_empty() {
        return err("base64 data is expected");
    }
    let concatenated: Vec<u8> = fields.iter().flat_map(|f| f.text.iter().copied()).collect();
    let data = base64_decode(&concatenated).ok_or(Error("base64 decoding failed".into()))?;
    Ok(Atom::Blob(data.into()))
}

fn hex(fields: &[Field]) -> Result<Atom> {
    if fields.is_empty() {
        return err("hex data is expected");
    }
    let concatenated: Vec<u8> = fields.iter().flat_map(|f| f.text.iter().copied()).collect();
    let data = hex_decode(&concatenated)
        .ok_or(Error("hex representation must be a whole number of octets".into()))?;
    Ok(Atom::Blob(data.into()))
}

/// NSEC3 salt: `-` for empty, hex otherwise; stored with its length
/// octet.
fn salt(f: &Field) -> Result<Atom> {
    let data = if f.text == b"-" {
        Vec::new()
    } else {
        hex_decode(&f.text).ok_or(Error("invalid salt".into()))?
    };
    if data.len() > 255 {
        return err("salt is too long");
    }
    let mut wire = Vec::with_capacity(data.len() + 1);
    wire.push(data.len() as u8);
    wire.extend_from_slice(&data);
    Ok(Atom::Blob(wire.into()))
}

/// The NSEC3 next-hashed-owner field: base32hex, stored with its
/// length octet.
fn next_hashed(f: &Field) -> Result<Atom> {
    let data = base32hex_decode(&f.text).ok_or(Error("invalid base32 hash".into()))?;
    if data.len() > 255 {
        return err("hash is too long");
    }
    let mut wire = Vec::with_capacity(data.len() + 1);
    wire.push(data.len() as u8);
    wire.extend_from_slice(&data);
    Ok(Atom::Blob(wire.into()))
}

fn type_value(f: &Field) -> Result<Atom> {
    let rr_type: Type = f
        .as_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error("RR type is expected".into()))?;
    Ok(Atom::Blob(u16::from(rr_type).to_be_bytes().into()))
}

////////////////////////////////////////////////////////////////////////
// TYPE BITMAPS                                                       //
////////////////////////////////////////////////////////////////////////

/// Builds the windowed type bitmap of NSEC and NSEC3 records
/// ([RFC 4034 § 4.1.2]) from a list of type mnemonics.
///
/// [RFC 4034 § 4.1.2]: https://datatracker.ietf.org/doc/html/rfc4034#section-4.1.2
fn type_bitmap(fields: &[Field]) -> Result<Atom> {
    let mut types: Vec<u16> = Vec::with_capacity(fields.len());
    for f in fields {
        let rr_type: Type = f
            .as_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error("RR type is expected in bitmap".into()))?;
        types.push(rr_type.into());
    }
    types.sort_unstable();
    types.dedup();

    let mut wire = Vec::new();
    let mut window_start = 0;
    while window_start < types.len() {
        let window = types[window_start] >> 8;
        let mut bits = [0u8; 32];
        let mut used = 0usize;
        let mut index = window_start;
        while index < types.len() && (types[index] >> 8) == window {
            let low = (types[index] & 0xff) as usize;
            bits[low / 8] |= 0x80 >> (low % 8);
            used = low / 8 + 1;
            index += 1;
        }
        wire.push(window as u8);
        wire.push(used as u8);
        wire.extend_from_slice(&bits[..used]);
        window_start = index;
    }
    Ok(Atom::Blob(wire.into()))
}

/// Builds the single-block bitmap of the obsolete NXT record
/// ([RFC 2535 § 5.2]): one bit per type 0–127, trailing zero octets
/// trimmed.
///
/// [RFC 2535 § 5.2]: https://datatracker.ietf.org/doc/html/rfc2535#section-5.2
fn nxt_bitmap(fields: &[Field]) -> Result<Atom> {
    let mut bits = [0u8; 16];
    let mut last = 0usize;
    for f in fields {
        let rr_type: Type = f
            .as_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error("RR type is expected in bitmap".into()))?;
        let value = u16::from(rr_type);
        if value > 127 {
            return err("NXT bitmaps cannot hold types above 127");
        }
        bits[value as usize / 8] |= 0x80 >> (value % 8);
        last = last.max(value as usize / 8 + 1);
    }
    Ok(Atom::Blob(bits[..last].to_vec().into()))
}

////////////////////////////////////////////////////////////////////////
// WKS                                                                //
////////////////////////////////////////////////////////////////////////

/// WKS ([RFC 1035 § 3.4.2]): an address, a protocol, and a port
/// bitmap. Protocols may be named `tcp`/`udp` or given numerically;
/// services must be numeric ports.
///
/// [RFC 1035 § 3.4.2]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.4.2
fn parse_wks(fields: &[Field]) -> Result<Vec<Atom>> {
    let address = a(field(fields, 0)?)?;
    let proto_field = field(fields, 1)?;
    let proto = match proto_field.text.as_slice() {
        p if p.eq_ignore_ascii_case(b"tcp") => 6u8,
        p if p.eq_ignore_ascii_case(b"udp") => 17u8,
        _ => {
            let value = number(proto_field)?;
            if value > u8::MAX as u64 {
                return err("unknown protocol");
            }
            value as u8
        }
    };

    let mut bits = Vec::new();
    for f in &fields[2..] {
        let port = number(f)?;
        if port > u16::MAX as u64 {
            return err("invalid port in service bitmap");
        }
        let port = port as usize;
        if bits.len() < port / 8 + 1 {
            bits.resize(port / 8 + 1, 0);
        }
        bits[port / 8] |= 0x80 >> (port % 8);
    }
    Ok(vec![
        address,
        Atom::Blob(Box::new([proto])),
        Atom::Blob(bits.into()),
    ])
}

////////////////////////////////////////////////////////////////////////
// LOC                                                                //
////////////////////////////////////////////////////////////////////////

/// Encodes a size or precision as the `mantissa << 4 | exponent`
/// centimeter form of [RFC 1876 § 2].
///
/// [RFC 1876 § 2]: https://datatracker.ietf.org/doc/html/rfc1876#section-2
fn precsize(meters: f64) -> u8 {
    let mut centimeters = (meters * 100.0).round() as u64;
    let mut exponent = 0u8;
    while centimeters >= 10 && exponent < 9 {
        centimeters /= 10;
        exponent += 1;
    }
    ((centimeters as u8) << 4) | exponent
}

/// LOC ([RFC 1876 § 3]): latitude, longitude, altitude, and optional
/// size and precision.
///
/// [RFC 1876 § 3]: https://datatracker.ietf.org/doc/html/rfc1876#section-3
fn parse_loc(fields: &[Field]) -> Result<Atom> {
    let mut index = 0;

    let mut angle = |positive: u8, negative: u8| -> Result<u32> {
        let mut parts = [0f64; 3];
        let mut count = 0;
        let sign;
        loop {
            let f = field(fields, index)?;
            index += 1;
            let text = f.as_str().or(Err(Error("invalid coordinates".into())))?;
            if text.len() == 1 && (text.as_bytes()[0] | 0x20) == (positive | 0x20) {
                sign = 1f64;
                break;
            } else if text.len() == 1 && (text.as_bytes()[0] | 0x20) == (negative | 0x20) {
                sign = -1f64;
                break;
            } else if count < 3 {
                parts[count] = text
                    .parse()
                    .or(Err(Error("invalid coordinates".into())))?;
                count += 1;
            } else {
                return err("invalid coordinates");
            }
        }
        if count == 0 {
            return err("invalid coordinates");
        }
        let milliseconds =
            ((parts[0] * 3600.0 + parts[1] * 60.0 + parts[2]) * 1000.0 * sign).round() as i64;
        Ok((1i64 << 31).checked_add(milliseconds).unwrap() as u32)
    };

    let latitude = angle(b'N', b'S')?;
    let longitude = angle(b'E', b'W')?;

    let mut meters = |default: f64| -> Result<f64> {
        match fields.get(index) {
            None => Ok(default),
            Some(f) => {
                index += 1;
                let text = f.as_str().or(Err(Error("invalid length".into())))?;
                let trimmed = text.strip_suffix(['m', 'M']).unwrap_or(text);
                trimmed.parse().or(Err(Error("invalid length".into())))
            }
        }
    };

    let altitude_meters = meters(0.0)?;
    let size = precsize(meters(1.0)?);
    let horizontal = precsize(meters(10000.0)?);
    let vertical = precsize(meters(10.0)?);
    let altitude = (10_000_000.0 + altitude_meters * 100.0).round() as u32;

    let mut wire = Vec::with_capacity(16);
    wire.push(0); // VERSION
    wire.push(size);
    wire.push(horizontal);
    wire.push(vertical);
    wire.extend_from_slice(&latitude.to_be_bytes());
    wire.extend_from_slice(&longitude.to_be_bytes());
    wire.extend_from_slice(&altitude.to_be_bytes());
    Ok(Atom::Blob(wire.into()))
}

////////////////////////////////////////////////////////////////////////
// SVCB AND HTTPS                                                     //
////////////////////////////////////////////////////////////////////////

/// SVCB/HTTPS ([RFC 9460]): priority, target name, and service
/// parameters. Parameters are emitted in ascending key order as the
/// wire format requires.
///
/// [RFC 9460]: https://datatracker.ietf.org/doc/html/rfc9460
fn parse_svcb(db: &mut Namedb, origin: &Dname, fields: &[Field]) -> Result<Vec<Atom>> {
    let priority = short(field(fields, 0)?)?;
    let target = domain(db, origin, field(fields, 1)?)?;

    let mut params: Vec<(u16, Vec<u8>)> = Vec::new();
    for f in &fields[2..] {
        params.push(parse_svc_param(f)?);
    }
    params.sort_by_key(|(key, _)| *key);

    let mut wire = Vec::new();
    for (key, value) in params {
        wire.extend_from_slice(&key.to_be_bytes());
        wire.extend_from_slice(&(value.len() as u16).to_be_bytes());
        wire.extend_from_slice(&value);
    }
    Ok(vec![priority, target, Atom::Blob(wire.into())])
}

fn parse_svc_param(f: &Field) -> Result<(u16, Vec<u8>)> {
    let text = f.unescaped().map_err(|e| Error(e.to_string()))?;
    let (key, value) = match text.iter().position(|&c| c == b'=') {
        Some(eq) => (&text[..eq], Some(&text[eq + 1..])),
        None => (&text[..], None),
    };

    let key_str = std::str::from_utf8(key).or(Err(Error("invalid service parameter".into())))?;
    match key_str {
        "no-default-alpn" => Ok((2, Vec::new())),
        "alpn" => {
            let value = value.ok_or(Error("alpn needs a value".into()))?;
            let mut wire = Vec::new();
            for id in value.split(|&c| c == b',') {
                if id.is_empty() || id.len() > 255 {
                    return err("invalid alpn id");
                }
                wire.push(id.len() as u8);
                wire.extend_from_slice(id);
            }
            Ok((1, wire))
        }
        "port" => {
            let value = value.ok_or(Error("port needs a value".into()))?;
            let port: u16 = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(Error("invalid port".into()))?;
            Ok((3, port.to_be_bytes().to_vec()))
        }
        "ipv4hint" => {
            let value = value.ok_or(Error("ipv4hint needs a value".into()))?;
            let mut wire = Vec::new();
            for address in value.split(|&c| c == b',') {
                let parsed: Ipv4Addr = std::str::from_utf8(address)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error("invalid ipv4hint".into()))?;
                wire.extend_from_slice(&parsed.octets());
            }
            Ok((4, wire))
        }
        "ech" => {
            let value = value.ok_or(Error("ech needs a value".into()))?;
            let data = base64_decode(value).ok_or(Error("invalid ech".into()))?;
            Ok((5, data))
        }
        "ipv6hint" => {
            let value = value.ok_or(Error("ipv6hint needs a value".into()))?;
            let mut wire = Vec::new();
            for address in value.split(|&c| c == b',') {
                let parsed: Ipv6Addr = std::str::from_utf8(address)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error("invalid ipv6hint".into()))?;
                wire.extend_from_slice(&parsed.octets());
            }
            Ok((6, wire))
        }
        _ => {
            if let Some(rest) = key_str.strip_prefix("key") {
                let key_number: u16 = rest.parse().or(Err(Error("invalid key number".into())))?;
                Ok((key_number, value.map(|v| v.to_vec()).unwrap_or_default()))
            } else {
                err(format!("unknown service parameter {}", key_str))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Namedb;

    fn fields(input: &[&str]) -> Vec<Field> {
        input
            .iter()
            .map(|s| Field {
                text: s.as_bytes().to_vec(),
                quoted: false,
            })
            .collect()
    }

    fn parse(rr_type: Type, input: &[&str]) -> Result<Rr> {
        let mut db = Namedb::new();
        let origin: Dname = "example.".parse().unwrap();
        parse_rdata(&mut db, &origin, rr_type, &fields(input))
    }

    fn blob(rr: &Rr, index: usize) -> &[u8] {
        rr.atoms[index].as_blob().unwrap()
    }

    #[test]
    fn a_and_aaaa_parse_addresses() {
        let rr = parse(Type::A, &["10.1.2.3"]).unwrap();
        assert_eq!(blob(&rr, 0), [10, 1, 2, 3]);
        let rr = parse(Type::AAAA, &["2001:db8::1"]).unwrap();
        assert_eq!(blob(&rr, 0)[0..4], [0x20, 0x01, 0x0d, 0xb8]);
        assert!(parse(Type::A, &["10.1.2"]).is_err());
    }

    #[test]
    fn soa_accepts_unit_suffixes() {
        let rr = parse(
            Type::SOA,
            &["ns1", "admin", "42", "1h", "15m", "1w", "1d"],
        )
        .unwrap();
        assert_eq!(rr.u32_field(2), Some(42));
        assert_eq!(rr.u32_field(3), Some(3600));
        assert_eq!(rr.u32_field(4), Some(900));
        assert_eq!(rr.u32_field(5), Some(604800));
        assert_eq!(rr.u32_field(6), Some(86400));
    }

    #[test]
    fn mx_produces_a_domain_reference() {
        let rr = parse(Type::MX, &["10", "mail"]).unwrap();
        assert_eq!(blob(&rr, 0), [0, 10]);
        assert!(rr.atoms[1].as_domain().is_some());
    }

    #[test]
    fn rrsig_accepts_timestamps() {
        let rr = parse(
            Type::RRSIG,
            &[
                "A",
                "8",
                "2",
                "3600",
                "20240101000000",
                "20231201000000",
                "12345",
                "example.",
                "aGVsbG8=",
            ],
        )
        .unwrap();
        assert_eq!(rr.u32_field(4), Some(1704067200));
        assert_eq!(blob(&rr, 7), b"\x07example\x00");
        assert_eq!(blob(&rr, 8), b"hello");
    }

    #[test]
    fn nsec3_fields_carry_their_length_octets() {
        let rr = parse(
            Type::NSEC3,
            &["1", "0", "12", "aabbcc", "ck0pojmg874ljref7efn8430qvit8bsm", "A", "SOA", "RRSIG"],
        )
        .unwrap();
        assert_eq!(blob(&rr, 0), [1]);
        assert_eq!(blob(&rr, 2), [0, 12]);
        assert_eq!(blob(&rr, 3), [3, 0xaa, 0xbb, 0xcc]);
        assert_eq!(blob(&rr, 4)[0], 20); // SHA-1 hash length
        // Bitmap window 0 with A (bit 1), SOA (bit 6), RRSIG (bit 46).
        let bitmap = blob(&rr, 5);
        assert_eq!(bitmap[0], 0);
        assert_eq!(bitmap[1], 6);
        assert_eq!(bitmap[2], 0x40 | 0x02);
        assert_eq!(bitmap[3..7], [0, 0, 0, 0]);
        assert_eq!(bitmap[7], 0x02);
    }

    #[test]
    fn empty_salt_is_a_dash() {
        let rr = parse(Type::NSEC3PARAM, &["1", "0", "0", "-"]).unwrap();
        assert_eq!(blob(&rr, 3), [0]);
    }

    #[test]
    fn loc_uses_centimeter_precision_encoding() {
        let rr = parse(
            Type::LOC,
            &["52", "22", "23.000", "N", "4", "53", "32.000", "E", "-2.00m", "0.00m", "10000m", "10m"],
        )
        .unwrap();
        let wire = blob(&rr, 0);
        assert_eq!(wire.len(), 16);
        assert_eq!(wire[0], 0); // version
        assert_eq!(wire[1], 0x00); // size 0 cm
        assert_eq!(wire[2], 0x16); // 10000 m = 1e6 cm
        assert_eq!(wire[3], 0x13); // 10 m = 1e3 cm
        let latitude = u32::from_be_bytes(wire[4..8].try_into().unwrap());
        assert_eq!(latitude, (1u32 << 31) + ((52 * 3600 + 22 * 60 + 23) * 1000));
        let altitude = u32::from_be_bytes(wire[12..16].try_into().unwrap());
        assert_eq!(altitude, 10_000_000 - 200);
    }

    #[test]
    fn generic_rdata_is_checked_against_its_length() {
        let rr = parse(Type::from(731), &["\\#", "3", "c0ffee"]).unwrap();
        assert_eq!(blob(&rr, 0), [0xc0, 0xff, 0xee]);
        assert!(parse(Type::from(731), &["\\#", "4", "c0ffee"]).is_err());
        // Types with domain-name fields reject the generic form.
        assert!(parse(Type::MX, &["\\#", "4", "000a0000"]).is_err());
    }

    #[test]
    fn svcb_parameters_are_sorted_by_key() {
        let rr = parse(
            Type::HTTPS,
            &["1", ".", "port=443", "alpn=h2,h3"],
        )
        .unwrap();
        let params = blob(&rr, 2);
        // alpn (key 1) precedes port (key 3) despite source order.
        assert_eq!(params[0..2], [0, 1]);
        assert_eq!(params[2..4], [0, 6]);
        assert_eq!(&params[4..10], b"\x02h2\x02h3");
        assert_eq!(params[10..12], [0, 3]);
        assert_eq!(params[12..14], [0, 2]);
        assert_eq!(params[14..16], [1, 187]); // 443
    }

    #[test]
    fn txt_strings_become_separate_atoms() {
        let rr = parse(Type::TXT, &["hello", "world"]).unwrap();
        assert_eq!(rr.atoms.len(), 2);
        assert_eq!(blob(&rr, 0), b"\x05hello");
        assert_eq!(blob(&rr, 1), b"\x05world");
    }
}
