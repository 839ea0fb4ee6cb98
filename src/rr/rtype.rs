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

//! Implementation of the [`Type`] type, representing RR types.

use std::fmt;
use std::str::FromStr;

macro_rules! rr_types {
    ($(($mnemonic:ident, $value:expr),)*) => {
        impl Type {
            $(pub const $mnemonic: Type = Type($value);)*
        }

        impl FromStr for Type {
            type Err = &'static str;

            fn from_str(text: &str) -> Result<Self, Self::Err> {
                $(
                    if text.eq_ignore_ascii_case(stringify!($mnemonic)) {
                        return Ok(Self::$mnemonic);
                    }
                )*
                // RFC 3597 § 5 syntax, e.g. TYPE731.
                if text
                    .get(0..4)
                    .map_or(false, |prefix| prefix.eq_ignore_ascii_case("TYPE"))
                {
                    text[4..]
                        .parse::<u16>()
                        .map(Self::from)
                        .or(Err("type value is not a valid unsigned 16-bit integer"))
                } else {
                    Err("unknown type")
                }
            }
        }

        impl fmt::Display for Type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match *self {
                    $(Self::$mnemonic => f.write_str(stringify!($mnemonic)),)*
                    Self(value) => write!(f, "TYPE{}", value), // RFC 3597 § 5
                }
            }
        }
    };
}

/// The RR type of a DNS record.
///
/// An RR type is represented on the wire as an unsigned 16-bit integer.
/// Constants are provided for every type that Belfry can decode from
/// zone-file text; unknown values are carried through numerically and
/// render in the [RFC 3597 § 5] `TYPEnnn` form.
///
/// [RFC 3597 § 5]: https://datatracker.ietf.org/doc/html/rfc3597#section-5
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Type(u16);

rr_types! {
    (A, 1),
    (NS, 2),
    (MD, 3),
    (MF, 4),
    (CNAME, 5),
    (SOA, 6),
    (MB, 7),
    (MG, 8),
    (MR, 9),
    (NULL, 10),
    (WKS, 11),
    (PTR, 12),
    (HINFO, 13),
    (MINFO, 14),
    (MX, 15),
    (TXT, 16),
    (RP, 17),
    (AFSDB, 18),
    (SIG, 24),
    (KEY, 25),
    (AAAA, 28),
    (LOC, 29),
    (NXT, 30),
    (SRV, 33),
    (NAPTR, 35),
    (KX, 36),
    (CERT, 37),
    (DNAME, 39),
    (OPT, 41),
    (DS, 43),
    (SSHFP, 44),
    (RRSIG, 46),
    (NSEC, 47),
    (DNSKEY, 48),
    (NSEC3, 50),
    (NSEC3PARAM, 51),
    (TLSA, 52),
    (SPF, 99),
    (TSIG, 250),
    (IXFR, 251),
    (AXFR, 252),
    (MAILB, 253),
    (MAILA, 254),
    (SVCB, 64),
    (HTTPS, 65),
}

impl Type {
    /// The QTYPE `*` (ANY), valid only in questions.
    pub const ANY: Type = Type(255);
}

impl From<u16> for Type {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<Type> for u16 {
    fn from(rr_type: Type) -> Self {
        rr_type.0
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::Type;

    #[test]
    fn type_parses_mnemonics_caselessly() {
        assert_eq!("soa".parse(), Ok(Type::SOA));
        assert_eq!("Nsec3".parse(), Ok(Type::NSEC3));
        assert_eq!("https".parse(), Ok(Type::HTTPS));
    }

    #[test]
    fn type_round_trips_rfc3597_forms() {
        let rr_type: Type = "TYPE65280".parse().unwrap();
        assert_eq!(u16::from(rr_type), 65280);
        assert_eq!(rr_type.to_string(), "TYPE65280");
        assert_eq!("TYPE1".parse(), Ok(Type::A));
    }
}
