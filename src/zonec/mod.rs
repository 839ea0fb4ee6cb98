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

//! The zone compiler.
//!
//! The compiler turns textual zone files into the in-memory database.
//! It understands the `$TTL`, `$ORIGIN` and `$INCLUDE` directives,
//! owner inheritance through leading whitespace, the `@` origin
//! shorthand, and TTL and class fields in either order. Errors are
//! reported with file and line and counted; a database with any
//! errors is never persisted.

pub mod lex;
pub mod rdata;

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::{error, warn};

use crate::class::Class;
use crate::db::{AddError, AddStatus, Namedb, ZoneId};
use crate::name::Dname;
use crate::rr::{Ttl, Type};

use lex::{Field, Lexer, Line};

/// The deepest `$INCLUDE` nesting the compiler will follow.
const MAX_INCLUDE_DEPTH: usize = 16;

/// The TTL used when a record states none and no `$TTL` or previous
/// record supplies one.
const DEFAULT_TTL: u32 = 3600;

////////////////////////////////////////////////////////////////////////
// ZONE LIST FILES                                                    //
////////////////////////////////////////////////////////////////////////

/// One entry of a zone list file:
/// `zone <apex-name> <zone-file-path> [masters <ip>…] [notify <ip>…]`.
#[derive(Clone, Debug)]
pub struct ZoneListEntry {
    pub name: Dname,
    pub path: PathBuf,
    pub masters: Vec<IpAddr>,
    pub notify: Vec<IpAddr>,
}

/// Parses a zone list file. Lines are whitespace-separated records;
/// `;` starts a comment.
pub fn parse_zone_list(path: &Path) -> Result<Vec<ZoneListEntry>, ZoneListError> {
    let contents = fs::read_to_string(path).map_err(ZoneListError::Io)?;
    let mut entries = Vec::new();
    for (index, raw_line) in contents.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.split(';').next().unwrap_or("");
        let mut tokens = line.split_whitespace();
        let keyword = match tokens.next() {
            Some(keyword) => keyword,
            None => continue,
        };
        if !keyword.eq_ignore_ascii_case("zone") {
            return Err(ZoneListError::Syntax(line_number, "expected token 'zone'"));
        }
        let name = tokens
            .next()
            .ok_or(ZoneListError::Syntax(line_number, "expected zone name"))?;
        let name = Dname::from_text(name, Some(Dname::root()))
            .or(Err(ZoneListError::Syntax(line_number, "bad zone name")))?;
        let file = tokens
            .next()
            .ok_or(ZoneListError::Syntax(line_number, "expected file name"))?;

        let mut entry = ZoneListEntry {
            name,
            path: PathBuf::from(file),
            masters: Vec::new(),
            notify: Vec::new(),
        };
        let mut target: Option<&mut Vec<IpAddr>> = None;
        for token in tokens {
            if token.eq_ignore_ascii_case("masters") {
                target = Some(&mut entry.masters);
            } else if token.eq_ignore_ascii_case("notify") {
                target = Some(&mut entry.notify);
            } else {
                let address: IpAddr = token
                    .parse()
                    .or(Err(ZoneListError::Syntax(line_number, "bad IP address")))?;
                match target {
                    Some(ref mut list) => list.push(address),
                    None => {
                        return Err(ZoneListError::Syntax(
                            line_number,
                            "expected 'masters' or 'notify'",
                        ))
                    }
                }
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// An error reading a zone list file.
#[derive(Debug)]
pub enum ZoneListError {
    Io(std::io::Error),
    Syntax(usize, &'static str),
}

impl fmt::Display for ZoneListError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read zone list: {}", e),
            Self::Syntax(line, what) => write!(f, "syntax error on line {}: {}", line, what),
        }
    }
}

impl std::error::Error for ZoneListError {}

////////////////////////////////////////////////////////////////////////
// THE COMPILER                                                       //
////////////////////////////////////////////////////////////////////////

/// Compiles zones into a [`Namedb`], keeping a running error count.
pub struct Compiler {
    db: Namedb,
    total_errors: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            db: Namedb::new(),
            total_errors: 0,
        }
    }

    pub fn total_errors(&self) -> usize {
        self.total_errors
    }

    pub fn db(&self) -> &Namedb {
        &self.db
    }

    /// Compiles one zone from `path`. Errors are logged and counted;
    /// the zone is still entered into the database so that later
    /// zones can be processed.
    pub fn compile_zone(&mut self, name: &Dname, path: &Path) -> ZoneId {
        let zone = self.db.add_zone(name);
        let mut state = ZoneFileState {
            db: &mut self.db,
            zone,
            apex: name.clone(),
            origin: name.clone(),
            previous_owner: None,
            previous_ttl: None,
            previous_class: None,
            default_ttl: None,
            seen_soa: false,
            errors: 0,
        };
        state.parse_file(path, 0);
        let seen_soa = state.seen_soa;
        let mut errors = state.errors;

        if !seen_soa {
            error!("{}: missing SOA record on top of the zone", path.display());
            errors += 1;
        } else if self.db.ns(zone).is_none() {
            warn!("{}: zone has no NS records at its apex", path.display());
        }
        self.total_errors += errors;
        zone
    }

    /// Finishes compilation, yielding the database only if every zone
    /// compiled cleanly.
    pub fn finish(self) -> Result<Namedb, usize> {
        if self.total_errors == 0 {
            Ok(self.db)
        } else {
            Err(self.total_errors)
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-file parsing context, threaded explicitly through the compile
/// of one zone (including `$INCLUDE`d files).
struct ZoneFileState<'a> {
    db: &'a mut Namedb,
    zone: ZoneId,
    apex: Dname,
    origin: Dname,
    previous_owner: Option<Dname>,
    previous_ttl: Option<Ttl>,
    previous_class: Option<Class>,
    default_ttl: Option<Ttl>,
    seen_soa: bool,
    errors: usize,
}

impl ZoneFileState<'_> {
    fn report(&mut self, path: &Path, line: usize, message: impl fmt::Display) {
        error!("{}:{}: {}", path.display(), line, message);
        self.errors += 1;
    }

    fn parse_file(&mut self, path: &Path, depth: usize) {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) => {
                self.report(path, 0, format_args!("cannot open zone file: {}", e));
                return;
            }
        };

        let mut lexer = Lexer::new(&contents);
        loop {
            match lexer.next_line() {
                Ok(Some(line)) => self.process_line(path, line, depth),
                Ok(None) => break,
                Err((number, e)) => {
                    self.report(path, number, e);
                    break;
                }
            }
        }
    }

    fn process_line(&mut self, path: &Path, line: Line, depth: usize) {
        let number = line.number;
        if line.fields[0].text.starts_with(b"$") {
            self.process_directive(path, line, depth);
        } else if let Err(message) = self.process_record(line) {
            self.report(path, number, message);
        }
    }

    fn process_directive(&mut self, path: &Path, line: Line, depth: usize) {
        let directive = line.fields[0].text.clone();
        if directive.eq_ignore_ascii_case(b"$TTL") {
            match line
                .fields
                .get(1)
                .and_then(|f| f.as_str().ok())
                .and_then(rdata::parse_period)
            {
                Some(value) => self.default_ttl = Some(Ttl::from(value)),
                None => self.report(path, line.number, "$TTL needs a time value"),
            }
        } else if directive.eq_ignore_ascii_case(b"$ORIGIN") {
            match line
                .fields
                .get(1)
                .and_then(|f| f.as_str().ok())
                .and_then(|text| Dname::from_text(text, Some(&self.origin)).ok())
            {
                Some(origin) => self.origin = origin,
                None => self.report(path, line.number, "$ORIGIN needs a domain name"),
            }
        } else if directive.eq_ignore_ascii_case(b"$INCLUDE") {
            if depth >= MAX_INCLUDE_DEPTH {
                self.report(path, line.number, "$INCLUDE nested too deeply");
                return;
            }
            let include_path = match line.fields.get(1).and_then(|f| f.as_str().ok()) {
                Some(text) => PathBuf::from(text),
                None => {
                    self.report(path, line.number, "$INCLUDE needs a file name");
                    return;
                }
            };
            let include_origin = match line.fields.get(2) {
                Some(f) => match f
                    .as_str()
                    .ok()
                    .and_then(|text| Dname::from_text(text, Some(&self.origin)).ok())
                {
                    Some(origin) => Some(origin),
                    None => {
                        self.report(path, line.number, "$INCLUDE has a bad origin");
                        return;
                    }
                },
                None => None,
            };

            // The origin change is scoped to the included file.
            let saved_origin = self.origin.clone();
            if let Some(origin) = include_origin {
                self.origin = origin;
            }
            let resolved = if include_path.is_absolute() {
                include_path
            } else {
                path.parent().unwrap_or(Path::new(".")).join(include_path)
            };
            self.parse_file(&resolved, depth + 1);
            self.origin = saved_origin;
        } else {
            self.report(
                path,
                line.number,
                format_args!(
                    "unknown directive {}",
                    String::from_utf8_lossy(&directive)
                ),
            );
        }
    }

    /// Parses and enters one record: `[owner] [ttl] [class] type
    /// rdata…`, with TTL and class accepted in either order.
    fn process_record(&mut self, line: Line) -> Result<(), String> {
        let mut fields = line.fields.as_slice();

        let owner = if line.leading_whitespace {
            self.previous_owner
                .clone()
                .ok_or("leading whitespace but no previous owner")?
        } else {
            let owner_field = &fields[0];
            fields = &fields[1..];
            let text = owner_field
                .as_str()
                .or(Err("owner name is not valid text"))?;
            Dname::from_text(text, Some(&self.origin))
                .map_err(|e| format!("bad owner name: {}", e))?
        };

        let mut ttl: Option<Ttl> = None;
        let mut class: Option<Class> = None;
        let rr_type: Type;
        loop {
            let f = fields.first().ok_or("record is missing its type")?;
            let text = f.as_str().or(Err("record field is not valid text"))?;
            if class.is_none() && text.parse::<Class>().is_ok() {
                class = text.parse().ok();
                fields = &fields[1..];
            } else if ttl.is_none() && text.as_bytes().first().map_or(false, u8::is_ascii_digit) {
                ttl = rdata::parse_period(text).map(Ttl::from);
                if ttl.is_none() {
                    return Err("invalid TTL value".into());
                }
                fields = &fields[1..];
            } else {
                rr_type = text.parse().or(Err(format!("unknown RR type {}", text)))?;
                fields = &fields[1..];
                break;
            }
        }

        let ttl = ttl
            .or(self.default_ttl)
            .or(self.previous_ttl)
            .unwrap_or(Ttl::from(DEFAULT_TTL));
        let class = class.or(self.previous_class).unwrap_or(Class::IN);

        self.previous_owner = Some(owner.clone());
        self.previous_ttl = Some(ttl);
        self.previous_class = Some(class);

        self.enter_record(owner, ttl, class, rr_type, fields)
    }

    /// The record-processing contract: validate the record against the
    /// zone, then add it to the database.
    fn enter_record(
        &mut self,
        owner: Dname,
        ttl: Ttl,
        class: Class,
        rr_type: Type,
        fields: &[Field],
    ) -> Result<(), String> {
        if class != Class::IN {
            return Err("wrong class".into());
        }
        if !owner.eq_or_subdomain_of(&self.apex) {
            return Err("out of zone data".into());
        }

        let rr = rdata::parse_rdata(self.db, &self.origin, rr_type, fields)
            .map_err(|e| e.to_string())?;

        if rr_type == Type::SOA {
            if self.seen_soa {
                return Err("duplicate SOA record discarded".into());
            }
            if owner != self.apex {
                return Err("SOA record with invalid domain name".into());
            }
        }

        match self.db.add_rr(self.zone, &owner, rr_type, ttl, rr) {
            Ok(AddStatus::DroppedDuplicate) => return Ok(()), // silent
            Ok(_) => (),
            Err(AddError::TtlMismatch) => {
                return Err("TTL does not match the TTL of the RRset".into())
            }
            Err(AddError::TooManyRrs) => return Err("too many records in the RRset".into()),
        }

        if rr_type == Type::SOA {
            self.seen_soa = true;
        } else if !self.seen_soa {
            return Err("missing SOA record on top of the zone".into());
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn name(text: &str) -> Dname {
        text.parse().unwrap()
    }

    fn write_temp(contents: &str) -> (tempdir::TempDirLike, PathBuf) {
        let dir = tempdir::TempDirLike::new();
        let path = dir.path().join("zone.db");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    // A minimal temporary-directory helper so that the tests do not
    // need an external crate.
    mod tempdir {
        use std::path::{Path, PathBuf};
        use std::sync::atomic::{AtomicUsize, Ordering};

        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        pub struct TempDirLike(PathBuf);

        impl TempDirLike {
            pub fn new() -> Self {
                let path = std::env::temp_dir().join(format!(
                    "belfry-zonec-test-{}-{}",
                    std::process::id(),
                    COUNTER.fetch_add(1, Ordering::Relaxed),
                ));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDirLike {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    const SAMPLE_ZONE: &str = "\
$ORIGIN example.
$TTL 86400
@   IN SOA ns1 admin (
    1       ; SERIAL
    3600    ; REFRESH
    900     ; RETRY
    86400   ; EXPIRE
    3600    ; MINIMUM
)
    IN NS ns1
ns1 IN A 10.0.0.1
    IN AAAA ::1
*.wild 300 IN A 10.0.0.9
";

    #[test]
    fn sample_zone_compiles() {
        let (_dir, path) = write_temp(SAMPLE_ZONE);
        let mut compiler = Compiler::new();
        let zone = compiler.compile_zone(&name("example."), &path);
        assert_eq!(compiler.total_errors(), 0);
        let db = compiler.finish().unwrap();

        assert_eq!(db.soa_serial(zone), Some(1));
        let ns1 = db.tree.find(&name("ns1.example.")).unwrap();
        assert!(db.tree.node(ns1).find_rrset(zone, Type::A).is_some());
        assert!(db.tree.node(ns1).find_rrset(zone, Type::AAAA).is_some());
        let wild = db.tree.find(&name("*.wild.example.")).unwrap();
        let a = db.tree.node(wild).find_rrset(zone, Type::A).unwrap();
        assert_eq!(u32::from(a.ttl), 300);
    }

    #[test]
    fn out_of_zone_data_is_an_error() {
        let (_dir, path) = write_temp(
            "$TTL 300\n@ IN SOA ns1.example. admin.example. 1 2 3 4 5\nother.test. IN A 10.0.0.1\n",
        );
        let mut compiler = Compiler::new();
        compiler.compile_zone(&name("example."), &path);
        assert_eq!(compiler.total_errors(), 1);
        assert!(compiler.finish().is_err());
    }

    #[test]
    fn duplicate_soa_is_an_error_and_discarded() {
        let (_dir, path) = write_temp(
            "$TTL 300\n\
             @ IN SOA ns1.example. admin.example. 1 2 3 4 5\n\
             @ IN SOA ns1.example. admin.example. 9 2 3 4 5\n",
        );
        let mut compiler = Compiler::new();
        let zone = compiler.compile_zone(&name("example."), &path);
        assert_eq!(compiler.total_errors(), 1);
        assert_eq!(compiler.db().soa_serial(zone), Some(1));
    }

    #[test]
    fn ttl_mismatch_within_an_rrset_is_an_error() {
        let (_dir, path) = write_temp(
            "$TTL 300\n\
             @ IN SOA ns1.example. admin.example. 1 2 3 4 5\n\
             www 100 IN A 10.0.0.1\n\
             www 200 IN A 10.0.0.2\n",
        );
        let mut compiler = Compiler::new();
        compiler.compile_zone(&name("example."), &path);
        assert_eq!(compiler.total_errors(), 1);
    }

    #[test]
    fn exact_duplicates_are_dropped_silently() {
        let (_dir, path) = write_temp(
            "$TTL 300\n\
             @ IN SOA ns1.example. admin.example. 1 2 3 4 5\n\
             www IN A 10.0.0.1\n\
             www IN A 10.0.0.1\n",
        );
        let mut compiler = Compiler::new();
        let zone = compiler.compile_zone(&name("example."), &path);
        assert_eq!(compiler.total_errors(), 0);
        let db = compiler.finish().unwrap();
        let www = db.tree.find(&name("www.example.")).unwrap();
        assert_eq!(db.tree.node(www).find_rrset(zone, Type::A).unwrap().rrs.len(), 1);
    }

    #[test]
    fn wrong_class_is_an_error() {
        let (_dir, path) = write_temp(
            "$TTL 300\n@ IN SOA ns1.example. admin.example. 1 2 3 4 5\nwww CH A 10.0.0.1\n",
        );
        let mut compiler = Compiler::new();
        compiler.compile_zone(&name("example."), &path);
        assert_eq!(compiler.total_errors(), 1);
    }

    #[test]
    fn include_directive_is_scoped_and_bounded() {
        let dir = tempdir::TempDirLike::new();
        let main = dir.path().join("main.zone");
        let sub = dir.path().join("sub.zone");
        fs::write(
            &main,
            "$TTL 300\n@ IN SOA ns1.example. admin.example. 1 2 3 4 5\n\
             $INCLUDE sub.zone sub.example.\n\
             top IN A 10.0.0.3\n",
        )
        .unwrap();
        fs::write(&sub, "www IN A 10.0.0.2\n").unwrap();

        let mut compiler = Compiler::new();
        let zone = compiler.compile_zone(&name("example."), &main);
        assert_eq!(compiler.total_errors(), 0);
        let db = compiler.finish().unwrap();
        // The include's origin applied inside the included file...
        assert!(db.tree.find(&name("www.sub.example.")).is_some());
        // ... and was restored afterwards.
        assert!(db.tree.find(&name("top.example.")).is_some());
        let _ = zone;
    }

    #[test]
    fn zone_list_files_parse() {
        let dir = tempdir::TempDirLike::new();
        let list = dir.path().join("zones.list");
        fs::write(
            &list,
            "; zones\n\
             zone example. example.zone\n\
             zone second. second.zone masters 10.0.0.1 10.0.0.2 notify 10.0.0.3\n",
        )
        .unwrap();
        let entries = parse_zone_list(&list).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, name("example."));
        assert!(entries[0].masters.is_empty());
        assert_eq!(entries[1].masters.len(), 2);
        assert_eq!(entries[1].notify.len(), 1);
    }
}
