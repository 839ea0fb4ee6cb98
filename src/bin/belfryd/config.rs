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

//! Loading the TOML configuration file and folding in the command
//! line.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use belfry::message::tsig;
use belfry::name::Dname;
use belfry::util::base64_decode;
use belfry::xfrd::zone::Master;
use belfry::xfrd::XfrdZoneConfig;

use crate::args::Args;

/// The default DNS port.
const DEFAULT_PORT: u16 = 53;

/// The resolved configuration the daemon runs with.
pub struct Config {
    pub bind: Vec<SocketAddr>,
    pub workers: usize,
    pub database: PathBuf,
    pub journal: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub keys: HashMap<String, tsig::Key>,
    pub xfr_zones: Vec<XfrdZoneConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(default)]
    server: TomlServer,
    #[serde(default, rename = "key")]
    keys: Vec<TomlKey>,
    #[serde(default, rename = "zone")]
    zones: Vec<TomlZone>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlServer {
    #[serde(default)]
    bind: Vec<String>,
    workers: Option<usize>,
    database: Option<PathBuf>,
    journal: Option<PathBuf>,
    pid_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlKey {
    name: String,
    algorithm: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlZone {
    name: String,
    #[serde(default)]
    masters: Vec<TomlMaster>,
    #[serde(default)]
    notify: Vec<String>,
    notify_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlMaster {
    address: String,
    key: Option<String>,
    #[serde(default)]
    axfr_only: bool,
}

/// Loads the configuration, with command-line arguments taking
/// precedence over the file.
pub fn load(args: &Args) -> Result<Config> {
    let toml_config = match args.config.as_deref() {
        Some(path) => read_file(path)?,
        None => TomlConfig::default(),
    };

    let port = args.port.unwrap_or(DEFAULT_PORT);
    let mut bind = Vec::new();
    for address in &args.addresses {
        bind.push(parse_listen_address(address, port)?);
    }
    if bind.is_empty() {
        for address in &toml_config.server.bind {
            bind.push(parse_listen_address(address, port)?);
        }
    }
    if bind.is_empty() {
        bind.push(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port));
    }
    if args.ipv4_only {
        bind.retain(|addr| addr.is_ipv4());
    } else if args.ipv6_only {
        bind.retain(|addr| addr.is_ipv6());
    }
    if bind.is_empty() {
        return Err(anyhow!("no listen addresses remain after -4/-6 filtering"));
    }

    let mut keys = HashMap::new();
    for key in &toml_config.keys {
        let name: Dname = key
            .name
            .parse()
            .map_err(|e| anyhow!("bad key name {}: {}", key.name, e))?;
        let algorithm: tsig::Algorithm = key
            .algorithm
            .parse()
            .map_err(|e| anyhow!("key {}: {}", key.name, e))?;
        let secret = base64_decode(key.secret.as_bytes())
            .ok_or_else(|| anyhow!("key {}: secret is not valid base64", key.name))?;
        keys.insert(
            key.name.clone(),
            tsig::Key {
                name,
                algorithm,
                secret,
            },
        );
    }

    let mut xfr_zones = Vec::new();
    for zone in &toml_config.zones {
        let apex: Dname = zone
            .name
            .parse()
            .map_err(|e| anyhow!("bad zone name {}: {}", zone.name, e))?;
        let mut masters = Vec::new();
        for master in &zone.masters {
            if let Some(key) = &master.key {
                if !keys.contains_key(key) {
                    return Err(anyhow!(
                        "zone {}: master references unknown key {}",
                        zone.name,
                        key
                    ));
                }
            }
            masters.push(Master {
                addr: parse_host_address(&master.address)?,
                key: master.key.clone(),
                use_axfr_only: master.axfr_only,
            });
        }
        let mut notify = Vec::new();
        for target in &zone.notify {
            notify.push(parse_host_address(target)?);
        }
        if let Some(key) = &zone.notify_key {
            if !keys.contains_key(key) {
                return Err(anyhow!(
                    "zone {}: notify_key references unknown key {}",
                    zone.name,
                    key
                ));
            }
        }
        xfr_zones.push(XfrdZoneConfig {
            apex,
            masters,
            notify,
            notify_key: zone.notify_key.clone(),
        });
    }

    let database = args
        .db_file
        .clone()
        .or(toml_config.server.database)
        .unwrap_or_else(|| PathBuf::from("belfry.db"));
    let journal = toml_config
        .server
        .journal
        .unwrap_or_else(|| database.with_extension("journal"));

    Ok(Config {
        bind,
        workers: args.workers.or(toml_config.server.workers).unwrap_or(1),
        database,
        journal,
        pid_file: args.pid_file.clone().or(toml_config.server.pid_file),
        keys,
        xfr_zones,
    })
}

fn read_file(path: &Path) -> Result<TomlConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
}

/// Parses the `ip[@port]` form used for listen addresses.
fn parse_listen_address(text: &str, default_port: u16) -> Result<SocketAddr> {
    let (host, port) = match text.split_once('@') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .map_err(|_| anyhow!("bad port in {}", text))?,
        ),
        None => (text, default_port),
    };
    let ip: IpAddr = host
        .parse()
        .map_err(|_| anyhow!("bad listen address {}", text))?;
    Ok(SocketAddr::new(ip, port))
}

/// Parses a master or notify address: `ip[:port]` with port 53 by
/// default (IPv6 addresses with an explicit port need brackets).
fn parse_host_address(text: &str) -> Result<SocketAddr> {
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = text
        .parse()
        .map_err(|_| anyhow!("bad address {}", text))?;
    Ok(SocketAddr::new(ip, DEFAULT_PORT))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["belfryd"];
        full.extend_from_slice(argv);
        Args::parse_from(full)
    }

    #[test]
    fn listen_addresses_support_the_at_port_form() {
        assert_eq!(
            parse_listen_address("127.0.0.1", 53).unwrap(),
            "127.0.0.1:53".parse().unwrap()
        );
        assert_eq!(
            parse_listen_address("::1@10053", 53).unwrap(),
            "[::1]:10053".parse().unwrap()
        );
        assert!(parse_listen_address("nonsense", 53).is_err());
    }

    #[test]
    fn the_command_line_overrides_defaults() {
        let config = load(&args(&["-a", "127.0.0.1", "-p", "10053", "-n", "4"])).unwrap();
        assert_eq!(config.bind, vec!["127.0.0.1:10053".parse().unwrap()]);
        assert_eq!(config.workers, 4);
        assert_eq!(config.database, PathBuf::from("belfry.db"));
        assert_eq!(config.journal, PathBuf::from("belfry.journal"));
    }

    #[test]
    fn family_filters_apply() {
        let config = load(&args(&["-a", "127.0.0.1", "-a", "::1", "-6"])).unwrap();
        assert_eq!(config.bind.len(), 1);
        assert!(config.bind[0].is_ipv6());
        assert!(load(&args(&["-a", "127.0.0.1", "-6"])).is_err());
    }
}
