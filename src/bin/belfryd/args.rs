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

//! Command-line argument handling.

use std::path::PathBuf;

use clap::Parser;

pub fn parse() -> Args {
    Args::parse()
}

#[derive(Debug, Parser)]
#[command(name = "belfryd", about = "the Belfry authoritative DNS server")]
pub struct Args {
    /// The port to listen on.
    #[arg(short = 'p')]
    pub port: Option<u16>,

    /// Listen on this address (may be given as ip or ip@port;
    /// repeatable).
    #[arg(short = 'a')]
    pub addresses: Vec<String>,

    /// Restrict to IPv4.
    #[arg(short = '4', conflicts_with = "ipv6_only")]
    pub ipv4_only: bool,

    /// Restrict to IPv6.
    #[arg(short = '6')]
    pub ipv6_only: bool,

    /// The number of query worker threads.
    #[arg(short = 'n')]
    pub workers: Option<usize>,

    /// The compiled database file.
    #[arg(short = 'f')]
    pub db_file: Option<PathBuf>,

    /// The configuration file.
    #[arg(short = 'c')]
    pub config: Option<PathBuf>,

    /// The pid file to write.
    #[arg(short = 'P')]
    pub pid_file: Option<PathBuf>,

    /// Do not daemonize.
    #[arg(short = 'd')]
    pub foreground: bool,

    /// Verbosity level (0 = warnings, 1 = info, 2 = debug).
    #[arg(short = 'V', default_value_t = 0)]
    pub verbosity: u8,
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_documented_surface_parses() {
        let args = Args::parse_from([
            "belfryd", "-p", "10053", "-a", "127.0.0.1", "-a", "::1@10054", "-4", "-n", "2",
            "-f", "zones.db", "-P", "belfryd.pid", "-d", "-V", "2",
        ]);
        assert_eq!(args.port, Some(10053));
        assert_eq!(args.addresses.len(), 2);
        assert!(args.ipv4_only);
        assert_eq!(args.workers, Some(2));
        assert!(args.foreground);
        assert_eq!(args.verbosity, 2);
    }
}
