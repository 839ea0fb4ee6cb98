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

//! The zone compiler: reads a zone list file, compiles every zone,
//! and writes the database image the server starts from. Exits 0 on
//! success and 1 if any zone had errors (in which case no image is
//! written).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use belfry::db::image;
use belfry::zonec::{parse_zone_list, Compiler};

#[derive(Parser)]
#[command(name = "zonec", about = "compile zone files into a database image")]
struct Args {
    /// Be more verbose.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// The database file to write.
    #[arg(short = 'f', default_value = "belfry.db")]
    db_file: PathBuf,

    /// Change to this directory before compiling.
    #[arg(short = 'd')]
    directory: Option<PathBuf>,

    /// The zone list file.
    zone_list: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::init_from_env(Env::new().default_filter_or(default_level));

    if let Some(ref directory) = args.directory {
        if let Err(e) = std::env::set_current_dir(directory) {
            error!("cannot chdir to {}: {}", directory.display(), e);
            return ExitCode::FAILURE;
        }
    }

    let entries = match parse_zone_list(&args.zone_list) {
        Ok(entries) => entries,
        Err(e) => {
            error!("{}: {}", args.zone_list.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let mut compiler = Compiler::new();
    for entry in &entries {
        info!("compiling zone {} from {}", entry.name, entry.path.display());
        compiler.compile_zone(&entry.name, &entry.path);
    }

    let total_errors = compiler.total_errors();
    match compiler.finish() {
        Ok(db) => {
            if let Err(e) = image::dump(&db, &args.db_file) {
                error!("error writing {}: {}", args.db_file.display(), e);
                return ExitCode::FAILURE;
            }
            info!("zonec: done with total 0 errors");
            ExitCode::SUCCESS
        }
        Err(_) => {
            error!("zonec: done with total {} errors", total_errors);
            ExitCode::FAILURE
        }
    }
}
