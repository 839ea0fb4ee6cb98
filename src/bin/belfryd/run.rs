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

//! Running the server: loading the database, starting the query
//! workers and the transfer coordinator, and supervising reloads and
//! shutdown.

use std::fmt::Write as _;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info, warn};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use belfry::db::{image, Namedb};
use belfry::message::tsig;
use belfry::nsec3;
use belfry::serve::{spawn_workers, Server};
use belfry::xfrd::{packet, Xfrd, XfrdConfig, XfrdHandle, XfrdMsg};

use crate::args::Args;
use crate::config::{self, Config};

pub fn run(args: Args) {
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::init_from_env(Env::new().default_filter_or(default_level));

    // An invariant violation anywhere (a poisoned lock, an impossible
    // state) must not leave a half-working server behind.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        error!("fatal internal error; exiting");
        process::exit(2);
    }));

    match try_running(args) {
        Ok(()) => {
            info!("exiting with success");
        }
        Err(e) => {
            let mut message = String::from("failed to run:");
            for (i, cause) in e.chain().enumerate() {
                write!(message, "\n[{}] {}", i + 1, cause).unwrap();
            }
            error!("{}", message);
            process::exit(1);
        }
    }
}

fn try_running(args: Args) -> Result<()> {
    info!(
        "belfryd v{}.{}.{} starting",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    let config = config::load(&args).context("failed to load the configuration")?;

    if !args.foreground {
        nix::unistd::daemon(true, false).context("failed to daemonize")?;
    }
    if let Some(ref pid_file) = config.pid_file {
        std::fs::write(pid_file, format!("{}\n", process::id()))
            .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("failed to set up signal handling")?;

    // Load the compiled database and bring it up to date from the
    // journal.
    let db = load_database(&config).context("failed to load the database")?;
    info!(
        "serving {} zones from {}",
        db.zone_count(),
        config.database.display(),
    );
    let mut keyring = tsig::Keyring::new();
    for key in config.keys.values() {
        keyring.insert(key.clone());
    }
    let server = Arc::new(Server::new(Arc::new(db), keyring));

    // The transfer coordinator, if any zone wants transfers or
    // notifies.
    let (reload_tx, reload_rx) = std::sync::mpsc::channel();
    let mut xfrd_handle: Option<XfrdHandle> = None;
    let mut xfrd_thread = None;
    if !config.xfr_zones.is_empty() {
        let xfrd_config = XfrdConfig {
            zones: config.xfr_zones.clone(),
            journal_path: config.journal.clone(),
            keys: config.keys.clone(),
        };
        let (mut xfrd, handle) = Xfrd::new(xfrd_config, reload_tx, shutdown.clone())
            .context("failed to start the transfer coordinator")?;
        xfrd_thread = Some(
            std::thread::Builder::new()
                .name("xfrd".into())
                .spawn(move || xfrd.run())
                .context("failed to spawn xfrd")?,
        );
        xfrd_handle = Some(handle);
    }

    // Query workers, one set per listen address.
    let mut workers = Vec::new();
    for &bind in &config.bind {
        workers.extend(
            spawn_workers(
                server.clone(),
                xfrd_handle.clone(),
                bind,
                config.workers,
                shutdown.clone(),
            )
            .with_context(|| format!("failed to bind {}", bind))?,
        );
    }

    // Tell the coordinator what the database serves.
    if let Some(ref handle) = xfrd_handle {
        report_loaded_soas(&server, &config, handle);
    }

    // Supervise: answer reload requests and wait for signals.
    info!("set-up is complete");
    'supervise: loop {
        for signal in signals.pending() {
            match signal {
                SIGINT | SIGTERM => {
                    info!("received termination signal; shutting down");
                    break 'supervise;
                }
                SIGHUP => {
                    info!("received SIGHUP; reloading");
                    reload(&server, &config, &xfrd_handle);
                }
                _ => unreachable!(),
            }
        }

        match reload_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) => reload(&server, &config, &xfrd_handle),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                // The coordinator is gone; keep serving.
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }

    // Orderly shutdown: stop the loops, drain the threads, clean up.
    shutdown.store(true, Ordering::SeqCst);
    if let Some(ref handle) = xfrd_handle {
        handle.send(XfrdMsg::Shutdown);
    }
    for worker in workers {
        let _ = worker.join();
    }
    if let Some(thread) = xfrd_thread {
        let _ = thread.join();
    }
    if let Some(ref pid_file) = config.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    Ok(())
}

/// Loads the database image and applies the committed transfers from
/// the journal, then runs denial precomputation.
fn load_database(config: &Config) -> Result<Namedb> {
    let mut db = match image::load(&config.database) {
        Ok(db) => db,
        Err(image::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "database {} does not exist; starting empty",
                config.database.display(),
            );
            Namedb::new()
        }
        Err(e) => return Err(e).context("cannot read the database image"),
    };

    // Secondary zones live in the database even before their first
    // transfer arrives.
    for zone_config in &config.xfr_zones {
        if db.find_zone_of(&zone_config.apex).map(|z| db.apex_name(z))
            != Some(&zone_config.apex)
        {
            db.add_zone(&zone_config.apex);
        }
    }

    belfry::xfrd::journal::replay(&config.journal, &mut |transfer| {
        let zone = match db.find_zone_of(&transfer.zone) {
            Some(zone) if db.apex_name(zone) == &transfer.zone => zone,
            _ => {
                warn!("journal names unknown zone {}; skipping", transfer.zone);
                return;
            }
        };
        match belfry::xfrd::apply::apply_transfer(&mut db, zone, &transfer.parts) {
            Ok(serial) => info!("zone {} updated to serial {}", transfer.zone, serial),
            Err(e) => warn!("zone {}: journal transfer rejected: {}", transfer.zone, e),
        }
    })
    .context("cannot replay the journal")?;

    nsec3::prehash(&mut db);
    Ok(db)
}

/// Rebuilds the snapshot from disk and installs it, then reports the
/// served SOAs back to the coordinator.
fn reload(server: &Arc<Server>, config: &Config, xfrd: &Option<XfrdHandle>) {
    match load_database(config) {
        Ok(db) => {
            server.swap(Arc::new(db));
            info!("reload complete");
            if let Some(handle) = xfrd {
                report_loaded_soas(server, config, handle);
            }
        }
        Err(e) => {
            // The live snapshot stays untouched.
            error!("reload failed: {:#}", e);
        }
    }
}

fn report_loaded_soas(server: &Arc<Server>, config: &Config, handle: &XfrdHandle) {
    let db = server.snapshot();
    for zone_config in &config.xfr_zones {
        let soa = db
            .find_zone_of(&zone_config.apex)
            .filter(|&z| db.apex_name(z) == &zone_config.apex)
            .and_then(|z| packet::soa_from_db(&db, z));
        handle.send(XfrdMsg::ZoneLoaded {
            apex: zone_config.apex.clone(),
            soa,
        });
    }
}
