// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `chassisd`, which brings up the switch
//! hardware described by a chassis configuration and keeps it in sync with
//! that configuration.

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::error;
use slog::info;
use slog::warn;
use structopt::StructOpt;
use tokio::sync::mpsc;

use aal::CapabilityMap;
use chassis::CapabilityMapList;
use chassis::ChangeClass;
use chassis::ChangeEvent;
use chassis::ChassisConfig;
use chassis::ChassisManager;

mod config;

#[derive(Debug, StructOpt)]
#[structopt(name = "chassisd", about = "chassis manager for a switch")]
pub(crate) enum Args {
    /// Bring up the chassis and keep it configured.
    Run(Opt),
    /// Report how a chassis config would be applied, without touching any
    /// hardware.
    Verify {
        #[structopt(flatten)]
        opt: Opt,

        #[structopt(
            long,
            help = "chassis config assumed to be applied already"
        )]
        applied_config: Option<String>,
    },
}

#[derive(Debug, Default, StructOpt)]
pub(crate) struct Opt {
    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(long, help = "file holding the platform's capability maps")]
    capability_map: Option<String>,

    #[structopt(long, help = "chassis config to apply")]
    chassis_config: Option<String>,

    #[structopt(long, help = "depth of the hardware event queue")]
    event_queue_depth: Option<usize>,

    #[cfg(feature = "chaos")]
    #[structopt(long, about = "path to the the chaos testing configuration")]
    chaos_config: Option<String>,
}

/// Load the chassis config at `config_path`, and the capability map it asks
/// for out of the file at `map_path`.
fn load_inputs(
    map_path: &str,
    config_path: &str,
) -> anyhow::Result<(CapabilityMap, ChassisConfig)> {
    let chassis_config = ChassisConfig::from_file(config_path)
        .with_context(|| format!("loading chassis config {config_path}"))?;
    let map = CapabilityMapList::from_file(map_path)
        .with_context(|| format!("loading capability maps {map_path}"))?
        .select(&chassis_config.capability_map_id)
        .context("selecting capability map")?;
    Ok((map, chassis_config))
}

/// Log every port and trunk state change reported by the chassis manager.
async fn log_change_events(
    log: slog::Logger,
    mut events: mpsc::Receiver<ChangeEvent>,
) {
    while let Some(event) = events.recv().await {
        info!(log, "state change";
            "node" => event.node_id,
            "subject" => ?event.subject,
            "state" => %event.state,
            "timestamp" => %event.timestamp);
    }
}

/// Re-read the chassis config and push it.  A config that can only be
/// applied by a restart is not an error for the running daemon.
fn handle_reload<H: aal::AsicOps + 'static>(
    manager: &ChassisManager<H>,
    log: &slog::Logger,
    path: &str,
) {
    let chassis_config = match ChassisConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!(log, "failed to load chassis config: {e}"; "path" => path);
            return;
        }
    };
    match manager.push(&chassis_config) {
        Ok(class) => {
            info!(log, "reloaded chassis config"; "class" => %class)
        }
        Err(e) if e.is_reboot_required() => {
            warn!(log, "new chassis config needs a restart; keeping the old one";
                "error" => %e)
        }
        Err(e) => error!(log, "failed to apply chassis config: {e}"),
    }
}

async fn handle_signals<H: aal::AsicOps + 'static>(
    manager: &ChassisManager<H>,
    log: &slog::Logger,
    chassis_config: &str,
    mut signals: Signals,
) {
    let log = log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();

    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            SIGHUP => {
                info!(log, "reloading chassis config");
                handle_reload(manager, &log, chassis_config)
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    match args {
        Args::Run(opt) => run_chassisd(opt).await,
        Args::Verify {
            opt,
            applied_config,
        } => verify_chassis(opt, applied_config).await,
    }
}

async fn run_chassisd(opt: Opt) -> anyhow::Result<()> {
    let config = config::build_config(&opt)?;

    let log = common::logging::init(
        "chassisd",
        &config.log_file,
        config.log_format,
    )?;
    info!(log, "chassisd config: {config:#?}");

    let (map, chassis_config) =
        load_inputs(&config.capability_map, &config.chassis_config)?;
    let asic = asic::Handle::new(&log, &config.asic_config)
        .context("creating asic handle")?;
    let manager =
        ChassisManager::new(&log, asic, map, config.event_queue_depth)?;

    let (tx, rx) = mpsc::channel(config.event_queue_depth);
    manager.register_event_writer(Box::new(tx));
    tokio::spawn(log_change_events(
        log.new(slog::o!("unit" => "change_events")),
        rx,
    ));

    // Install the handlers before touching the hardware, so a signal that
    // arrives during bring-up is queued rather than fatal.
    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals =
        Signals::new(SIGNALS).context("installing signal handlers")?;

    let class = manager
        .push(&chassis_config)
        .context("applying chassis config")?;
    info!(log, "chassis config applied"; "class" => %class);

    handle_signals(&manager, &log, &config.chassis_config, signals).await;

    info!(log, "shutting down chassis");
    manager.shutdown().context("shutting down chassis")?;
    info!(log, "done");

    Ok(())
}

/// Classify the chassis config named in `config` against the one at
/// `applied`, if any, using a model of the hardware.
fn classify_config(
    log: &slog::Logger,
    config: &config::Config,
    applied: Option<&str>,
) -> anyhow::Result<ChangeClass> {
    let (map, next) =
        load_inputs(&config.capability_map, &config.chassis_config)?;
    let model = asic::stub::StubHandle::new(
        log,
        &asic::stub::AsicConfig::default(),
    )?;
    let manager =
        ChassisManager::new(log, model, map, config.event_queue_depth)?;
    if let Some(path) = applied {
        let prior = ChassisConfig::from_file(path)
            .with_context(|| format!("loading chassis config {path}"))?;
        manager.push(&prior).context("applying the current config")?;
    }
    let class = manager.verify(&next)?;
    manager.shutdown()?;
    Ok(class)
}

async fn verify_chassis(
    opt: Opt,
    applied: Option<String>,
) -> anyhow::Result<()> {
    let config = config::build_config(&opt)?;
    let log = common::logging::init(
        "chassisd",
        &config.log_file,
        config.log_format,
    )?;
    let class = classify_config(&log, &config, applied.as_deref())?;
    println!("{class}");
    Ok(())
}
