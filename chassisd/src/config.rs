// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `chassisd`.

use asic::AsicConfig;
use chassis::ChassisError;
use chassis::ChassisResult;

/// The Config structure captures all of the run-time settings that can be
/// controlled by command-line options.
#[derive(Debug)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: common::logging::LogFormat,

    /// The file holding the capability maps for this platform.
    pub capability_map: String,

    /// The chassis configuration to apply.
    pub chassis_config: String,

    /// Depth of the channel carrying hardware events.
    pub event_queue_depth: usize,

    /// Asic/platform-specific config settings.
    pub asic_config: AsicConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: common::logging::LogFormat::Json,
            capability_map: String::new(),
            chassis_config: String::new(),
            event_queue_depth: common::DEFAULT_EVENT_QUEUE_DEPTH,
            asic_config: AsicConfig::default(),
        }
    }
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &crate::Opt, config: &mut Config) -> ChassisResult<()> {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(path) = &opts.capability_map {
        config.capability_map = path.to_string();
    }

    if let Some(path) = &opts.chassis_config {
        config.chassis_config = path.to_string();
    }

    if let Some(depth) = opts.event_queue_depth {
        config.event_queue_depth = depth;
    }

    #[cfg(feature = "chaos")]
    {
        if let Some(path) = &opts.chaos_config {
            let txt = std::fs::read_to_string(path)?;
            config.asic_config = toml::from_str(&txt)?;
        }
    }

    Ok(())
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior.
pub(crate) fn build_config(opts: &crate::Opt) -> ChassisResult<Config> {
    let mut config = Config::default();
    update_from_cli(opts, &mut config)?;

    if config.capability_map.is_empty() {
        return Err(ChassisError::Invalid(
            "no capability map file given".into(),
        ));
    }
    if config.chassis_config.is_empty() {
        return Err(ChassisError::Invalid(
            "no chassis config file given".into(),
        ));
    }
    if config.event_queue_depth == 0 {
        return Err(ChassisError::Invalid(
            "the event queue needs room for at least one event".into(),
        ));
    }

    Ok(config)
}
