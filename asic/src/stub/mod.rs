// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! An in-memory model of a switch ASIC.  It tracks which units and ports have
//! been brought up and what state they are in, and it emits the PortUpdate
//! events real hardware would send when a port is enabled or disabled.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o};
use tokio::sync::mpsc;

use aal::{
    AsicError, AsicOps, AsicResult, ChipSpec, ChipType, PortSpec, PortUpdate,
    SdkPort, SdkTrunk, TrunkPort, Unit,
};
use common::ports::{HealthState, LoopbackState, TrunkMemberBlockState};

pub mod ports;

pub use ports::StubPort;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsicConfig {
    /// When set, enabling a port brings its link up, and disabling it brings
    /// the link down, as though a peer were always attached.
    pub link_follows_enable: bool,
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig {
            link_follows_enable: true,
        }
    }
}

impl AsicOps for StubHandle {
    fn unit_init(&self, chip: &ChipSpec) -> AsicResult<()> {
        if chip.chip_type == ChipType::Unknown {
            return Err(AsicError::AsicUnsupported(format!(
                "unit {} has no chip type",
                chip.unit
            )));
        }
        let mut units = self.units.lock();
        if units.contains_key(&chip.unit) {
            return Err(AsicError::Exists);
        }
        info!(self.log, "initialized unit";
            "unit" => chip.unit,
            "chip_type" => %chip.chip_type,
            "module" => chip.module);
        units.insert(chip.unit, chip.clone());
        Ok(())
    }

    fn port_init(&self, port: &PortSpec) -> AsicResult<()> {
        ports::init_port(self, port)
    }

    fn port_speed_set(
        &self,
        port: SdkPort,
        speed_bps: u64,
        num_serdes_lanes: u32,
    ) -> AsicResult<()> {
        info!(self.log, "setting speed on port {} to {}", port, speed_bps);
        ports::set_speed(self, port, speed_bps, num_serdes_lanes)
    }

    fn port_enable_set(&self, port: SdkPort, enabled: bool) -> AsicResult<()> {
        ports::set_enable(self, port, enabled)
    }

    fn port_loopback_set(
        &self,
        port: SdkPort,
        mode: LoopbackState,
    ) -> AsicResult<()> {
        info!(self.log, "setting loopback on port {} to {}", port, mode);
        ports::set_loopback(self, port, mode)
    }

    fn port_health_set(
        &self,
        port: SdkPort,
        health: HealthState,
    ) -> AsicResult<()> {
        ports::set_health(self, port, health)
    }

    fn trunk_member_block_set(
        &self,
        trunk: SdkTrunk,
        member: SdkPort,
        state: TrunkMemberBlockState,
    ) -> AsicResult<()> {
        let Some(trunk_port) = trunk.trunk_port else {
            return Err(AsicError::InvalidArg(format!(
                "trunk {trunk} has no hardware binding"
            )));
        };
        if trunk.unit != member.unit {
            return Err(AsicError::InvalidArg(format!(
                "member {member} is not on the unit of trunk {trunk}"
            )));
        }
        ports::get_port(&self.ports.lock(), member)?;
        self.trunk_blocks
            .lock()
            .insert((trunk.unit, trunk_port, member), state);
        Ok(())
    }

    fn register_port_update_handler(
        &self,
        tx_channel: mpsc::Sender<PortUpdate>,
    ) -> AsicResult<()> {
        let mut tx = self.update_tx.lock();
        *tx = Some(tx_channel);
        Ok(())
    }

    fn unregister_port_update_handler(&self) -> AsicResult<()> {
        let _ = self.update_tx.lock().take();
        Ok(())
    }

    fn units_fini(&self) -> AsicResult<()> {
        let mut units = self.units.lock();
        if !units.is_empty() {
            info!(self.log, "shutting down {} units", units.len());
        }
        units.clear();
        self.ports.lock().clear();
        self.trunk_blocks.lock().clear();
        Ok(())
    }
}

pub struct StubHandle {
    log: slog::Logger,
    config: AsicConfig,
    units: Mutex<BTreeMap<Unit, ChipSpec>>,
    ports: Mutex<BTreeMap<SdkPort, StubPort>>,
    trunk_blocks:
        Mutex<BTreeMap<(Unit, TrunkPort, SdkPort), TrunkMemberBlockState>>,

    update_tx: Mutex<Option<mpsc::Sender<PortUpdate>>>,
}

impl StubHandle {
    pub fn new(log: &slog::Logger, config: &AsicConfig) -> AsicResult<Self> {
        let log = log.new(o!("unit" => "stub_asic"));
        debug!(log, "created stub asic"; "config" => ?config);

        Ok(StubHandle {
            log,
            config: config.clone(),
            units: Mutex::new(BTreeMap::new()),
            ports: Mutex::new(BTreeMap::new()),
            trunk_blocks: Mutex::new(BTreeMap::new()),
            update_tx: Mutex::new(None),
        })
    }

    /// Deliver an event to the registered handler, exactly as the hardware
    /// would.  This is how tests drive the event path.
    pub fn inject(&self, update: PortUpdate) -> AsicResult<()> {
        ports::send_update(self, update)
    }

    /// Units that are currently initialized.
    pub fn units(&self) -> Vec<Unit> {
        self.units.lock().keys().copied().collect()
    }

    /// A snapshot of a port's state, if it has been brought up.
    pub fn port(&self, port: SdkPort) -> Option<StubPort> {
        self.ports.lock().get(&port).cloned()
    }

    /// Number of ports that have been brought up.
    pub fn port_count(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn trunk_member_block(
        &self,
        trunk: SdkTrunk,
        member: SdkPort,
    ) -> Option<TrunkMemberBlockState> {
        let trunk_port = trunk.trunk_port?;
        self.trunk_blocks
            .lock()
            .get(&(trunk.unit, trunk_port, member))
            .copied()
    }

    pub fn has_update_handler(&self) -> bool {
        self.update_tx.lock().is_some()
    }
}
