// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;
use tokio::sync::mpsc;

use aal::{
    AsicError, AsicOps, AsicResult, ChipSpec, PortSpec, PortUpdate, SdkPort,
    SdkTrunk,
};
use common::ports::{HealthState, LoopbackState, TrunkMemberBlockState};

use crate::stub::{self, StubHandle};

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> Self {
        let mut c = Self::default();
        c.set(value);
        c
    }
    /// Set the chaos value. Panics if value is outside the range [0.0, 1.0].
    pub fn set(&mut self, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            panic!("probability out of range");
        }
        self.value = value;
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Return a chaos error according to the underlying probability value.
    pub fn unfurled(&self, log: &Logger, message: &str) -> AsicResult<()> {
        if self.value > 0.0 && self.value >= random() {
            slog::error!(log, "chaos error: {}", message);
            return Err(AsicError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// The chaos ASIC config contains chaos values for each ASIC operation, along
/// with the config of the stub ASIC it wraps.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AsicConfig {
    pub stub: stub::AsicConfig,
    pub unit_init: Chaos,
    pub port_init: Chaos,
    pub port_speed_set: Chaos,
    pub port_enable_set: Chaos,
    pub port_loopback_set: Chaos,
    pub port_health_set: Chaos,
    pub trunk_member_block_set: Chaos,
    pub register_port_update_handler: Chaos,
    pub unregister_port_update_handler: Chaos,
    pub units_fini: Chaos,
}

impl AsicConfig {
    /// The uniform chaos config applies a uniform underlying probability to
    /// each chaos value.
    pub fn uniform(v: f64) -> Self {
        Self {
            stub: stub::AsicConfig::default(),
            unit_init: Chaos::new(v),
            port_init: Chaos::new(v),
            port_speed_set: Chaos::new(v),
            port_enable_set: Chaos::new(v),
            port_loopback_set: Chaos::new(v),
            port_health_set: Chaos::new(v),
            trunk_member_block_set: Chaos::new(v),
            register_port_update_handler: Chaos::new(v),
            unregister_port_update_handler: Chaos::new(v),
            units_fini: Chaos::new(v),
        }
    }

    /// Applies a uniform probability to the operations that bring the chassis
    /// up.  Everything else is initialized with a default Chaos config that
    /// fails with probability zero.
    pub fn uniform_init(v: f64) -> Self {
        Self {
            unit_init: Chaos::new(v),
            port_init: Chaos::new(v),
            register_port_update_handler: Chaos::new(v),
            ..Default::default()
        }
    }

    /// Applies a uniform probability to the operations that change the state
    /// of a running chassis.  Bring-up and teardown are initialized with a
    /// default Chaos config that fails with probability zero.
    pub fn uniform_set(v: f64) -> Self {
        Self {
            port_speed_set: Chaos::new(v),
            port_enable_set: Chaos::new(v),
            port_loopback_set: Chaos::new(v),
            port_health_set: Chaos::new(v),
            trunk_member_block_set: Chaos::new(v),
            ..Default::default()
        }
    }
}

/// A handle for a chaos asic.  All state is kept by an embedded stub ASIC,
/// which is only consulted once the operation has survived its chaos roll.
pub struct Handle {
    inner: StubHandle,
    config: AsicConfig,
    log: Logger,
}

impl Handle {
    /// Create a new chaos ASIC with the provided logger and config.
    pub fn new(log: &Logger, config: &AsicConfig) -> AsicResult<Self> {
        Ok(Handle {
            inner: StubHandle::new(log, &config.stub)?,
            config: config.clone(),
            log: log.clone(),
        })
    }

    /// The stub ASIC underneath the chaos.
    pub fn stub(&self) -> &StubHandle {
        &self.inner
    }

    pub fn inject(&self, update: PortUpdate) -> AsicResult<()> {
        self.inner.inject(update)
    }
}

/// A convenience macro for unfurling chaos. The $name should be a regular
/// `Chaos` member of [`AsicConfig`]. The `handle` is a [`Handle`] object.
macro_rules! unfurl {
    ($handle:ident, $name:ident) => {
        $handle
            .config
            .$name
            .unfurled(&$handle.log, stringify!($name))?
    };
}

impl AsicOps for Handle {
    fn unit_init(&self, chip: &ChipSpec) -> AsicResult<()> {
        unfurl!(self, unit_init);
        self.inner.unit_init(chip)
    }

    fn port_init(&self, port: &PortSpec) -> AsicResult<()> {
        unfurl!(self, port_init);
        self.inner.port_init(port)
    }

    fn port_speed_set(
        &self,
        port: SdkPort,
        speed_bps: u64,
        num_serdes_lanes: u32,
    ) -> AsicResult<()> {
        unfurl!(self, port_speed_set);
        self.inner.port_speed_set(port, speed_bps, num_serdes_lanes)
    }

    fn port_enable_set(&self, port: SdkPort, enabled: bool) -> AsicResult<()> {
        unfurl!(self, port_enable_set);
        self.inner.port_enable_set(port, enabled)
    }

    fn port_loopback_set(
        &self,
        port: SdkPort,
        mode: LoopbackState,
    ) -> AsicResult<()> {
        unfurl!(self, port_loopback_set);
        self.inner.port_loopback_set(port, mode)
    }

    fn port_health_set(
        &self,
        port: SdkPort,
        health: HealthState,
    ) -> AsicResult<()> {
        unfurl!(self, port_health_set);
        self.inner.port_health_set(port, health)
    }

    fn trunk_member_block_set(
        &self,
        trunk: SdkTrunk,
        member: SdkPort,
        state: TrunkMemberBlockState,
    ) -> AsicResult<()> {
        unfurl!(self, trunk_member_block_set);
        self.inner.trunk_member_block_set(trunk, member, state)
    }

    fn register_port_update_handler(
        &self,
        tx_channel: mpsc::Sender<PortUpdate>,
    ) -> AsicResult<()> {
        unfurl!(self, register_port_update_handler);
        self.inner.register_port_update_handler(tx_channel)
    }

    fn unregister_port_update_handler(&self) -> AsicResult<()> {
        unfurl!(self, unregister_port_update_handler);
        self.inner.unregister_port_update_handler()
    }

    fn units_fini(&self) -> AsicResult<()> {
        unfurl!(self, units_fini);
        self.inner.units_fini()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::{ChipType, PortType};
    use slog::Drain;

    fn logger() -> Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, slog::o!())
    }

    fn chip() -> ChipSpec {
        ChipSpec {
            chip_type: ChipType::Trident2,
            unit: 0,
            ..Default::default()
        }
    }

    #[test]
    #[should_panic]
    fn test_chaos_range() {
        let _ = Chaos::new(1.5);
    }

    #[test]
    fn test_certain_chaos() {
        let hdl = Handle::new(&logger(), &AsicConfig::uniform(1.0)).unwrap();
        assert!(matches!(
            hdl.unit_init(&chip()),
            Err(AsicError::Synthetic(_))
        ));
        assert!(hdl.stub().units().is_empty());
    }

    #[test]
    fn test_no_chaos_passes_through() {
        let hdl = Handle::new(&logger(), &AsicConfig::default()).unwrap();
        hdl.unit_init(&chip()).unwrap();
        let port = PortSpec {
            port_type: PortType::Xe,
            unit: 0,
            logical_port: 5,
            speed_bps: 10_000_000_000,
            num_serdes_lanes: 1,
            ..Default::default()
        };
        hdl.port_init(&port).unwrap();
        assert!(hdl.stub().port(SdkPort::new(0, 5)).is_some());
    }

    #[test]
    fn test_set_chaos_spares_init() {
        let hdl = Handle::new(&logger(), &AsicConfig::uniform_set(1.0)).unwrap();
        hdl.unit_init(&chip()).unwrap();
        assert!(hdl.port_enable_set(SdkPort::new(0, 1), true).is_err());
        hdl.units_fini().unwrap();
    }
}
