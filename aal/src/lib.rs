// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use thiserror::Error;
use tokio::sync::mpsc;

use common::ports::{
    HealthState, HwState, LoopbackState, PortState, TrunkMemberBlockState,
};

mod chassis_map;
pub use chassis_map::*;

mod ports;
pub use ports::*;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug)]
pub enum AsicError {
    /// Error reported by the vendor SDK.  This will report both the location
    /// in the ASIC layer that detected the error, as well as the detailed
    /// error message from the SDK.
    #[error("SDK error at {ctx}: {err}")]
    SdkError { ctx: String, err: String },
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An Asic function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// An unsupported ASIC was discovered
    #[error("Unsupported ASIC found: {}", .0)]
    AsicUnsupported(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}",.0)]
    Internal(String),
    /// The driver or asic wasn't found
    #[error("ASIC not found")]
    AsicMissing,
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic ASIC error: {}", .0)]
    Synthetic(String),
    /// A general indication that a caller is trying to create something that
    /// already exists.
    #[error("Already exists")]
    Exists,
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// The `AsicOps` trait contains the hardware operations the chassis manager
/// needs to bring up units and ports, and to drive per-port state afterwards.
///
/// Every hardware family implements this trait.  The chassis manager never
/// asks which family it is talking to.
pub trait AsicOps: Send + Sync {
    /// Find the unit described by `chip` on the PCI bus, initialize it, and
    /// program its module id.  Called once per unit on the first
    /// configuration push.
    fn unit_init(&self, chip: &ChipSpec) -> AsicResult<()>;

    /// Bring up a single physical port.  Called exactly once for each row of
    /// the applied capability map, after its unit has been initialized.
    fn port_init(&self, port: &PortSpec) -> AsicResult<()>;

    /// Reprogram the speed and lane count of a port.  Used when a flex group
    /// is re-channelized.
    fn port_speed_set(
        &self,
        port: SdkPort,
        speed_bps: u64,
        num_serdes_lanes: u32,
    ) -> AsicResult<()>;

    /// Update a port's enabled/disabled state
    fn port_enable_set(&self, port: SdkPort, enabled: bool) -> AsicResult<()>;

    /// Update a port's loopback mode
    fn port_loopback_set(
        &self,
        port: SdkPort,
        mode: LoopbackState,
    ) -> AsicResult<()>;

    /// Reflect a port's health, typically on its front-panel LEDs
    fn port_health_set(
        &self,
        port: SdkPort,
        health: HealthState,
    ) -> AsicResult<()>;

    /// Allow or prevent a trunk member from carrying traffic
    fn trunk_member_block_set(
        &self,
        trunk: SdkTrunk,
        member: SdkPort,
        state: TrunkMemberBlockState,
    ) -> AsicResult<()>;

    /// Register with the ASIC layer to receive PortUpdate events.  Any
    /// previously registered channel is replaced.  Implementations must not
    /// block when the channel is full.
    fn register_port_update_handler(
        &self,
        updates: mpsc::Sender<PortUpdate>,
    ) -> AsicResult<()>;

    /// Stop delivering PortUpdate events.  Unregistering when nothing is
    /// registered is not an error.
    fn unregister_port_update_handler(&self) -> AsicResult<()>;

    /// Tear down every unit brought up by `unit_init`.  Safe to call when
    /// nothing has been initialized.
    fn units_fini(&self) -> AsicResult<()>;
}

/// When the ASIC layer detects a state change for a port, it can send a
/// PortUpdate event to the chassis manager informing it of the change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortUpdate {
    /// Signal that the link state of a logical port has changed
    LinkState {
        unit: Unit,
        logical_port: LogicalPort,
        state: PortState,
    },
    /// Signal that a transceiver was inserted in or removed from a physical
    /// port.
    Presence { slot: i32, port: i32, state: HwState },
}
