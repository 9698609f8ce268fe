// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the chassis manager.

use std::convert;

use aal::AsicError;

/// Identifies a node, and with it the unit that hosts it.
pub type NodeId = u64;

/// The externally visible id of a singleton port.
pub type PortId = u32;

/// The externally visible id of a trunk.  Trunk ids share a namespace with
/// port ids on the same node.
pub type TrunkId = u32;

/// Port id reserved for the CPU port.  It may never be used for a singleton
/// port or a trunk.
pub const CPU_PORT_ID: u32 = 0xFFFF_FFFD;

pub type ChassisResult<T> = Result<T, ChassisError>;

#[derive(Debug, thiserror::Error)]
pub enum ChassisError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("ASIC error: {0:?}")]
    Asic(AsicError),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid capability map: {0}")]
    InvalidCapabilityMap(String),
    #[error("Invalid chassis config: {0}")]
    InvalidConfig(String),
    #[error("Reboot required: {0}")]
    RebootRequired(String),
    #[error("Chassis manager is not initialized")]
    NotInitialized,
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Unwind: initial: {initial}, unwind: {unwind}")]
    Unwind {
        initial: Box<ChassisError>,
        unwind: Box<ChassisError>,
    },
}

impl ChassisError {
    /// Did a config push fail only because it can't be applied to a running
    /// chassis?
    pub fn is_reboot_required(&self) -> bool {
        matches!(self, ChassisError::RebootRequired(_))
    }
}

impl convert::From<std::io::Error> for ChassisError {
    fn from(err: std::io::Error) -> Self {
        ChassisError::Io(err)
    }
}

impl convert::From<AsicError> for ChassisError {
    fn from(err: AsicError) -> Self {
        ChassisError::Asic(err)
    }
}

impl convert::From<toml::de::Error> for ChassisError {
    fn from(err: toml::de::Error) -> Self {
        ChassisError::Parse(err.to_string())
    }
}

impl convert::From<serde_json::Error> for ChassisError {
    fn from(err: serde_json::Error) -> Self {
        ChassisError::Parse(err.to_string())
    }
}

impl convert::From<anyhow::Error> for ChassisError {
    fn from(err: anyhow::Error) -> Self {
        ChassisError::Internal(format!("{err:#}"))
    }
}

/// The outcome of comparing a freshly resolved configuration against the one
/// currently applied to the hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeClass {
    /// Nothing has been applied yet.
    Uninitialized,
    /// The new configuration is identical to the applied one.
    NoOp,
    /// The differences can be applied to the running hardware.
    HotApplicable,
    /// The differences can only take effect after a restart.
    RebootRequired { reason: String },
}

impl std::fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChangeClass::Uninitialized => write!(f, "uninitialized"),
            ChangeClass::NoOp => write!(f, "no-op"),
            ChangeClass::HotApplicable => write!(f, "hot-applicable"),
            ChangeClass::RebootRequired { reason } => {
                write!(f, "reboot required: {reason}")
            }
        }
    }
}
