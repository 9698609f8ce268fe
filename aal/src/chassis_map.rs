// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The capability map: a static description of the chips in a chassis and of
//! every way their physical ports may be carved into logical ports.
//!
//! A map usually lists several rows for the same front-panel cage, one per
//! supported channelization.  For example, a QSFP28 cage may appear as one
//! 100G row on channel 0, two 50G rows on channels 1 and 2, and four 25G rows
//! on channels 1 through 4.  Rows sharing a `(slot, port)` pair form a flex
//! group when they are marked `flex_port`.

use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::LogicalPort;
use crate::SdkPort;
use crate::Unit;
use common::ports::ONE_GIG_BPS;

/// The silicon family of a chip.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChipType {
    #[default]
    Unknown,
    TridentPlus,
    Trident2,
    Tomahawk,
    Tofino,
}

impl ChipType {
    /// Speed at which every channel of an active flex group is first brought
    /// up on this family.
    pub fn min_flex_speed_bps(&self) -> Option<u64> {
        match self {
            ChipType::Tomahawk | ChipType::Tofino => Some(25 * ONE_GIG_BPS),
            ChipType::TridentPlus | ChipType::Trident2 => {
                Some(10 * ONE_GIG_BPS)
            }
            ChipType::Unknown => None,
        }
    }

    /// Maximum number of data-plane ports a single chip can carry.  GE and
    /// MGMT ports don't count against this limit.
    pub fn max_ports(&self) -> Option<usize> {
        match self {
            ChipType::TridentPlus => Some(64),
            ChipType::Trident2 => Some(104),
            ChipType::Tomahawk => Some(128),
            ChipType::Tofino => Some(64),
            ChipType::Unknown => None,
        }
    }
}

/// The role of a physical port.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortType {
    #[default]
    Unknown,
    /// 10G/25G/40G/50G front-panel port
    Xe,
    /// 100G and faster front-panel port
    Ce,
    /// 1G port
    Ge,
    /// Management port
    Mgmt,
}

impl PortType {
    /// GE and MGMT ports sit outside the regular data-plane port space.
    pub fn is_data_plane(&self) -> bool {
        !matches!(self, PortType::Ge | PortType::Mgmt)
    }
}

/// A single ASIC in the chassis.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct ChipSpec {
    pub chip_type: ChipType,
    pub unit: Unit,
    /// Chassis slot, or 0 when slots are assigned automatically.
    pub slot: i32,
    pub module: i32,
    pub pci_bus: i32,
    pub pci_slot: i32,
    pub is_oversubscribed: bool,
}

/// One row of the capability map: a physical port in one particular
/// channelization.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct PortSpec {
    pub port_type: PortType,
    pub slot: i32,
    pub port: i32,
    /// 0 for an unchannelized port, 1-4 otherwise.
    pub channel: i32,
    pub unit: Unit,
    pub speed_bps: u64,
    /// 0 when logical ports are assigned automatically.
    pub logical_port: LogicalPort,
    pub physical_port: u32,
    pub diag_port: u32,
    pub serdes_core: u32,
    pub serdes_lane: u32,
    pub num_serdes_lanes: u32,
    pub flex_port: bool,
    pub internal: bool,
}

impl PortSpec {
    pub fn key(&self) -> PortKey {
        PortKey::new(self.slot, self.port, self.channel)
    }

    pub fn group_key(&self) -> PortGroupKey {
        PortGroupKey::new(self.slot, self.port)
    }

    pub fn sdk_port(&self) -> SdkPort {
        SdkPort::new(self.unit, self.logical_port)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} at {} {}Gbps (unit {}, logical_port {}, physical_port {})",
            self.port_type,
            if self.flex_port { "flex" } else { "fixed" },
            self.key(),
            self.speed_bps / ONE_GIG_BPS,
            self.unit,
            self.logical_port,
            self.physical_port,
        )
    }
}

/// The full capability description of a chassis.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct CapabilityMap {
    pub id: String,
    /// Logical port numbers are assigned by software rather than listed.
    pub auto_add_logical_ports: bool,
    /// Slot numbers are taken from the chassis configuration rather than
    /// listed.
    pub auto_add_slot: bool,
    pub chips: Vec<ChipSpec>,
    pub ports: Vec<PortSpec>,
}

impl CapabilityMap {
    pub fn chip(&self, unit: Unit) -> Option<&ChipSpec> {
        self.chips.iter().find(|chip| chip.unit == unit)
    }

    pub fn chip_type(&self, unit: Unit) -> ChipType {
        self.chip(unit).map(|c| c.chip_type).unwrap_or_default()
    }

    /// GE ports on a Trident+ get their logical port from the unused numbers
    /// of the chip's X pipeline.
    pub fn is_ge_on_trident_plus(&self, port: &PortSpec) -> bool {
        port.port_type == PortType::Ge
            && self.chip_type(port.unit) == ChipType::TridentPlus
    }
}

/// Identifies a row of the capability map, and a singleton port in the
/// chassis configuration.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PortKey {
    pub slot: i32,
    pub port: i32,
    pub channel: i32,
}

impl PortKey {
    pub fn new(slot: i32, port: i32, channel: i32) -> Self {
        PortKey {
            slot,
            port,
            channel,
        }
    }

    pub fn group(&self) -> PortGroupKey {
        PortGroupKey::new(self.slot, self.port)
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.slot, self.port, self.channel)
    }
}

/// Identifies a physical cage, and with it every channelization of it.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PortGroupKey {
    pub slot: i32,
    pub port: i32,
}

impl PortGroupKey {
    pub fn new(slot: i32, port: i32) -> Self {
        PortGroupKey { slot, port }
    }
}

impl fmt::Display for PortGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.slot, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_limits() {
        assert_eq!(
            ChipType::Tomahawk.min_flex_speed_bps(),
            Some(25 * ONE_GIG_BPS)
        );
        assert_eq!(
            ChipType::Trident2.min_flex_speed_bps(),
            Some(10 * ONE_GIG_BPS)
        );
        assert_eq!(ChipType::Unknown.min_flex_speed_bps(), None);
        assert_eq!(ChipType::Trident2.max_ports(), Some(104));
    }

    #[test]
    fn test_ge_on_trident_plus() {
        let map = CapabilityMap {
            chips: vec![ChipSpec {
                chip_type: ChipType::TridentPlus,
                unit: 0,
                ..Default::default()
            }],
            ..Default::default()
        };
        let ge = PortSpec {
            port_type: PortType::Ge,
            unit: 0,
            ..Default::default()
        };
        let xe = PortSpec {
            port_type: PortType::Xe,
            unit: 0,
            ..Default::default()
        };
        assert!(map.is_ge_on_trident_plus(&ge));
        assert!(!map.is_ge_on_trident_plus(&xe));
    }

    #[test]
    fn test_keys() {
        let key = PortKey::new(1, 2, 3);
        assert_eq!(key.to_string(), "1/2/3");
        assert_eq!(key.group(), PortGroupKey::new(1, 2));
        assert!(PortKey::new(1, 2, 0) < key);
    }
}
