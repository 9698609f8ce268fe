// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Loading and validation of capability map files.
//!
//! A file may carry several maps, one per supported chassis.  A chassis
//! configuration picks one of them by id.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use aal::CapabilityMap;
use aal::ChipType;
use aal::PortGroupKey;
use aal::PortType;
use common::ports::ONE_GIG_BPS;

use crate::config::load_file;
use crate::types::ChassisError;
use crate::types::ChassisResult;

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct CapabilityMapList {
    pub maps: Vec<CapabilityMap>,
}

impl CapabilityMapList {
    pub fn from_file(path: impl AsRef<Path>) -> ChassisResult<Self> {
        load_file(path.as_ref())
    }

    /// Return a validated copy of the map with the given id, or of the first
    /// map if `id` is empty.
    pub fn select(&self, id: &str) -> ChassisResult<CapabilityMap> {
        let map = self
            .maps
            .iter()
            .find(|m| id.is_empty() || m.id == id)
            .ok_or_else(|| {
                ChassisError::InvalidCapabilityMap(format!(
                    "no capability map with id {id:?}"
                ))
            })?;
        validate(map)?;
        Ok(map.clone())
    }
}

fn invalid(msg: String) -> ChassisError {
    ChassisError::InvalidCapabilityMap(msg)
}

/// Check the internal consistency of a capability map, before it is matched
/// against any configuration.
pub fn validate(map: &CapabilityMap) -> ChassisResult<()> {
    let mut slots = BTreeSet::new();
    let mut units = BTreeSet::new();
    let mut modules = BTreeSet::new();

    for chip in &map.chips {
        if chip.chip_type == ChipType::Unknown {
            return Err(invalid(format!("unit {} has no chip type", chip.unit)));
        }
        if map.auto_add_slot {
            if chip.slot != 0 {
                return Err(invalid(format!(
                    "auto_add_slot is set, yet unit {} has slot {}",
                    chip.unit, chip.slot
                )));
            }
        } else if chip.slot <= 0 {
            return Err(invalid(format!(
                "invalid slot {} for unit {}",
                chip.slot, chip.unit
            )));
        } else {
            slots.insert(chip.slot);
        }
        if !units.insert(chip.unit) {
            return Err(invalid(format!("duplicate unit {}", chip.unit)));
        }
        if chip.module < 0 || !modules.insert(chip.module) {
            return Err(invalid(format!(
                "invalid module {} for unit {}",
                chip.module, chip.unit
            )));
        }
        if chip.pci_bus < 0 || chip.pci_slot < 0 {
            return Err(invalid(format!(
                "invalid pci address {}:{} for unit {}",
                chip.pci_bus, chip.pci_slot, chip.unit
            )));
        }
    }

    let mut group_internal: BTreeMap<PortGroupKey, bool> = BTreeMap::new();
    for port in &map.ports {
        if port.port_type == PortType::Unknown {
            return Err(invalid(format!("no port type for {port}")));
        }
        if map.auto_add_slot {
            if port.slot != 0 {
                return Err(invalid(format!(
                    "auto_add_slot is set, yet port {port} has a slot"
                )));
            }
        } else if port.slot <= 0 || !slots.contains(&port.slot) {
            return Err(invalid(format!("invalid slot in {port}")));
        }
        if port.port <= 0 {
            return Err(invalid(format!("invalid port in {port}")));
        }
        if !(0..=4).contains(&port.channel) {
            return Err(invalid(format!("invalid channel in {port}")));
        }
        if !units.contains(&port.unit) {
            return Err(invalid(format!("unknown unit in {port}")));
        }
        if port.speed_bps == 0 || port.speed_bps % ONE_GIG_BPS != 0 {
            return Err(invalid(format!(
                "invalid speed_bps {} in {port}",
                port.speed_bps
            )));
        }
        if port.serdes_lane > 3 {
            return Err(invalid(format!("invalid serdes_lane in {port}")));
        }
        if port.port_type != PortType::Mgmt
            && !(1..=4).contains(&port.num_serdes_lanes)
        {
            return Err(invalid(format!("invalid num_serdes_lanes in {port}")));
        }
        if map.auto_add_logical_ports || map.is_ge_on_trident_plus(port) {
            if port.logical_port != 0 {
                return Err(invalid(format!(
                    "logical ports are assigned automatically, yet {port} \
                     has one"
                )));
            }
        } else if port.logical_port == 0 {
            return Err(invalid(format!("no logical_port in {port}")));
        }
        let internal = group_internal
            .entry(port.group_key())
            .or_insert(port.internal);
        if *internal != port.internal {
            return Err(invalid(format!(
                "ports at {} are both internal and external",
                port.group_key()
            )));
        }
    }

    Ok(())
}
