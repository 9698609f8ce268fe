// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Matching of a chassis configuration against a capability map.
//!
//! The resolver produces two things.  The first is the target map: the subset
//! of the capability map that has to be brought up in hardware to carry the
//! configuration, with its logical port numbers filled in.  The second is
//! the binding of every configured port and trunk to the hardware resources
//! in that target map.
//!
//! A flex group is always brought up as four channels at the chip's minimum
//! flex speed, whatever channelization is requested for it.  Moving a flex
//! group between channelizations therefore leaves the target map untouched,
//! and can be done on a running chassis.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::debug;
use slog::o;

use aal::CapabilityMap;
use aal::PortGroupKey;
use aal::PortKey;
use aal::PortSpec;
use aal::SdkPort;
use aal::Unit;
use aal::CPU_LOGICAL_PORT;
use common::ports::AdminState;
use common::ports::LoopbackState;
use common::ports::PortSpeed;

use crate::config::ChassisConfig;
use crate::config::TrunkType;
use crate::types::ChassisError;
use crate::types::ChassisResult;
use crate::types::NodeId;
use crate::types::PortId;
use crate::types::TrunkId;
use crate::types::CPU_PORT_ID;

/// Number of logical ports in the X pipeline of a Trident+.
const TRIDENT_PLUS_X_PIPELINE_PORTS: u32 = 32;

/// The channels every flex group is brought up with.
const FLEX_CHANNELS: [i32; 4] = [1, 2, 3, 4];

/// A singleton port bound to its hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPort {
    pub node: NodeId,
    pub id: PortId,
    pub key: PortKey,
    pub speed_bps: u64,
    /// The capability row the port was matched against, with its slot and
    /// logical port filled in.
    pub spec: PortSpec,
    pub sdk_port: SdkPort,
    /// Intent from the configuration.  `Unknown` when none was given.
    pub admin: AdminState,
    pub loopback: LoopbackState,
    pub flex: bool,
    pub internal: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTrunk {
    pub node: NodeId,
    pub id: TrunkId,
    pub unit: Unit,
    pub trunk_type: TrunkType,
    pub members: Vec<PortId>,
}

/// A physical cage whose lanes are shared by the channels carved out of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlexGroup {
    pub unit: Unit,
    /// The one speed requested for every port of the group.
    pub speed_bps: u64,
    /// The target map rows backing the group, one per channel.
    pub rows: Vec<SdkPort>,
    /// The rows that carry a configured port, at `speed_bps`.
    pub active: Vec<SdkPort>,
}

/// The complete outcome of matching a configuration against a capability
/// map.  Two mappings compare equal exactly when applying either one leaves
/// the hardware in the same state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub target: CapabilityMap,
    pub node_id_to_unit: BTreeMap<NodeId, Unit>,
    /// Sorted by (node, id)
    pub ports: Vec<ResolvedPort>,
    /// Sorted by (node, id)
    pub trunks: Vec<ResolvedTrunk>,
    pub flex_groups: BTreeMap<PortGroupKey, FlexGroup>,
}

impl ResolvedMapping {
    pub fn port(&self, node: NodeId, id: PortId) -> Option<&ResolvedPort> {
        self.ports.iter().find(|p| p.node == node && p.id == id)
    }

    pub fn trunk(&self, node: NodeId, id: TrunkId) -> Option<&ResolvedTrunk> {
        self.trunks.iter().find(|t| t.node == node && t.id == id)
    }
}

fn invalid(msg: String) -> ChassisError {
    ChassisError::InvalidConfig(msg)
}

pub struct PortResolver {
    log: slog::Logger,
}

impl PortResolver {
    pub fn new(log: &slog::Logger) -> Self {
        PortResolver {
            log: log.new(o!("unit" => "resolver")),
        }
    }

    /// Resolve `config` against `base`, which must already have passed
    /// [`crate::capability::validate`].  Nothing outside the returned value
    /// is modified.
    pub fn resolve(
        &self,
        base: &CapabilityMap,
        config: &ChassisConfig,
    ) -> ChassisResult<ResolvedMapping> {
        let platform = config.chassis.platform;
        if platform.supported_chip_types().is_empty() {
            return Err(invalid(format!("unsupported platform: {platform}")));
        }

        let mut base = base.clone();
        if base.auto_add_slot {
            populate_slot(config, &mut base)?;
        }

        // Every node needs a positive id and slot, and ids must be unique.
        let mut node_units: BTreeMap<NodeId, Option<Unit>> = BTreeMap::new();
        for node in &config.nodes {
            if node.slot <= 0 {
                return Err(invalid(format!(
                    "no positive slot for node {}",
                    node.id
                )));
            }
            if node.id == 0 {
                return Err(invalid(format!(
                    "node {:?} has no positive id",
                    node.name
                )));
            }
            if node_units.insert(node.id, None).is_some() {
                return Err(invalid(format!("duplicate node id {}", node.id)));
            }
        }

        // Match every singleton port against exactly one capability row.
        let mut node_port_ids: BTreeMap<NodeId, BTreeSet<PortId>> =
            BTreeMap::new();
        let mut port_keys = BTreeSet::new();
        let mut flex_groups = BTreeSet::new();
        let mut fixed_groups = BTreeSet::new();
        let mut group_speeds: BTreeMap<PortGroupKey, BTreeSet<u64>> =
            BTreeMap::new();
        let mut group_internal: BTreeMap<PortGroupKey, BTreeSet<bool>> =
            BTreeMap::new();
        // Base map indices of the rows in the target map
        let mut target_rows = BTreeSet::new();
        let mut matched = Vec::new();

        for port in &config.singleton_ports {
            if port.id == 0 {
                return Err(invalid(format!("no positive id in {port}")));
            }
            if port.id == CPU_PORT_ID {
                return Err(invalid(format!(
                    "singleton port {port} has the reserved CPU port id"
                )));
            }
            if port.slot <= 0 {
                return Err(invalid(format!("no valid slot in {port}")));
            }
            if port.port <= 0 {
                return Err(invalid(format!("no valid port in {port}")));
            }
            if port.speed_bps == 0 {
                return Err(invalid(format!("no valid speed_bps in {port}")));
            }
            let key = port.key();
            if !port_keys.insert(key) {
                return Err(invalid(format!(
                    "the (slot, port, channel) of singleton port {port} is \
                     used by another singleton port"
                )));
            }
            if port.node == 0 {
                return Err(invalid(format!("no valid node id in {port}")));
            }
            let Some(node_unit) = node_units.get_mut(&port.node) else {
                return Err(invalid(format!(
                    "node {} of singleton port {port} is not configured",
                    port.node
                )));
            };
            if !node_port_ids.entry(port.node).or_default().insert(port.id) {
                return Err(invalid(format!(
                    "the id of singleton port {port} is used by another \
                     singleton port on node {}",
                    port.node
                )));
            }
            let speed = PortSpeed::try_from(port.speed_bps).map_err(|e| {
                invalid(format!("singleton port {port}: {e}"))
            })?;
            if !speed.valid_channels().contains(&port.channel) {
                return Err(invalid(format!(
                    "channel {} is invalid for a {speed} singleton port {port}",
                    port.channel
                )));
            }

            let candidates: Vec<usize> = base
                .ports
                .iter()
                .enumerate()
                .filter(|(_, row)| {
                    row.key() == key && row.speed_bps == port.speed_bps
                })
                .map(|(idx, _)| idx)
                .collect();
            let idx = match candidates.as_slice() {
                [idx] => *idx,
                [] => {
                    return Err(invalid(format!(
                        "no capability row matches the (slot, port, channel, \
                         speed_bps) of singleton port {port}"
                    )))
                }
                _ => {
                    return Err(invalid(format!(
                        "{} capability rows match the (slot, port, channel, \
                         speed_bps) of singleton port {port}",
                        candidates.len()
                    )))
                }
            };
            let row = &base.ports[idx];

            let group = key.group();
            if row.flex_port {
                if fixed_groups.contains(&group) {
                    return Err(invalid(format!(
                        "singleton port {port} is flex, but {group} is \
                         already used by a fixed port"
                    )));
                }
                flex_groups.insert(group);
            } else {
                if flex_groups.contains(&group) {
                    return Err(invalid(format!(
                        "singleton port {port} is fixed, but {group} is \
                         already used by a flex port"
                    )));
                }
                fixed_groups.insert(group);
                target_rows.insert(idx);
            }

            let unit = *node_unit.get_or_insert(row.unit);
            if unit != row.unit {
                return Err(invalid(format!(
                    "singleton port {port} is on unit {}, but node {} is \
                     already on unit {unit}",
                    row.unit, port.node
                )));
            }

            group_internal.entry(group).or_default().insert(row.internal);
            group_speeds.entry(group).or_default().insert(port.speed_bps);
            matched.push((port, idx));
        }

        // A node without ports has no unit.
        let mut node_id_to_unit = BTreeMap::new();
        for (node, unit) in &node_units {
            let Some(unit) = unit else {
                return Err(invalid(format!(
                    "no singleton port configured for node {node}"
                )));
            };
            node_id_to_unit.insert(*node, *unit);
        }
        let mut unit_nodes: BTreeMap<Unit, NodeId> = BTreeMap::new();
        for (node, unit) in &node_id_to_unit {
            if let Some(other) = unit_nodes.insert(*unit, *node) {
                return Err(invalid(format!(
                    "nodes {other} and {node} are both on unit {unit}"
                )));
            }
        }

        let mut node_trunk_ids: BTreeMap<NodeId, BTreeSet<TrunkId>> =
            BTreeMap::new();
        let mut parent_trunks: BTreeMap<(NodeId, PortId), TrunkId> =
            BTreeMap::new();
        let mut trunks = Vec::new();
        for trunk in &config.trunk_ports {
            if trunk.id == 0 {
                return Err(invalid(format!("no positive id in {trunk}")));
            }
            if trunk.trunk_type == TrunkType::Unknown {
                return Err(invalid(format!("no type in trunk {trunk}")));
            }
            if trunk.id == CPU_PORT_ID {
                return Err(invalid(format!(
                    "trunk {trunk} has the reserved CPU port id"
                )));
            }
            if trunk.node == 0 {
                return Err(invalid(format!("no valid node id in {trunk}")));
            }
            let Some(unit) = node_id_to_unit.get(&trunk.node) else {
                return Err(invalid(format!(
                    "node {} of trunk {trunk} is not configured",
                    trunk.node
                )));
            };
            if !node_trunk_ids.entry(trunk.node).or_default().insert(trunk.id)
            {
                return Err(invalid(format!(
                    "the id of trunk {trunk} is used by another trunk on \
                     node {}",
                    trunk.node
                )));
            }
            let port_ids = node_port_ids.get(&trunk.node);
            if port_ids.is_some_and(|ids| ids.contains(&trunk.id)) {
                return Err(invalid(format!(
                    "the id of trunk {trunk} is used by a singleton port on \
                     node {}",
                    trunk.node
                )));
            }
            if trunk.trunk_type == TrunkType::Lacp && !trunk.members.is_empty()
            {
                return Err(invalid(format!(
                    "LACP trunk {trunk} may not list static members"
                )));
            }
            let mut members = Vec::new();
            for member in &trunk.members {
                if !port_ids.is_some_and(|ids| ids.contains(member)) {
                    return Err(invalid(format!(
                        "unknown member singleton port {member} for trunk \
                         {trunk}"
                    )));
                }
                if let Some(other) =
                    parent_trunks.insert((trunk.node, *member), trunk.id)
                {
                    return Err(invalid(format!(
                        "singleton port {member} is a member of both trunk \
                         {other} and trunk {}",
                        trunk.id
                    )));
                }
                members.push(*member);
            }
            members.sort_unstable();
            trunks.push(ResolvedTrunk {
                node: trunk.node,
                id: trunk.id,
                unit: *unit,
                trunk_type: trunk.trunk_type,
                members,
            });
        }
        trunks.sort_by_key(|t| (t.node, t.id));

        // The chips hosting the configured nodes make up the target map.
        let units: BTreeSet<Unit> = node_id_to_unit.values().copied().collect();
        let mut target = CapabilityMap {
            id: base.id.clone(),
            auto_add_logical_ports: base.auto_add_logical_ports,
            auto_add_slot: base.auto_add_slot,
            chips: Vec::new(),
            ports: Vec::new(),
        };
        for unit in &units {
            let chip = base.chip(*unit).ok_or_else(|| {
                invalid(format!("no chip for unit {unit} in the capability map"))
            })?;
            if !platform.supports(chip.chip_type) {
                return Err(invalid(format!(
                    "chip type {} is not supported on platform {platform}",
                    chip.chip_type
                )));
            }
            target.chips.push(chip.clone());
        }

        for (group, internal) in &group_internal {
            if internal.len() != 1 {
                return Err(invalid(format!(
                    "singleton ports at {group} use both internal and \
                     external ports"
                )));
            }
        }
        for (group, speeds) in &group_speeds {
            if speeds.len() != 1 {
                return Err(invalid(format!(
                    "singleton ports at {group} use {} different speeds",
                    speeds.len()
                )));
            }
        }

        // Each flex group is brought up as all four channels at the chip's
        // minimum flex speed.
        for group in &flex_groups {
            let group_units: BTreeSet<Unit> = base
                .ports
                .iter()
                .filter(|row| row.group_key() == *group)
                .map(|row| row.unit)
                .collect();
            let unit = match group_units.len() {
                1 => group_units.iter().copied().next().unwrap_or_default(),
                _ => {
                    return Err(invalid(format!(
                        "ports at {group} are spread over units {group_units:?}"
                    )))
                }
            };
            let chip_type = base.chip_type(unit);
            let min_speed = chip_type.min_flex_speed_bps().ok_or_else(|| {
                invalid(format!("unsupported chip type {chip_type} for flex"))
            })?;
            for channel in FLEX_CHANNELS {
                let key = PortKey::new(group.slot, group.port, channel);
                let idx = base
                    .ports
                    .iter()
                    .position(|row| {
                        row.key() == key && row.speed_bps == min_speed
                    })
                    .ok_or_else(|| {
                        invalid(format!(
                            "no capability row for flex channel {key} at \
                             {min_speed} bps"
                        ))
                    })?;
                target_rows.insert(idx);
            }
        }

        // Target rows keep the order in which the capability map lists them.
        target.ports =
            target_rows.iter().map(|idx| base.ports[*idx].clone()).collect();

        check_max_ports(&target)?;
        if target.auto_add_logical_ports {
            assign_logical_ports(&mut target);
        }
        assign_ge_trident_plus_ports(&mut target)?;
        post_validate(&target)?;

        // Bind each singleton port to its row in the target map.
        let auto = target.auto_add_logical_ports;
        let mut ports = Vec::with_capacity(matched.len());
        for (port, idx) in matched {
            let mut spec = base.ports[idx].clone();
            if auto || base.is_ge_on_trident_plus(&spec) {
                let row = target
                    .ports
                    .iter()
                    .find(|row| {
                        row.unit == spec.unit
                            && row.physical_port == spec.physical_port
                            && row.diag_port == spec.diag_port
                    })
                    .ok_or_else(|| {
                        invalid(format!(
                            "no target row shares the physical port of \
                             singleton port {port}"
                        ))
                    })?;
                spec.logical_port = row.logical_port;
            } else if !target
                .ports
                .iter()
                .any(|row| row.sdk_port() == spec.sdk_port())
            {
                return Err(invalid(format!(
                    "logical port {} of singleton port {port} is not brought \
                     up by any target row",
                    spec.sdk_port()
                )));
            }

            ports.push(ResolvedPort {
                node: port.node,
                id: port.id,
                key: port.key(),
                speed_bps: port.speed_bps,
                sdk_port: spec.sdk_port(),
                admin: port.config_params.admin_state,
                loopback: port.config_params.loopback_mode,
                flex: spec.flex_port,
                internal: spec.internal,
                spec,
            });
        }
        ports.sort_by_key(|p| (p.node, p.id));

        let mut groups = BTreeMap::new();
        for group in flex_groups {
            let rows: Vec<SdkPort> = target
                .ports
                .iter()
                .filter(|row| row.group_key() == group)
                .map(|row| row.sdk_port())
                .collect();
            let members: Vec<&ResolvedPort> =
                ports.iter().filter(|p| p.key.group() == group).collect();
            let mut active: Vec<SdkPort> =
                members.iter().map(|p| p.sdk_port).collect();
            active.sort();
            let unit = rows.first().map(|r| r.unit).unwrap_or_default();
            let speed_bps = members.first().map(|p| p.speed_bps).unwrap_or(0);
            groups.insert(
                group,
                FlexGroup {
                    unit,
                    speed_bps,
                    rows,
                    active,
                },
            );
        }

        debug!(self.log, "resolved chassis config";
            "map" => &target.id,
            "units" => ?units,
            "ports" => ports.len(),
            "trunks" => trunks.len(),
            "flex_groups" => groups.len());

        Ok(ResolvedMapping {
            target,
            node_id_to_unit,
            ports,
            trunks,
            flex_groups: groups,
        })
    }
}

/// Stamp the one slot used by the configuration onto every chip and port.
fn populate_slot(
    config: &ChassisConfig,
    base: &mut CapabilityMap,
) -> ChassisResult<()> {
    let slots: BTreeSet<i32> = config
        .nodes
        .iter()
        .map(|n| n.slot)
        .chain(config.singleton_ports.iter().map(|p| p.slot))
        .collect();
    let slot = match slots.len() {
        1 => slots.iter().copied().next().unwrap_or_default(),
        n => {
            return Err(invalid(format!(
                "auto_add_slot needs exactly one slot in the config, found \
                 {n}: {slots:?}"
            )))
        }
    };
    base.chips.iter_mut().for_each(|c| c.slot = slot);
    base.ports.iter_mut().for_each(|p| p.slot = slot);
    Ok(())
}

fn check_max_ports(target: &CapabilityMap) -> ChassisResult<()> {
    for chip in &target.chips {
        let count = target
            .ports
            .iter()
            .filter(|p| p.unit == chip.unit && p.port_type.is_data_plane())
            .count();
        let max = chip.chip_type.max_ports().unwrap_or(0);
        if count > max {
            return Err(invalid(format!(
                "a {} chip carries at most {max} ports, but unit {} needs \
                 {count}",
                chip.chip_type, chip.unit
            )));
        }
    }
    Ok(())
}

/// Number the rows of each unit from 1, data-plane rows first.  GE ports on a
/// Trident+ are left for [`assign_ge_trident_plus_ports`].
fn assign_logical_ports(target: &mut CapabilityMap) {
    let mut next: BTreeMap<Unit, u32> = BTreeMap::new();
    let mut order: Vec<usize> = (0..target.ports.len())
        .filter(|idx| target.ports[*idx].port_type.is_data_plane())
        .collect();
    order.extend((0..target.ports.len()).filter(|idx| {
        let row = &target.ports[*idx];
        !row.port_type.is_data_plane() && !target.is_ge_on_trident_plus(row)
    }));

    for idx in order {
        let counter = next.entry(target.ports[idx].unit).or_insert(1);
        target.ports[idx].logical_port = *counter;
        *counter += 1;
    }
}

/// A GE port on a Trident+ takes the highest logical port of the X pipeline
/// that is not otherwise in use on its unit.
fn assign_ge_trident_plus_ports(target: &mut CapabilityMap) -> ChassisResult<()> {
    for idx in 0..target.ports.len() {
        if !target.is_ge_on_trident_plus(&target.ports[idx]) {
            continue;
        }
        let unit = target.ports[idx].unit;
        let used: BTreeSet<u32> = target
            .ports
            .iter()
            .enumerate()
            .filter(|(other, p)| *other != idx && p.unit == unit)
            .filter(|(other, p)| {
                p.port_type != aal::PortType::Ge || *other < idx
            })
            .map(|(_, p)| p.logical_port)
            .collect();
        let free = (1..=TRIDENT_PLUS_X_PIPELINE_PORTS)
            .rev()
            .find(|lp| !used.contains(lp))
            .ok_or_else(|| {
                invalid(format!(
                    "no empty logical_port in X pipeline of unit {unit} for \
                     GE port {}",
                    target.ports[idx]
                ))
            })?;
        target.ports[idx].logical_port = free;
    }
    Ok(())
}

fn post_validate(target: &CapabilityMap) -> ChassisResult<()> {
    let mut physical: BTreeMap<Unit, BTreeSet<u32>> = BTreeMap::new();
    let mut diag: BTreeMap<Unit, BTreeSet<u32>> = BTreeMap::new();
    let mut logical: BTreeMap<Unit, BTreeSet<u32>> = target
        .chips
        .iter()
        .map(|c| (c.unit, BTreeSet::from([CPU_LOGICAL_PORT])))
        .collect();

    for row in &target.ports {
        if !physical.entry(row.unit).or_default().insert(row.physical_port) {
            return Err(ChassisError::InvalidCapabilityMap(format!(
                "duplicate physical_port {} on unit {}",
                row.physical_port, row.unit
            )));
        }
        if !diag.entry(row.unit).or_default().insert(row.diag_port) {
            return Err(ChassisError::InvalidCapabilityMap(format!(
                "duplicate diag_port {} on unit {}",
                row.diag_port, row.unit
            )));
        }
        if !logical.entry(row.unit).or_default().insert(row.logical_port) {
            return Err(ChassisError::InvalidCapabilityMap(format!(
                "duplicate logical_port for {row}"
            )));
        }
    }
    Ok(())
}
