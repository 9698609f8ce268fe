// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The canonical view of the chassis: every mapping between logical ids and
//! hardware, plus the live state of each port and trunk.
//!
//! A store is never patched to follow a new configuration.  Each push builds
//! a complete replacement from the resolved mapping and the store it
//! replaces, and the manager swaps it in only once the hardware has accepted
//! the change.  Hardware events and operator requests do mutate the store in
//! place, but only at the level of individual state fields.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::debug;

use aal::ChipSpec;
use aal::PortGroupKey;
use aal::PortKey;
use aal::PortSpec;
use aal::SdkPort;
use aal::SdkTrunk;
use aal::TrunkPort;
use aal::Unit;
use common::ports::AdminState;
use common::ports::HealthState;
use common::ports::HwState;
use common::ports::LoopbackState;
use common::ports::PortState;
use common::ports::TrunkMemberBlockState;

use crate::events::ChangeEvent;
use crate::events::Subject;
use crate::freemap::FreeMap;
use crate::resolver::ResolvedMapping;
use crate::types::ChassisError;
use crate::types::ChassisResult;
use crate::types::NodeId;
use crate::types::PortId;
use crate::types::TrunkId;

/// Hardware trunk numbers handed out on each unit: `[low, high)`.
const TRUNK_PORT_RANGE: (TrunkPort, TrunkPort) = (1, 1025);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub oper: PortState,
    pub admin: AdminState,
    pub loopback: LoopbackState,
    pub health: HealthState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrunkStatus {
    pub oper: PortState,
    pub members: BTreeSet<PortId>,
    /// Members explicitly blocked or unblocked by an operator.
    pub member_blocks: BTreeMap<PortId, TrunkMemberBlockState>,
}

/// A trunk is up if any member is up, and down otherwise.  Only a trunk
/// without members has an unknown state.
pub fn derive_trunk_state(
    members: impl IntoIterator<Item = PortState>,
) -> PortState {
    let mut members = members.into_iter().peekable();
    if members.peek().is_none() {
        return PortState::Unknown;
    }
    match members.any(|state| state == PortState::Up) {
        true => PortState::Up,
        false => PortState::Down,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceMapStore {
    unit_to_chip: BTreeMap<Unit, ChipSpec>,
    key_to_port: BTreeMap<PortKey, PortSpec>,
    node_id_to_unit: BTreeMap<NodeId, Unit>,
    unit_to_node_id: BTreeMap<Unit, NodeId>,
    node_id_to_port_id_to_sdk_port: BTreeMap<NodeId, BTreeMap<PortId, SdkPort>>,
    sdk_port_to_port: BTreeMap<SdkPort, (NodeId, PortId)>,
    node_id_to_trunk_id_to_sdk_trunk:
        BTreeMap<NodeId, BTreeMap<TrunkId, SdkTrunk>>,
    // Bound trunks only
    sdk_trunk_to_trunk: BTreeMap<SdkTrunk, (NodeId, TrunkId)>,
    port_status: BTreeMap<(NodeId, PortId), PortStatus>,
    trunk_status: BTreeMap<(NodeId, TrunkId), TrunkStatus>,
    port_to_parent_trunk: BTreeMap<(NodeId, PortId), TrunkId>,
    xcvr_states: BTreeMap<PortGroupKey, HwState>,
}

impl ResourceMapStore {
    /// Build the store for `mapping`.  State that survives from `prior` is
    /// carried forward:
    ///
    /// - oper and health state of ports still backed by the same SdkPort
    /// - admin and loopback state of ports without explicit intent
    /// - hardware trunk numbers
    /// - operator trunk member blocks
    /// - transceiver state
    pub fn build(
        log: &slog::Logger,
        mapping: &ResolvedMapping,
        prior: Option<&ResourceMapStore>,
    ) -> ChassisResult<Self> {
        let mut store = ResourceMapStore {
            unit_to_chip: mapping
                .target
                .chips
                .iter()
                .map(|c| (c.unit, c.clone()))
                .collect(),
            node_id_to_unit: mapping.node_id_to_unit.clone(),
            unit_to_node_id: mapping
                .node_id_to_unit
                .iter()
                .map(|(node, unit)| (*unit, *node))
                .collect(),
            ..Default::default()
        };

        for port in &mapping.ports {
            let id = (port.node, port.id);
            store.key_to_port.insert(port.key, port.spec.clone());
            store
                .node_id_to_port_id_to_sdk_port
                .entry(port.node)
                .or_default()
                .insert(port.id, port.sdk_port);
            store.sdk_port_to_port.insert(port.sdk_port, id);

            let old_status = prior.and_then(|p| p.port_status.get(&id));
            let same_port = prior
                .and_then(|p| p.port_id_to_sdk_port(port.node, port.id).ok())
                == Some(port.sdk_port);
            let (oper, health) = match (old_status, same_port) {
                (Some(old), true) => (old.oper, old.health),
                _ => (PortState::Unknown, HealthState::Unknown),
            };
            let admin = match (port.admin, old_status) {
                (AdminState::Unknown, Some(old))
                    if old.admin != AdminState::Unknown =>
                {
                    old.admin
                }
                (AdminState::Unknown, _) => AdminState::Enabled,
                (admin, _) => admin,
            };
            let loopback = match (port.loopback, old_status) {
                (LoopbackState::Unknown, Some(old))
                    if old.loopback != LoopbackState::Unknown =>
                {
                    old.loopback
                }
                (LoopbackState::Unknown, _) => LoopbackState::None,
                (loopback, _) => loopback,
            };
            store.port_status.insert(
                id,
                PortStatus {
                    oper,
                    admin,
                    loopback,
                    health,
                },
            );
        }

        // Hardware trunk numbers that are already in use stay with their
        // trunks.  Trunks with members that have never been bound get the
        // lowest free number on their unit.
        let mut free: BTreeMap<Unit, FreeMap> = BTreeMap::new();
        let mut bindings = BTreeMap::new();
        for trunk in &mapping.trunks {
            let old = prior
                .and_then(|p| p.trunk_id_to_sdk_trunk(trunk.node, trunk.id).ok())
                .filter(|t| t.unit == trunk.unit && t.is_bound());
            if let Some(old) = old {
                let map = free.entry(trunk.unit).or_insert_with(|| {
                    trunk_freemap(log, trunk.unit)
                });
                if let Some(trunk_port) = old.trunk_port {
                    map.reserve(trunk_port)?;
                }
                bindings.insert((trunk.node, trunk.id), old);
            }
        }
        for trunk in &mapping.trunks {
            let id = (trunk.node, trunk.id);
            let sdk_trunk = match bindings.get(&id) {
                Some(bound) => *bound,
                None if !trunk.members.is_empty() => {
                    let map = free.entry(trunk.unit).or_insert_with(|| {
                        trunk_freemap(log, trunk.unit)
                    });
                    let bound = SdkTrunk::bound(trunk.unit, map.alloc()?);
                    debug!(log, "bound trunk";
                        "node" => trunk.node,
                        "trunk" => trunk.id,
                        "sdk_trunk" => %bound);
                    bound
                }
                None => SdkTrunk::unbound(trunk.unit),
            };
            store
                .node_id_to_trunk_id_to_sdk_trunk
                .entry(trunk.node)
                .or_default()
                .insert(trunk.id, sdk_trunk);
            if sdk_trunk.is_bound() {
                store.sdk_trunk_to_trunk.insert(sdk_trunk, id);
            }

            let members: BTreeSet<PortId> =
                trunk.members.iter().copied().collect();
            for member in &members {
                store.port_to_parent_trunk.insert((trunk.node, *member), trunk.id);
            }
            let member_blocks = prior
                .and_then(|p| p.trunk_status.get(&id))
                .map(|old| {
                    old.member_blocks
                        .iter()
                        .filter(|(port, _)| members.contains(port))
                        .map(|(port, state)| (*port, *state))
                        .collect()
                })
                .unwrap_or_default();
            let oper = store.member_states(trunk.node, &members);
            store.trunk_status.insert(
                id,
                TrunkStatus {
                    oper,
                    members,
                    member_blocks,
                },
            );
        }

        if let Some(prior) = prior {
            store.xcvr_states = prior.xcvr_states.clone();
        }
        for port in &mapping.ports {
            store.xcvr_states.entry(port.key.group()).or_insert(
                match port.internal {
                    true => HwState::Present,
                    false => HwState::Unknown,
                },
            );
        }

        Ok(store)
    }

    fn member_states(
        &self,
        node: NodeId,
        members: &BTreeSet<PortId>,
    ) -> PortState {
        derive_trunk_state(members.iter().map(|port| {
            self.port_status
                .get(&(node, *port))
                .map(|s| s.oper)
                .unwrap_or_default()
        }))
    }

    fn port_status(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<&PortStatus> {
        self.port_status.get(&(node, port)).ok_or_else(|| {
            ChassisError::Missing(format!("port {port} on node {node}"))
        })
    }

    fn port_status_mut(
        &mut self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<&mut PortStatus> {
        self.port_status.get_mut(&(node, port)).ok_or_else(|| {
            ChassisError::Missing(format!("port {port} on node {node}"))
        })
    }

    fn trunk_status(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<&TrunkStatus> {
        self.trunk_status.get(&(node, trunk)).ok_or_else(|| {
            ChassisError::Missing(format!("trunk {trunk} on node {node}"))
        })
    }

    pub fn chip(&self, unit: Unit) -> ChassisResult<&ChipSpec> {
        self.unit_to_chip
            .get(&unit)
            .ok_or_else(|| ChassisError::Missing(format!("unit {unit}")))
    }

    pub fn port_by_key(&self, key: PortKey) -> ChassisResult<&PortSpec> {
        self.key_to_port.get(&key).ok_or_else(|| {
            ChassisError::Missing(format!("singleton port at {key}"))
        })
    }

    /// The capability row behind a singleton port.
    pub fn port(&self, node: NodeId, port: PortId) -> ChassisResult<&PortSpec> {
        let sdk_port = self.port_id_to_sdk_port(node, port)?;
        self.key_to_port
            .values()
            .find(|spec| spec.sdk_port() == sdk_port)
            .ok_or_else(|| {
                ChassisError::Internal(format!(
                    "no capability row for {sdk_port}"
                ))
            })
    }

    pub fn node_id_to_unit(&self) -> &BTreeMap<NodeId, Unit> {
        &self.node_id_to_unit
    }

    pub fn unit_to_node_id(&self, unit: Unit) -> Option<NodeId> {
        self.unit_to_node_id.get(&unit).copied()
    }

    pub fn port_id_to_sdk_port_map(
        &self,
        node: NodeId,
    ) -> ChassisResult<&BTreeMap<PortId, SdkPort>> {
        self.node_id_to_port_id_to_sdk_port
            .get(&node)
            .ok_or_else(|| ChassisError::Missing(format!("node {node}")))
    }

    pub fn trunk_id_to_sdk_trunk_map(
        &self,
        node: NodeId,
    ) -> ChassisResult<&BTreeMap<TrunkId, SdkTrunk>> {
        match self.node_id_to_trunk_id_to_sdk_trunk.get(&node) {
            Some(trunks) => Ok(trunks),
            None if self.node_id_to_unit.contains_key(&node) => {
                static EMPTY: BTreeMap<TrunkId, SdkTrunk> = BTreeMap::new();
                Ok(&EMPTY)
            }
            None => Err(ChassisError::Missing(format!("node {node}"))),
        }
    }

    pub fn port_id_to_sdk_port(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<SdkPort> {
        self.port_id_to_sdk_port_map(node)?
            .get(&port)
            .copied()
            .ok_or_else(|| {
                ChassisError::Missing(format!("port {port} on node {node}"))
            })
    }

    pub fn sdk_port_to_port_id(
        &self,
        sdk_port: SdkPort,
    ) -> Option<(NodeId, PortId)> {
        self.sdk_port_to_port.get(&sdk_port).copied()
    }

    pub fn trunk_id_to_sdk_trunk(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<SdkTrunk> {
        self.trunk_id_to_sdk_trunk_map(node)?
            .get(&trunk)
            .copied()
            .ok_or_else(|| {
                ChassisError::Missing(format!("trunk {trunk} on node {node}"))
            })
    }

    pub fn sdk_trunk_to_trunk_id(
        &self,
        sdk_trunk: SdkTrunk,
    ) -> Option<(NodeId, TrunkId)> {
        self.sdk_trunk_to_trunk.get(&sdk_trunk).copied()
    }

    pub fn port_oper_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<PortState> {
        self.port_status(node, port).map(|s| s.oper)
    }

    pub fn port_admin_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<AdminState> {
        self.port_status(node, port).map(|s| s.admin)
    }

    pub fn port_loopback_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<LoopbackState> {
        self.port_status(node, port).map(|s| s.loopback)
    }

    pub fn port_health_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<HealthState> {
        self.port_status(node, port).map(|s| s.health)
    }

    pub fn trunk_oper_state(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<PortState> {
        self.trunk_status(node, trunk).map(|s| s.oper)
    }

    pub fn trunk_members(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<BTreeSet<PortId>> {
        self.trunk_status(node, trunk).map(|s| s.members.clone())
    }

    pub fn trunk_member_block_state(
        &self,
        node: NodeId,
        trunk: TrunkId,
        port: PortId,
    ) -> ChassisResult<TrunkMemberBlockState> {
        let status = self.trunk_status(node, trunk)?;
        if !status.members.contains(&port) {
            return Err(ChassisError::Invalid(format!(
                "port {port} is not a member of trunk {trunk} on node {node}"
            )));
        }
        Ok(status.member_blocks.get(&port).copied().unwrap_or_default())
    }

    /// The trunk a port belongs to, if any.  Fails only if the port itself
    /// is unknown.
    pub fn parent_trunk(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<Option<TrunkId>> {
        self.port_status(node, port)?;
        Ok(self.port_to_parent_trunk.get(&(node, port)).copied())
    }

    pub fn xcvr_state(&self, group: PortGroupKey) -> ChassisResult<HwState> {
        self.xcvr_states.get(&group).copied().ok_or_else(|| {
            ChassisError::Missing(format!("transceiver at {group}"))
        })
    }

    /// Does any configured port live on the cage at `group`?
    pub fn has_ports_at(&self, group: PortGroupKey) -> bool {
        self.key_to_port.keys().any(|key| key.group() == group)
    }

    /// Record a link state change for the port behind `sdk_port`, and
    /// re-derive the state of its trunk.  Returns the changes that resulted,
    /// or None if no configured port lives at `sdk_port`.
    pub fn apply_link_state(
        &mut self,
        sdk_port: SdkPort,
        state: PortState,
    ) -> Option<Vec<ChangeEvent>> {
        let (node, port) = self.sdk_port_to_port_id(sdk_port)?;
        let status = self.port_status.get_mut(&(node, port))?;
        let mut changes = Vec::new();
        if status.oper == state {
            return Some(changes);
        }
        status.oper = state;
        changes.push(ChangeEvent::new(node, Subject::Port(port), state));

        if let Some(trunk) = self.port_to_parent_trunk.get(&(node, port)) {
            let trunk = *trunk;
            let members = self
                .trunk_status
                .get(&(node, trunk))
                .map(|t| t.members.clone())
                .unwrap_or_default();
            let oper = self.member_states(node, &members);
            if let Some(status) = self.trunk_status.get_mut(&(node, trunk)) {
                if status.oper != oper {
                    status.oper = oper;
                    changes.push(ChangeEvent::new(
                        node,
                        Subject::Trunk(trunk),
                        oper,
                    ));
                }
            }
        }
        Some(changes)
    }

    /// Drive the transceiver state machine at `group`.  Returns the new
    /// state, if it changed.
    pub fn apply_presence(
        &mut self,
        group: PortGroupKey,
        state: HwState,
    ) -> ChassisResult<Option<HwState>> {
        let old = self.xcvr_states.get(&group).copied().unwrap_or_default();
        let new = match state {
            HwState::Present if old == HwState::Ready => return Ok(None),
            HwState::Present if self.has_ports_at(group) => HwState::Ready,
            HwState::Present => HwState::Present,
            HwState::NotPresent if old == HwState::Unknown => return Ok(None),
            HwState::NotPresent => HwState::NotPresent,
            other => {
                return Err(ChassisError::Invalid(format!(
                    "unexpected transceiver state {other} at {group}"
                )))
            }
        };
        if new == old {
            return Ok(None);
        }
        self.xcvr_states.insert(group, new);
        Ok(Some(new))
    }

    pub fn set_port_admin_state(
        &mut self,
        node: NodeId,
        port: PortId,
        state: AdminState,
    ) -> ChassisResult<()> {
        self.port_status_mut(node, port)?.admin = state;
        Ok(())
    }

    pub fn set_port_loopback_state(
        &mut self,
        node: NodeId,
        port: PortId,
        state: LoopbackState,
    ) -> ChassisResult<()> {
        self.port_status_mut(node, port)?.loopback = state;
        Ok(())
    }

    pub fn set_port_health_state(
        &mut self,
        node: NodeId,
        port: PortId,
        state: HealthState,
    ) -> ChassisResult<()> {
        self.port_status_mut(node, port)?.health = state;
        Ok(())
    }

    pub fn set_trunk_member_block_state(
        &mut self,
        node: NodeId,
        trunk: TrunkId,
        port: PortId,
        state: TrunkMemberBlockState,
    ) -> ChassisResult<()> {
        let status =
            self.trunk_status.get_mut(&(node, trunk)).ok_or_else(|| {
                ChassisError::Missing(format!("trunk {trunk} on node {node}"))
            })?;
        status.member_blocks.insert(port, state);
        Ok(())
    }
}

fn trunk_freemap(log: &slog::Logger, unit: Unit) -> FreeMap {
    FreeMap::new(
        log,
        format!("trunks_unit{unit}"),
        TRUNK_PORT_RANGE.0,
        TRUNK_PORT_RANGE.1,
    )
}
