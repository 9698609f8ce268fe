// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The chassis manager owns the applied mapping and the resource store, and
//! is the only component that talks to the ASIC backend.
//!
//! All state lives behind a single RwLock.  A push or a shutdown holds the
//! writer side for its whole duration, so readers only ever see a complete
//! store from before or after it.  Hardware events are drained by a tokio
//! task, which takes the writer side once per event.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::RwLock;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use tokio::sync::mpsc;

use aal::AsicOps;
use aal::CapabilityMap;
use aal::ChipSpec;
use aal::PortGroupKey;
use aal::PortKey;
use aal::PortSpec;
use aal::PortUpdate;
use aal::SdkPort;
use aal::SdkTrunk;
use aal::Unit;
use common::ports::AdminState;
use common::ports::HealthState;
use common::ports::HwState;
use common::ports::LoopbackState;
use common::ports::PortState;
use common::ports::TrunkMemberBlockState;

use crate::capability;
use crate::config::ChassisConfig;
use crate::differ;
use crate::events::EventBridge;
use crate::events::EventWriter;
use crate::resolver::FlexGroup;
use crate::resolver::PortResolver;
use crate::resolver::ResolvedMapping;
use crate::store::ResourceMapStore;
use crate::types::ChangeClass;
use crate::types::ChassisError;
use crate::types::ChassisResult;
use crate::types::NodeId;
use crate::types::PortId;
use crate::types::TrunkId;

/// Tracks the task draining the backend's event channel.
struct UpdateHandler {
    cancel: Arc<AtomicBool>,
}

impl UpdateHandler {
    fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ChassisState {
    applied: Option<ResolvedMapping>,
    store: Option<ResourceMapStore>,
    updates: Option<UpdateHandler>,
}

struct Inner<H> {
    log: slog::Logger,
    backend: H,
    capability_map: CapabilityMap,
    event_queue_depth: usize,
    resolver: PortResolver,
    bridge: EventBridge,
    state: RwLock<ChassisState>,
}

pub struct ChassisManager<H: AsicOps + 'static> {
    inner: Arc<Inner<H>>,
}

impl<H: AsicOps + 'static> ChassisManager<H> {
    /// Create a manager that will bring up hardware through `backend`, using
    /// the ports described by `capability_map`.  Nothing is touched until
    /// the first push.
    pub fn new(
        log: &slog::Logger,
        backend: H,
        capability_map: CapabilityMap,
        event_queue_depth: usize,
    ) -> ChassisResult<Self> {
        if event_queue_depth == 0 {
            return Err(ChassisError::Invalid(
                "event queue depth must be positive".into(),
            ));
        }
        capability::validate(&capability_map)?;

        let log = log.new(o!("unit" => "chassis_manager"));
        info!(log, "created chassis manager";
            "capability_map" => &capability_map.id,
            "chips" => capability_map.chips.len(),
            "ports" => capability_map.ports.len());
        Ok(ChassisManager {
            inner: Arc::new(Inner {
                resolver: PortResolver::new(&log),
                bridge: EventBridge::new(&log),
                log,
                backend,
                capability_map,
                event_queue_depth,
                state: RwLock::new(ChassisState::default()),
            }),
        })
    }

    pub fn backend(&self) -> &H {
        &self.inner.backend
    }

    /// Resolve `config` and apply it to the hardware.
    ///
    /// The first push brings up every unit and port the configuration needs.
    /// Later pushes are applied in place when possible.  A configuration that
    /// can only take effect after a restart is refused with
    /// [`ChassisError::RebootRequired`], leaving everything as it was.
    pub fn push(&self, config: &ChassisConfig) -> ChassisResult<ChangeClass> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        let mapping = inner.resolve(config)?;
        let class = differ::classify(state.applied.as_ref(), &mapping);
        info!(inner.log, "pushing chassis config";
            "description" => &config.description,
            "class" => %class);

        match &class {
            ChangeClass::NoOp => {}
            ChangeClass::RebootRequired { reason } => {
                warn!(inner.log, "refusing config"; "reason" => reason);
                return Err(ChassisError::RebootRequired(reason.clone()));
            }
            ChangeClass::Uninitialized => {
                self.first_push(&mut state, mapping)?
            }
            ChangeClass::HotApplicable => {
                inner.hot_apply(&mut state, mapping)?
            }
        }
        Ok(class)
    }

    /// Report what a push of `config` would do, without doing it.
    pub fn verify(&self, config: &ChassisConfig) -> ChassisResult<ChangeClass> {
        let state = self.inner.state.read();
        let mapping = self.inner.resolve(config)?;
        Ok(differ::classify(state.applied.as_ref(), &mapping))
    }

    /// Stop event delivery, tear down all units, and forget everything that
    /// was applied.  The state is cleared even if the backend reports an
    /// error, in which case the first error is returned.
    pub fn shutdown(&self) -> ChassisResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        info!(inner.log, "shutting down";
            "initialized" => state.store.is_some());

        let mut first = None;
        if let Some(updates) = state.updates.take() {
            updates.cancel();
        }
        if let Err(e) = inner.backend.unregister_port_update_handler() {
            error!(inner.log, "failed to unregister update handler: {e:?}");
            first.get_or_insert(ChassisError::from(e));
        }
        inner.bridge.unregister_writer();
        if let Err(e) = inner.backend.units_fini() {
            error!(inner.log, "failed to tear down units: {e:?}");
            first.get_or_insert(ChassisError::from(e));
        }
        state.store = None;
        state.applied = None;

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn first_push(
        &self,
        state: &mut ChassisState,
        mapping: ResolvedMapping,
    ) -> ChassisResult<()> {
        let inner = &self.inner;
        let store = ResourceMapStore::build(&inner.log, &mapping, None)?;
        match self.bring_up(&mapping, &store) {
            Ok(updates) => {
                info!(inner.log, "chassis initialized";
                    "units" => mapping.target.chips.len(),
                    "ports" => mapping.target.ports.len());
                state.updates = Some(updates);
                state.store = Some(store);
                state.applied = Some(mapping);
                Ok(())
            }
            Err(e) => {
                error!(inner.log, "chassis bring-up failed: {e:?}");
                Err(inner.unwind(e))
            }
        }
    }

    fn bring_up(
        &self,
        mapping: &ResolvedMapping,
        store: &ResourceMapStore,
    ) -> ChassisResult<UpdateHandler> {
        let inner = &self.inner;
        let backend = &inner.backend;
        for chip in &mapping.target.chips {
            backend.unit_init(chip)?;
        }
        for row in &mapping.target.ports {
            backend.port_init(row)?;
        }
        for flex in mapping.flex_groups.values() {
            inner.set_flex_speed(mapping, flex)?;
        }
        for port in &mapping.ports {
            let admin = store.port_admin_state(port.node, port.id)?;
            backend.port_enable_set(port.sdk_port, admin == AdminState::Enabled)?;
            let loopback = store.port_loopback_state(port.node, port.id)?;
            if loopback != LoopbackState::None {
                backend.port_loopback_set(port.sdk_port, loopback)?;
            }
        }
        init_update_handler(inner)
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&ResourceMapStore) -> ChassisResult<T>,
    ) -> ChassisResult<T> {
        let state = self.inner.state.read();
        state.store.as_ref().ok_or(ChassisError::NotInitialized).and_then(f)
    }

    fn modify<T>(
        &self,
        f: impl FnOnce(&H, &mut ResourceMapStore) -> ChassisResult<T>,
    ) -> ChassisResult<T> {
        let mut state = self.inner.state.write();
        let store = state.store.as_mut().ok_or(ChassisError::NotInitialized)?;
        f(&self.inner.backend, store)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.read().store.is_some()
    }

    /// Hardware events dropped because no configured port matched them.
    pub fn unknown_event_count(&self) -> u64 {
        self.inner.bridge.unknown_events()
    }

    /// Notifications dropped because the registered sink was full.
    pub fn dropped_notification_count(&self) -> u64 {
        self.inner.bridge.dropped_notifications()
    }

    pub fn register_event_writer(&self, writer: Box<dyn EventWriter>) {
        self.inner.bridge.register_writer(writer)
    }

    pub fn unregister_event_writer(&self) {
        self.inner.bridge.unregister_writer()
    }

    pub fn chip(&self, unit: Unit) -> ChassisResult<ChipSpec> {
        self.read(|store| store.chip(unit).cloned())
    }

    pub fn port_by_key(&self, key: PortKey) -> ChassisResult<PortSpec> {
        self.read(|store| store.port_by_key(key).cloned())
    }

    pub fn port(&self, node: NodeId, port: PortId) -> ChassisResult<PortSpec> {
        self.read(|store| store.port(node, port).cloned())
    }

    pub fn node_id_to_unit(&self) -> ChassisResult<BTreeMap<NodeId, Unit>> {
        self.read(|store| Ok(store.node_id_to_unit().clone()))
    }

    /// The unit hosting `node`.
    pub fn unit_from_node_id(&self, node: NodeId) -> ChassisResult<Unit> {
        self.read(|store| {
            store
                .node_id_to_unit()
                .get(&node)
                .copied()
                .ok_or_else(|| ChassisError::Missing(format!("node {node}")))
        })
    }

    pub fn port_id_to_sdk_port_map(
        &self,
        node: NodeId,
    ) -> ChassisResult<BTreeMap<PortId, SdkPort>> {
        self.read(|store| Ok(store.port_id_to_sdk_port_map(node)?.clone()))
    }

    /// All trunks configured on `node`, bound or not.
    pub fn trunk_id_to_sdk_trunk_map(
        &self,
        node: NodeId,
    ) -> ChassisResult<BTreeMap<TrunkId, SdkTrunk>> {
        self.read(|store| Ok(store.trunk_id_to_sdk_trunk_map(node)?.clone()))
    }

    pub fn port_id_to_sdk_port(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<SdkPort> {
        self.read(|store| store.port_id_to_sdk_port(node, port))
    }

    pub fn trunk_id_to_sdk_trunk(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<SdkTrunk> {
        self.read(|store| store.trunk_id_to_sdk_trunk(node, trunk))
    }

    /// Operational state of whatever configured port lives at `sdk_port`.
    pub fn sdk_port_state(&self, sdk_port: SdkPort) -> ChassisResult<PortState> {
        self.read(|store| {
            let (node, port) =
                store.sdk_port_to_port_id(sdk_port).ok_or_else(|| {
                    ChassisError::Missing(format!("sdk port {sdk_port}"))
                })?;
            store.port_oper_state(node, port)
        })
    }

    pub fn port_oper_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<PortState> {
        self.read(|store| store.port_oper_state(node, port))
    }

    pub fn trunk_oper_state(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<PortState> {
        self.read(|store| store.trunk_oper_state(node, trunk))
    }

    pub fn port_admin_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<AdminState> {
        self.read(|store| store.port_admin_state(node, port))
    }

    pub fn port_loopback_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<LoopbackState> {
        self.read(|store| store.port_loopback_state(node, port))
    }

    pub fn port_health_state(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<HealthState> {
        self.read(|store| store.port_health_state(node, port))
    }

    pub fn trunk_members(
        &self,
        node: NodeId,
        trunk: TrunkId,
    ) -> ChassisResult<BTreeSet<PortId>> {
        self.read(|store| store.trunk_members(node, trunk))
    }

    pub fn trunk_member_block_state(
        &self,
        node: NodeId,
        trunk: TrunkId,
        port: PortId,
    ) -> ChassisResult<TrunkMemberBlockState> {
        self.read(|store| store.trunk_member_block_state(node, trunk, port))
    }

    pub fn parent_trunk(
        &self,
        node: NodeId,
        port: PortId,
    ) -> ChassisResult<Option<TrunkId>> {
        self.read(|store| store.parent_trunk(node, port))
    }

    pub fn xcvr_state(&self, group: PortGroupKey) -> ChassisResult<HwState> {
        self.read(|store| store.xcvr_state(group))
    }

    pub fn set_port_admin_state(
        &self,
        node: NodeId,
        port: PortId,
        admin: AdminState,
    ) -> ChassisResult<()> {
        let enabled = match admin {
            AdminState::Enabled => true,
            AdminState::Disabled => false,
            AdminState::Unknown => {
                return Err(ChassisError::Invalid(format!(
                    "no admin state given for port {port} on node {node}"
                )))
            }
        };
        self.modify(|backend, store| {
            let sdk_port = store.port_id_to_sdk_port(node, port)?;
            backend.port_enable_set(sdk_port, enabled)?;
            debug!(self.inner.log, "set admin state";
                "node" => node,
                "port" => port,
                "admin" => %admin);
            store.set_port_admin_state(node, port, admin)
        })
    }

    pub fn set_port_loopback_state(
        &self,
        node: NodeId,
        port: PortId,
        loopback: LoopbackState,
    ) -> ChassisResult<()> {
        if loopback == LoopbackState::Unknown {
            return Err(ChassisError::Invalid(format!(
                "no loopback mode given for port {port} on node {node}"
            )));
        }
        self.modify(|backend, store| {
            let sdk_port = store.port_id_to_sdk_port(node, port)?;
            backend.port_loopback_set(sdk_port, loopback)?;
            store.set_port_loopback_state(node, port, loopback)
        })
    }

    pub fn set_port_health_state(
        &self,
        node: NodeId,
        port: PortId,
        health: HealthState,
    ) -> ChassisResult<()> {
        if health == HealthState::Unknown {
            return Err(ChassisError::Invalid(format!(
                "no health state given for port {port} on node {node}"
            )));
        }
        self.modify(|backend, store| {
            let sdk_port = store.port_id_to_sdk_port(node, port)?;
            backend.port_health_set(sdk_port, health)?;
            store.set_port_health_state(node, port, health)
        })
    }

    /// Block or unblock traffic on one member of a trunk.  The trunk must
    /// have a hardware binding, which it gets once it has members.
    pub fn set_trunk_member_block_state(
        &self,
        node: NodeId,
        trunk: TrunkId,
        port: PortId,
        block: TrunkMemberBlockState,
    ) -> ChassisResult<()> {
        if block == TrunkMemberBlockState::Unknown {
            return Err(ChassisError::Invalid(format!(
                "no block state given for port {port} of trunk {trunk}"
            )));
        }
        self.modify(|backend, store| {
            // Fails unless the port is a member
            store.trunk_member_block_state(node, trunk, port)?;
            let sdk_trunk = store.trunk_id_to_sdk_trunk(node, trunk)?;
            if !sdk_trunk.is_bound() {
                return Err(ChassisError::Invalid(format!(
                    "trunk {trunk} on node {node} has no hardware binding"
                )));
            }
            let member = store.port_id_to_sdk_port(node, port)?;
            backend.trunk_member_block_set(sdk_trunk, member, block)?;
            store.set_trunk_member_block_state(node, trunk, port, block)
        })
    }
}

impl<H: AsicOps> Inner<H> {
    fn resolve(&self, config: &ChassisConfig) -> ChassisResult<ResolvedMapping> {
        let id = &config.capability_map_id;
        if !id.is_empty() && *id != self.capability_map.id {
            return Err(ChassisError::InvalidConfig(format!(
                "config wants capability map {id:?}, but {:?} is loaded",
                self.capability_map.id
            )));
        }
        self.resolver.resolve(&self.capability_map, config)
    }

    /// Program the speed of every active port in a flex group.
    fn set_flex_speed(
        &self,
        mapping: &ResolvedMapping,
        flex: &FlexGroup,
    ) -> ChassisResult<()> {
        for sdk_port in &flex.active {
            let port = mapping
                .ports
                .iter()
                .find(|p| p.sdk_port == *sdk_port)
                .ok_or_else(|| {
                    ChassisError::Internal(format!(
                        "no singleton port behind active flex port {sdk_port}"
                    ))
                })?;
            self.backend.port_speed_set(
                *sdk_port,
                flex.speed_bps,
                port.spec.num_serdes_lanes,
            )?;
        }
        Ok(())
    }

    /// Apply a mapping that differs from the applied one only in port intent
    /// and flex channelization.  The new store is committed only if the
    /// hardware accepted every change.
    fn hot_apply(
        &self,
        state: &mut ChassisState,
        mapping: ResolvedMapping,
    ) -> ChassisResult<()> {
        let (Some(old_store), Some(old_mapping)) =
            (state.store.as_ref(), state.applied.as_ref())
        else {
            return Err(ChassisError::Internal(
                "hot apply without an applied config".into(),
            ));
        };
        let store = ResourceMapStore::build(&self.log, &mapping, Some(old_store))?;
        let backend = &self.backend;

        // Ports that have to be (re)enabled whatever their previous state
        let mut disabled = BTreeSet::new();
        for (group, flex) in &mapping.flex_groups {
            let unchanged = old_mapping.flex_groups.get(group).is_some_and(
                |old| old.speed_bps == flex.speed_bps && old.active == flex.active,
            );
            if unchanged {
                continue;
            }
            debug!(self.log, "re-slicing flex group";
                "group" => %group,
                "speed_bps" => flex.speed_bps,
                "active" => flex.active.len());
            for row in &flex.rows {
                backend.port_enable_set(*row, false)?;
                disabled.insert(*row);
            }
            self.set_flex_speed(&mapping, flex)?;
        }

        // Ports that are no longer configured are left disabled
        for old in &old_mapping.ports {
            if disabled.contains(&old.sdk_port)
                || mapping.ports.iter().any(|p| p.sdk_port == old.sdk_port)
            {
                continue;
            }
            if old_store.port_admin_state(old.node, old.id)?
                == AdminState::Enabled
            {
                backend.port_enable_set(old.sdk_port, false)?;
            }
        }

        for port in &mapping.ports {
            let admin = store.port_admin_state(port.node, port.id)?;
            let loopback = store.port_loopback_state(port.node, port.id)?;
            let old = old_store
                .sdk_port_to_port_id(port.sdk_port)
                .and_then(|(node, id)| {
                    let admin = old_store.port_admin_state(node, id).ok()?;
                    let loopback = old_store.port_loopback_state(node, id).ok()?;
                    Some((admin, loopback))
                });
            let admin_changed = old.map(|(a, _)| a != admin).unwrap_or(true);
            if disabled.contains(&port.sdk_port) || admin_changed {
                backend.port_enable_set(
                    port.sdk_port,
                    admin == AdminState::Enabled,
                )?;
            }
            if old.map(|(_, l)| l != loopback).unwrap_or(true) {
                backend.port_loopback_set(port.sdk_port, loopback)?;
            }
        }

        info!(self.log, "applied config changes";
            "ports" => mapping.ports.len(),
            "trunks" => mapping.trunks.len());
        state.store = Some(store);
        state.applied = Some(mapping);
        Ok(())
    }

    /// Best-effort teardown after a failed bring-up.
    fn unwind(&self, initial: ChassisError) -> ChassisError {
        let mut failure = self.backend.unregister_port_update_handler().err();
        if let Err(e) = self.backend.units_fini() {
            failure.get_or_insert(e);
        }
        match failure {
            None => initial,
            Some(e) => {
                error!(self.log, "unwind failed: {e:?}");
                ChassisError::Unwind {
                    initial: Box::new(initial),
                    unwind: Box::new(e.into()),
                }
            }
        }
    }
}

async fn handle_port_updates<H: AsicOps + 'static>(
    inner: Weak<Inner<H>>,
    log: slog::Logger,
    cancel: Arc<AtomicBool>,
    mut updates: mpsc::Receiver<PortUpdate>,
) {
    while let Some(update) = updates.recv().await {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut state = inner.state.write();
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match state.store.as_mut() {
            Some(store) => inner.bridge.handle_update(store, update),
            None => debug!(log, "dropping {update:?}: no config applied"),
        }
    }
    debug!(log, "port update handler exiting");
}

/// Spawn a task that will receive link update events from the backend, and
/// register its channel.
fn init_update_handler<H: AsicOps + 'static>(
    inner: &Arc<Inner<H>>,
) -> ChassisResult<UpdateHandler> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
        ChassisError::Internal(format!("no runtime for the update handler: {e}"))
    })?;

    let (tx, rx) = mpsc::channel(inner.event_queue_depth);
    let cancel = Arc::new(AtomicBool::new(false));
    let log = inner.log.new(o!("unit" => "callback_handler"));
    runtime.spawn(handle_port_updates(
        Arc::downgrade(inner),
        log,
        cancel.clone(),
        rx,
    ));

    let handler = UpdateHandler { cancel };
    if let Err(e) = inner.backend.register_port_update_handler(tx) {
        handler.cancel();
        return Err(e.into());
    }
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{Node, SingletonPort, TrunkPort, TrunkType};
    use crate::events::{ChangeEvent, Subject};
    use crate::resolver::tests::{config, logger, row, singleton, tomahawk_map};
    use aal::{AsicError, AsicResult, ChipType};
    use asic::stub::{AsicConfig, StubHandle};
    use common::ports::ONE_GIG_BPS;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    mockall::mock! {
        pub Backend {}
        impl AsicOps for Backend {
            fn unit_init(&self, chip: &ChipSpec) -> AsicResult<()>;
            fn port_init(&self, port: &PortSpec) -> AsicResult<()>;
            fn port_speed_set(
                &self,
                port: SdkPort,
                speed_bps: u64,
                num_serdes_lanes: u32,
            ) -> AsicResult<()>;
            fn port_enable_set(
                &self,
                port: SdkPort,
                enabled: bool,
            ) -> AsicResult<()>;
            fn port_loopback_set(
                &self,
                port: SdkPort,
                mode: LoopbackState,
            ) -> AsicResult<()>;
            fn port_health_set(
                &self,
                port: SdkPort,
                health: HealthState,
            ) -> AsicResult<()>;
            fn trunk_member_block_set(
                &self,
                trunk: SdkTrunk,
                member: SdkPort,
                state: TrunkMemberBlockState,
            ) -> AsicResult<()>;
            fn register_port_update_handler(
                &self,
                updates: mpsc::Sender<PortUpdate>,
            ) -> AsicResult<()>;
            fn unregister_port_update_handler(&self) -> AsicResult<()>;
            fn units_fini(&self) -> AsicResult<()>;
        }
    }

    const DEPTH: usize = 64;

    fn stub_manager(map: CapabilityMap) -> ChassisManager<StubHandle> {
        let log = logger();
        let stub = StubHandle::new(&log, &AsicConfig::default()).unwrap();
        ChassisManager::new(&log, stub, map, DEPTH).unwrap()
    }

    fn link(logical_port: u32, state: PortState) -> PortUpdate {
        PortUpdate::LinkState {
            unit: 0,
            logical_port,
            state,
        }
    }

    // Wait for the update handler to catch up with injected events
    async fn settle(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn store_of<H: AsicOps + 'static>(
        mgr: &ChassisManager<H>,
    ) -> Option<ResourceMapStore> {
        mgr.inner.state.read().store.clone()
    }

    fn flex_pair() -> ChassisConfig {
        config(vec![singleton(101, 1, 1, 50), singleton(102, 1, 2, 50)])
    }

    fn with_trunk(mut c: ChassisConfig) -> ChassisConfig {
        c.trunk_ports.push(TrunkPort {
            id: 10,
            name: "trunk10".into(),
            node: 1,
            trunk_type: TrunkType::Static,
            members: vec![101, 102],
        });
        c
    }

    #[tokio::test]
    async fn test_bring_up_calls() {
        let mut mock = MockBackend::new();
        mock.expect_unit_init().times(1).returning(|_| Ok(()));
        mock.expect_port_init().times(5).returning(|_| Ok(()));
        mock.expect_port_speed_set()
            .with(eq(SdkPort::new(0, 1)), eq(100 * ONE_GIG_BPS), eq(4))
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_port_enable_set()
            .with(eq(SdkPort::new(0, 1)), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_port_loopback_set().times(0);
        mock.expect_register_port_update_handler()
            .times(1)
            .returning(|_| Ok(()));

        let mgr =
            ChassisManager::new(&logger(), mock, tomahawk_map(), DEPTH).unwrap();
        let c = config(vec![singleton(100, 1, 0, 100)]);
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::Uninitialized);
        // A second identical push touches nothing
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::NoOp);
        assert!(mgr.is_initialized());
    }

    #[tokio::test]
    async fn test_failed_bring_up_unwinds() {
        let mut mock = MockBackend::new();
        mock.expect_unit_init().times(1).returning(|_| Ok(()));
        mock.expect_port_init()
            .times(1)
            .returning(|_| Err(AsicError::Internal("no serdes".into())));
        mock.expect_register_port_update_handler().times(0);
        mock.expect_unregister_port_update_handler()
            .times(1)
            .returning(|| Ok(()));
        mock.expect_units_fini()
            .times(1)
            .returning(|| Err(AsicError::Internal("unit stuck".into())));

        let mgr =
            ChassisManager::new(&logger(), mock, tomahawk_map(), DEPTH).unwrap();
        let err = mgr
            .push(&config(vec![singleton(100, 1, 0, 100)]))
            .unwrap_err();
        let ChassisError::Unwind { initial, unwind } = err else {
            panic!("expected an unwind error, got {err:?}");
        };
        assert!(matches!(*initial, ChassisError::Asic(AsicError::Internal(_))));
        assert!(unwind.to_string().contains("unit stuck"));
        assert!(!mgr.is_initialized());
        assert!(matches!(
            mgr.port_oper_state(1, 100),
            Err(ChassisError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_failed_bring_up_with_chaos() {
        let log = logger();
        let chaos = asic::chaos::Handle::new(
            &log,
            &asic::chaos::AsicConfig::uniform_init(1.0),
        )
        .unwrap();
        let mgr = ChassisManager::new(&log, chaos, tomahawk_map(), DEPTH).unwrap();
        let c = config(vec![singleton(100, 1, 0, 100)]);
        assert!(matches!(
            mgr.push(&c),
            Err(ChassisError::Asic(AsicError::Synthetic(_)))
        ));
        assert!(!mgr.is_initialized());
        assert!(mgr.backend().stub().units().is_empty());
        assert_eq!(mgr.verify(&c).unwrap(), ChangeClass::Uninitialized);
        mgr.shutdown().unwrap();
        assert!(matches!(
            mgr.port_id_to_sdk_port(1, 100),
            Err(ChassisError::NotInitialized)
        ));
        assert!(matches!(
            mgr.port_oper_state(1, 100),
            Err(ChassisError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_flex_replacement() {
        let mgr = stub_manager(tomahawk_map());
        let c = config(vec![singleton(100, 1, 0, 100)]);
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::Uninitialized);
        assert_eq!(mgr.port_id_to_sdk_port(1, 100).unwrap(), SdkPort::new(0, 1));

        let stub = mgr.backend();
        assert_eq!(stub.units(), vec![0]);
        assert_eq!(stub.port_count(), 5);
        let p = stub.port(SdkPort::new(0, 1)).unwrap();
        assert_eq!(p.speed_bps, 100 * ONE_GIG_BPS);
        assert_eq!(p.num_serdes_lanes, 4);
        assert!(p.enabled);

        assert_eq!(mgr.push(&flex_pair()).unwrap(), ChangeClass::HotApplicable);
        assert!(matches!(
            mgr.port_id_to_sdk_port(1, 100),
            Err(ChassisError::Missing(_))
        ));
        assert_eq!(mgr.port_id_to_sdk_port(1, 101).unwrap(), SdkPort::new(0, 1));
        assert_eq!(mgr.port_id_to_sdk_port(1, 102).unwrap(), SdkPort::new(0, 3));
        assert_eq!(
            mgr.port_id_to_sdk_port_map(1).unwrap(),
            BTreeMap::from([(101, SdkPort::new(0, 1)), (102, SdkPort::new(0, 3))])
        );
        assert!(matches!(
            mgr.port_id_to_sdk_port_map(2),
            Err(ChassisError::Missing(_))
        ));

        for lp in [1, 3] {
            let p = stub.port(SdkPort::new(0, lp)).unwrap();
            assert_eq!(p.speed_bps, 50 * ONE_GIG_BPS);
            assert_eq!(p.num_serdes_lanes, 2);
            assert!(p.enabled);
        }
        assert!(!stub.port(SdkPort::new(0, 2)).unwrap().enabled);
        assert!(!stub.port(SdkPort::new(0, 4)).unwrap().enabled);

        // And back again
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::HotApplicable);
        assert!(!stub.port(SdkPort::new(0, 3)).unwrap().enabled);
        assert_eq!(
            stub.port(SdkPort::new(0, 1)).unwrap().speed_bps,
            100 * ONE_GIG_BPS
        );
    }

    #[tokio::test]
    async fn test_idempotent_push() {
        let mgr = stub_manager(tomahawk_map());
        let c = with_trunk(flex_pair());
        mgr.push(&c).unwrap();
        let before = store_of(&mgr);
        assert_eq!(mgr.verify(&c).unwrap(), ChangeClass::NoOp);
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::NoOp);
        assert_eq!(store_of(&mgr), before);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let mgr = stub_manager(tomahawk_map());
        // Legal before anything was pushed
        mgr.shutdown().unwrap();

        let c = flex_pair();
        mgr.push(&c).unwrap();
        assert!(mgr.backend().has_update_handler());
        mgr.shutdown().unwrap();

        assert!(!mgr.is_initialized());
        assert!(mgr.backend().units().is_empty());
        assert_eq!(mgr.backend().port_count(), 0);
        assert!(!mgr.backend().has_update_handler());
        assert!(matches!(
            mgr.node_id_to_unit(),
            Err(ChassisError::NotInitialized)
        ));
        assert!(matches!(
            mgr.set_port_admin_state(1, 101, AdminState::Disabled),
            Err(ChassisError::NotInitialized)
        ));
        mgr.shutdown().unwrap();

        // The hardware can be brought up again from scratch
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::Uninitialized);
    }

    #[tokio::test]
    async fn test_events_after_reapply() {
        let mgr = stub_manager(tomahawk_map());
        let c = flex_pair();
        mgr.push(&c).unwrap();
        mgr.shutdown().unwrap();
        assert!(mgr.backend().inject(link(1, PortState::Up)).is_err());

        mgr.push(&c).unwrap();
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(16);
        mgr.register_event_writer(Box::new(tx));

        let stub = mgr.backend();
        stub.inject(link(1, PortState::Up)).unwrap();
        stub.inject(link(2, PortState::Up)).unwrap();
        settle(|| mgr.unknown_event_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Each event was handled by exactly one consumer
        assert_eq!(mgr.unknown_event_count(), 1);
        assert_eq!(mgr.port_oper_state(1, 101).unwrap(), PortState::Up);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((event.subject, event.state));
        }
        assert_eq!(events, vec![(Subject::Port(101), PortState::Up)]);
    }

    #[tokio::test]
    async fn test_cancelled_consumer_stops() {
        let mgr = stub_manager(tomahawk_map());
        mgr.push(&flex_pair()).unwrap();
        let before = store_of(&mgr);

        let (tx, rx) = mpsc::channel(4);
        tx.try_send(link(1, PortState::Up)).unwrap();
        tx.try_send(link(2, PortState::Up)).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        tokio::spawn(handle_port_updates(
            Arc::downgrade(&mgr.inner),
            logger(),
            cancel,
            rx,
        ))
        .await
        .unwrap();

        assert!(tx.is_closed());
        assert_eq!(store_of(&mgr), before);
        assert_eq!(mgr.unknown_event_count(), 0);

        // A live consumer applies the same events
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(link(1, PortState::Up)).unwrap();
        tx.try_send(link(2, PortState::Up)).unwrap();
        drop(tx);
        tokio::spawn(handle_port_updates(
            Arc::downgrade(&mgr.inner),
            logger(),
            Arc::new(AtomicBool::new(false)),
            rx,
        ))
        .await
        .unwrap();
        assert_eq!(mgr.port_oper_state(1, 101).unwrap(), PortState::Up);
        assert_eq!(mgr.unknown_event_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_numbering() {
        let mut map = tomahawk_map();
        map.auto_add_logical_ports = true;
        map.ports.iter_mut().for_each(|p| p.logical_port = 0);
        let mgr = stub_manager(map.clone());

        let c = config(vec![singleton(7, 2, 0, 100), singleton(8, 1, 2, 50)]);
        mgr.push(&c).unwrap();
        assert_eq!(mgr.port_id_to_sdk_port(1, 7).unwrap(), SdkPort::new(0, 5));
        assert_eq!(mgr.port_id_to_sdk_port(1, 8).unwrap(), SdkPort::new(0, 3));
        assert_eq!(mgr.port(1, 7).unwrap().port, 2);

        // Explicit numbers are refused when they are assigned automatically
        map.ports[0].logical_port = 9;
        let log = logger();
        let stub = StubHandle::new(&log, &AsicConfig::default()).unwrap();
        assert!(matches!(
            ChassisManager::new(&log, stub, map, DEPTH),
            Err(ChassisError::InvalidCapabilityMap(_))
        ));
    }

    fn two_chip_map() -> CapabilityMap {
        let mut map = tomahawk_map();
        map.chips.push(ChipSpec {
            chip_type: ChipType::Tomahawk,
            unit: 1,
            slot: 2,
            module: 1,
            ..Default::default()
        });
        let mut other = row(1, 0, 100, 1, 1);
        other.slot = 2;
        other.unit = 1;
        other.flex_port = false;
        map.ports.push(other);
        map
    }

    #[tokio::test]
    async fn test_reboot_required_changes_nothing() {
        let mgr = stub_manager(two_chip_map());
        let a = config(vec![singleton(7, 2, 0, 100)]);
        assert_eq!(mgr.push(&a).unwrap(), ChangeClass::Uninitialized);
        let before = store_of(&mgr);

        // Move the node, and its port, onto the other unit
        let mut b = a.clone();
        b.nodes[0] = Node {
            slot: 2,
            ..b.nodes[0].clone()
        };
        b.singleton_ports[0] = SingletonPort {
            slot: 2,
            ..singleton(7, 1, 0, 100)
        };

        let ChangeClass::RebootRequired { reason } = mgr.verify(&b).unwrap()
        else {
            panic!("expected a reboot");
        };
        assert_eq!(reason, "node 1 moves from unit 0 to unit 1");
        let err = mgr.push(&b).unwrap_err();
        assert!(err.is_reboot_required());

        assert_eq!(store_of(&mgr), before);
        assert_eq!(mgr.node_id_to_unit().unwrap(), BTreeMap::from([(1, 0)]));
        assert_eq!(mgr.backend().units(), vec![0]);
        assert_eq!(mgr.port_id_to_sdk_port(1, 7).unwrap(), SdkPort::new(0, 5));
    }

    #[tokio::test]
    async fn test_trunk_aggregation() {
        let mgr = stub_manager(tomahawk_map());
        mgr.push(&with_trunk(flex_pair())).unwrap();
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(16);
        mgr.register_event_writer(Box::new(tx));

        // Members haven't reported yet
        assert_eq!(mgr.trunk_oper_state(1, 10).unwrap(), PortState::Down);
        assert_eq!(mgr.parent_trunk(1, 101).unwrap(), Some(10));
        assert_eq!(mgr.trunk_members(1, 10).unwrap(), BTreeSet::from([101, 102]));

        let stub = mgr.backend();
        stub.inject(link(1, PortState::Up)).unwrap();
        stub.inject(link(3, PortState::Down)).unwrap();
        settle(|| mgr.port_oper_state(1, 102).unwrap() == PortState::Down).await;
        assert_eq!(mgr.trunk_oper_state(1, 10).unwrap(), PortState::Up);

        stub.inject(link(1, PortState::Down)).unwrap();
        settle(|| mgr.port_oper_state(1, 101).unwrap() == PortState::Down).await;
        assert_eq!(mgr.trunk_oper_state(1, 10).unwrap(), PortState::Down);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((event.subject, event.state));
        }
        assert_eq!(
            events,
            vec![
                (Subject::Port(101), PortState::Up),
                (Subject::Trunk(10), PortState::Up),
                (Subject::Port(102), PortState::Down),
                (Subject::Port(101), PortState::Down),
                (Subject::Trunk(10), PortState::Down),
            ]
        );
    }

    #[tokio::test]
    async fn test_node_tables() {
        let mgr = stub_manager(tomahawk_map());
        let mut c = with_trunk(flex_pair());
        c.trunk_ports.push(TrunkPort {
            id: 11,
            name: "trunk11".into(),
            node: 1,
            trunk_type: TrunkType::Static,
            members: vec![],
        });
        mgr.push(&c).unwrap();

        assert_eq!(mgr.unit_from_node_id(1).unwrap(), 0);
        assert!(matches!(
            mgr.unit_from_node_id(2),
            Err(ChassisError::Missing(_))
        ));
        assert_eq!(
            mgr.trunk_id_to_sdk_trunk_map(1).unwrap(),
            BTreeMap::from([
                (10, SdkTrunk::bound(0, 1)),
                (11, SdkTrunk::unbound(0)),
            ])
        );
        assert!(mgr.trunk_id_to_sdk_trunk_map(2).is_err());

        assert_eq!(
            mgr.sdk_port_state(SdkPort::new(0, 3)).unwrap(),
            PortState::Unknown
        );
        mgr.backend().inject(link(3, PortState::Up)).unwrap();
        settle(|| mgr.port_oper_state(1, 102).unwrap() == PortState::Up).await;
        assert_eq!(mgr.sdk_port_state(SdkPort::new(0, 3)).unwrap(), PortState::Up);
        // Brought up as part of the flex group, but not configured
        assert!(matches!(
            mgr.sdk_port_state(SdkPort::new(0, 2)),
            Err(ChassisError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let mgr = stub_manager(tomahawk_map());
        mgr.push(&flex_pair()).unwrap();
        let before = store_of(&mgr);

        // Logical port 2 was brought up, but no singleton port lives there
        mgr.backend().inject(link(2, PortState::Up)).unwrap();
        settle(|| mgr.unknown_event_count() == 1).await;
        assert_eq!(store_of(&mgr), before);
    }

    #[tokio::test]
    async fn test_port_mutators() {
        let mgr = stub_manager(tomahawk_map());
        mgr.push(&with_trunk(flex_pair())).unwrap();
        let stub = mgr.backend();

        mgr.set_port_admin_state(1, 101, AdminState::Disabled).unwrap();
        assert_eq!(mgr.port_admin_state(1, 101).unwrap(), AdminState::Disabled);
        assert!(!stub.port(SdkPort::new(0, 1)).unwrap().enabled);
        assert!(matches!(
            mgr.set_port_admin_state(1, 101, AdminState::Unknown),
            Err(ChassisError::Invalid(_))
        ));

        mgr.set_port_loopback_state(1, 102, LoopbackState::Mac).unwrap();
        assert_eq!(
            stub.port(SdkPort::new(0, 3)).unwrap().loopback,
            LoopbackState::Mac
        );
        mgr.set_port_health_state(1, 102, HealthState::Bad).unwrap();
        assert_eq!(mgr.port_health_state(1, 102).unwrap(), HealthState::Bad);
        assert!(matches!(
            mgr.set_port_health_state(1, 999, HealthState::Good),
            Err(ChassisError::Missing(_))
        ));

        mgr.set_trunk_member_block_state(
            1,
            10,
            102,
            TrunkMemberBlockState::Blocked,
        )
        .unwrap();
        let sdk_trunk = mgr.trunk_id_to_sdk_trunk(1, 10).unwrap();
        assert_eq!(sdk_trunk, SdkTrunk::bound(0, 1));
        assert_eq!(
            stub.trunk_member_block(sdk_trunk, SdkPort::new(0, 3)),
            Some(TrunkMemberBlockState::Blocked)
        );
        assert_eq!(
            mgr.trunk_member_block_state(1, 10, 102).unwrap(),
            TrunkMemberBlockState::Blocked
        );

        // Intent set at run time survives a push that doesn't mention it
        let mut c = with_trunk(flex_pair());
        c.singleton_ports[1].config_params.admin_state = AdminState::Disabled;
        assert_eq!(mgr.push(&c).unwrap(), ChangeClass::HotApplicable);
        assert_eq!(mgr.port_admin_state(1, 101).unwrap(), AdminState::Disabled);
        assert_eq!(
            mgr.port_loopback_state(1, 102).unwrap(),
            LoopbackState::Mac
        );
        assert!(!stub.port(SdkPort::new(0, 3)).unwrap().enabled);
        assert_eq!(mgr.trunk_id_to_sdk_trunk(1, 10).unwrap(), sdk_trunk);
    }

    #[tokio::test]
    async fn test_trunk_member_block_needs_member() {
        let mgr = stub_manager(tomahawk_map());
        let mut c = with_trunk(flex_pair());
        c.trunk_ports[0].members = vec![101];
        mgr.push(&c).unwrap();
        assert!(matches!(
            mgr.set_trunk_member_block_state(
                1,
                10,
                102,
                TrunkMemberBlockState::Blocked
            ),
            Err(ChassisError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_sink_replacement() {
        let mgr = stub_manager(tomahawk_map());
        mgr.push(&flex_pair()).unwrap();

        let (old_tx, old_rx) = mpsc::channel::<ChangeEvent>(4);
        mgr.register_event_writer(Box::new(old_tx));
        let (tx, rx) = tokio::sync::watch::channel(None);
        mgr.register_event_writer(Box::new(tx));
        drop(old_rx);

        mgr.backend().inject(link(3, PortState::Up)).unwrap();
        settle(|| rx.borrow().is_some()).await;
        let event = rx.borrow().clone().unwrap();
        assert_eq!(event.subject, Subject::Port(102));
        assert_eq!(event.node_id, 1);

        // Once the subscriber goes away, so does the registration
        drop(rx);
        mgr.backend().inject(link(3, PortState::Down)).unwrap();
        settle(|| mgr.port_oper_state(1, 102).unwrap() == PortState::Down)
            .await;
        assert!(!mgr.inner.bridge.has_writer());
    }

    #[tokio::test]
    async fn test_transceivers() {
        let mgr = stub_manager(tomahawk_map());
        assert!(matches!(
            mgr.xcvr_state(PortGroupKey::new(1, 1)),
            Err(ChassisError::NotInitialized)
        ));
        mgr.push(&flex_pair()).unwrap();
        let group = PortGroupKey::new(1, 1);
        assert_eq!(mgr.xcvr_state(group).unwrap(), HwState::Unknown);

        mgr.backend()
            .inject(PortUpdate::Presence {
                slot: 1,
                port: 1,
                state: HwState::Present,
            })
            .unwrap();
        settle(|| mgr.xcvr_state(group).unwrap() == HwState::Ready).await;
        assert_eq!(mgr.unknown_event_count(), 0);
    }

    #[test]
    fn test_needs_runtime() {
        // Without a tokio runtime there is nowhere to run the update handler,
        // and the bring-up is rolled back.
        let mgr = stub_manager(tomahawk_map());
        assert!(matches!(
            mgr.push(&flex_pair()),
            Err(ChassisError::Internal(_))
        ));
        assert!(!mgr.is_initialized());
        assert!(mgr.backend().units().is_empty());
    }

    #[test]
    fn test_map_id_mismatch() {
        let mgr = stub_manager(tomahawk_map());
        let mut c = flex_pair();
        c.capability_map_id = "other".into();
        assert!(matches!(mgr.verify(&c), Err(ChassisError::InvalidConfig(_))));
        c.capability_map_id = "test-tomahawk".into();
        assert_eq!(mgr.verify(&c).unwrap(), ChangeClass::Uninitialized);
    }
}
