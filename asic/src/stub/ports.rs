// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use aal::AsicError;
use aal::AsicResult;
use aal::PortSpec;
use aal::PortUpdate;
use aal::SdkPort;
use common::ports::HealthState;
use common::ports::LoopbackState;
use common::ports::PortState;

use crate::stub::StubHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubPort {
    pub spec: PortSpec,
    pub speed_bps: u64,
    pub num_serdes_lanes: u32,
    pub link_up: bool,
    pub enabled: bool,
    pub loopback: LoopbackState,
    pub health: HealthState,
}

fn no_port(port: SdkPort) -> AsicError {
    AsicError::InvalidArg(format!("no such port: {port}"))
}

pub(crate) fn get_port(
    port_state: &BTreeMap<SdkPort, StubPort>,
    port: SdkPort,
) -> AsicResult<&StubPort> {
    port_state.get(&port).ok_or_else(|| no_port(port))
}

fn get_port_mut(
    port_state: &mut BTreeMap<SdkPort, StubPort>,
    port: SdkPort,
) -> AsicResult<&mut StubPort> {
    port_state.get_mut(&port).ok_or_else(|| no_port(port))
}

/// Bring up a port described by a row of the capability map.  The port starts
/// out disabled, with its link down.
pub fn init_port(hdl: &StubHandle, spec: &PortSpec) -> AsicResult<()> {
    if !hdl.units.lock().contains_key(&spec.unit) {
        return Err(AsicError::Uninitialized(format!(
            "unit {} has not been initialized",
            spec.unit
        )));
    }

    let port = spec.sdk_port();
    let mut ports = hdl.ports.lock();
    if ports.contains_key(&port) {
        return Err(AsicError::Exists);
    }
    slog::debug!(hdl.log, "initialized port {}", port; "spec" => %spec);
    ports.insert(
        port,
        StubPort {
            spec: spec.clone(),
            speed_bps: spec.speed_bps,
            num_serdes_lanes: spec.num_serdes_lanes,
            link_up: false,
            enabled: false,
            loopback: LoopbackState::None,
            health: HealthState::Unknown,
        },
    );
    Ok(())
}

pub fn set_speed(
    hdl: &StubHandle,
    port: SdkPort,
    speed_bps: u64,
    num_serdes_lanes: u32,
) -> AsicResult<()> {
    if num_serdes_lanes == 0 || num_serdes_lanes > 4 {
        return Err(AsicError::InvalidArg(format!(
            "{num_serdes_lanes} is not a valid lane count"
        )));
    }
    let mut state = hdl.ports.lock();
    let p = get_port_mut(&mut state, port)?;
    if p.enabled {
        return Err(AsicError::InvalidArg(format!(
            "port {port} must be disabled before changing its speed"
        )));
    }
    p.speed_bps = speed_bps;
    p.num_serdes_lanes = num_serdes_lanes;
    Ok(())
}

pub fn set_enable(
    hdl: &StubHandle,
    port: SdkPort,
    enabled: bool,
) -> AsicResult<()> {
    let link_change = {
        let mut state = hdl.ports.lock();
        let p = get_port_mut(&mut state, port)?;
        p.enabled = enabled;
        if hdl.config.link_follows_enable && p.link_up != enabled {
            p.link_up = enabled;
            true
        } else {
            false
        }
    };

    // When a port is enabled in the stub, it automatically comes online.  If
    // a handler has been registered, it sees the same link event it would
    // see on real hardware.
    if link_change {
        let state = match enabled {
            true => PortState::Up,
            false => PortState::Down,
        };
        let update = PortUpdate::LinkState {
            unit: port.unit,
            logical_port: port.logical_port,
            state,
        };
        if let Err(e) = send_update(hdl, update) {
            slog::debug!(hdl.log, "link event for {port} not delivered: {e}");
        }
    }
    Ok(())
}

pub fn set_loopback(
    hdl: &StubHandle,
    port: SdkPort,
    mode: LoopbackState,
) -> AsicResult<()> {
    if mode == LoopbackState::Unknown {
        return Err(AsicError::InvalidArg(format!(
            "no loopback mode given for port {port}"
        )));
    }
    let mut state = hdl.ports.lock();
    get_port_mut(&mut state, port)?.loopback = mode;
    Ok(())
}

pub fn set_health(
    hdl: &StubHandle,
    port: SdkPort,
    health: HealthState,
) -> AsicResult<()> {
    let mut state = hdl.ports.lock();
    get_port_mut(&mut state, port)?.health = health;
    Ok(())
}

/// Push an event into the registered handler's channel without blocking.
pub fn send_update(hdl: &StubHandle, update: PortUpdate) -> AsicResult<()> {
    let tx = hdl.update_tx.lock();
    match tx.as_ref() {
        Some(tx) => tx.try_send(update).map_err(|e| {
            AsicError::Internal(format!("failed to send {update:?}: {e}"))
        }),
        None => Err(AsicError::Uninitialized(
            "no PortUpdate handler registered".to_string(),
        )),
    }
}
