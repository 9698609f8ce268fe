// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Hardware events in, change notifications out.
//!
//! The bridge turns each PortUpdate from the ASIC layer into a state change
//! in the store, and forwards every resulting port or trunk state change to
//! the one registered notification sink.  Nothing here ever blocks: events
//! for unknown ports are counted and dropped, as are notifications a slow
//! subscriber has no room for.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use tokio::sync::mpsc;
use tokio::sync::watch;

use aal::PortGroupKey;
use aal::PortUpdate;
use aal::SdkPort;
use common::ports::PortState;

use crate::store::ResourceMapStore;
use crate::types::NodeId;
use crate::types::PortId;
use crate::types::TrunkId;

/// What a change notification is about.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Port(PortId),
    Trunk(TrunkId),
}

/// A change in the operational state of a port or trunk.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub node_id: NodeId,
    pub subject: Subject,
    pub state: PortState,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(node_id: NodeId, subject: Subject, state: PortState) -> Self {
        ChangeEvent {
            node_id,
            subject,
            state,
            timestamp: Utc::now(),
        }
    }
}

/// The outcome of handing a notification to a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    Written,
    /// The sink had no room, and the notification was lost.
    Dropped,
    /// Nobody is listening any more.
    Closed,
}

/// A destination for change notifications.  Writing must never block.
pub trait EventWriter: Send + Sync {
    fn write(&self, event: &ChangeEvent) -> WriteResult;
}

/// A bounded queue.  When it is full, new notifications are dropped.
impl EventWriter for mpsc::Sender<ChangeEvent> {
    fn write(&self, event: &ChangeEvent) -> WriteResult {
        match self.try_send(event.clone()) {
            Ok(()) => WriteResult::Written,
            Err(mpsc::error::TrySendError::Full(_)) => WriteResult::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => WriteResult::Closed,
        }
    }
}

/// A single slot.  The newest notification replaces any the subscriber has
/// not yet seen.
impl EventWriter for watch::Sender<Option<ChangeEvent>> {
    fn write(&self, event: &ChangeEvent) -> WriteResult {
        if self.is_closed() {
            return WriteResult::Closed;
        }
        self.send_replace(Some(event.clone()));
        WriteResult::Written
    }
}

pub struct EventBridge {
    log: slog::Logger,
    writer: Mutex<Option<Box<dyn EventWriter>>>,
    unknown_events: AtomicU64,
    dropped_notifications: AtomicU64,
}

impl EventBridge {
    pub fn new(log: &slog::Logger) -> Self {
        EventBridge {
            log: log.new(o!("unit" => "event_bridge")),
            writer: Mutex::new(None),
            unknown_events: AtomicU64::new(0),
            dropped_notifications: AtomicU64::new(0),
        }
    }

    /// Install `writer` as the notification sink, replacing any existing one.
    pub fn register_writer(&self, writer: Box<dyn EventWriter>) {
        if self.writer.lock().replace(writer).is_some() {
            info!(self.log, "replaced event writer");
        }
    }

    pub fn unregister_writer(&self) {
        let _ = self.writer.lock().take();
    }

    pub fn has_writer(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Number of hardware events that didn't match any configured port.
    pub fn unknown_events(&self) -> u64 {
        self.unknown_events.load(Ordering::Relaxed)
    }

    /// Number of notifications lost to a full sink.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    pub fn publish(&self, events: &[ChangeEvent]) {
        let mut writer = self.writer.lock();
        let Some(w) = writer.as_ref() else {
            return;
        };
        for event in events {
            match w.write(event) {
                WriteResult::Written => {}
                WriteResult::Dropped => {
                    self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                    debug!(self.log, "dropped notification";
                        "event" => ?event);
                }
                WriteResult::Closed => {
                    info!(self.log, "event writer closed, unregistering");
                    *writer = None;
                    return;
                }
            }
        }
    }

    /// Apply one hardware event to `store`, and notify the subscriber of any
    /// state that changed as a result.
    pub fn handle_update(&self, store: &mut ResourceMapStore, update: PortUpdate) {
        match update {
            PortUpdate::LinkState {
                unit,
                logical_port,
                state,
            } => {
                let sdk_port = SdkPort::new(unit, logical_port);
                match store.apply_link_state(sdk_port, state) {
                    None => {
                        self.unknown_events.fetch_add(1, Ordering::Relaxed);
                        warn!(self.log, "link event for unknown port";
                            "sdk_port" => %sdk_port,
                            "state" => %state);
                    }
                    Some(changes) => {
                        debug!(self.log, "link update";
                            "sdk_port" => %sdk_port,
                            "state" => %state,
                            "changes" => changes.len());
                        self.publish(&changes);
                    }
                }
            }
            PortUpdate::Presence { slot, port, state } => {
                let group = PortGroupKey::new(slot, port);
                match store.apply_presence(group, state) {
                    Ok(Some(new)) => {
                        debug!(self.log, "transceiver update";
                            "group" => %group,
                            "state" => %new);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(self.log, "ignoring transceiver event";
                            "group" => %group,
                            "error" => %e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrunkPort, TrunkType};
    use crate::resolver::tests::{config, logger, singleton, tomahawk_map};
    use crate::resolver::PortResolver;
    use common::ports::HwState;

    fn store() -> ResourceMapStore {
        let log = logger();
        let mut c =
            config(vec![singleton(101, 1, 1, 50), singleton(102, 1, 2, 50)]);
        c.trunk_ports.push(TrunkPort {
            id: 10,
            node: 1,
            trunk_type: TrunkType::Static,
            members: vec![101, 102],
            ..Default::default()
        });
        let mapping =
            PortResolver::new(&log).resolve(&tomahawk_map(), &c).unwrap();
        ResourceMapStore::build(&log, &mapping, None).unwrap()
    }

    fn link(logical_port: u32, state: PortState) -> PortUpdate {
        PortUpdate::LinkState {
            unit: 0,
            logical_port,
            state,
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ChangeEvent::new(1, Subject::Trunk(10), PortState::Up);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["subject"], serde_json::json!({"trunk": 10}));
        assert_eq!(json["state"], "up");
        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unknown_event() {
        let bridge = EventBridge::new(&logger());
        let mut store = store();
        let before = store.clone();

        bridge.handle_update(&mut store, link(2, PortState::Up));
        bridge.handle_update(
            &mut store,
            PortUpdate::LinkState {
                unit: 5,
                logical_port: 1,
                state: PortState::Up,
            },
        );
        assert_eq!(bridge.unknown_events(), 2);
        assert_eq!(store, before);
    }

    #[test]
    fn test_mpsc_writer() {
        let bridge = EventBridge::new(&logger());
        let mut store = store();
        let (tx, mut rx) = mpsc::channel(2);
        bridge.register_writer(Box::new(tx));

        bridge.handle_update(&mut store, link(1, PortState::Up));
        let port = rx.try_recv().unwrap();
        assert_eq!(port.subject, Subject::Port(101));
        assert_eq!(port.state, PortState::Up);
        let trunk = rx.try_recv().unwrap();
        assert_eq!(trunk.subject, Subject::Trunk(10));
        assert_eq!(trunk.state, PortState::Up);

        // Fill the queue, and overflow it by one
        bridge.handle_update(&mut store, link(3, PortState::Down));
        bridge.handle_update(&mut store, link(3, PortState::Up));
        bridge.handle_update(&mut store, link(3, PortState::Down));
        assert_eq!(bridge.dropped_notifications(), 1);
        assert!(bridge.has_writer());

        // A closed queue unregisters itself
        drop(rx);
        bridge.handle_update(&mut store, link(1, PortState::Down));
        assert!(!bridge.has_writer());
    }

    #[test]
    fn test_watch_writer_keeps_newest() {
        let bridge = EventBridge::new(&logger());
        let mut store = store();
        let (tx, rx) = watch::channel(None);
        bridge.register_writer(Box::new(tx));

        bridge.handle_update(&mut store, link(3, PortState::Down));
        bridge.handle_update(&mut store, link(3, PortState::Up));
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.subject, Subject::Trunk(10));
        assert_eq!(latest.state, PortState::Up);
        assert_eq!(bridge.dropped_notifications(), 0);
    }

    #[test]
    fn test_writer_replacement() {
        let bridge = EventBridge::new(&logger());
        let mut store = store();
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);
        bridge.register_writer(Box::new(old_tx));
        bridge.register_writer(Box::new(new_tx));

        bridge.handle_update(&mut store, link(1, PortState::Up));
        assert!(new_rx.try_recv().is_ok());
        // The replaced sender was dropped along with its registration
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        bridge.unregister_writer();
        bridge.handle_update(&mut store, link(1, PortState::Down));
        assert!(new_rx.try_recv().is_err());
    }

    #[test]
    fn test_presence() {
        let bridge = EventBridge::new(&logger());
        let mut store = store();
        bridge.handle_update(
            &mut store,
            PortUpdate::Presence {
                slot: 1,
                port: 1,
                state: HwState::Present,
            },
        );
        assert_eq!(
            store.xcvr_state(PortGroupKey::new(1, 1)).unwrap(),
            HwState::Ready
        );
        // Presence events never count as unknown
        assert_eq!(bridge.unknown_events(), 0);
    }
}
