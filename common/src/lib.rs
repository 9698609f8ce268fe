// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types and helpers shared by every crate in the chassis workspace.

pub mod logging;
pub mod ports;

/// Default depth of the bounded channel carrying hardware events into the
/// chassis manager.
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 1024;
