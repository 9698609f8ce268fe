// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Reconciles a declarative chassis configuration against the capability map
//! of a switch, brings up the hardware it describes through an [`AsicOps`]
//! backend, and keeps the resulting resource maps current as hardware events
//! arrive.
//!
//! [`AsicOps`]: aal::AsicOps

pub mod capability;
pub mod config;
pub mod differ;
pub mod events;
mod freemap;
pub mod manager;
pub mod resolver;
pub mod store;
pub mod types;

pub use capability::CapabilityMapList;
pub use config::ChassisConfig;
pub use events::ChangeEvent;
pub use events::EventWriter;
pub use events::Subject;
pub use manager::ChassisManager;
pub use types::ChangeClass;
pub use types::ChassisError;
pub use types::ChassisResult;
