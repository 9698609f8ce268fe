// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The declarative chassis configuration pushed by an operator: the nodes of
//! the chassis, the singleton ports that should exist, and the trunks built
//! from them.

use std::path::Path;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use aal::ChipType;
use aal::PortKey;
use common::ports::AdminState;
use common::ports::LoopbackState;

use crate::types::ChassisResult;
use crate::types::NodeId;
use crate::types::PortId;
use crate::types::TrunkId;

/// The hardware platform a configuration is written for.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    #[default]
    Unknown,
    GenericTridentPlus,
    GenericTrident2,
    GenericTomahawk,
    GenericTofino,
}

impl Platform {
    /// Chip families that may appear in a chassis of this platform.
    pub fn supported_chip_types(&self) -> &'static [ChipType] {
        match self {
            Platform::Unknown => &[],
            Platform::GenericTridentPlus => &[ChipType::TridentPlus],
            Platform::GenericTrident2 => &[ChipType::Trident2],
            Platform::GenericTomahawk => &[ChipType::Tomahawk],
            Platform::GenericTofino => &[ChipType::Tofino],
        }
    }

    pub fn supports(&self, chip_type: ChipType) -> bool {
        self.supported_chip_types().contains(&chip_type)
    }
}

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct Chassis {
    pub name: String,
    pub platform: Platform,
}

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub slot: i32,
    pub index: i32,
}

/// Per-port intent.  Anything left `Unknown` keeps its previous value, or
/// falls back to the default for a new port.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(default)]
pub struct PortConfigParams {
    pub admin_state: AdminState,
    pub loopback_mode: LoopbackState,
}

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct SingletonPort {
    pub id: PortId,
    pub name: String,
    pub node: NodeId,
    pub slot: i32,
    pub port: i32,
    pub channel: i32,
    pub speed_bps: u64,
    pub config_params: PortConfigParams,
}

impl SingletonPort {
    pub fn key(&self) -> PortKey {
        PortKey::new(self.slot, self.port, self.channel)
    }
}

impl std::fmt::Display for SingletonPort {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(id: {}, name: {:?}, node: {}, slot: {}, port: {}, channel: {}, \
             speed_bps: {})",
            self.id,
            self.name,
            self.node,
            self.slot,
            self.port,
            self.channel,
            self.speed_bps
        )
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrunkType {
    #[default]
    Unknown,
    /// Members are listed in the configuration.
    Static,
    /// Members are negotiated at run time.
    Lacp,
}

#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct TrunkPort {
    pub id: TrunkId,
    pub name: String,
    pub node: NodeId,
    pub trunk_type: TrunkType,
    pub members: Vec<PortId>,
}

impl std::fmt::Display for TrunkPort {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(id: {}, name: {:?}, node: {}, type: {}, members: {:?})",
            self.id, self.name, self.node, self.trunk_type, self.members
        )
    }
}

/// A complete chassis configuration.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(default)]
pub struct ChassisConfig {
    pub description: String,
    /// Selects one map out of a capability map file.  When empty, the first
    /// map in the file is used.
    pub capability_map_id: String,
    pub chassis: Chassis,
    pub nodes: Vec<Node>,
    pub singleton_ports: Vec<SingletonPort>,
    pub trunk_ports: Vec<TrunkPort>,
}

impl ChassisConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ChassisResult<Self> {
        load_file(path.as_ref())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Read a structure from a file.  Files ending in `.json` are parsed as JSON,
/// everything else as TOML.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> ChassisResult<T> {
    let contents = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        Ok(serde_json::from_str(&contents)?)
    } else {
        Ok(toml::from_str(&contents)?)
    }
}
