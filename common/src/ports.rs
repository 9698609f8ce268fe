// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Speeds and the various per-port state enums tracked by the chassis manager.

use std::convert::TryFrom;
use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// One gigabit per second, the granularity of every supported speed.
pub const ONE_GIG_BPS: u64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SpeedError {
    #[error("{0} bps is not a whole number of Gbps")]
    NotGbps(u64),
    #[error("unsupported port speed: {0} Gbps")]
    Unsupported(u64),
}

/// The set of port speeds a singleton port may request.
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
    strum::EnumIter,
)]
pub enum PortSpeed {
    #[serde(rename = "1G")]
    Speed1G,
    #[serde(rename = "10G")]
    Speed10G,
    #[serde(rename = "20G")]
    Speed20G,
    #[serde(rename = "25G")]
    Speed25G,
    #[serde(rename = "40G")]
    Speed40G,
    #[serde(rename = "50G")]
    Speed50G,
    #[serde(rename = "100G")]
    Speed100G,
    #[serde(rename = "200G")]
    Speed200G,
    #[serde(rename = "400G")]
    Speed400G,
}

impl PortSpeed {
    pub fn gbps(&self) -> u64 {
        match self {
            PortSpeed::Speed1G => 1,
            PortSpeed::Speed10G => 10,
            PortSpeed::Speed20G => 20,
            PortSpeed::Speed25G => 25,
            PortSpeed::Speed40G => 40,
            PortSpeed::Speed50G => 50,
            PortSpeed::Speed100G => 100,
            PortSpeed::Speed200G => 200,
            PortSpeed::Speed400G => 400,
        }
    }

    pub fn bps(&self) -> u64 {
        self.gbps() * ONE_GIG_BPS
    }

    /// The channels of a physical port on which a link of this speed may be
    /// carved out.  Channel 0 is the unchannelized port.
    pub fn valid_channels(&self) -> &'static [i32] {
        match self {
            PortSpeed::Speed1G
            | PortSpeed::Speed40G
            | PortSpeed::Speed100G
            | PortSpeed::Speed200G
            | PortSpeed::Speed400G => &[0],
            PortSpeed::Speed20G | PortSpeed::Speed50G => &[1, 2],
            PortSpeed::Speed10G | PortSpeed::Speed25G => &[1, 2, 3, 4],
        }
    }
}

impl fmt::Display for PortSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}G", self.gbps())
    }
}

impl TryFrom<u64> for PortSpeed {
    type Error = SpeedError;

    fn try_from(bps: u64) -> Result<Self, Self::Error> {
        if bps == 0 || bps % ONE_GIG_BPS != 0 {
            return Err(SpeedError::NotGbps(bps));
        }
        match bps / ONE_GIG_BPS {
            1 => Ok(PortSpeed::Speed1G),
            10 => Ok(PortSpeed::Speed10G),
            20 => Ok(PortSpeed::Speed20G),
            25 => Ok(PortSpeed::Speed25G),
            40 => Ok(PortSpeed::Speed40G),
            50 => Ok(PortSpeed::Speed50G),
            100 => Ok(PortSpeed::Speed100G),
            200 => Ok(PortSpeed::Speed200G),
            400 => Ok(PortSpeed::Speed400G),
            x => Err(SpeedError::Unsupported(x)),
        }
    }
}

/// Operational state of a port or trunk.
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
pub enum PortState {
    #[default]
    Unknown,
    Up,
    Down,
    Failed,
}

/// The administrator's intent for a port.
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
pub enum AdminState {
    /// No intent was expressed.
    #[default]
    Unknown,
    Enabled,
    Disabled,
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
pub enum LoopbackState {
    #[default]
    Unknown,
    None,
    Mac,
    Phy,
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
pub enum HealthState {
    #[default]
    Unknown,
    Good,
    Bad,
}

/// Whether a trunk member is allowed to carry traffic.
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
pub enum TrunkMemberBlockState {
    #[default]
    Unknown,
    Forwarding,
    Blocked,
}

/// Presence and readiness of the transceiver plugged into a front-panel port.
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
pub enum HwState {
    #[default]
    Unknown,
    NotPresent,
    Present,
    Configured,
    Ready,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_speed_conversion() {
        for speed in PortSpeed::iter() {
            assert_eq!(PortSpeed::try_from(speed.bps()), Ok(speed));
        }
        assert_eq!(
            PortSpeed::try_from(1_500_000_000),
            Err(SpeedError::NotGbps(1_500_000_000))
        );
        assert_eq!(
            PortSpeed::try_from(30 * ONE_GIG_BPS),
            Err(SpeedError::Unsupported(30))
        );
        assert!(PortSpeed::try_from(0).is_err());
    }

    #[test]
    fn test_valid_channels() {
        assert_eq!(PortSpeed::Speed100G.valid_channels(), &[0]);
        assert_eq!(PortSpeed::Speed50G.valid_channels(), &[1, 2]);
        assert!(PortSpeed::Speed25G.valid_channels().contains(&4));
        assert!(!PortSpeed::Speed40G.valid_channels().contains(&1));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PortState::Up.to_string(), "up");
        assert_eq!(HwState::NotPresent.to_string(), "not_present");
        assert_eq!(PortSpeed::Speed25G.to_string(), "25G");
    }
}
