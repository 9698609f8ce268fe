// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Index of an ASIC within the chassis, assigned densely by the backend.
pub type Unit = u32;

/// The backend's own numeric handle for a port on a unit.
pub type LogicalPort = u32;

/// The backend's numeric handle for a trunk on a unit.
pub type TrunkPort = u32;

/// The logical port reserved for the CPU on every unit.
pub const CPU_LOGICAL_PORT: LogicalPort = 0;

/// Identifies a port as the vendor SDK sees it.
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
)]
pub struct SdkPort {
    pub unit: Unit,
    pub logical_port: LogicalPort,
}

impl SdkPort {
    pub fn new(unit: Unit, logical_port: LogicalPort) -> Self {
        SdkPort { unit, logical_port }
    }

    pub fn is_cpu(&self) -> bool {
        self.logical_port == CPU_LOGICAL_PORT
    }
}

impl fmt::Display for SdkPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.logical_port)
    }
}

impl FromStr for SdkPort {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = "invalid sdk port";

        let (unit, port) = s.split_once(':').ok_or(err)?;
        let unit = unit.parse::<Unit>().map_err(|_| err)?;
        let logical_port = port.parse::<LogicalPort>().map_err(|_| err)?;
        Ok(SdkPort { unit, logical_port })
    }
}

/// Identifies a trunk as the vendor SDK sees it.  A trunk is created on its
/// unit as soon as it is configured, but it is only bound to a hardware trunk
/// number once it has at least one member.
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
)]
pub struct SdkTrunk {
    pub unit: Unit,
    pub trunk_port: Option<TrunkPort>,
}

impl SdkTrunk {
    pub fn unbound(unit: Unit) -> Self {
        SdkTrunk {
            unit,
            trunk_port: None,
        }
    }

    pub fn bound(unit: Unit, trunk_port: TrunkPort) -> Self {
        SdkTrunk {
            unit,
            trunk_port: Some(trunk_port),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.trunk_port.is_some()
    }
}

impl fmt::Display for SdkTrunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.trunk_port {
            Some(t) => write!(f, "{}:trunk{}", self.unit, t),
            None => write!(f, "{}:trunk(unbound)", self.unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdk_port_parse() {
        let p: SdkPort = "1:34".parse().unwrap();
        assert_eq!(p, SdkPort::new(1, 34));
        assert_eq!(p.to_string(), "1:34");
        assert!("1".parse::<SdkPort>().is_err());
        assert!("a:2".parse::<SdkPort>().is_err());
        assert!(SdkPort::new(0, CPU_LOGICAL_PORT).is_cpu());
    }

    #[test]
    fn test_sdk_trunk_binding() {
        let t = SdkTrunk::unbound(2);
        assert!(!t.is_bound());
        assert_eq!(t.to_string(), "2:trunk(unbound)");
        let t = SdkTrunk::bound(2, 7);
        assert!(t.is_bound());
        assert_eq!(t.to_string(), "2:trunk7");
    }
}
