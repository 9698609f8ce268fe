// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Classification of a new mapping against the applied one.
//!
//! Anything that changes which hardware is brought up, or how it is carved
//! into logical ports, needs a restart.  Everything else is port and trunk
//! intent, or a flex re-slice within lanes that are already up, and can be
//! applied in place.

use std::collections::BTreeSet;

use aal::CapabilityMap;
use aal::PortSpec;
use aal::Unit;

use crate::resolver::ResolvedMapping;
use crate::types::ChangeClass;

pub fn classify(
    applied: Option<&ResolvedMapping>,
    next: &ResolvedMapping,
) -> ChangeClass {
    let Some(applied) = applied else {
        return ChangeClass::Uninitialized;
    };
    if applied == next {
        return ChangeClass::NoOp;
    }
    match reboot_reason(applied, next) {
        Some(reason) => ChangeClass::RebootRequired { reason },
        None => ChangeClass::HotApplicable,
    }
}

fn reboot_reason(
    applied: &ResolvedMapping,
    next: &ResolvedMapping,
) -> Option<String> {
    let nodes: BTreeSet<_> = applied
        .node_id_to_unit
        .keys()
        .chain(next.node_id_to_unit.keys())
        .collect();
    for node in nodes {
        let old = applied.node_id_to_unit.get(node);
        let new = next.node_id_to_unit.get(node);
        match (old, new) {
            (Some(old), Some(new)) if old != new => {
                return Some(format!(
                    "node {node} moves from unit {old} to unit {new}"
                ))
            }
            (Some(old), None) => {
                return Some(format!("node {node} on unit {old} is removed"))
            }
            (None, Some(new)) => {
                return Some(format!("node {node} is added on unit {new}"))
            }
            _ => {}
        }
    }

    target_reason(&applied.target, &next.target).or_else(|| {
        let old: BTreeSet<_> = applied.flex_groups.keys().collect();
        let new: BTreeSet<_> = next.flex_groups.keys().collect();
        (old != new).then(|| {
            format!("flex groups change from {old:?} to {new:?}")
        })
    })
}

fn target_reason(old: &CapabilityMap, new: &CapabilityMap) -> Option<String> {
    if old.id != new.id {
        return Some(format!(
            "capability map changes from {:?} to {:?}",
            old.id, new.id
        ));
    }
    if old.auto_add_logical_ports != new.auto_add_logical_ports {
        return Some("auto_add_logical_ports changes".to_string());
    }
    if old.auto_add_slot != new.auto_add_slot {
        return Some("auto_add_slot changes".to_string());
    }
    if old.chips != new.chips {
        let units = |map: &CapabilityMap| -> Vec<Unit> {
            map.chips.iter().map(|c| c.unit).collect()
        };
        return Some(format!(
            "chips change from units {:?} to units {:?}",
            units(old),
            units(new)
        ));
    }

    let units: BTreeSet<Unit> = old
        .ports
        .iter()
        .chain(new.ports.iter())
        .map(|p| p.unit)
        .collect();
    for unit in units {
        let rows = |map: &'_ CapabilityMap| -> Vec<PortSpec> {
            map.ports.iter().filter(|p| p.unit == unit).cloned().collect()
        };
        let (old_rows, new_rows) = (rows(old), rows(new));
        if old_rows != new_rows {
            let changed = old_rows
                .iter()
                .filter(|r| !new_rows.contains(r))
                .chain(new_rows.iter().filter(|r| !old_rows.contains(r)))
                .map(|r| r.key().to_string())
                .collect::<BTreeSet<_>>();
            return Some(format!(
                "ports on unit {unit} change at {}",
                changed.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::{config, logger, singleton, tomahawk_map};
    use crate::resolver::PortResolver;
    use aal::{ChipSpec, ChipType};
    use common::ports::AdminState;
    use pretty_assertions::assert_eq;

    fn resolve(c: &crate::config::ChassisConfig) -> ResolvedMapping {
        PortResolver::new(&logger()).resolve(&tomahawk_map(), c).unwrap()
    }

    #[test]
    fn test_uninitialized_and_noop() {
        let m = resolve(&config(vec![singleton(100, 1, 0, 100)]));
        assert_eq!(classify(None, &m), ChangeClass::Uninitialized);
        assert_eq!(classify(Some(&m), &m.clone()), ChangeClass::NoOp);
    }

    #[test]
    fn test_port_order_is_irrelevant() {
        let a = resolve(&config(vec![
            singleton(101, 1, 1, 50),
            singleton(102, 1, 2, 50),
        ]));
        let b = resolve(&config(vec![
            singleton(102, 1, 2, 50),
            singleton(101, 1, 1, 50),
        ]));
        assert_eq!(classify(Some(&a), &b), ChangeClass::NoOp);
    }

    #[test]
    fn test_hot_changes() {
        let a = resolve(&config(vec![singleton(100, 1, 0, 100)]));

        // Re-slice the flex group
        let b = resolve(&config(vec![
            singleton(101, 1, 1, 50),
            singleton(102, 1, 2, 50),
        ]));
        assert_eq!(classify(Some(&a), &b), ChangeClass::HotApplicable);

        // Change the intent of a port
        let mut c = config(vec![singleton(100, 1, 0, 100)]);
        c.singleton_ports[0].config_params.admin_state = AdminState::Disabled;
        let c = resolve(&c);
        assert_eq!(classify(Some(&a), &c), ChangeClass::HotApplicable);
    }

    #[test]
    fn test_reboot_on_new_rows() {
        let a = resolve(&config(vec![singleton(100, 1, 0, 100)]));
        let b = resolve(&config(vec![
            singleton(100, 1, 0, 100),
            singleton(7, 2, 0, 100),
        ]));
        let ChangeClass::RebootRequired { reason } = classify(Some(&a), &b)
        else {
            panic!("expected a reboot");
        };
        assert!(reason.contains("ports on unit 0 change at 1/2/0"), "{reason}");
    }

    #[test]
    fn test_reboot_on_unit_change() {
        let a = resolve(&config(vec![singleton(100, 1, 0, 100)]));
        let mut b = a.clone();
        b.node_id_to_unit.insert(1, 1);
        b.target.chips.push(ChipSpec {
            chip_type: ChipType::Tomahawk,
            unit: 1,
            ..Default::default()
        });
        let ChangeClass::RebootRequired { reason } = classify(Some(&a), &b)
        else {
            panic!("expected a reboot");
        };
        assert_eq!(reason, "node 1 moves from unit 0 to unit 1");

        let mut c = a.clone();
        c.target.id = "other".into();
        assert!(matches!(
            classify(Some(&a), &c),
            ChangeClass::RebootRequired { .. }
        ));
    }
}
