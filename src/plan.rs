//! Planning for resource changes.
//!
//! Works on raw msgpack values so that unknown values coming from the
//! configuration survive into the planned state untouched.

use tracing::debug;

use crate::plugin::codec::{get_attr, is_null, is_unknown, json_to_rmpv, set_attr, unknown};
use crate::schema::Block;

/// What the host should do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Replace,
    Delete,
    NoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub action: Action,
    pub planned_state: rmpv::Value,
    /// Attributes whose change forces replacement.
    pub requires_replace: Vec<String>,
}

/// Compute the planned state for a resource.
pub fn plan_change(
    block: &Block,
    prior: &rmpv::Value,
    proposed: &rmpv::Value,
    config: &rmpv::Value,
) -> PlannedChange {
    if is_null(proposed) {
        return PlannedChange {
            action: if is_null(prior) {
                Action::NoOp
            } else {
                Action::Delete
            },
            planned_state: rmpv::Value::Nil,
            requires_replace: vec![],
        };
    }

    let mut planned = proposed.clone();
    apply_defaults(block, config, &mut planned);
    drop_empty_collections(block, &mut planned);

    if is_null(prior) {
        mark_unknown(block, &mut planned, |attr| attr.computed);
        return PlannedChange {
            action: Action::Create,
            planned_state: planned,
            requires_replace: vec![],
        };
    }

    let requires_replace: Vec<String> = block
        .attributes
        .iter()
        .filter(|attr| attr.force_new)
        .filter(|attr| {
            let before = get_attr(prior, attr.name).unwrap_or(&rmpv::Value::Nil);
            let after = get_attr(&planned, attr.name).unwrap_or(&rmpv::Value::Nil);
            is_unknown(after) || !same_value(before, after)
        })
        .map(|attr| attr.name.to_string())
        .collect();

    let action = if !requires_replace.is_empty() {
        debug!(?requires_replace, "Change forces replacement");
        // The replacement is a new object; nothing it computes is known yet.
        for attr in block.attributes.iter().filter(|a| a.is_computed_only()) {
            set_attr(&mut planned, attr.name, unknown());
        }
        Action::Replace
    } else if same_value(prior, &planned) {
        Action::NoOp
    } else {
        Action::Update
    };

    PlannedChange {
        action,
        planned_state: planned,
        requires_replace,
    }
}

/// Plan the schema default for every attribute the configuration leaves unset.
fn apply_defaults(block: &Block, config: &rmpv::Value, planned: &mut rmpv::Value) {
    for attr in &block.attributes {
        let Some(default) = &attr.default else {
            continue;
        };
        let configured = get_attr(config, attr.name).unwrap_or(&rmpv::Value::Nil);
        if is_null(configured) {
            set_attr(planned, attr.name, json_to_rmpv(default));
        }
    }
}

/// Empty collections are planned as null, matching how state stores them.
fn drop_empty_collections(block: &Block, planned: &mut rmpv::Value) {
    for attr in block.attributes.iter().filter(|a| a.ty.is_collection() && !a.computed) {
        let empty = match get_attr(planned, attr.name) {
            Some(rmpv::Value::Array(items)) => items.is_empty(),
            Some(rmpv::Value::Map(entries)) => entries.is_empty(),
            _ => false,
        };
        if empty {
            set_attr(planned, attr.name, rmpv::Value::Nil);
        }
    }
}

/// Mark null attributes selected by `select` as known after apply.
fn mark_unknown(
    block: &Block,
    planned: &mut rmpv::Value,
    select: impl Fn(&crate::schema::Attribute) -> bool,
) {
    for attr in block.attributes.iter().filter(|a| select(a)) {
        let current = get_attr(planned, attr.name).unwrap_or(&rmpv::Value::Nil);
        if is_null(current) {
            set_attr(planned, attr.name, unknown());
        }
    }
}

/// Value equality that ignores element order of arrays of scalars and
/// treats an empty collection like null.
fn same_value(a: &rmpv::Value, b: &rmpv::Value) -> bool {
    match (a, b) {
        (rmpv::Value::Nil, rmpv::Value::Array(items))
        | (rmpv::Value::Array(items), rmpv::Value::Nil) => items.is_empty(),
        (rmpv::Value::Array(x), rmpv::Value::Array(y)) => {
            x.len() == y.len() && x.iter().all(|item| y.contains(item))
        }
        (rmpv::Value::Map(x), rmpv::Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .find(|(k2, _)| k2 == k)
                        .is_some_and(|(_, v2)| same_value(v, v2))
                })
        }
        _ => a == b,
    }
}
