// Helpers for pulling typed values out of KDL nodes.

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Numeric property; integers are accepted where floats are expected.
pub(crate) fn number_prop(node: &KdlNode, name: &str) -> Option<f64> {
    node.get(name)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
}

pub(crate) fn has_child(node: &KdlNode, name: &str) -> bool {
    node.children()
        .is_some_and(|children| children.nodes().iter().any(|c| c.name().value() == name))
}

/// A positive integer argument that fits in `u32`.
pub(crate) fn u32_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = first_integer_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    u32::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{value} is out of range"),
    })
}
