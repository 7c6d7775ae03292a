//! Typed operator configuration parsed from the string parameter map.

use std::fmt::Debug;

use crate::types::{OpError, ParamMap};

/// Documentation and default for one configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub name:        &'static str,
    pub type_info:   &'static str,
    /// `None` marks a required field
    pub default:     Option<&'static str>,
    pub description: &'static str,
}

/// Immutable, typed configuration of one operator instance.
///
/// Built once from a [`ParamMap`] and never mutated, so kernels may read it
/// from any thread.
pub trait OpParam: Clone + Debug + PartialEq + Send + Sync + Sized + 'static {
    /// Declared fields, in declaration order
    const FIELDS: &'static [FieldInfo];

    /// Parse from string form. Unknown keys, missing required fields and
    /// malformed literals are all parse errors.
    fn init(op: &'static str, kwargs: &ParamMap) -> Result<Self, OpError>;

    /// Serialize back to string form; `init(op, &p.to_map())` reproduces `p`.
    fn to_map(&self) -> ParamMap;
}

/// Reject keys that no field declares
pub fn reject_unknown(op: &'static str, fields: &[FieldInfo], kwargs: &ParamMap) -> Result<(), OpError> {
    match kwargs.keys().find(|k| !fields.iter().any(|f| f.name == k.as_str())) {
        Some(key) => Err(OpError::Parse {
            op,
            field: key.clone(),
            reason: format!(
                "unknown parameter, expected one of {:?}",
                fields.iter().map(|f| f.name).collect::<Vec<_>>()
            ),
        }),
        None => Ok(()),
    }
}

/// Parse a float field, falling back to its declared default
pub fn parse_f32(op: &'static str, field: &FieldInfo, kwargs: &ParamMap) -> Result<f32, OpError> {
    let raw = match kwargs.get(field.name) {
        Some(v) => v.as_str(),
        None => field.default.ok_or_else(|| OpError::Parse {
            op,
            field: field.name.to_string(),
            reason: "required parameter is missing".to_string(),
        })?,
    };
    raw.trim().parse::<f32>().map_err(|e| OpError::Parse {
        op,
        field: field.name.to_string(),
        reason: format!("`{raw}` is not a float: {e}"),
    })
}

/// Shortest representation that parses back to the same value
pub fn format_f32(v: f32) -> String {
    format!("{v}")
}
