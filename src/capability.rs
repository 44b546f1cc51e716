//! Capability instances published into and discovered from a registry.
//!
//! A capability is the unit tracked by this engine: a typed, property-carrying
//! record that can appear in a registry at any time and disappear just as
//! asynchronously. Programs consume capabilities through filtered
//! subscriptions and may issue their own back into the registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a capability instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(uuid::Uuid);

impl CapabilityId {
    /// Creates a new random capability ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CapabilityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Possible values a capability property can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Structured(serde_json::Value),
    Null,
}

impl PropValue {
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub const fn is_str(&self) -> bool {
        matches!(self, Self::Str(_))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Scalar rendering used by filter matching.
    ///
    /// Structured values have no scalar form; filters can only test their
    /// presence.
    #[must_use]
    pub fn as_filter_text(&self) -> Option<String> {
        match self {
            Self::Bool(v) => Some(v.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Str(v) => Some(v.clone()),
            Self::Structured(_) | Self::Null => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A capability instance.
///
/// The `type_name` plays the role the `objectClass` attribute plays in
/// registry filters; properties are free-form typed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Stable identity of this instance.
    pub id: CapabilityId,
    /// Capability type, matched by `(objectClass=...)` filter terms.
    pub type_name: String,
    /// Typed attributes, matched by `(key=value)` filter terms.
    pub properties: BTreeMap<String, PropValue>,
}

impl Capability {
    /// Creates a capability of the given type with no properties.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            id: CapabilityId::new(),
            type_name: type_name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds a property, consuming and returning the capability.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Looks up a property value.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&PropValue> {
        self.properties.get(key)
    }
}
