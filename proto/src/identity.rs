use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed identity value, e.g. `("email", "joe@example.com")`. This is the
/// unit that translation maps and the directory resolves.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityValue {
    pub id_type: String,
    pub value: String,
}

impl IdentityValue {
    pub fn new(id_type: &str, value: &str) -> Self {
        IdentityValue {
            id_type: id_type.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for IdentityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id_type, self.value)
    }
}

/// A named, possibly multi-valued attribute scoped to a group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    /// The group scope of the attribute, `/` for root.
    pub group: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: &str, group: &str, values: &[&str]) -> Self {
        Attribute {
            name: name.to_string(),
            group: group.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// The usability of a defined credential of an entity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialState {
    /// Set and usable.
    Valid,
    /// Set, but no longer meets its credential definition.
    Outdated,
    /// Administratively unusable.
    Disabled,
}
