//! Identity of the caller executing an operation.

use std::collections::BTreeSet;

/// Authenticated caller attached to a [`ConquerorContext`](super::ConquerorContext).
///
/// A principal lives only in the current process; it is never written onto
/// the wire. Receivers establish their own principal, typically in a
/// middleware that reads a credential from context data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
    roles: BTreeSet<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: BTreeSet::new(),
        }
    }

    /// Add a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Roles in sorted order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}
