//! Backend catalog
//!
//! Resolves opaque location names into concrete backend endpoints. The
//! registry that normally populates this (mart/dataset/attribute name
//! resolution) is an external collaborator; the engine only needs the
//! lookup side of the contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

/// SQL flavor of a relational location, selecting the sqlx driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlFlavor {
    Postgres,
    MySql,
    Sqlite,
}

/// Resolved backend location for one subquery node.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendLocation {
    /// Relational backend reached over a parameterized-statement protocol.
    Relational { url: String, flavor: SqlFlavor },
    /// HTTP backend that streams tab-delimited rows.
    Text { endpoint: Url },
}

/// Catalog that maps location names to backend locations.
pub struct Catalog {
    locations: HashMap<String, BackendLocation>,
}

impl Catalog {
    /// Creates a new empty catalog
    pub fn new() -> Self {
        Self {
            locations: HashMap::new(),
        }
    }

    /// Registers a location under the given name.
    pub fn register(&mut self, name: impl Into<String>, location: BackendLocation) {
        self.locations.insert(name.into(), location);
    }

    /// Gets a location by name.
    pub fn get(&self, name: &str) -> Option<&BackendLocation> {
        self.locations.get(name)
    }

    /// Lists all registered location names.
    pub fn list(&self) -> Vec<&str> {
        self.locations.keys().map(|s| s.as_str()).collect()
    }

    /// Returns the number of registered locations
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Returns true if no locations are registered
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
