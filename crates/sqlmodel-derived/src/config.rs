//! Configuration for derived attributes.

use serde::{Deserialize, Serialize};
use sqlmodel_derived_core::Result;

/// Behavior switches for a [`DerivedAttributes`](crate::DerivedAttributes) context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedConfig {
    /// Aggregates over paths without a complete inverse are refreshed with a
    /// correlated WHERE clause instead of failing at configuration.
    pub correlation_fallback: bool,
    /// Aggregate UPDATEs ask the session to write the new values back into
    /// loaded objects.
    pub refresh_aggregates: bool,
}

impl Default for DerivedConfig {
    fn default() -> Self {
        Self {
            correlation_fallback: true,
            refresh_aggregates: true,
        }
    }
}

impl DerivedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn correlation_fallback(mut self, enabled: bool) -> Self {
        self.correlation_fallback = enabled;
        self
    }

    #[must_use]
    pub fn refresh_aggregates(mut self, enabled: bool) -> Self {
        self.refresh_aggregates = enabled;
        self
    }

    /// Parse a JSON object; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
