//! Endpoint domain type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A managed node that receives remote-executed actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,

    /// Set when a dispatch outcome made the package list stale
    pub needs_refresh: bool,

    /// Last successful check-in
    pub last_checkin: Option<DateTime<Utc>>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            needs_refresh: false,
            last_checkin: None,
        }
    }

    pub fn mark_refresh_needed(&mut self) {
        debug!(endpoint = %self.id, "Endpoint::mark_refresh_needed: called");
        self.needs_refresh = true;
    }

    pub fn clear_refresh(&mut self) {
        debug!(endpoint = %self.id, "Endpoint::clear_refresh: called");
        self.needs_refresh = false;
    }

    pub fn record_checkin(&mut self, at: DateTime<Utc>) {
        self.last_checkin = Some(at);
    }
}
