//! Action domain type
//!
//! A unit of scheduled work: what to run, when, and after which other action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Store-assigned action identifier
pub type ActionId = i64;

/// State applied by the synthesized package-list refresh checkpoint
pub const PACKAGE_REFRESH_STATE: &str = "packages.profileupdate";

/// Display name of the synthesized package-list refresh checkpoint
pub const PACKAGE_REFRESH_NAME: &str = "Package List Refresh";

/// Remote procedure to invoke on an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDescriptor {
    /// Function identifier, e.g. `pkg.install` or `state.apply`
    pub function: String,

    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ProcedureDescriptor {
    /// Create a descriptor with no arguments
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Builder method to append a positional argument
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder method to set a keyword argument
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// The procedure run by the package-list refresh checkpoint
    pub fn package_refresh() -> Self {
        Self::new("state.apply").with_arg(PACKAGE_REFRESH_STATE)
    }

    /// Whether this is a state application whose result is a map of state returns
    pub fn is_state_apply(&self) -> bool {
        matches!(self.function.as_str(), "state.apply" | "state.highstate")
    }

    /// Whether this is the package-list refresh checkpoint procedure
    pub fn is_package_refresh(&self) -> bool {
        self.function == "state.apply" && self.args.first().and_then(Value::as_str) == Some(PACKAGE_REFRESH_STATE)
    }
}

impl std::fmt::Display for ProcedureDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.function)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

/// A scheduled action as loaded from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,

    /// Human readable name
    pub name: String,

    /// Earliest time the action may be dispatched
    pub scheduled_at: DateTime<Utc>,

    /// Action that must have succeeded on the same endpoint first
    pub prerequisite: Option<ActionId>,

    /// What to run on each endpoint
    pub procedure: ProcedureDescriptor,

    pub created_at: DateTime<Utc>,
}

impl Action {
    /// Whether the action may be dispatched at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

/// Request to create an action targeting one or more endpoints
#[derive(Debug, Clone)]
pub struct NewAction {
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub prerequisite: Option<ActionId>,
    pub procedure: ProcedureDescriptor,

    /// Endpoints that receive an execution record
    pub endpoints: Vec<String>,

    /// Initial retry budget for every execution record
    pub retries: u32,
}

impl NewAction {
    /// Create a request scheduled for `scheduled_at` with no endpoints yet
    pub fn new(name: impl Into<String>, procedure: ProcedureDescriptor, scheduled_at: DateTime<Utc>) -> Self {
        let name = name.into();
        debug!(%name, %procedure, %scheduled_at, "NewAction::new: called");
        Self {
            name,
            scheduled_at,
            prerequisite: None,
            procedure,
            endpoints: Vec::new(),
            retries: 5,
        }
    }

    /// The checkpoint action synthesized at the end of a cycle
    pub fn package_refresh(endpoint: impl Into<String>, now: DateTime<Utc>, retries: u32) -> Self {
        Self::new(PACKAGE_REFRESH_NAME, ProcedureDescriptor::package_refresh(), now)
            .for_endpoint(endpoint)
            .with_retries(retries)
    }

    /// Builder method to add a target endpoint
    pub fn for_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Builder method to set the prerequisite
    pub fn after(mut self, prerequisite: ActionId) -> Self {
        self.prerequisite = Some(prerequisite);
        self
    }

    /// Builder method to set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}
