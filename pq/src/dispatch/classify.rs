//! Package-list staleness classification

use serde_json::Value;
use tracing::debug;

use crate::channel::StructuredResult;
use crate::domain::ProcedureDescriptor;

/// Functions that always leave the endpoint's package list stale
pub const PACKAGE_FUNCTIONS: &[&str] = &[
    "pkg.install",
    "pkg.remove",
    "pkg.purge",
    "pkg.upgrade",
    "pkg.update",
    "pkg.refresh_db",
];

/// State id prefixes whose changes touch installed packages or repositories
pub const PACKAGE_STATE_PREFIXES: &[&str] = &["pkg_|-", "pkgrepo_|-"];

/// Decides whether a dispatch result makes the package list stale
pub trait RefreshClassifier: Send + Sync {
    fn requires_refresh(&self, procedure: &ProcedureDescriptor, result: &StructuredResult) -> bool;
}

/// Table-driven classifier keyed by function name
#[derive(Debug, Clone)]
pub struct DefaultRefreshClassifier {
    functions: Vec<String>,
    state_prefixes: Vec<String>,
}

impl Default for DefaultRefreshClassifier {
    fn default() -> Self {
        Self {
            functions: PACKAGE_FUNCTIONS.iter().map(|s| s.to_string()).collect(),
            state_prefixes: PACKAGE_STATE_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DefaultRefreshClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add a function that always raises the flag
    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.functions.push(function.into());
        self
    }

    fn state_changed_packages(&self, ret: &Value) -> bool {
        let Some(states) = ret.as_object() else {
            return false;
        };
        states.iter().any(|(id, state)| {
            self.state_prefixes.iter().any(|p| id.starts_with(p.as_str()))
                && state
                    .get("changes")
                    .is_some_and(|changes| match changes {
                        Value::Object(map) => !map.is_empty(),
                        Value::Array(items) => !items.is_empty(),
                        Value::Null => false,
                        _ => true,
                    })
        })
    }
}

impl RefreshClassifier for DefaultRefreshClassifier {
    fn requires_refresh(&self, procedure: &ProcedureDescriptor, result: &StructuredResult) -> bool {
        let stale = if self.functions.iter().any(|f| *f == procedure.function) {
            true
        } else if procedure.is_state_apply() {
            self.state_changed_packages(&result.ret)
        } else {
            false
        };
        debug!(function = %procedure.function, stale, "DefaultRefreshClassifier::requires_refresh: classified");
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_package_functions_always_stale() {
        let classifier = DefaultRefreshClassifier::new();
        let failed = StructuredResult::failure(1, json!("no such package"));
        assert!(classifier.requires_refresh(&ProcedureDescriptor::new("pkg.install"), &failed));
        assert!(classifier.requires_refresh(
            &ProcedureDescriptor::new("pkg.refresh_db"),
            &StructuredResult::success(json!(true))
        ));
        assert!(!classifier.requires_refresh(
            &ProcedureDescriptor::new("cmd.run"),
            &StructuredResult::success(json!("ok"))
        ));
    }

    #[test]
    fn test_state_apply_checks_package_changes() {
        let classifier = DefaultRefreshClassifier::new();
        let apply = ProcedureDescriptor::new("state.apply").with_arg("webserver");

        let changed = StructuredResult::success(json!({
            "file_|-motd_|-/etc/motd_|-managed": {"result": true, "changes": {"diff": "..."}},
            "pkg_|-nginx_|-nginx_|-installed": {"result": true, "changes": {"nginx": {"new": "1.24"}}}
        }));
        assert!(classifier.requires_refresh(&apply, &changed));

        let unchanged = StructuredResult::success(json!({
            "pkg_|-nginx_|-nginx_|-installed": {"result": true, "changes": {}},
            "file_|-motd_|-/etc/motd_|-managed": {"result": true, "changes": {"diff": "..."}}
        }));
        assert!(!classifier.requires_refresh(&apply, &unchanged));
    }

    #[test]
    fn test_custom_function() {
        let classifier = DefaultRefreshClassifier::new().with_function("zypper.patch");
        assert!(classifier.requires_refresh(
            &ProcedureDescriptor::new("zypper.patch"),
            &StructuredResult::success(json!(true))
        ));
    }
}
