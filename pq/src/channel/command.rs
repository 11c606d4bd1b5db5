//! Subprocess-backed remote call channel
//!
//! Runs a configured program once per call (for example `salt-ssh`) and reads
//! a JSON reply from its stdout. Argument templates may contain the
//! placeholders `{endpoint}`, `{function}`, `{args}` and `{kwargs}`; the last
//! two expand to zero or more argv entries.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::domain::ProcedureDescriptor;

use super::{RemoteCallChannel, StructuredResult, TransportError};

/// Exit status ssh uses for connection failures
const SSH_CONNECT_FAILURE: i32 = 255;

/// Configuration for [`CommandChannel`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandChannelConfig {
    /// Program to run for each call
    pub program: String,

    /// Argument template
    pub args: Vec<String>,

    /// Per-call timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for CommandChannelConfig {
    fn default() -> Self {
        Self {
            program: "salt-ssh".to_string(),
            args: vec![
                "--out=json".to_string(),
                "--static".to_string(),
                "{endpoint}".to_string(),
                "{function}".to_string(),
                "{args}".to_string(),
                "{kwargs}".to_string(),
            ],
            timeout_ms: 120_000,
        }
    }
}

impl CommandChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// RemoteCallChannel that shells out to a push helper program
pub struct CommandChannel {
    config: CommandChannelConfig,
}

impl CommandChannel {
    pub fn new(config: CommandChannelConfig) -> Self {
        debug!(?config, "CommandChannel::new: called");
        Self { config }
    }

    /// Expand the argument template for one call
    pub fn render_args(&self, endpoint: &str, procedure: &ProcedureDescriptor) -> Vec<String> {
        let mut argv = Vec::new();
        for template in &self.config.args {
            match template.as_str() {
                "{args}" => argv.extend(procedure.args.iter().map(render_value)),
                "{kwargs}" => argv.extend(
                    procedure
                        .kwargs
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, render_value(v))),
                ),
                other => argv.push(
                    other
                        .replace("{endpoint}", endpoint)
                        .replace("{function}", &procedure.function),
                ),
            }
        }
        argv
    }

    async fn run(&self, endpoint: &str, procedure: &ProcedureDescriptor) -> Result<Option<Reply>, TransportError> {
        let argv = self.render_args(endpoint, procedure);
        debug!(program = %self.config.program, ?argv, "CommandChannel::run: spawning");

        let timeout = self.config.timeout();
        let output = match tokio::time::timeout(
            timeout,
            tokio::process::Command::new(&self.config.program)
                .args(&argv)
                .kill_on_drop(true)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(%e, "CommandChannel::run: failed to spawn");
                return Err(TransportError::Io(e));
            }
            Err(_) => {
                debug!(?timeout, "CommandChannel::run: timed out");
                return Err(TransportError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(%stdout, %stderr, "CommandChannel::run: output");

        let code = output.status.code();
        if code == Some(SSH_CONNECT_FAILURE) || (!output.status.success() && stdout.trim().is_empty()) {
            debug!(?code, "CommandChannel::run: endpoint unreachable");
            return Err(TransportError::Unreachable(format!(
                "{} (exit {})",
                stderr.trim(),
                code.unwrap_or(-1)
            )));
        }

        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let value: Value =
            serde_json::from_str(stdout.trim()).map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(Some(Reply {
            value: unwrap_endpoint(value, endpoint),
            exit_code: code.unwrap_or(-1),
        }))
    }
}

/// Parsed stdout of one helper run together with its exit status
#[derive(Debug)]
struct Reply {
    value: Value,
    exit_code: i32,
}

/// Strings pass through raw; everything else is JSON encoded
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Push helpers key their output by endpoint id; strip that layer
fn unwrap_endpoint(value: Value, endpoint: &str) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(endpoint) => {
            map.remove(endpoint).unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Interpret a reply as a structured result
///
/// Objects carrying `retcode` are used as-is, with `return` as the payload
/// when present. Anything else is the bare return value of the call. A
/// nonzero exit status always marks the result failed.
fn into_structured(reply: Reply) -> Option<StructuredResult> {
    let Reply { value, exit_code } = reply;
    if value.is_null() {
        return None;
    }
    let exit_code = i64::from(exit_code);
    let result = match value {
        Value::Object(ref map) if map.contains_key("retcode") => {
            let reported = map.get("retcode").and_then(Value::as_i64).unwrap_or(-1);
            let retcode = if reported == 0 { exit_code } else { reported };
            let success = map.get("success").and_then(Value::as_bool).unwrap_or(true) && retcode == 0;
            let ret = map.get("return").cloned().unwrap_or_else(|| value.clone());
            StructuredResult { retcode, success, ret }
        }
        other if exit_code != 0 => StructuredResult::failure(exit_code, other),
        other => StructuredResult::success(other),
    };
    Some(result)
}

#[async_trait]
impl RemoteCallChannel for CommandChannel {
    async fn invoke(
        &self,
        endpoint: &str,
        procedure: &ProcedureDescriptor,
    ) -> Result<Option<StructuredResult>, TransportError> {
        debug!(%endpoint, %procedure, "CommandChannel::invoke: called");
        Ok(self.run(endpoint, procedure).await?.and_then(into_structured))
    }

    async fn ping(&self, endpoint: &str) -> Result<Option<bool>, TransportError> {
        debug!(%endpoint, "CommandChannel::ping: called");
        let reply = self.run(endpoint, &ProcedureDescriptor::new("test.ping")).await?;
        Ok(reply
            .and_then(into_structured)
            .and_then(|r| r.ret.as_bool().map(|alive| alive && r.success)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_channel(script: &str, timeout_ms: u64) -> CommandChannel {
        CommandChannel::new(CommandChannelConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_ms,
        })
    }

    #[test]
    fn test_render_args_expands_placeholders() {
        let channel = CommandChannel::new(CommandChannelConfig::default());
        let proc = ProcedureDescriptor::new("pkg.install")
            .with_arg("vim")
            .with_arg(json!(["a", "b"]))
            .with_kwarg("refresh", true);

        let argv = channel.render_args("web-1", &proc);
        assert_eq!(
            argv,
            vec![
                "--out=json",
                "--static",
                "web-1",
                "pkg.install",
                "vim",
                "[\"a\",\"b\"]",
                "refresh=true"
            ]
        );
    }

    #[test]
    fn test_unwrap_endpoint_layer() {
        assert_eq!(unwrap_endpoint(json!({"web-1": true}), "web-1"), json!(true));
        assert_eq!(unwrap_endpoint(json!({"web-2": true}), "web-1"), json!({"web-2": true}));
    }

    fn reply(value: Value, exit_code: i32) -> Reply {
        Reply { value, exit_code }
    }

    #[test]
    fn test_into_structured() {
        let result = into_structured(reply(json!({"retcode": 2, "return": "bad"}), 0)).unwrap();
        assert_eq!(result.retcode, 2);
        assert!(!result.success);

        let bare = into_structured(reply(json!({"pkg": "installed"}), 0)).unwrap();
        assert!(bare.success);
        assert_eq!(bare.ret, json!({"pkg": "installed"}));

        assert!(into_structured(reply(Value::Null, 0)).is_none());
    }

    #[test]
    fn test_into_structured_retcode_without_return() {
        let value = json!({"retcode": 1, "stderr": "No package vim available"});
        let result = into_structured(reply(value.clone(), 1)).unwrap();
        assert_eq!(result.retcode, 1);
        assert!(!result.success);
        assert_eq!(result.ret, value);
    }

    #[test]
    fn test_into_structured_nonzero_exit_fails() {
        let result = into_structured(reply(json!("ERROR: package vim not found"), 1)).unwrap();
        assert_eq!(result.retcode, 1);
        assert!(!result.success);

        let result = into_structured(reply(json!({"retcode": 0, "return": true}), 2)).unwrap();
        assert_eq!(result.retcode, 2);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_invoke_failed_call_with_output_maps_to_failed() {
        let channel = shell_channel(r#"echo '{"web-1": "ERROR: package vim not found"}'; exit 1"#, 5_000);
        let procedure = ProcedureDescriptor::new("pkg.install").with_arg("vim");
        let result = channel.invoke("web-1", &procedure).await.unwrap().unwrap();
        assert_eq!(result.retcode, 1);
        assert!(!result.success);

        let verdict = crate::dispatch::map_result(&procedure, &result);
        assert_eq!(verdict.status, crate::domain::ExecutionStatus::Failed);
        assert_eq!(verdict.code, crate::domain::RESULT_REMOTE_ERROR);
        assert!(verdict.message.contains("package vim not found"));
    }

    #[tokio::test]
    async fn test_invoke_salt_ssh_error_shape_maps_to_failed() {
        let channel = shell_channel(
            r#"echo '{"web-1": {"retcode": 1, "stderr": "Permission denied"}}'; exit 1"#,
            5_000,
        );
        let result = channel
            .invoke("web-1", &ProcedureDescriptor::new("pkg.install"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.retcode, 1);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_invoke_parses_json_stdout() {
        let channel = shell_channel(r#"echo '{"web-1": {"retcode": 0, "return": {"vim": "9.0"}}}'"#, 5_000);
        let result = channel
            .invoke("web-1", &ProcedureDescriptor::new("pkg.install"))
            .await
            .unwrap()
            .unwrap();
        assert!(result.success);
        assert_eq!(result.ret, json!({"vim": "9.0"}));
    }

    #[tokio::test]
    async fn test_invoke_empty_stdout_is_none() {
        let channel = shell_channel("true", 5_000);
        let result = channel.invoke("web-1", &ProcedureDescriptor::new("pkg.install")).await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let channel = shell_channel("sleep 5", 50);
        let err = channel
            .invoke("web-1", &ProcedureDescriptor::new("pkg.install"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_invoke_failure_without_output_is_unreachable() {
        let channel = shell_channel("echo 'no route to host' >&2; exit 1", 5_000);
        let err = channel
            .invoke("web-1", &ProcedureDescriptor::new("pkg.install"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(msg) if msg.contains("no route")));
    }

    #[tokio::test]
    async fn test_invoke_garbage_is_protocol_error() {
        let channel = shell_channel("echo not-json", 5_000);
        let err = channel
            .invoke("web-1", &ProcedureDescriptor::new("pkg.install"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ping() {
        let channel = shell_channel(r#"echo '{"web-1": true}'"#, 5_000);
        assert_eq!(channel.ping("web-1").await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let channel = CommandChannel::new(CommandChannelConfig {
            program: "/nonexistent/push-helper".to_string(),
            args: vec![],
            timeout_ms: 1_000,
        });
        let err = channel.ping("web-1").await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
