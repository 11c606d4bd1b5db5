//! Remote call channel to managed endpoints
//!
//! The channel is the only place the dispatcher talks to an endpoint. A call
//! either fails at the transport level (timeout, unreachable, garbled reply),
//! returns nothing, or returns a structured result.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::ProcedureDescriptor;

mod command;

pub use command::{CommandChannel, CommandChannelConfig};

/// Transport-level failure of a remote call
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed reply: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reply of a remote procedure call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    /// Remote return code (0 = success)
    pub retcode: i64,

    /// Whether the remote side reported success
    pub success: bool,

    /// Returned payload
    #[serde(rename = "return")]
    pub ret: Value,
}

impl StructuredResult {
    pub fn success(ret: Value) -> Self {
        Self {
            retcode: 0,
            success: true,
            ret,
        }
    }

    pub fn failure(retcode: i64, ret: Value) -> Self {
        Self {
            retcode,
            success: false,
            ret,
        }
    }
}

/// Request/response primitive to a named endpoint
///
/// Implementations enforce their own timeout and report it as
/// [`TransportError::Timeout`].
#[async_trait]
pub trait RemoteCallChannel: Send + Sync {
    /// Invoke a procedure on an endpoint
    ///
    /// `Ok(None)` means the call went through but produced no payload.
    async fn invoke(
        &self,
        endpoint: &str,
        procedure: &ProcedureDescriptor,
    ) -> Result<Option<StructuredResult>, TransportError>;

    /// Liveness probe; `Ok(None)` means no answer
    async fn ping(&self, endpoint: &str) -> Result<Option<bool>, TransportError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tracing::debug;

    /// Scripted reply for one invoke call
    #[derive(Debug, Clone)]
    pub enum Reply {
        Result(StructuredResult),
        Empty,
        Timeout,
        Unreachable,
        /// Panic inside the call
        Panic,
    }

    /// Mock channel that replays scripted replies per endpoint and records calls
    #[derive(Default)]
    pub struct MockChannel {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<(String, ProcedureDescriptor)>>,
        pings: Mutex<Vec<String>>,
        ping_answer: Mutex<Option<bool>>,
        delay: Option<Duration>,
    }

    impl MockChannel {
        pub fn new() -> Self {
            Self {
                ping_answer: Mutex::new(Some(true)),
                ..Default::default()
            }
        }

        /// Sleep for `delay` inside every invoke and ping
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn push_reply(&self, endpoint: &str, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .push_back(reply);
        }

        pub fn set_ping_answer(&self, answer: Option<bool>) {
            *self.ping_answer.lock().unwrap() = answer;
        }

        pub fn calls(&self) -> Vec<(String, ProcedureDescriptor)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn ping_count(&self) -> usize {
            self.pings.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteCallChannel for MockChannel {
        async fn invoke(
            &self,
            endpoint: &str,
            procedure: &ProcedureDescriptor,
        ) -> Result<Option<StructuredResult>, TransportError> {
            debug!(%endpoint, %procedure, "MockChannel::invoke: called");
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), procedure.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(endpoint)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Reply::Result(StructuredResult::success(Value::Bool(true))));
            match reply {
                Reply::Result(result) => Ok(Some(result)),
                Reply::Empty => Ok(None),
                Reply::Timeout => Err(TransportError::Timeout(Duration::from_secs(1))),
                Reply::Unreachable => Err(TransportError::Unreachable(endpoint.to_string())),
                Reply::Panic => panic!("scripted panic for {}", endpoint),
            }
        }

        async fn ping(&self, endpoint: &str) -> Result<Option<bool>, TransportError> {
            debug!(%endpoint, "MockChannel::ping: called");
            self.pings.lock().unwrap().push(endpoint.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(*self.ping_answer.lock().unwrap())
        }
    }

    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_replays_in_order_then_succeeds() {
            let channel = MockChannel::new();
            channel.push_reply("web-1", Reply::Timeout);
            channel.push_reply("web-1", Reply::Empty);
            let proc = ProcedureDescriptor::new("pkg.install");

            assert!(channel.invoke("web-1", &proc).await.is_err());
            assert!(channel.invoke("web-1", &proc).await.unwrap().is_none());
            assert!(channel.invoke("web-1", &proc).await.unwrap().unwrap().success);
            assert_eq!(channel.call_count(), 3);
        }
    }
}
