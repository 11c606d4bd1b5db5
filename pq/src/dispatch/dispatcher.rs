//! TaskDispatcher - drains one endpoint's backlog

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::channel::{RemoteCallChannel, StructuredResult};
use crate::domain::{
    Action, ActionId, ExecutionStatus, NewAction, PREREQUISITE_FAILED_MSG, RESULT_PREREQUISITE_FAILED,
    RESULT_RETRIES_EXHAUSTED, RETRIES_EXHAUSTED_MSG,
};
use crate::queue::{EndpointQueue, PendingRecord};
use crate::store::{ActionStore, StoreError};

use super::classify::{DefaultRefreshClassifier, RefreshClassifier};
use super::outcome::{CycleReport, ProbeOutcome, RecordOutcome, map_result};
use super::DispatchError;

/// Retry budget of synthesized checkpoint actions
pub const DEFAULT_RETRIES: u32 = 5;

/// Decision taken for a record before any remote call
enum Prepared {
    Done(RecordOutcome),
    Dispatch { action: Action, remaining_tries: u32 },
}

/// Runs dispatch cycles for endpoints
///
/// Store transactions are opened and committed inside synchronous helpers so
/// none is alive while a remote call is in flight.
pub struct TaskDispatcher {
    store: Arc<dyn ActionStore>,
    channel: Arc<dyn RemoteCallChannel>,
    classifier: Arc<dyn RefreshClassifier>,
    default_retries: u32,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn ActionStore>, channel: Arc<dyn RemoteCallChannel>) -> Self {
        debug!("TaskDispatcher::new: called");
        Self {
            store,
            channel,
            classifier: Arc::new(DefaultRefreshClassifier::default()),
            default_retries: DEFAULT_RETRIES,
        }
    }

    /// Builder method to replace the refresh classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn RefreshClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Builder method to set the retry budget of checkpoint actions
    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Run one cycle for an endpoint at the current time
    pub async fn run_cycle(&self, endpoint: &str) -> Result<CycleReport, DispatchError> {
        self.run_cycle_at(endpoint, Utc::now()).await
    }

    /// Run one cycle treating `now` as the current time for due checks
    ///
    /// Per-record failures are recorded in the report. A store failure aborts
    /// the cycle; the records not yet visited stay untouched.
    pub async fn run_cycle_at(&self, endpoint: &str, now: DateTime<Utc>) -> Result<CycleReport, DispatchError> {
        let mut report = CycleReport::new(endpoint, now);
        info!(cycle_id = %report.cycle_id, %endpoint, "TaskDispatcher::run_cycle: starting");

        let mut queue = EndpointQueue::new(endpoint, self.load_pending(endpoint)?);
        while let Some(item) = queue.next_due(now) {
            self.dispatch_record(endpoint, item.action_id(), &mut report).await?;
        }
        report.deferred = queue.remaining();

        if let Some(checkpoint) = self.take_refresh_checkpoint(endpoint, now)? {
            report.checkpoint = Some(checkpoint.id);
            self.dispatch_record(endpoint, checkpoint.id, &mut report).await?;
        }

        if !report.visited_any() {
            report.probe = Some(self.probe(endpoint).await?);
        }

        info!(
            cycle_id = %report.cycle_id,
            %endpoint,
            processed = report.outcomes.len(),
            remote_calls = report.remote_calls,
            deferred = report.deferred,
            "TaskDispatcher::run_cycle: finished"
        );
        Ok(report)
    }

    fn load_pending(&self, endpoint: &str) -> Result<Vec<PendingRecord>, DispatchError> {
        let mut tx = self.store.begin()?;
        let pending = tx.load_pending_execution_records(endpoint)?;
        tx.commit()?;
        Ok(pending)
    }

    async fn dispatch_record(
        &self,
        endpoint: &str,
        action_id: ActionId,
        report: &mut CycleReport,
    ) -> Result<(), DispatchError> {
        match self.process(endpoint, action_id, report).await {
            Ok(outcome) => {
                debug!(%endpoint, action_id, outcome = outcome.label(), "TaskDispatcher::dispatch_record: done");
                report.outcomes.push(outcome);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(%endpoint, action_id, error = %e, "TaskDispatcher::dispatch_record: aborting cycle");
                Err(e)
            }
            Err(e) => {
                warn!(%endpoint, action_id, error = %e, "TaskDispatcher::dispatch_record: record failed");
                report.outcomes.push(RecordOutcome::Error {
                    action_id,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn process(
        &self,
        endpoint: &str,
        action_id: ActionId,
        report: &mut CycleReport,
    ) -> Result<RecordOutcome, DispatchError> {
        let (action, remaining_tries) = match self.prepare(endpoint, action_id)? {
            Prepared::Done(outcome) => return Ok(outcome),
            Prepared::Dispatch { action, remaining_tries } => (action, remaining_tries),
        };

        debug!(%endpoint, action_id, procedure = %action.procedure, remaining_tries, "TaskDispatcher::process: invoking");
        report.remote_calls += 1;
        let Some(result) = self.channel.invoke(endpoint, &action.procedure).await? else {
            warn!(%endpoint, action_id, "TaskDispatcher::process: remote call returned no result");
            return Ok(RecordOutcome::NoResult {
                action_id,
                remaining_tries,
            });
        };

        self.apply_result(endpoint, &action, &result, remaining_tries)
    }

    /// Apply the no-call rules and, if the record is dispatchable, commit the attempt
    fn prepare(&self, endpoint: &str, action_id: ActionId) -> Result<Prepared, DispatchError> {
        let mut tx = self.store.begin()?;
        let mut record = tx
            .load_record(action_id, endpoint)?
            .ok_or_else(|| StoreError::NotFound(format!("Execution record for action {} on {}", action_id, endpoint)))?;

        if record.is_terminal() {
            debug!(%endpoint, action_id, status = %record.status, "TaskDispatcher::prepare: already terminal");
            tx.rollback()?;
            return Ok(Prepared::Done(RecordOutcome::Skipped {
                action_id,
                status: record.status,
            }));
        }

        let action = tx.load_action(action_id)?;
        if let Some(prerequisite) = action.prerequisite {
            match tx.load_record(prerequisite, endpoint)?.map(|r| r.status) {
                Some(ExecutionStatus::Failed) => {
                    info!(%endpoint, action_id, prerequisite, "TaskDispatcher::prepare: prerequisite failed");
                    record.fail(RESULT_PREREQUISITE_FAILED, PREREQUISITE_FAILED_MSG, Utc::now())?;
                    tx.save(&record)?;
                    tx.commit()?;
                    return Ok(Prepared::Done(RecordOutcome::PrerequisiteFailed { action_id }));
                }
                Some(ExecutionStatus::Queued) => {
                    debug!(%endpoint, action_id, prerequisite, "TaskDispatcher::prepare: prerequisite pending, holding");
                    tx.rollback()?;
                    return Ok(Prepared::Done(RecordOutcome::Held {
                        action_id,
                        prerequisite,
                    }));
                }
                Some(ExecutionStatus::Completed) | None => {}
            }
        }

        if record.remaining_tries < 1 {
            warn!(%endpoint, action_id, "TaskDispatcher::prepare: retry budget exhausted");
            record.fail(RESULT_RETRIES_EXHAUSTED, RETRIES_EXHAUSTED_MSG, Utc::now())?;
            tx.save(&record)?;
            tx.commit()?;
            return Ok(Prepared::Done(RecordOutcome::RetriesExhausted { action_id }));
        }

        let remaining_tries = record.consume_attempt()?;
        tx.save(&record)?;
        tx.commit()?;
        Ok(Prepared::Dispatch { action, remaining_tries })
    }

    fn apply_result(
        &self,
        endpoint: &str,
        action: &Action,
        result: &StructuredResult,
        remaining_tries: u32,
    ) -> Result<RecordOutcome, DispatchError> {
        let verdict = map_result(&action.procedure, result);
        let stale =
            !action.procedure.is_package_refresh() && self.classifier.requires_refresh(&action.procedure, result);
        let now = Utc::now();

        let mut tx = self.store.begin()?;
        let mut record = tx
            .load_record(action.id, endpoint)?
            .ok_or_else(|| StoreError::NotFound(format!("Execution record for action {} on {}", action.id, endpoint)))?;
        if verdict.status == ExecutionStatus::Completed {
            record.complete(verdict.code, verdict.message.as_str(), now)?;
        } else {
            record.fail(verdict.code, verdict.message.as_str(), now)?;
        }
        tx.save(&record)?;

        if stale {
            let mut state = tx.load_endpoint(endpoint)?;
            state.mark_refresh_needed();
            tx.save_endpoint(&state)?;
        }
        tx.record_checkin(endpoint, now)?;
        tx.commit()?;

        info!(%endpoint, action_id = action.id, status = %verdict.status, stale, "TaskDispatcher::apply_result: recorded");
        Ok(match verdict.status {
            ExecutionStatus::Completed => RecordOutcome::Completed {
                action_id: action.id,
                remaining_tries,
            },
            _ => RecordOutcome::Failed {
                action_id: action.id,
                remaining_tries,
                message: verdict.message,
            },
        })
    }

    /// Insert the package-list refresh action if the endpoint is flagged
    ///
    /// The flag is cleared in the same transaction that creates the action.
    fn take_refresh_checkpoint(&self, endpoint: &str, now: DateTime<Utc>) -> Result<Option<Action>, DispatchError> {
        let mut tx = self.store.begin()?;
        let mut state = tx.load_endpoint(endpoint)?;
        if !state.needs_refresh {
            tx.rollback()?;
            return Ok(None);
        }

        let action = tx.insert_action(NewAction::package_refresh(endpoint, now, self.default_retries))?;
        state.clear_refresh();
        tx.save_endpoint(&state)?;
        tx.commit()?;

        info!(%endpoint, action_id = action.id, "TaskDispatcher::take_refresh_checkpoint: scheduled package list refresh");
        Ok(Some(action))
    }

    async fn probe(&self, endpoint: &str) -> Result<ProbeOutcome, DispatchError> {
        debug!(%endpoint, "TaskDispatcher::probe: called");
        match self.channel.ping(endpoint).await {
            Ok(Some(true)) => {
                let mut tx = self.store.begin()?;
                tx.record_checkin(endpoint, Utc::now())?;
                tx.commit()?;
                Ok(ProbeOutcome::Alive)
            }
            Ok(answer) => {
                info!(%endpoint, ?answer, "TaskDispatcher::probe: no positive answer");
                Ok(ProbeOutcome::Silent)
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "TaskDispatcher::probe: ping failed");
                Ok(ProbeOutcome::Unreachable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockChannel, Reply};
    use crate::domain::{PACKAGE_REFRESH_NAME, ProcedureDescriptor, RESULT_REMOTE_ERROR};
    use crate::store::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, Arc<MockChannel>, TaskDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MockChannel::new());
        let dispatcher = TaskDispatcher::new(store.clone(), channel.clone());
        (store, channel, dispatcher)
    }

    fn run(name: &str, at: DateTime<Utc>) -> NewAction {
        NewAction::new(name, ProcedureDescriptor::new("cmd.run").with_arg(name), at).for_endpoint("web-1")
    }

    struct AlwaysStale;

    impl RefreshClassifier for AlwaysStale {
        fn requires_refresh(&self, _: &ProcedureDescriptor, _: &StructuredResult) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_failed_prerequisite_fails_dependent_without_call() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let a1 = store.create_action(run("a1", now).with_retries(1)).unwrap();
        let a2 = store.create_action(run("a2", now).after(a1.id)).unwrap();
        channel.push_reply("web-1", Reply::Timeout);

        // Cycle 1: A1 times out and keeps its status, A2 waits on it
        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();
        assert!(matches!(report.outcome_for(a1.id), Some(RecordOutcome::Error { .. })));
        assert!(matches!(report.outcome_for(a2.id), Some(RecordOutcome::Held { prerequisite, .. }) if *prerequisite == a1.id));
        let r1 = store.record(a1.id, "web-1").unwrap();
        assert_eq!(r1.status, ExecutionStatus::Queued);
        assert_eq!(r1.remaining_tries, 0);

        // Cycle 2: A1 exhausts its budget, A2 follows it without a call
        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();
        assert_eq!(report.outcome_for(a1.id), Some(&RecordOutcome::RetriesExhausted { action_id: a1.id }));
        assert_eq!(report.outcome_for(a2.id), Some(&RecordOutcome::PrerequisiteFailed { action_id: a2.id }));

        let r1 = store.record(a1.id, "web-1").unwrap();
        assert_eq!(r1.status, ExecutionStatus::Failed);
        assert_eq!(r1.result_code, Some(RESULT_RETRIES_EXHAUSTED));
        let r2 = store.record(a2.id, "web-1").unwrap();
        assert_eq!(r2.status, ExecutionStatus::Failed);
        assert_eq!(r2.result_code, Some(RESULT_PREREQUISITE_FAILED));
        assert_eq!(r2.result_msg.as_deref(), Some(PREREQUISITE_FAILED_MSG));
        assert_eq!(r2.remaining_tries, 5);

        let calls = channel.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, a1.procedure);
    }

    #[tokio::test]
    async fn test_stale_result_triggers_one_refresh_checkpoint() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let a3 = store
            .create_action(
                NewAction::new("install vim", ProcedureDescriptor::new("pkg.install").with_arg("vim"), now)
                    .for_endpoint("web-1"),
            )
            .unwrap();

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();

        assert!(matches!(report.outcome_for(a3.id), Some(RecordOutcome::Completed { .. })));
        let checkpoint = report.checkpoint.expect("checkpoint should run");
        assert!(matches!(report.outcome_for(checkpoint), Some(RecordOutcome::Completed { .. })));
        assert!(report.probe.is_none());

        let calls = channel.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, ProcedureDescriptor::package_refresh());

        let actions = store.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].name, PACKAGE_REFRESH_NAME);
        assert!(!store.endpoint("web-1").unwrap().needs_refresh);
        assert_eq!(store.checkin_count("web-1"), 2);
    }

    #[tokio::test]
    async fn test_empty_backlog_probes_once() {
        let (store, channel, dispatcher) = setup();

        let report = dispatcher.run_cycle("web-9").await.unwrap();

        assert_eq!(report.probe, Some(ProbeOutcome::Alive));
        assert_eq!(channel.ping_count(), 1);
        assert_eq!(channel.call_count(), 0);
        assert_eq!(store.checkin_count("web-9"), 1);
        assert!(store.endpoint("web-9").unwrap().last_checkin.is_some());
    }

    #[tokio::test]
    async fn test_silent_probe_records_no_checkin() {
        let (store, channel, dispatcher) = setup();
        channel.set_ping_answer(None);

        let report = dispatcher.run_cycle("web-9").await.unwrap();

        assert_eq!(report.probe, Some(ProbeOutcome::Silent));
        assert_eq!(store.checkin_count("web-9"), 0);
    }

    #[tokio::test]
    async fn test_terminal_backlog_is_noop_except_probe() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let action = store.create_action(run("uptime", now)).unwrap();
        dispatcher.run_cycle_at("web-1", now).await.unwrap();
        let before = store.record(action.id, "web-1").unwrap();
        assert_eq!(before.status, ExecutionStatus::Completed);
        assert_eq!(channel.call_count(), 1);

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(report.probe, Some(ProbeOutcome::Alive));
        assert_eq!(channel.call_count(), 1);
        assert_eq!(store.record(action.id, "web-1").unwrap(), before);
        assert_eq!(store.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_due_records_without_calls_skip_probe() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let spent = store.create_action(run("spent", now).with_retries(0)).unwrap();
        let dependent = store.create_action(run("dependent", now).after(spent.id)).unwrap();

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();

        assert_eq!(report.outcome_for(spent.id), Some(&RecordOutcome::RetriesExhausted { action_id: spent.id }));
        assert_eq!(
            report.outcome_for(dependent.id),
            Some(&RecordOutcome::PrerequisiteFailed { action_id: dependent.id })
        );
        assert_eq!(report.remote_calls, 0);
        assert!(report.probe.is_none());
        assert_eq!(channel.ping_count(), 0);
        assert_eq!(store.checkin_count("web-1"), 0);
    }

    #[tokio::test]
    async fn test_each_attempt_consumes_exactly_one_try() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let action = store.create_action(run("flaky", now).with_retries(3)).unwrap();
        channel.push_reply("web-1", Reply::Empty);
        channel.push_reply("web-1", Reply::Timeout);
        channel.push_reply("web-1", Reply::Unreachable);

        for expected in [2, 1, 0] {
            dispatcher.run_cycle_at("web-1", now).await.unwrap();
            let record = store.record(action.id, "web-1").unwrap();
            assert_eq!(record.status, ExecutionStatus::Queued);
            assert_eq!(record.remaining_tries, expected);
        }

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();
        assert_eq!(report.remote_calls, 0);
        assert_eq!(channel.call_count(), 3);
        let record = store.record(action.id, "web-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.result_code, Some(RESULT_RETRIES_EXHAUSTED));
        assert_eq!(record.remaining_tries, 0);
    }

    #[tokio::test]
    async fn test_remote_error_fails_record_and_checks_in() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let action = store.create_action(run("false", now)).unwrap();
        channel.push_reply("web-1", Reply::Result(StructuredResult::failure(1, json!("boom"))));

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();

        assert!(matches!(report.outcome_for(action.id), Some(RecordOutcome::Failed { remaining_tries: 4, .. })));
        let record = store.record(action.id, "web-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.result_code, Some(RESULT_REMOTE_ERROR));
        assert_eq!(record.result_msg.as_deref(), Some("cmd.run failed with return code 1: boom"));
        assert_eq!(store.checkin_count("web-1"), 1);
        assert!(report.probe.is_none());
    }

    #[tokio::test]
    async fn test_future_action_is_deferred() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let due = store.create_action(run("now", now - Duration::minutes(5))).unwrap();
        let later = store.create_action(run("later", now + Duration::hours(1))).unwrap();

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(channel.call_count(), 1);
        assert_eq!(store.record(due.id, "web-1").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(store.record(later.id, "web-1").unwrap().status, ExecutionStatus::Queued);
        assert_eq!(store.record(later.id, "web-1").unwrap().remaining_tries, 5);
    }

    #[tokio::test]
    async fn test_completed_prerequisite_releases_dependent_in_same_cycle() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let first = store.create_action(run("first", now)).unwrap();
        let second = store.create_action(run("second", now).after(first.id)).unwrap();

        dispatcher.run_cycle_at("web-1", now).await.unwrap();

        assert_eq!(channel.call_count(), 2);
        assert_eq!(store.record(second.id, "web-1").unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_cycle() {
        let (store, channel, dispatcher) = setup();
        let now = Utc::now();
        let action = store.create_action(run("uptime", now)).unwrap();
        store.set_fail_commits(true);

        let err = dispatcher.run_cycle_at("web-1", now).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(channel.call_count(), 0);
        assert_eq!(store.record(action.id, "web-1").unwrap().remaining_tries, 5);

        store.set_fail_commits(false);
        dispatcher.run_cycle_at("web-1", now).await.unwrap();
        assert_eq!(store.record(action.id, "web-1").unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_checkpoint_never_flags_itself() {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MockChannel::new());
        let dispatcher = TaskDispatcher::new(store.clone(), channel.clone())
            .with_classifier(Arc::new(AlwaysStale))
            .with_default_retries(2);
        let now = Utc::now();
        store.create_action(run("uptime", now)).unwrap();

        let report = dispatcher.run_cycle_at("web-1", now).await.unwrap();

        let checkpoint = report.checkpoint.unwrap();
        assert_eq!(store.record(checkpoint, "web-1").unwrap().remaining_tries, 1);
        assert!(!store.endpoint("web-1").unwrap().needs_refresh);
        assert_eq!(store.actions().len(), 2);
    }
}
