//! The driver loop: polls the broker, hands each submission to a
//! semaphore-bounded worker task, and carries cancellation down to
//! in-flight work on shutdown.

use std::sync::Arc;

use oj_shared::{JudgingResult, Submission, SubmissionStatus};
use sandbox::{ExecLimits, Sandbox};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{InboundMessage, MessageConsumer, MessageProducer};
use crate::store::Store;

pub struct ProcessorLoop {
    consumer: Arc<dyn MessageConsumer>,
    producer: Arc<dyn MessageProducer>,
    store: Arc<dyn Store>,
    sandbox: Arc<dyn Sandbox>,
    limits: ExecLimits,
    poll_timeout: std::time::Duration,
    worker_budget: Arc<Semaphore>,
}

impl ProcessorLoop {
    pub fn new(
        consumer: Arc<dyn MessageConsumer>,
        producer: Arc<dyn MessageProducer>,
        store: Arc<dyn Store>,
        sandbox: Arc<dyn Sandbox>,
        limits: ExecLimits,
        poll_timeout: std::time::Duration,
        concurrent_judges: usize,
    ) -> Self {
        Self {
            consumer,
            producer,
            store,
            sandbox,
            limits,
            poll_timeout,
            worker_budget: Arc::new(Semaphore::new(concurrent_judges.max(1))),
        }
    }

    /// Runs until `cancel` is triggered. In-flight worker tasks are
    /// awaited before returning so a shutdown never drops a submission
    /// mid-judge.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("processor loop received shutdown signal, draining in-flight work");
                    break;
                }
                polled = self.consumer.poll(self.poll_timeout) => {
                    match polled {
                        Ok(Some(message)) => {
                            let permit = match Arc::clone(&self.worker_budget).acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => continue,
                            };
                            let consumer = Arc::clone(&self.consumer);
                            let producer = Arc::clone(&self.producer);
                            let store = Arc::clone(&self.store);
                            let sandbox = Arc::clone(&self.sandbox);
                            let limits = self.limits;

                            in_flight.spawn(async move {
                                let _permit = permit;
                                process_one(consumer.as_ref(), producer.as_ref(), store.as_ref(), sandbox.as_ref(), limits, message).await;
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "poll failed, backing off");
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        }
                    }
                }
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "worker task panicked");
                    }
                }
            }
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker task panicked during drain");
            }
        }
    }
}

/// Bounded attempts for persisting the terminal judging result (§7:
/// "retried within the task with bounded attempts"). Only
/// `StoreError::is_retryable` failures are retried; anything else fails
/// fast.
const MAX_PERSIST_ATTEMPTS: usize = 3;

/// The per-submission pipeline (§4.5): parse, mark running, fetch test
/// cases, judge, persist, publish, commit. Every failure past parsing
/// is recorded as an `error` result rather than propagated, so one bad
/// submission never stalls the consumer offset — except a persist
/// failure that survives retries, which must leave the offset
/// uncommitted so the broker redelivers the message (§7).
async fn process_one(
    consumer: &dyn MessageConsumer,
    producer: &dyn MessageProducer,
    store: &dyn Store,
    sandbox: &dyn Sandbox,
    limits: ExecLimits,
    message: InboundMessage,
) {
    let submission: Submission = match serde_json::from_slice(&message.payload) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "dropping undecodable submission payload");
            let _ = consumer.commit(&message).await;
            return;
        }
    };

    let (result, commit_regardless) = run_submission(store, sandbox, limits, &submission).await;

    match persist_with_retry(store, &result).await {
        Ok(()) => {
            match serde_json::to_vec(&result) {
                Ok(payload) => {
                    if let Err(e) = producer.produce(&submission.id, &payload).await {
                        warn!(submission_id = %submission.id, error = %e, "failed to publish judging result");
                    }
                }
                Err(e) => {
                    error!(submission_id = %submission.id, error = %e, "failed to encode judging result")
                }
            }

            if let Err(e) = consumer.commit(&message).await {
                error!(submission_id = %submission.id, error = %e, "failed to commit consumer offset");
            }
        }
        Err(e) => {
            error!(submission_id = %submission.id, error = %e, "failed to persist judging result after retries");

            if commit_regardless {
                if let Err(e) = consumer.commit(&message).await {
                    error!(submission_id = %submission.id, error = %e, "failed to commit consumer offset");
                }
            } else {
                warn!(submission_id = %submission.id, "leaving offset uncommitted for redelivery");
            }
        }
    }
}

/// Persists `result`, retrying transient store failures up to
/// `MAX_PERSIST_ATTEMPTS` times before giving up.
async fn persist_with_retry(store: &dyn Store, result: &JudgingResult) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.save_judging_result(result).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < MAX_PERSIST_ATTEMPTS => {
                warn!(
                    submission_id = %result.submission_id,
                    attempt,
                    error = %e,
                    "transient store failure persisting judging result, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs the judging pipeline for one submission. Returns the terminal
/// result plus whether the consumer offset must be committed even if
/// persisting that result fails — true only for the step-3 "failed to
/// mark running" path (§4.5.1: "route to the error path and commit"),
/// false for every other path, where a persist failure must leave the
/// offset uncommitted so the broker redelivers.
async fn run_submission(
    store: &dyn Store,
    sandbox: &dyn Sandbox,
    limits: ExecLimits,
    submission: &Submission,
) -> (JudgingResult, bool) {
    if let Err(e) = store
        .set_submission_status(&submission.id, SubmissionStatus::Running)
        .await
    {
        error!(submission_id = %submission.id, error = %e, "failed to mark submission running, routing to error path");
        return (
            JudgingResult::error(&submission.id, format!("failed to mark submission running: {e}")),
            true,
        );
    }

    let test_cases = match store.list_test_cases(&submission.problem_id).await {
        Ok(cases) if !cases.is_empty() => cases,
        Ok(_) => {
            return (
                JudgingResult::error(&submission.id, "no test cases for problem"),
                false,
            );
        }
        Err(e) => {
            return (
                JudgingResult::error(&submission.id, format!("failed to load test cases: {e}")),
                false,
            );
        }
    };

    let result = crate::judge::judge_submission(sandbox, submission, &test_cases, limits).await;
    (result, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::FakeBroker;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use chrono::Utc;
    use oj_shared::{ProgrammingLanguage, TestCase};
    use sandbox::{CompileOutcome, CompileResult, ExecResult, ExecuteOutcome, SandboxError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoSandbox;

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn compile(
            &self,
            _language: ProgrammingLanguage,
            _code: &[u8],
        ) -> Result<CompileOutcome, SandboxError> {
            Ok(CompileOutcome {
                compile_output: String::new(),
                result: CompileResult::Ok,
            })
        }

        async fn execute(
            &self,
            _language: ProgrammingLanguage,
            _code: &[u8],
            input: &[u8],
            _limits: ExecLimits,
        ) -> Result<ExecuteOutcome, SandboxError> {
            Ok(ExecuteOutcome {
                stdout: input.to_vec(),
                elapsed: Duration::from_millis(1),
                memory_estimate_bytes: 0,
                result: ExecResult::Ok,
            })
        }
    }

    struct InMemoryStore {
        test_cases: Vec<TestCase>,
        saved: Mutex<Vec<JudgingResult>>,
        concurrent_calls: AtomicUsize,
        max_concurrent_calls: AtomicUsize,
    }

    impl InMemoryStore {
        fn new(test_cases: Vec<TestCase>) -> Self {
            Self {
                test_cases,
                saved: Mutex::new(Vec::new()),
                concurrent_calls: AtomicUsize::new(0),
                max_concurrent_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn list_test_cases(&self, _problem_id: &str) -> Result<Vec<TestCase>, StoreError> {
            let current = self.concurrent_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_calls.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent_calls.fetch_sub(1, Ordering::SeqCst);
            Ok(self.test_cases.clone())
        }

        async fn set_submission_status(
            &self,
            _submission_id: &str,
            _status: SubmissionStatus,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_judging_result(&self, result: &JudgingResult) -> Result<(), StoreError> {
            self.saved.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    fn submission(id: &str) -> Submission {
        Submission {
            id: id.to_string(),
            user_id: "user-1".into(),
            problem_id: "prob-1".into(),
            language: ProgrammingLanguage::Python,
            code: "print(input())".into(),
            status: SubmissionStatus::Pending,
            submitted_at: Utc::now(),
        }
    }

    fn payload_for(id: &str) -> Vec<u8> {
        serde_json::to_vec(&submission(id)).unwrap()
    }

    #[tokio::test]
    async fn judges_every_submission_and_commits_its_offset() {
        let test_case = {
            let mut tc = TestCase::new("tc-1", "prob-1");
            tc.input = b"hi".to_vec();
            tc.expected_output = b"hi".to_vec();
            tc
        };
        let broker = Arc::new(FakeBroker::new(vec![payload_for("sub-1"), payload_for("sub-2")]));
        let store = Arc::new(InMemoryStore::new(vec![test_case]));
        let sandbox = Arc::new(EchoSandbox);

        let processor = ProcessorLoop::new(
            broker.clone(),
            broker.clone(),
            store.clone(),
            sandbox,
            ExecLimits::new(Duration::from_secs(2), 64 * 1024 * 1024),
            Duration::from_millis(20),
            4,
        );

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel_clone.cancel();
        });
        processor.run(cancel).await;

        assert_eq!(store.saved.lock().unwrap().len(), 2);
        assert_eq!(broker.committed.lock().unwrap().len(), 2);
        assert_eq!(broker.produced.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn worker_budget_bounds_concurrent_store_calls() {
        let test_case = TestCase::new("tc-1", "prob-1");
        let payloads: Vec<Vec<u8>> = (0..6).map(|i| payload_for(&format!("sub-{i}"))).collect();
        let broker = Arc::new(FakeBroker::new(payloads));
        let store = Arc::new(InMemoryStore::new(vec![test_case]));
        let sandbox = Arc::new(EchoSandbox);

        let processor = ProcessorLoop::new(
            broker.clone(),
            broker.clone(),
            store.clone(),
            sandbox,
            ExecLimits::new(Duration::from_secs(2), 64 * 1024 * 1024),
            Duration::from_millis(20),
            2,
        );

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel_clone.cancel();
        });
        processor.run(cancel).await;

        assert!(store.max_concurrent_calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(store.saved.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn missing_test_cases_produce_an_error_result_without_panicking() {
        let broker = Arc::new(FakeBroker::new(vec![payload_for("sub-1")]));
        let store = Arc::new(InMemoryStore::new(vec![]));
        let sandbox = Arc::new(EchoSandbox);

        let (result, commit_regardless) = run_submission(
            store.as_ref(),
            sandbox.as_ref(),
            ExecLimits::new(Duration::from_secs(2), 64 * 1024 * 1024),
            &submission("sub-1"),
        )
        .await;

        assert_eq!(result.status, SubmissionStatus::Error);
        assert!(result.error.contains("no test cases"));
        assert!(!commit_regardless);
        let _ = broker;
    }

    /// A store whose `set_submission_status` always fails, to exercise
    /// the step-3 error-routing path.
    struct RunningUpdateFailsStore {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl Store for RunningUpdateFailsStore {
        async fn list_test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, StoreError> {
            self.inner.list_test_cases(problem_id).await
        }

        async fn set_submission_status(
            &self,
            _submission_id: &str,
            _status: SubmissionStatus,
        ) -> Result<(), StoreError> {
            Err(StoreError::Permanent("database unreachable".into()))
        }

        async fn save_judging_result(&self, result: &JudgingResult) -> Result<(), StoreError> {
            self.inner.save_judging_result(result).await
        }
    }

    #[tokio::test]
    async fn failed_running_update_routes_to_error_path_and_commits_regardless() {
        let store = Arc::new(RunningUpdateFailsStore {
            inner: InMemoryStore::new(vec![TestCase::new("tc-1", "prob-1")]),
        });
        let sandbox = Arc::new(EchoSandbox);

        let (result, commit_regardless) = run_submission(
            store.as_ref(),
            sandbox.as_ref(),
            ExecLimits::new(Duration::from_secs(2), 64 * 1024 * 1024),
            &submission("sub-1"),
        )
        .await;

        assert_eq!(result.status, SubmissionStatus::Error);
        assert!(result.error.contains("failed to mark submission running"));
        assert!(commit_regardless);
    }

    /// A store whose `save_judging_result` fails a configurable number
    /// of times with a transient error before succeeding (or never
    /// succeeds, if `fail_forever` is set).
    struct FlakyStore {
        inner: InMemoryStore,
        remaining_failures: AtomicUsize,
        fail_forever: bool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn list_test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, StoreError> {
            self.inner.list_test_cases(problem_id).await
        }

        async fn set_submission_status(
            &self,
            submission_id: &str,
            status: SubmissionStatus,
        ) -> Result<(), StoreError> {
            self.inner.set_submission_status(submission_id, status).await
        }

        async fn save_judging_result(&self, result: &JudgingResult) -> Result<(), StoreError> {
            if self.fail_forever || self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Transient("connection reset".into()));
            }
            self.inner.save_judging_result(result).await
        }
    }

    #[tokio::test]
    async fn persist_with_retry_recovers_from_transient_failures_within_the_budget() {
        let store = FlakyStore {
            inner: InMemoryStore::new(vec![]),
            remaining_failures: AtomicUsize::new(MAX_PERSIST_ATTEMPTS - 1),
            fail_forever: false,
        };
        let result = JudgingResult::error("sub-1", "test");

        let outcome = persist_with_retry(&store, &result).await;

        assert!(outcome.is_ok());
        assert_eq!(store.inner.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_with_retry_gives_up_after_the_bounded_attempts() {
        let store = FlakyStore {
            inner: InMemoryStore::new(vec![]),
            remaining_failures: AtomicUsize::new(0),
            fail_forever: true,
        };
        let result = JudgingResult::error("sub-1", "test");

        let outcome = persist_with_retry(&store, &result).await;

        assert!(outcome.is_err());
        assert!(store.inner.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_failure_leaves_offset_uncommitted_so_the_message_is_redelivered() {
        let broker = Arc::new(FakeBroker::new(vec![payload_for("sub-1")]));
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(vec![TestCase::new("tc-1", "prob-1")]),
            remaining_failures: AtomicUsize::new(0),
            fail_forever: true,
        });
        let sandbox = Arc::new(EchoSandbox);

        let message = broker.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        process_one(
            broker.as_ref(),
            broker.as_ref(),
            store.as_ref(),
            sandbox.as_ref(),
            ExecLimits::new(Duration::from_secs(2), 64 * 1024 * 1024),
            message,
        )
        .await;

        assert!(broker.committed.lock().unwrap().is_empty());
        assert!(broker.produced.lock().unwrap().is_empty());
    }
}
