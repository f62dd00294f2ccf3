//! The per-submission judging pipeline: compile once, then execute
//! against every test case concurrently (bounded only by the test-case
//! count, not by the outer worker semaphore), aggregate into a
//! composite result, and derive the overall status.

use std::sync::Arc;

use chrono::Utc;
use oj_shared::{
    compare_output, JudgingResult, ProgrammingLanguage, Submission, SubmissionStatus, TestCase,
    TestResult,
};
use sandbox::{CompileResult, ExecLimits, ExecResult, Sandbox};
use tokio::sync::Mutex;

/// Runs the full judging pipeline for one submission against its test
/// cases, returning a composite result that always covers every test
/// case attempted — the Judger never aborts on a single test-case
/// failure.
pub async fn judge_submission(
    sandbox: &dyn Sandbox,
    submission: &Submission,
    test_cases: &[TestCase],
    limits: ExecLimits,
) -> JudgingResult {
    let judged_at = Utc::now();

    let compile_outcome = match sandbox.compile(submission.language, submission.code.as_bytes()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return JudgingResult {
                submission_id: submission.id.clone(),
                status: SubmissionStatus::Error,
                test_results: Vec::new(),
                execution_time_ms: 0,
                memory_used_bytes: 0,
                compile_output: String::new(),
                error: format!("sandbox failure during compile: {e}"),
                judged_at,
            };
        }
    };

    if let CompileResult::CompileFailed { details } = &compile_outcome.result {
        return JudgingResult {
            submission_id: submission.id.clone(),
            status: SubmissionStatus::CompilationError,
            test_results: Vec::new(),
            execution_time_ms: 0,
            memory_used_bytes: 0,
            compile_output: compile_outcome.compile_output.clone(),
            error: details.clone(),
            judged_at,
        };
    }

    let slots: Vec<Mutex<Option<TestResult>>> =
        test_cases.iter().map(|_| Mutex::new(None)).collect();
    let slots = Arc::new(slots);
    let max_elapsed_ms = Arc::new(Mutex::new(0u64));
    let max_memory_bytes = Arc::new(Mutex::new(0u64));

    let tasks = test_cases.iter().enumerate().map(|(index, test_case)| {
        let slots = Arc::clone(&slots);
        let max_elapsed_ms = Arc::clone(&max_elapsed_ms);
        let max_memory_bytes = Arc::clone(&max_memory_bytes);
        let language = submission.language;
        let code = submission.code.clone();
        let test_case = test_case.clone();

        async move {
            let result = run_one_test_case(sandbox, language, &code, &test_case, limits).await;

            {
                let mut max_elapsed = max_elapsed_ms.lock().await;
                *max_elapsed = (*max_elapsed).max(result.execution_time_ms);
            }
            {
                let mut max_memory = max_memory_bytes.lock().await;
                *max_memory = (*max_memory).max(result.memory_used_bytes);
            }

            let mut slot = slots[index].lock().await;
            *slot = Some(result);
        }
    });

    futures::future::join_all(tasks).await;

    let mut test_results = Vec::with_capacity(test_cases.len());
    for slot in slots.iter() {
        let guard = slot.lock().await;
        test_results.push(
            guard
                .clone()
                .expect("every slot is written exactly once by its task"),
        );
    }

    let max_elapsed_ms = *max_elapsed_ms.lock().await;
    let max_memory_bytes = *max_memory_bytes.lock().await;

    let status = derive_status(&test_results, max_elapsed_ms, max_memory_bytes, limits);

    JudgingResult {
        submission_id: submission.id.clone(),
        status,
        test_results,
        execution_time_ms: max_elapsed_ms,
        memory_used_bytes: max_memory_bytes,
        compile_output: compile_outcome.compile_output,
        error: String::new(),
        judged_at,
    }
}

async fn run_one_test_case(
    sandbox: &dyn Sandbox,
    language: ProgrammingLanguage,
    code: &str,
    test_case: &TestCase,
    limits: ExecLimits,
) -> TestResult {
    let outcome = match sandbox
        .execute(language, code.as_bytes(), &test_case.input, limits)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            return TestResult {
                test_case_id: test_case.id.clone(),
                passed: false,
                actual_output: Vec::new(),
                execution_time_ms: 0,
                memory_used_bytes: 0,
                error: format!("sandbox failure: {e}"),
            };
        }
    };

    let execution_time_ms = outcome.elapsed.as_millis() as u64;
    let memory_used_bytes = outcome.memory_estimate_bytes;

    let (passed, error) = match &outcome.result {
        ExecResult::Ok => (
            compare_output(&outcome.stdout, &test_case.expected_output),
            String::new(),
        ),
        ExecResult::TimedOut => (false, "Time limit exceeded".to_string()),
        ExecResult::Oom => (false, "Memory limit exceeded".to_string()),
        ExecResult::RuntimeError { details } => (false, details.clone()),
        ExecResult::StartFailed { details } => (false, details.clone()),
    };

    TestResult {
        test_case_id: test_case.id.clone(),
        passed,
        actual_output: outcome.stdout,
        execution_time_ms,
        memory_used_bytes,
        error,
    }
}

/// Status derivation, applied in order — first match wins.
pub fn derive_status(
    test_results: &[TestResult],
    max_elapsed_ms: u64,
    max_memory_bytes: u64,
    limits: ExecLimits,
) -> SubmissionStatus {
    let max_execution_time_ms = limits.max_time.as_millis() as u64;
    if max_elapsed_ms >= max_execution_time_ms {
        return SubmissionStatus::TimeLimitExceeded;
    }
    if max_memory_bytes >= limits.max_memory_bytes {
        return SubmissionStatus::MemoryLimitExceeded;
    }
    if test_results.iter().any(|r| !r.error.is_empty()) {
        return SubmissionStatus::RuntimeError;
    }
    if test_results.iter().all(|r| r.passed) {
        return SubmissionStatus::Accepted;
    }
    SubmissionStatus::Rejected
}
