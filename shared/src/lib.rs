use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Programming languages the judging core can compile and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgrammingLanguage {
    Go,
    Python,
    Java,
    C,
    Cpp,
}

impl ProgrammingLanguage {
    /// Source file extension for this language.
    pub fn file_extension(&self) -> &'static str {
        match self {
            ProgrammingLanguage::Go => "go",
            ProgrammingLanguage::Python => "py",
            ProgrammingLanguage::Java => "java",
            ProgrammingLanguage::C => "c",
            ProgrammingLanguage::Cpp => "cpp",
        }
    }

    /// Whether this language requires a compile step before execution.
    pub fn needs_compilation(&self) -> bool {
        match self {
            ProgrammingLanguage::Go
            | ProgrammingLanguage::Java
            | ProgrammingLanguage::C
            | ProgrammingLanguage::Cpp => true,
            ProgrammingLanguage::Python => false,
        }
    }

    /// Toolchain image tag used by the secure sandbox for this language.
    pub fn toolchain_image(&self) -> &'static str {
        match self {
            ProgrammingLanguage::Go => "codecourt-toolchain-go",
            ProgrammingLanguage::Python => "codecourt-toolchain-python",
            ProgrammingLanguage::Java => "codecourt-toolchain-java",
            ProgrammingLanguage::C => "codecourt-toolchain-c",
            ProgrammingLanguage::Cpp => "codecourt-toolchain-cpp",
        }
    }

    /// Parses a language tag from the wire representation used on the
    /// submission topic. Unknown tags are rejected, not defaulted.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "go" => Some(ProgrammingLanguage::Go),
            "python" | "python3" | "py" => Some(ProgrammingLanguage::Python),
            "java" => Some(ProgrammingLanguage::Java),
            "c" => Some(ProgrammingLanguage::C),
            "cpp" | "c++" => Some(ProgrammingLanguage::Cpp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgrammingLanguage::Go => "go",
            ProgrammingLanguage::Python => "python",
            ProgrammingLanguage::Java => "java",
            ProgrammingLanguage::C => "c",
            ProgrammingLanguage::Cpp => "cpp",
        }
    }
}

impl fmt::Display for ProgrammingLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a submission as tracked by the judging core.
///
/// `Pending` and `Running` are the only non-terminal states; every other
/// variant is terminal for a given processing round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Accepted,
    Rejected,
    Error,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
    RuntimeError,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending | SubmissionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Error => "error",
            SubmissionStatus::TimeLimitExceeded => "time_limit_exceeded",
            SubmissionStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            SubmissionStatus::CompilationError => "compilation_error",
            SubmissionStatus::RuntimeError => "runtime_error",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A code submission as it arrives on the submission topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub user_id: String,
    pub problem_id: String,
    pub language: ProgrammingLanguage,
    pub code: String,
    /// Advisory on ingress; the core recomputes it.
    pub status: SubmissionStatus,
    pub submitted_at: DateTime<Utc>,
}

impl Submission {
    pub fn filename(&self) -> String {
        format!("main.{}", self.language.file_extension())
    }
}

/// A single test case belonging to a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub problem_id: String,
    pub input: Vec<u8>,
    pub expected_output: Vec<u8>,
    pub is_hidden: bool,
}

impl TestCase {
    pub fn new(id: impl Into<String>, problem_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            problem_id: problem_id.into(),
            input: Vec::new(),
            expected_output: Vec::new(),
            is_hidden: false,
        }
    }
}

/// Outcome of running one test case against a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case_id: String,
    pub passed: bool,
    pub actual_output: Vec<u8>,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Memory used, in bytes (estimated in Local mode).
    pub memory_used_bytes: u64,
    pub error: String,
}

impl TestResult {
    /// A result for a test case that never ran because of an earlier
    /// sandbox failure unrelated to the candidate's output.
    pub fn failed(test_case_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            passed: false,
            actual_output: Vec::new(),
            execution_time_ms: 0,
            memory_used_bytes: 0,
            error: error.into(),
        }
    }
}

/// Composite judging outcome for a submission: exactly one per
/// submission id per processing round (upserted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgingResult {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub test_results: Vec<TestResult>,
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub compile_output: String,
    pub error: String,
    pub judged_at: DateTime<Utc>,
}

impl JudgingResult {
    /// A minimal result used on the error path (§4.5 step 8): no test
    /// cases were run, `status = error`.
    pub fn error(submission_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.into(),
            status: SubmissionStatus::Error,
            test_results: Vec::new(),
            execution_time_ms: 0,
            memory_used_bytes: 0,
            compile_output: String::new(),
            error: cause.into(),
            judged_at: Utc::now(),
        }
    }

    pub fn passed_count(&self) -> usize {
        self.test_results.iter().filter(|r| r.passed).count()
    }
}

/// Per-test-case and overall resource limits applied during judging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Wall-clock and cpu-time cap per test case.
    pub max_execution_time_ms: u64,
    /// Memory cap per execution, in bytes.
    pub max_memory_usage_bytes: u64,
}

impl Limits {
    pub fn new(max_execution_time_ms: u64, max_memory_usage_bytes: u64) -> Self {
        Self {
            max_execution_time_ms,
            max_memory_usage_bytes,
        }
    }
}

/// Normalizes output for comparison: canonicalizes line endings (CRLF
/// and LF both accepted) and trims trailing whitespace on the final
/// line. Case-sensitive; interior whitespace is significant.
///
/// This is deliberately the *minimum* contract from the judging spec;
/// it is the extension point for richer comparators (e.g. float
/// tolerance, token-based diffing) that the core does not implement.
pub fn compare_output(actual: &[u8], expected: &[u8]) -> bool {
    normalize(actual) == normalize(expected)
}

fn normalize(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    let unified: String = text.replace("\r\n", "\n");
    let trimmed = unified.trim_end_matches(['\n', ' ', '\t', '\r']);
    let mut out = trimmed.as_bytes().to_vec();
    out.push(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_round_trip() {
        for lang in [
            ProgrammingLanguage::Go,
            ProgrammingLanguage::Python,
            ProgrammingLanguage::Java,
            ProgrammingLanguage::C,
            ProgrammingLanguage::Cpp,
        ] {
            assert_eq!(ProgrammingLanguage::parse(lang.as_str()), Some(lang));
        }
        assert_eq!(ProgrammingLanguage::parse("brainfuck"), None);
    }

    #[test]
    fn needs_compilation_matches_spec_closed_set() {
        assert!(ProgrammingLanguage::Go.needs_compilation());
        assert!(ProgrammingLanguage::Java.needs_compilation());
        assert!(ProgrammingLanguage::C.needs_compilation());
        assert!(ProgrammingLanguage::Cpp.needs_compilation());
        assert!(!ProgrammingLanguage::Python.needs_compilation());
    }

    #[test]
    fn compare_output_trims_trailing_whitespace_on_final_line() {
        assert!(compare_output(b"Hello, World!\n", b"Hello, World!"));
        assert!(compare_output(b"Hello, World!", b"Hello, World!\n   "));
    }

    #[test]
    fn compare_output_accepts_crlf_and_lf() {
        assert!(compare_output(b"a\r\nb\r\n", b"a\nb\n"));
    }

    #[test]
    fn compare_output_is_case_sensitive_and_respects_interior_whitespace() {
        assert!(!compare_output(b"Hello", b"hello"));
        assert!(!compare_output(b"a  b", b"a b"));
    }

    #[test]
    fn submission_status_terminal_classification() {
        assert!(!SubmissionStatus::Pending.is_terminal());
        assert!(!SubmissionStatus::Running.is_terminal());
        assert!(SubmissionStatus::Accepted.is_terminal());
        assert!(SubmissionStatus::Error.is_terminal());
    }

    #[test]
    fn judging_result_error_has_no_test_results() {
        let r = JudgingResult::error("sub-1", "no test cases for problem");
        assert_eq!(r.status, SubmissionStatus::Error);
        assert!(r.test_results.is_empty());
        assert_eq!(r.error, "no test cases for problem");
    }

    #[test]
    fn serde_round_trip_submission() {
        let s = Submission {
            id: "sub-1".into(),
            user_id: "user-1".into(),
            problem_id: "prob-1".into(),
            language: ProgrammingLanguage::Python,
            code: "print(1)".into(),
            status: SubmissionStatus::Pending,
            submitted_at: Utc::now(),
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: Submission = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
