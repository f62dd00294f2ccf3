//! The relational store adapter: fetches ordered test cases for a
//! problem and persists composite judging results atomically.
//!
//! Uses `sqlx`'s dynamic query API (`query`/`query_as` + `.bind(..)`)
//! rather than the compile-time-checked `query!` macros, so the crate
//! builds without a live database connection or checked-in query
//! metadata at compile time.

use async_trait::async_trait;
use oj_shared::{JudgingResult, SubmissionStatus, TestCase};
use sqlx::PgPool;

use crate::error::StoreError;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, StoreError>;
    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<(), StoreError>;
    async fn save_judging_result(&self, result: &JudgingResult) -> Result<(), StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(db_err.to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
        _ => StoreError::Permanent(err.to_string()),
    }
}

#[derive(sqlx::FromRow)]
struct TestCaseRow {
    id: String,
    problem_id: String,
    input: Vec<u8>,
    expected_output: Vec<u8>,
    is_hidden: bool,
}

impl From<TestCaseRow> for TestCase {
    fn from(row: TestCaseRow) -> Self {
        TestCase {
            id: row.id,
            problem_id: row.problem_id,
            input: row.input,
            expected_output: row.expected_output,
            is_hidden: row.is_hidden,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, StoreError> {
        let rows: Vec<TestCaseRow> = sqlx::query_as(
            r#"
            SELECT id, problem_id, input, expected_output, is_hidden
            FROM test_cases
            WHERE problem_id = $1
            ORDER BY id
            "#,
        )
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(TestCase::from).collect())
    }

    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE submissions SET status = $2 WHERE id = $1"#)
            .bind(submission_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn save_judging_result(&self, result: &JudgingResult) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query(
            r#"
            INSERT INTO judging_results
                (submission_id, status, execution_time, memory_used, compile_output, error, judged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (submission_id) DO UPDATE SET
                status = EXCLUDED.status,
                execution_time = EXCLUDED.execution_time,
                memory_used = EXCLUDED.memory_used,
                compile_output = EXCLUDED.compile_output,
                error = EXCLUDED.error,
                judged_at = EXCLUDED.judged_at
            "#,
        )
        .bind(&result.submission_id)
        .bind(result.status.as_str())
        .bind(result.execution_time_ms as i64)
        .bind(result.memory_used_bytes as i64)
        .bind(&result.compile_output)
        .bind(&result.error)
        .bind(result.judged_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        for test_result in &result.test_results {
            sqlx::query(
                r#"
                INSERT INTO test_results
                    (submission_id, test_case_id, passed, actual_output, execution_time, memory_used, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (submission_id, test_case_id) DO UPDATE SET
                    passed = EXCLUDED.passed,
                    actual_output = EXCLUDED.actual_output,
                    execution_time = EXCLUDED.execution_time,
                    memory_used = EXCLUDED.memory_used,
                    error = EXCLUDED.error
                "#,
            )
            .bind(&result.submission_id)
            .bind(&test_result.test_case_id)
            .bind(test_result.passed)
            .bind(&test_result.actual_output)
            .bind(test_result.execution_time_ms as i64)
            .bind(test_result.memory_used_bytes as i64)
            .bind(&test_result.error)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        sqlx::query(r#"UPDATE submissions SET status = $2 WHERE id = $1"#)
            .bind(&result.submission_id)
            .bind(result.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_row_maps_onto_the_shared_test_case_type() {
        let row = TestCaseRow {
            id: "tc-1".into(),
            problem_id: "prob-1".into(),
            input: b"1 2".to_vec(),
            expected_output: b"3".to_vec(),
            is_hidden: true,
        };
        let tc: TestCase = row.into();
        assert_eq!(tc.id, "tc-1");
        assert!(tc.is_hidden);
    }

    #[test]
    fn classify_is_a_total_function_over_sqlx_error_variants() {
        // Most sqlx::Error variants aren't publicly constructible;
        // the mapping's behavior for the reachable ones is exercised
        // through PgStore's integration tests against a live database.
        let _ = classify;
    }
}
