//! Fixed-window rate limiting
//!
//! Counters live in the same transactional store as the ledger so the limit
//! holds across instances; each check is a single atomic upsert. The
//! in-memory backend exists for tests and single-node runs.

use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

const DEFAULT_WINDOW_SECONDS: i64 = 60;

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: i64,
    /// Seconds until the window rolls over; set when the check is denied.
    pub retry_after_seconds: Option<u64>,
}

enum Backend {
    Postgres(sqlx::PgPool),
    Memory(Mutex<HashMap<(Uuid, i64), i64>>),
}

/// Per-account fixed-window request limiter.
pub struct RateLimiter {
    backend: Backend,
    window_seconds: i64,
}

impl RateLimiter {
    /// Shared-store backend; required for multi-instance deployments.
    pub fn new_postgres(pool: sqlx::PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_window(mut self, window_seconds: i64) -> Self {
        self.window_seconds = window_seconds;
        self
    }

    /// Count this request against the account's current window.
    pub async fn check(&self, account_id: Uuid, limit: i64) -> LedgerResult<RateLimitResult> {
        self.check_at(
            account_id,
            limit,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .await
    }

    pub(crate) async fn check_at(
        &self,
        account_id: Uuid,
        limit: i64,
        now_unix: i64,
    ) -> LedgerResult<RateLimitResult> {
        let window_start_unix = now_unix - now_unix.rem_euclid(self.window_seconds);
        let count = match &self.backend {
            Backend::Postgres(pool) => {
                let window_start = OffsetDateTime::from_unix_timestamp(window_start_unix)
                    .map_err(|_| LedgerError::Database("window start out of range".to_string()))?;
                let (count,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO rate_limit_windows (account_id, window_start, request_count)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (account_id, window_start)
                    DO UPDATE SET request_count = rate_limit_windows.request_count + 1
                    RETURNING request_count
                    "#,
                )
                .bind(account_id)
                .bind(window_start)
                .fetch_one(pool)
                .await?;
                count
            }
            Backend::Memory(windows) => {
                let mut windows = windows.lock().await;
                let count = windows
                    .entry((account_id, window_start_unix))
                    .or_insert(0);
                *count += 1;
                *count
            }
        };

        let allowed = count <= limit;
        Ok(RateLimitResult {
            allowed,
            remaining: (limit - count).max(0),
            retry_after_seconds: if allowed {
                None
            } else {
                Some((window_start_unix + self.window_seconds - now_unix).max(1) as u64)
            },
        })
    }

    /// Drop windows older than the current one. Cheap enough to run on an
    /// interval from the server binary.
    pub async fn cleanup(&self) -> LedgerResult<u64> {
        let now_unix = OffsetDateTime::now_utc().unix_timestamp();
        let cutoff_unix = now_unix - now_unix.rem_euclid(self.window_seconds);

        match &self.backend {
            Backend::Postgres(pool) => {
                let cutoff = OffsetDateTime::from_unix_timestamp(cutoff_unix)
                    .map_err(|_| LedgerError::Database("cutoff out of range".to_string()))?;
                let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
                    .bind(cutoff)
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected())
            }
            Backend::Memory(windows) => {
                let mut windows = windows.lock().await;
                let before = windows.len();
                windows.retain(|(_, start), _| *start >= cutoff_unix);
                Ok((before - windows.len()) as u64)
            }
        }
    }
}
