//! Idempotency Service: fingerprint-keyed cache of prior
//! mutating-request responses, keyed by `(owner, key)`.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::db::DbPool;
use crate::error::CoreError;

pub fn fingerprint(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

pub struct IdempotencyService {
    pool: DbPool,
    ttl: Duration,
}

pub enum CheckOutcome {
    /// No prior record, or the prior record expired: caller should proceed.
    Miss,
    /// A prior record with a matching fingerprint: caller should replay it.
    Hit { response_body: String, status_code: i32 },
}

impl IdempotencyService {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Returns `Hit` only when the stored fingerprint matches; returns an
    /// error (conflict) when the key exists but the fingerprint differs.
    pub async fn check(
        &self,
        owner: &str,
        key: &str,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<CheckOutcome, CoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            "SELECT fingerprint, response_body, status_code, expires_at FROM idempotency_keys WHERE owner = ? AND key = ?",
        )
        .bind(owner)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(CheckOutcome::Miss);
        };

        let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(sqlx::Error::from)?;
        if now > expires_at {
            // Lazily expired: treat as absent: a subsequent save() overwrites it.
            return Ok(CheckOutcome::Miss);
        }

        let stored_fingerprint: String = row.try_get("fingerprint").map_err(sqlx::Error::from)?;
        let incoming_fingerprint = fingerprint(method, path, body);
        if stored_fingerprint != incoming_fingerprint {
            return Err(CoreError::Conflict(format!(
                "idempotency key '{key}' was already used with a different request body"
            )));
        }

        let response_body: String = row.try_get("response_body").map_err(sqlx::Error::from)?;
        let status_code: i32 = row.try_get("status_code").map_err(sqlx::Error::from)?;
        Ok(CheckOutcome::Hit { response_body, status_code })
    }

    /// Persist the response for `(owner, key)`. The primary key makes this
    /// first-writer-wins: a losing concurrent writer's row is discarded and
    /// this returns what the winner actually persisted instead.
    pub async fn save(
        &self,
        owner: &str,
        key: &str,
        method: &str,
        path: &str,
        body: &[u8],
        response_body: &str,
        status_code: i32,
    ) -> Result<(String, i32), CoreError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let fp = fingerprint(method, path, body);

        sqlx::query(
            "INSERT INTO idempotency_keys (owner, key, fingerprint, response_body, status_code, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (owner, key) DO NOTHING",
        )
        .bind(owner)
        .bind(key)
        .bind(&fp)
        .bind(response_body)
        .bind(status_code)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT response_body, status_code FROM idempotency_keys WHERE owner = ? AND key = ?")
            .bind(owner)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;

        let persisted_body: String = row.try_get("response_body").map_err(sqlx::Error::from)?;
        let persisted_status: i32 = row.try_get("status_code").map_err(sqlx::Error::from)?;
        Ok((persisted_body, persisted_status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_identical_inputs() {
        let a = fingerprint("POST", "/sandboxes", b"{\"ttl\":120}");
        let b = fingerprint("POST", "/sandboxes", b"{\"ttl\":120}");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_for_different_bodies() {
        let a = fingerprint("POST", "/sandboxes", b"{\"ttl\":120}");
        let b = fingerprint("POST", "/sandboxes", b"{\"ttl\":60}");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_differs_for_different_paths() {
        let a = fingerprint("POST", "/sandboxes", b"{}");
        let b = fingerprint("POST", "/cargos", b"{}");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn save_is_first_writer_wins_on_conflict() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let service = IdempotencyService::new(pool, Duration::hours(1));

        let (body, status) = service.save("owner-1", "key-1", "POST", "/sandboxes", b"{}", "first", 201).await.unwrap();
        assert_eq!(body, "first");
        assert_eq!(status, 201);

        // A second writer for the same (owner, key) must observe the first
        // writer's persisted row, not overwrite it.
        let (body, status) = service.save("owner-1", "key-1", "POST", "/sandboxes", b"{}", "second", 500).await.unwrap();
        assert_eq!(body, "first");
        assert_eq!(status, 201);
    }
}
