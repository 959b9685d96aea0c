//! The durable run queue.
//!
//! Claims use a conditional `UPDATE ... WHERE status = 'queued'` so two
//! workers racing on the same row cannot both win the lease (SQLite
//! serializes writers, but the conditional guards against logic bugs too).

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::model::{QueueStatus, RunQueueEntry};

fn status_to_str(s: QueueStatus) -> &'static str {
    match s {
        QueueStatus::Queued => "queued",
        QueueStatus::Leased => "leased",
        QueueStatus::Done => "done",
    }
}

fn status_from_str(s: &str) -> StoreResult<QueueStatus> {
    match s {
        "queued" => Ok(QueueStatus::Queued),
        "leased" => Ok(QueueStatus::Leased),
        "done" => Ok(QueueStatus::Done),
        other => Err(StoreError::Corrupt {
            column: "status",
            value: other.to_string(),
        }),
    }
}

impl Store {
    /// Total queued-or-leased entries across every tenant, for the
    /// Scheduler's global concurrency cap.
    pub async fn count_in_flight_total(&self) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM run_queue WHERE status IN ('queued', 'leased')")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Queued-or-leased entries belonging to `tenant_id`'s tests, for the
    /// Scheduler's per-tenant concurrency cap.
    pub async fn count_in_flight_for_tenant(&self, tenant_id: Uuid) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM run_queue \
             JOIN tests ON tests.id = run_queue.test_id \
             WHERE run_queue.status IN ('queued', 'leased') AND tests.tenant_id = ?",
        )
        .bind(tenant_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Enqueues a run for `test_id`, unless one is already queued or leased
    /// for that test (the single-in-flight-run-per-test invariant).
    pub async fn enqueue_if_idle(&self, test_id: Uuid, due_ts: DateTime<Utc>) -> StoreResult<bool> {
        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM run_queue WHERE test_id = ? AND status IN ('queued', 'leased')",
        )
        .bind(test_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        if in_flight > 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO run_queue (id, test_id, due_ts, attempt, status) \
             VALUES (?, ?, ?, 0, 'queued')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(test_id.to_string())
        .bind(due_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Claims the oldest queued entry, leasing it to `worker_id` for
    /// `lease_seconds`. Returns `None` if the queue is empty.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<Option<RunQueueEntry>> {
        let candidate = sqlx::query(
            "SELECT id FROM run_queue WHERE status = 'queued' AND due_ts <= ? \
             ORDER BY due_ts ASC LIMIT 1",
        )
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let id: String = row.try_get("id")?;
        let leased_until = Utc::now() + Duration::seconds(lease_seconds);

        let updated = sqlx::query(
            "UPDATE run_queue SET status = 'leased', leased_by = ?, leased_until_ts = ?, \
             attempt = attempt + 1 WHERE id = ? AND status = 'queued'",
        )
        .bind(worker_id)
        .bind(leased_until.to_rfc3339())
        .bind(&id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Lost the race to another worker; caller should try again.
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM run_queue WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(entry_from_row(row)?))
    }

    pub async fn mark_queue_entry_done(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE run_queue SET status = 'done' WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reclaims leases whose `leased_until_ts` has passed, e.g. after a
    /// worker crash. Returns the reclaimed entries so the caller can record
    /// a synthetic `infra_degraded` run for each.
    pub async fn reclaim_abandoned_leases(&self) -> StoreResult<Vec<RunQueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM run_queue WHERE status = 'leased' AND leased_until_ts < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = entry_from_row(row)?;
            sqlx::query("UPDATE run_queue SET status = 'done' WHERE id = ?")
                .bind(entry.id.to_string())
                .execute(&self.pool)
                .await?;
            reclaimed.push(entry);
        }
        Ok(reclaimed)
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<RunQueueEntry> {
    let id: String = row.try_get("id")?;
    let test_id: String = row.try_get("test_id")?;
    let due_ts: String = row.try_get("due_ts")?;
    let status: String = row.try_get("status")?;
    let leased_until_ts: Option<String> = row.try_get("leased_until_ts")?;
    Ok(RunQueueEntry {
        id: Uuid::parse_str(&id).map_err(|_| StoreError::Corrupt { column: "id", value: id })?,
        test_id: Uuid::parse_str(&test_id).map_err(|_| StoreError::Corrupt {
            column: "test_id",
            value: test_id,
        })?,
        due_ts: chrono::DateTime::parse_from_rfc3339(&due_ts)
            .map_err(|_| StoreError::Corrupt {
                column: "due_ts",
                value: due_ts,
            })?
            .with_timezone(&Utc),
        attempt: row.try_get("attempt")?,
        status: status_from_str(&status)?,
        leased_by: row.try_get("leased_by")?,
        leased_until_ts: leased_until_ts
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| StoreError::Corrupt {
                        column: "leased_until_ts",
                        value: s,
                    })
            })
            .transpose()?,
    })
}

#[allow(dead_code)]
fn roundtrip_status(s: QueueStatus) -> QueueStatus {
    status_from_str(status_to_str(s)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Test, TestKind};

    async fn seeded_store() -> (Store, Uuid) {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant = store.create_tenant("acme").await.unwrap();
        let now = Utc::now();
        let test = Test {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            name: "t".into(),
            base_url: "https://example.com".into(),
            kind: TestKind::ScriptPython,
            enabled: true,
            disabled_reason: None,
            disabled_until_ts: None,
            interval_seconds: 300,
            timeout_seconds: 30,
            jitter_seconds: 10,
            down_after_failures: 2,
            up_after_successes: 2,
            source_blob_ref: "x".into(),
            created_at: now,
            updated_at: now,
        };
        store.insert_test(&test).await.unwrap();
        (store, test.id)
    }

    #[tokio::test]
    async fn enqueue_coalesces_while_in_flight() {
        let (store, test_id) = seeded_store().await;
        assert!(store.enqueue_if_idle(test_id, Utc::now()).await.unwrap());
        // A second trigger while the first is still queued does not enqueue again.
        assert!(!store.enqueue_if_idle(test_id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn claim_next_leases_and_hides_from_other_claimants() {
        let (store, test_id) = seeded_store().await;
        store.enqueue_if_idle(test_id, Utc::now()).await.unwrap();

        let claimed = store.claim_next("worker-1", 60).await.unwrap().unwrap();
        assert_eq!(claimed.test_id, test_id);

        let second = store.claim_next("worker-2", 60).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn abandoned_leases_are_reclaimed() {
        let (store, test_id) = seeded_store().await;
        store.enqueue_if_idle(test_id, Utc::now()).await.unwrap();
        let claimed = store.claim_next("worker-1", -1).await.unwrap().unwrap();

        let reclaimed = store.reclaim_abandoned_leases().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed.id);

        // Now idle again; a new run can be enqueued.
        assert!(store.enqueue_if_idle(test_id, Utc::now()).await.unwrap());
    }
}
