//! Call history.

use quadlink_realtime::types::{CallLogEntry, EndReason, MediaKind, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::invalid;
use crate::types::DatabaseResult;

#[derive(Clone)]
pub struct CallRepository {
    pool: SqlitePool,
}

impl CallRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, entry: &CallLogEntry) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO call_log (call_id, caller_id, callee_id, media_kind, outcome, started_at, connected_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.call_id)
        .bind(entry.caller_id)
        .bind(entry.callee_id)
        .bind(entry.media_kind.as_str())
        .bind(entry.outcome.as_str())
        .bind(entry.started_at)
        .bind(entry.connected_at)
        .bind(entry.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Calls the identity took part in, newest first.
    pub async fn recent_for(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> DatabaseResult<Vec<CallLogEntry>> {
        let rows = sqlx::query(
            "SELECT call_id, caller_id, callee_id, media_kind, outcome, started_at, connected_at, ended_at
             FROM call_log WHERE caller_id = ? OR callee_id = ?
             ORDER BY ended_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &SqliteRow) -> DatabaseResult<CallLogEntry> {
    let media_kind: String = row.try_get("media_kind")?;
    let outcome: String = row.try_get("outcome")?;
    Ok(CallLogEntry {
        call_id: row.try_get("call_id")?,
        caller_id: row.try_get("caller_id")?,
        callee_id: row.try_get("callee_id")?,
        media_kind: MediaKind::parse(&media_kind)
            .ok_or_else(|| invalid("media kind", &media_kind))?,
        outcome: EndReason::parse(&outcome).ok_or_else(|| invalid("call outcome", &outcome))?,
        started_at: row.try_get("started_at")?,
        connected_at: row.try_get("connected_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn records_and_lists_calls() {
        let (pool, _dir) = test_pool().await;
        let repo = CallRepository::new(pool);
        let started = Utc::now() - Duration::seconds(40);

        repo.record(&CallLogEntry {
            call_id: "call-1".into(),
            caller_id: 1,
            callee_id: 2,
            media_kind: MediaKind::Video,
            outcome: EndReason::NoAnswer,
            started_at: started,
            connected_at: None,
            ended_at: started + Duration::seconds(30),
        })
        .await
        .unwrap();

        let for_callee = repo.recent_for(2, 10).await.unwrap();
        assert_eq!(for_callee.len(), 1);
        assert_eq!(for_callee[0].outcome, EndReason::NoAnswer);
        assert_eq!(for_callee[0].media_kind, MediaKind::Video);
        assert!(repo.recent_for(3, 10).await.unwrap().is_empty());
    }
}
