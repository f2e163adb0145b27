//! Message and read-receipt persistence.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use quadlink_realtime::types::{Attachment, Message, MessageId, MessageKind, ReadReceipt, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::invalid;
use crate::types::{DatabaseError, DatabaseResult};

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sequence, sender_id, content, kind, reply_to, attachment, edited, deleted, created_at";

#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fails with [`DatabaseError::Duplicate`] when the id or the
    /// `(chat_id, sequence)` slot is already taken.
    pub async fn insert(&self, message: &Message) -> DatabaseResult<()> {
        let attachment = message
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;

        sqlx::query(
            "INSERT INTO messages (id, chat_id, sequence, sender_id, content, kind, reply_to, attachment, edited, deleted, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(message.sequence as i64)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(&message.reply_to)
        .bind(attachment)
        .bind(message.edited)
        .bind(message.deleted)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(&self, message_id: &str) -> DatabaseResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row)?;
        message.read_by = self
            .receipts_for(std::slice::from_ref(&message.id))
            .await?
            .remove(&message.id)
            .unwrap_or_default();
        Ok(Some(message))
    }

    /// Oldest first. With a cursor: the first `limit` messages after it.
    /// Without: the newest `limit` messages.
    pub async fn page(
        &self,
        chat_id: &str,
        after_sequence: Option<u64>,
        limit: u32,
    ) -> DatabaseResult<Vec<Message>> {
        let rows = match after_sequence {
            Some(after) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ? AND sequence > ? ORDER BY sequence ASC LIMIT ?"
                ))
                .bind(chat_id)
                .bind(after as i64)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                let mut rows = sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ? ORDER BY sequence DESC LIMIT ?"
                ))
                .bind(chat_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
        };

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<DatabaseResult<Vec<_>>>()?;
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
        let mut receipts = self.receipts_for(&ids).await?;
        for message in &mut messages {
            message.read_by = receipts.remove(&message.id).unwrap_or_default();
        }
        Ok(messages)
    }

    pub async fn last_sequence(&self, chat_id: &str) -> DatabaseResult<u64> {
        let last = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(sequence) FROM messages WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(last.unwrap_or(0).max(0) as u64)
    }

    pub async fn count_for_chat(&self, chat_id: &str) -> DatabaseResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Records receipts for messages of `chat_id` not sent by `user_id` and
    /// returns the ids that were newly marked, in request order.
    pub async fn mark_read(
        &self,
        chat_id: &str,
        user_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> DatabaseResult<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let mut newly = Vec::new();

        for id in message_ids {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 SELECT id, ?, ? FROM messages
                 WHERE id = ? AND chat_id = ? AND sender_id <> ?",
            )
            .bind(user_id)
            .bind(read_at)
            .bind(id)
            .bind(chat_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted > 0 {
                newly.push(id.clone());
            }
        }

        if !newly.is_empty() {
            sqlx::query(
                "UPDATE chat_members SET last_read_at = ? WHERE chat_id = ? AND user_id = ?",
            )
            .bind(read_at)
            .bind(chat_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(newly)
    }

    async fn receipts_for(
        &self,
        message_ids: &[MessageId],
    ) -> DatabaseResult<HashMap<MessageId, Vec<ReadReceipt>>> {
        let mut receipts: HashMap<MessageId, Vec<ReadReceipt>> = HashMap::new();
        if message_ids.is_empty() {
            return Ok(receipts);
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in message_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY read_at, user_id");

        for row in query.build().fetch_all(&self.pool).await? {
            let message_id: String = row.try_get("message_id")?;
            receipts.entry(message_id).or_default().push(ReadReceipt {
                user_id: row.try_get("user_id")?,
                read_at: row.try_get("read_at")?,
            });
        }
        Ok(receipts)
    }
}

fn message_from_row(row: &SqliteRow) -> DatabaseResult<Message> {
    let kind: String = row.try_get("kind")?;
    let sequence: i64 = row.try_get("sequence")?;
    let attachment: Option<String> = row.try_get("attachment")?;
    let attachment = attachment
        .map(|raw| serde_json::from_str::<Attachment>(&raw))
        .transpose()
        .map_err(|e| DatabaseError::InvalidData(format!("attachment: {e}")))?;

    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        sequence: u64::try_from(sequence).map_err(|_| invalid("sequence", &sequence.to_string()))?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        kind: MessageKind::parse(&kind).ok_or_else(|| invalid("message kind", &kind))?,
        reply_to: row.try_get("reply_to")?,
        attachment,
        read_by: Vec::new(),
        edited: row.try_get("edited")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
    })
}
