//! Chat and membership persistence.

use chrono::{DateTime, Utc};
use quadlink_realtime::types::{Chat, ChatId, ChatKind, ChatSettings, Member, MemberRole, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::invalid;
use crate::types::{DatabaseError, DatabaseResult};

const CHAT_COLUMNS: &str = "id, kind, name, only_admins_can_post, created_by, created_at, last_message_id, last_message_at";

#[derive(Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, chat_id: &str) -> DatabaseResult<Option<Chat>> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"))
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chat_from_row).transpose()
    }

    pub async fn list(&self) -> DatabaseResult<Vec<Chat>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chat_from_row).collect()
    }

    pub async fn members(&self, chat_id: &str) -> DatabaseResult<Vec<Member>> {
        let rows = sqlx::query(
            "SELECT user_id, role, joined_at, last_read_at FROM chat_members
             WHERE chat_id = ? ORDER BY joined_at, user_id",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(member_from_row).collect()
    }

    pub async fn chats_for_member(&self, user_id: UserId) -> DatabaseResult<Vec<ChatId>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT chat_id FROM chat_members WHERE user_id = ? ORDER BY chat_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn find_direct(&self, a: UserId, b: UserId) -> DatabaseResult<Option<ChatId>> {
        let id = sqlx::query_scalar::<_, String>("SELECT id FROM chats WHERE direct_key = ?")
            .bind(Chat::direct_key(a, b))
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Inserts the chat and its initial members atomically. A second direct
    /// chat for the same pair trips the `direct_key` constraint.
    pub async fn create(&self, chat: &Chat, members: &[Member]) -> DatabaseResult<()> {
        let direct_key = match chat.kind {
            ChatKind::Direct => {
                let [first, second] = members else {
                    return Err(DatabaseError::InvalidData(format!(
                        "direct chat {} needs exactly two members",
                        chat.id
                    )));
                };
                Some(Chat::direct_key(first.user_id, second.user_id))
            }
            ChatKind::Group => None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chats (id, kind, name, direct_key, only_admins_can_post, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chat.id)
        .bind(chat.kind.as_str())
        .bind(&chat.name)
        .bind(direct_key)
        .bind(chat.settings.only_admins_can_post)
        .bind(chat.created_by)
        .bind(chat.created_at)
        .execute(&mut *tx)
        .await?;

        for member in members {
            insert_member(&mut tx, &chat.id, member).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_member(&self, chat_id: &str, member: &Member) -> DatabaseResult<()> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Err(DatabaseError::NotFound(format!("chat {chat_id}")));
        }
        insert_member(&mut tx, chat_id, member).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_member(&self, chat_id: &str, user_id: UserId) -> DatabaseResult<()> {
        sqlx::query("DELETE FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_settings(
        &self,
        chat_id: &str,
        settings: &ChatSettings,
    ) -> DatabaseResult<()> {
        let result = sqlx::query("UPDATE chats SET only_admins_can_post = ? WHERE id = ?")
            .bind(settings.only_admins_can_post)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("chat {chat_id}")));
        }
        Ok(())
    }

    pub async fn set_last_message(
        &self,
        chat_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        sqlx::query("UPDATE chats SET last_message_id = ?, last_message_at = ? WHERE id = ?")
            .bind(message_id)
            .bind(at)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_member(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chat_id: &str,
    member: &Member,
) -> DatabaseResult<()> {
    sqlx::query(
        "INSERT INTO chat_members (chat_id, user_id, role, joined_at, last_read_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(chat_id)
    .bind(member.user_id)
    .bind(member.role.as_str())
    .bind(member.joined_at)
    .bind(member.last_read_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn chat_from_row(row: &SqliteRow) -> DatabaseResult<Chat> {
    let kind: String = row.try_get("kind")?;
    Ok(Chat {
        id: row.try_get("id")?,
        kind: ChatKind::parse(&kind).ok_or_else(|| invalid("chat kind", &kind))?,
        name: row.try_get("name")?,
        settings: ChatSettings {
            only_admins_can_post: row.try_get("only_admins_can_post")?,
        },
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        last_message_id: row.try_get("last_message_id")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

fn member_from_row(row: &SqliteRow) -> DatabaseResult<Member> {
    let role: String = row.try_get("role")?;
    Ok(Member {
        user_id: row.try_get("user_id")?,
        role: MemberRole::parse(&role).ok_or_else(|| invalid("member role", &role))?,
        joined_at: row.try_get("joined_at")?,
        last_read_at: row.try_get("last_read_at")?,
    })
}
