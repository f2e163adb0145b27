//! Validation utilities.

use crate::types::{Attachment, RealtimeError, RealtimeResult};

const MAX_GROUP_NAME_CHARS: usize = 100;
const MAX_GROUP_SIZE: usize = 256;
const MAX_READ_BATCH: usize = 500;
const MAX_URL_CHARS: usize = 2048;

/// Validation utilities
pub struct Validator;

impl Validator {
    /// A message needs text or an attachment, and text is bounded in characters.
    pub fn message_content(
        content: &str,
        attachment: Option<&Attachment>,
        max_chars: usize,
    ) -> RealtimeResult<()> {
        if content.trim().is_empty() && attachment.is_none() {
            return Err(RealtimeError::invalid_argument(
                "Message content cannot be empty",
            ));
        }

        let length = content.chars().count();
        if length > max_chars {
            return Err(RealtimeError::invalid_argument(format!(
                "Message content too long ({length} > {max_chars} characters)"
            )));
        }

        if let Some(attachment) = attachment {
            Self::attachment(attachment)?;
        }

        Ok(())
    }

    pub fn attachment(attachment: &Attachment) -> RealtimeResult<()> {
        if attachment.url.trim().is_empty() {
            return Err(RealtimeError::invalid_argument("Attachment url cannot be empty"));
        }
        if attachment.url.chars().count() > MAX_URL_CHARS {
            return Err(RealtimeError::invalid_argument("Attachment url too long"));
        }
        if attachment.size.is_some_and(|size| size < 0) {
            return Err(RealtimeError::invalid_argument("Attachment size cannot be negative"));
        }
        Ok(())
    }

    pub fn group_name(name: &str) -> RealtimeResult<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(RealtimeError::invalid_argument("Group name cannot be empty"));
        }
        if trimmed.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(RealtimeError::invalid_argument(format!(
                "Group name too long (max {MAX_GROUP_NAME_CHARS} characters)"
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn group_size(members: usize) -> RealtimeResult<()> {
        if members > MAX_GROUP_SIZE {
            return Err(RealtimeError::invalid_argument(format!(
                "Groups are limited to {MAX_GROUP_SIZE} members"
            )));
        }
        Ok(())
    }

    pub fn read_batch(count: usize) -> RealtimeResult<()> {
        if count > MAX_READ_BATCH {
            return Err(RealtimeError::invalid_argument(format!(
                "At most {MAX_READ_BATCH} message ids per read receipt"
            )));
        }
        Ok(())
    }

    pub fn chat_id(chat_id: &str) -> RealtimeResult<()> {
        if chat_id.trim().is_empty() {
            return Err(RealtimeError::invalid_argument("Chat id cannot be empty"));
        }
        Ok(())
    }
}
