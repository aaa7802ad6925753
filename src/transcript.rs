//! Transcript Store: one durable, append-only chat log per user.
//!
//! The transcript is a single text blob at
//! `chatHistory/{uid}/chatHistory.txt`:
//!
//! ```text
//! Chat history for user: u1
//!
//! user: What is this?
//!
//! assistant: A readme for the project.
//!
//! ```
//!
//! The blob store has no append primitive, so [`TranscriptStore::append`] is
//! a read-modify-write of the whole blob. Cycles for the same user are
//! serialized through a per-user async mutex; without it two concurrent
//! appends based on the same read would silently drop one turn.
//!
//! Reads never fail: any error degrades to an empty transcript and is
//! logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::blob::BlobStore;
use crate::error::StorageError;
use crate::models::{Turn, UserId};

/// Storage path of a user's transcript.
pub fn transcript_path(user: &UserId) -> String {
    format!("chatHistory/{}/chatHistory.txt", user)
}

/// Content a freshly created transcript starts with.
pub fn transcript_header(user: &UserId) -> String {
    format!("Chat history for user: {}\n\n", user)
}

pub struct TranscriptStore {
    blobs: Arc<dyn BlobStore>,
    write_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TranscriptStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, user: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(user.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Create the transcript with its header if it does not exist yet.
    ///
    /// Idempotent: an existing transcript (even an empty, reset one) is left
    /// untouched.
    pub async fn ensure_exists(&self, user: &UserId) -> Result<(), StorageError> {
        let path = transcript_path(user);
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        if self.blobs.exists(&path).await? {
            return Ok(());
        }
        self.blobs
            .upload(&path, transcript_header(user).as_bytes())
            .await?;
        tracing::debug!(uid = %user, "created transcript");
        Ok(())
    }

    /// Full transcript text, or `""` if it cannot be read.
    pub async fn read(&self, user: &UserId) -> String {
        let path = transcript_path(user);
        match self.blobs.download_text(&path).await {
            Ok(text) => text,
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(uid = %user, "transcript not found, using empty history");
                String::new()
            }
            Err(e) => {
                tracing::warn!(uid = %user, error = %e, "failed to read transcript, using empty history");
                String::new()
            }
        }
    }

    /// Ensure the transcript exists, then read it.
    ///
    /// This is what the chat controller uses to fetch history for a prompt.
    pub async fn load(&self, user: &UserId) -> String {
        if let Err(e) = self.ensure_exists(user).await {
            tracing::warn!(uid = %user, error = %e, "failed to create transcript");
        }
        self.read(user).await
    }

    /// Append one turn as `"{role}: {content}\n\n"`.
    ///
    /// A missing transcript is treated as empty. Any other read failure aborts
    /// the append so the existing transcript is not overwritten with only the
    /// new turn.
    pub async fn append(&self, user: &UserId, turn: &Turn) -> Result<(), StorageError> {
        let path = transcript_path(user);
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let mut content = match self.blobs.download_text(&path).await {
            Ok(text) => text,
            Err(StorageError::NotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };
        content.push_str(&turn.to_transcript_line());
        self.blobs.upload(&path, content.as_bytes()).await?;
        tracing::debug!(uid = %user, role = %turn.role, "appended turn to transcript");
        Ok(())
    }

    /// Overwrite the transcript with empty content.
    pub async fn reset(&self, user: &UserId) -> Result<(), StorageError> {
        let path = transcript_path(user);
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        self.blobs.upload(&path, b"").await?;
        tracing::info!(uid = %user, "reset transcript");
        Ok(())
    }
}
