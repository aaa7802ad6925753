//! Core data models used throughout DocAI.
//!
//! These types represent users, documents, transcript turns, and the
//! in-memory message list that drives the chat view.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier issued by the identity provider.
///
/// Scopes every storage path: documents live under `{uid}/` and the
/// transcript under `chatHistory/{uid}/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signed-in user as seen by the rest of the crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub uid: UserId,
    pub email: String,
}

/// Speaker of a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label written in front of each transcript line.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One role-tagged exchange unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Render the turn as it is appended to the transcript blob.
    pub fn to_transcript_line(&self) -> String {
        format!("{}: {}\n\n", self.role.label(), self.content)
    }
}

/// Who a displayed message came from. Serialized as `user` / `ai` for the
/// front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl From<Role> for Sender {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Sender::User,
            Role::Assistant => Sender::Ai,
        }
    }
}

/// A single entry in the session's view model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub sender: Sender,
}

impl Message {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender,
        }
    }
}

/// A listed object in a user's document library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub url: String,
}

/// The active document of a chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Storage path, e.g. `u1/readme.md`.
    pub path: String,
    /// Raw Markdown text.
    pub text: String,
}
