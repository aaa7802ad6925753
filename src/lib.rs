//! # DocAI
//!
//! A documentation assistant: users upload Markdown documentation, pick one
//! file as context, and chat with a language model that sees the document
//! plus their chat history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ┌──────────┐
//! │   CLI    │  │   HTTP   │
//! │ (docai)  │  │  (axum)  │
//! └────┬─────┘  └────┬─────┘
//!      └──────┬──────┘
//!             ▼
//!      ┌─────────────┐     ┌───────────────┐
//!      │ DocAssistant│────▶│   Identity    │
//!      └──────┬──────┘     └───────────────┘
//!             ▼
//!      ┌─────────────┐     ┌───────────────┐     ┌─────────────────┐
//!      │ ChatSession │────▶│ build_prompt  │────▶│ InferenceBackend│
//!      └──────┬──────┘     └───────────────┘     │ OpenAI / Ollama │
//!             ▼                                  └─────────────────┘
//!   ┌───────────────────┐
//!   │ TranscriptStore   │
//!   │ DocumentLibrary   │──▶ BlobStore (memory / filesystem / s3)
//!   └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_API_KEY=sk-...
//! docai --email ada@example.com --password hunter22 signup
//! docai --email ada@example.com --password hunter22 files upload README.md
//! docai --email ada@example.com --password hunter22 chat --file README.md
//! docai serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Auth, storage, and inference error types |
//! | [`blob`] | Blob store abstraction |
//! | [`blob_memory`] | In-memory blob store |
//! | [`blob_fs`] | Filesystem blob store |
//! | [`blob_s3`] | Amazon S3 blob store |
//! | [`identity`] | Identity provider |
//! | [`library`] | Per-user document library |
//! | [`transcript`] | Per-user chat transcript |
//! | [`prompt`] | Prompt assembly |
//! | [`inference`] | OpenAI and Ollama backends |
//! | [`session`] | Chat session controller |
//! | [`assistant`] | Application object tying it together |
//! | [`server`] | HTTP API |

pub mod assistant;
pub mod blob;
pub mod blob_fs;
pub mod blob_memory;
pub mod blob_s3;
pub mod config;
pub mod error;
pub mod identity;
pub mod inference;
pub mod library;
pub mod models;
pub mod prompt;
pub mod server;
pub mod session;
pub mod transcript;
