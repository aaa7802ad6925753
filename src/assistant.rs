//! The DocAI application object.
//!
//! [`DocAssistant`] wires the collaborators together (blob store, identity
//! provider, document library, transcript store, inference backends) and
//! owns the active [`ChatSession`]. Both the HTTP server and the CLI drive
//! DocAI through it.
//!
//! Identity is the single source of truth for who is chatting: a session is
//! opened when a user signs in and closed when they sign out.

use anyhow::{Context, Result};
use std::sync::{Arc, RwLock, Weak};

use crate::blob::{create_blob_store, BlobStore};
use crate::config::Config;
use crate::error::AuthError;
use crate::identity::{IdentityProvider, LocalIdentityProvider};
use crate::inference::{BackendRegistry, ModelSelector};
use crate::library::DocumentLibrary;
use crate::models::User;
use crate::prompt::DEFAULT_INSTRUCTIONS;
use crate::session::{ChatSession, SessionContext, SessionDeps};
use crate::transcript::TranscriptStore;

pub struct DocAssistant {
    identity: Arc<dyn IdentityProvider>,
    blobs: Arc<dyn BlobStore>,
    deps: SessionDeps,
    default_model: ModelSelector,
    session: RwLock<Option<Arc<ChatSession>>>,
}

impl DocAssistant {
    /// Build every collaborator from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let blobs = create_blob_store(&config.storage)?;
        let identity = LocalIdentityProvider::from_config(&config.identity)
            .context("Failed to initialize identity provider")?;
        let backends = BackendRegistry::from_config(&config.inference)
            .context("Failed to initialize inference backends")?;
        Self::new(config, blobs, Arc::new(identity), backends)
    }

    pub fn new(
        config: &Config,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        backends: BackendRegistry,
    ) -> Result<Self> {
        let default_model: ModelSelector = config.chat.default_model.parse()?;
        let instructions = config
            .chat
            .instructions
            .as_deref()
            .unwrap_or(DEFAULT_INSTRUCTIONS);
        let library = DocumentLibrary::new(blobs.clone(), &config.storage.accept_globs)?;

        tracing::info!(
            storage = blobs.backend(),
            default_model = %default_model,
            backends = ?backends.available(),
            "DocAI initialized"
        );

        Ok(Self {
            identity,
            deps: SessionDeps {
                transcripts: Arc::new(TranscriptStore::new(blobs.clone())),
                library: Arc::new(library),
                backends: Arc::new(backends),
                instructions: Arc::from(instructions),
            },
            blobs,
            default_model,
            session: RwLock::new(None),
        })
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn library(&self) -> &DocumentLibrary {
        &self.deps.library
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.deps.transcripts
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.deps.backends
    }

    pub fn current_user(&self) -> Option<User> {
        self.identity.current_user()
    }

    /// The signed-in user, or [`AuthError::NotSignedIn`].
    pub fn require_user(&self) -> Result<User, AuthError> {
        self.current_user().ok_or(AuthError::NotSignedIn)
    }

    /// The active chat session, if someone is signed in.
    pub fn session(&self) -> Option<Arc<ChatSession>> {
        self.session.read().unwrap().clone()
    }

    pub fn require_session(&self) -> Result<Arc<ChatSession>, AuthError> {
        self.session().ok_or(AuthError::NotSignedIn)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = self.identity.sign_up(email, password).await?;
        self.on_auth_state_changed(Some(user.clone())).await;
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = self.identity.sign_in(email, password).await?;
        self.on_auth_state_changed(Some(user.clone())).await;
        Ok(user)
    }

    /// Close the session, empty the user's transcript, then sign out.
    ///
    /// Responses still in flight are discarded and pending transcript writes
    /// finish before the reset. A failed reset is logged and does not prevent
    /// signing out.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let user = self.require_user()?;

        let session = self.session.write().unwrap().take();
        if let Some(session) = session {
            session.close();
            session.wait_for_writes().await;
        }
        if let Err(e) = self.deps.transcripts.reset(&user.uid).await {
            tracing::warn!(uid = %user.uid, error = %e, "failed to reset transcript on sign-out");
        }

        self.identity.sign_out().await?;
        tracing::info!(uid = %user.uid, "signed out");
        Ok(())
    }

    /// Reconcile the active session with the identity provider's state.
    ///
    /// Opens a session (creating the transcript if needed) for a newly
    /// signed-in user and closes it when nobody is signed in.
    pub async fn on_auth_state_changed(&self, user: Option<User>) {
        match user {
            Some(user) => {
                if let Some(existing) = self.session() {
                    if existing.user().uid == user.uid && !existing.is_closed() {
                        return;
                    }
                }
                if let Err(e) = self.deps.transcripts.ensure_exists(&user.uid).await {
                    tracing::warn!(uid = %user.uid, error = %e, "failed to create transcript");
                }
                let session = Arc::new(ChatSession::new(
                    self.deps.clone(),
                    SessionContext::new(user, self.default_model),
                ));
                if let Some(previous) = self.session.write().unwrap().replace(session) {
                    previous.close();
                }
            }
            None => {
                if let Some(session) = self.session.write().unwrap().take() {
                    session.close();
                }
            }
        }
    }

    /// Follow identity changes made outside this object (for example a
    /// provider shared with another front-end).
    pub fn watch_identity(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.identity.subscribe();
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let user = rx.borrow_and_update().clone();
                let Some(assistant) = this.upgrade() else {
                    break;
                };
                assistant.on_auth_state_changed(user).await;
            }
        })
    }

    /// The signed-in user's transcript text.
    pub async fn transcript(&self) -> Result<String, AuthError> {
        let user = self.require_user()?;
        Ok(self.deps.transcripts.read(&user.uid).await)
    }

    /// Empty the signed-in user's transcript without signing out.
    pub async fn reset_transcript(&self) -> Result<()> {
        let user = self.require_user()?;
        self.deps
            .transcripts
            .reset(&user.uid)
            .await
            .with_context(|| format!("Failed to reset transcript for {}", user.uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_memory::InMemoryBlobStore;
    use crate::transcript::transcript_path;

    fn assistant() -> (Arc<InMemoryBlobStore>, Arc<DocAssistant>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let assistant = DocAssistant::new(
            &Config::minimal(),
            blobs.clone(),
            Arc::new(LocalIdentityProvider::new(6)),
            BackendRegistry::new(),
        )
        .unwrap();
        (blobs, Arc::new(assistant))
    }

    #[tokio::test]
    async fn sign_in_opens_session_and_transcript() {
        let (blobs, assistant) = assistant();
        assert!(assistant.session().is_none());

        let user = assistant.sign_up("ada@example.com", "hunter22").await.unwrap();
        let session = assistant.require_session().unwrap();
        assert_eq!(session.user().uid, user.uid);
        assert_eq!(session.model(), ModelSelector::OpenAi);
        assert!(blobs.exists(&transcript_path(&user.uid)).await.unwrap());
    }

    #[tokio::test]
    async fn sign_out_closes_session() {
        let (_, assistant) = assistant();
        assistant.sign_up("ada@example.com", "hunter22").await.unwrap();
        let session = assistant.require_session().unwrap();

        assistant.sign_out().await.unwrap();
        assert!(session.is_closed());
        assert!(assistant.session().is_none());
        assert!(matches!(
            assistant.sign_out().await,
            Err(AuthError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn reset_transcript_reports_storage_failures() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blobs = Arc::new(
            crate::blob_fs::FilesystemBlobStore::new(tmp.path().to_path_buf()).unwrap(),
        );
        let identity = Arc::new(LocalIdentityProvider::new(6));
        identity
            .add_user(crate::models::UserId::new("u1"), "u1@example.com", "password1")
            .unwrap();
        let assistant = DocAssistant::new(
            &Config::minimal(),
            blobs.clone(),
            identity,
            BackendRegistry::new(),
        )
        .unwrap();

        let err = assistant.reset_transcript().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AuthError>(),
            Some(AuthError::NotSignedIn)
        ));

        // A directory squatting on the transcript path makes the write fail.
        let squatter = blobs
            .root()
            .join(transcript_path(&crate::models::UserId::new("u1")));
        std::fs::create_dir_all(&squatter).unwrap();
        std::fs::write(squatter.join("keep"), b"x").unwrap();
        assistant.sign_in("u1@example.com", "password1").await.unwrap();

        let err = assistant.reset_transcript().await.unwrap_err();
        assert!(err.downcast_ref::<AuthError>().is_none());
        assert!(err.downcast_ref::<crate::error::StorageError>().is_some());
    }

    #[tokio::test]
    async fn watcher_follows_external_sign_out() {
        let (_, assistant) = assistant();
        let watcher = assistant.watch_identity();
        assistant.sign_up("ada@example.com", "hunter22").await.unwrap();
        let session = assistant.require_session().unwrap();

        assistant.identity().sign_out().await.unwrap();
        while !session.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(assistant.session().is_none());
        watcher.abort();
    }
}
