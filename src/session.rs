//! Chat Session Controller.
//!
//! A [`ChatSession`] drives one user's conversation. It owns the view model
//! (the ordered [`Message`] list the UI renders) and runs each submitted
//! turn through the same steps:
//!
//! ```text
//! submit(input)
//!   ├── reject blank input                       → TurnOutcome::Rejected
//!   ├── push user message to the view model
//!   ├── append user turn to the transcript       (background)
//!   ├── load transcript, build prompt
//!   ├── backend.complete(prompt)
//!   │     ├── error / no choices                 → TurnOutcome::Failed
//!   │     └── session closed meanwhile           → TurnOutcome::Stale
//!   ├── push assistant message to the view model
//!   └── append assistant turn to the transcript  (background) → Answered
//! ```
//!
//! Transcript writes never block the turn; their failures are logged.
//! [`ChatSession::wait_for_writes`] waits for the ones in flight.
//!
//! Several turns may be in flight at once. Their assistant messages are
//! pushed in the order the responses arrive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::InferenceError;
use crate::inference::{BackendRegistry, ModelSelector, PromptMessage};
use crate::library::DocumentLibrary;
use crate::models::{Document, Message, Role, Sender, Turn, User};
use crate::prompt::build_prompt;
use crate::transcript::TranscriptStore;

/// Explicit per-session state: who is chatting, about which document, with
/// which backend.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: User,
    pub document: Option<Document>,
    pub model: ModelSelector,
}

impl SessionContext {
    pub fn new(user: User, model: ModelSelector) -> Self {
        Self {
            user,
            document: None,
            model,
        }
    }
}

/// Where the most recent turn is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    AwaitingDocument,
    Composing,
    Sending,
    AwaitingResponse,
    Succeeded,
    Failed,
}

/// Result of [`ChatSession::submit`].
#[derive(Debug)]
pub enum TurnOutcome {
    /// Blank input; nothing happened.
    Rejected,
    /// The assistant replied; its message is now in the view model.
    Answered(Message),
    /// The backend failed. The view model holds only the user's message.
    Failed(InferenceError),
    /// The session was closed before the response arrived. The response
    /// was discarded.
    Stale,
}

impl TurnOutcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, TurnOutcome::Answered(_))
    }
}

/// Shared collaborators a session needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub transcripts: Arc<TranscriptStore>,
    pub library: Arc<DocumentLibrary>,
    pub backends: Arc<BackendRegistry>,
    pub instructions: Arc<str>,
}

pub struct ChatSession {
    deps: SessionDeps,
    context: Mutex<SessionContext>,
    messages: Mutex<Vec<Message>>,
    phase: Mutex<(u64, TurnPhase)>,
    turn_seq: AtomicU64,
    closed: CancellationToken,
    writes: TaskTracker,
}

impl ChatSession {
    pub fn new(deps: SessionDeps, context: SessionContext) -> Self {
        tracing::debug!(uid = %context.user.uid, model = %context.model, "session opened");
        Self {
            deps,
            context: Mutex::new(context),
            messages: Mutex::new(Vec::new()),
            phase: Mutex::new((0, TurnPhase::Idle)),
            turn_seq: AtomicU64::new(0),
            closed: CancellationToken::new(),
            writes: TaskTracker::new(),
        }
    }

    pub fn user(&self) -> User {
        self.context.lock().unwrap().user.clone()
    }

    pub fn context(&self) -> SessionContext {
        self.context.lock().unwrap().clone()
    }

    pub fn model(&self) -> ModelSelector {
        self.context.lock().unwrap().model
    }

    /// Switch backends for subsequent turns.
    pub fn set_model(&self, model: ModelSelector) {
        let mut ctx = self.context.lock().unwrap();
        tracing::info!(uid = %ctx.user.uid, from = %ctx.model, to = %model, "model changed");
        ctx.model = model;
    }

    /// Path of the active document, if any.
    pub fn document_path(&self) -> Option<String> {
        self.context
            .lock()
            .unwrap()
            .document
            .as_ref()
            .map(|d| d.path.clone())
    }

    /// Fetch `name` from the user's library and make it the active document.
    ///
    /// On failure the session has no active document and the prompt uses the
    /// `null` placeholder. Returns whether a document is now active.
    pub async fn select_document(&self, name: &str) -> bool {
        let user = self.user();
        self.set_idle_phase(TurnPhase::AwaitingDocument);

        let fetched = self.deps.library.fetch(&user.uid, name).await;
        let selected = {
            let mut ctx = self.context.lock().unwrap();
            match fetched {
                Ok(doc) => {
                    tracing::info!(uid = %user.uid, path = %doc.path, bytes = doc.text.len(), "document selected");
                    ctx.document = Some(doc);
                    true
                }
                Err(e) => {
                    tracing::warn!(uid = %user.uid, file = name, error = %e, "failed to load document");
                    ctx.document = None;
                    false
                }
            }
        };

        self.set_idle_phase(TurnPhase::Idle);
        selected
    }

    pub fn clear_document(&self) {
        self.context.lock().unwrap().document = None;
    }

    /// Snapshot of the view model.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase.lock().unwrap().1
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Run one turn. See the module docs for the sequence.
    pub async fn submit(&self, input: &str) -> TurnOutcome {
        let input = input.trim();
        if input.is_empty() || self.is_closed() {
            return TurnOutcome::Rejected;
        }

        let seq = self.turn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = self.context();
        let uid = ctx.user.uid.clone();

        self.set_phase(seq, TurnPhase::Composing);
        self.messages
            .lock()
            .unwrap()
            .push(Message::new(Sender::User, input));
        let user_write = self.spawn_append(Turn::new(Role::User, input));

        self.set_phase(seq, TurnPhase::Sending);
        let transcript = self.deps.transcripts.load(&uid).await;
        let prompt = build_prompt(
            &self.deps.instructions,
            ctx.document.as_ref().map(|d| d.text.as_str()),
            &transcript,
            input,
        );

        let backend = match self.deps.backends.get(ctx.model) {
            Ok(backend) => backend,
            Err(e) => return self.fail(seq, e),
        };

        self.set_phase(seq, TurnPhase::AwaitingResponse);
        tracing::debug!(uid = %uid, seq, backend = backend.name(), model = backend.model(), prompt_chars = prompt.len(), "sending turn");

        let messages = [PromptMessage::user(prompt)];
        let result = tokio::select! {
            _ = self.closed.cancelled() => None,
            result = backend.complete(&messages) => Some(result),
        };

        let text = match result {
            None => {
                tracing::info!(uid = %uid, seq, "session closed, discarding in-flight turn");
                return TurnOutcome::Stale;
            }
            Some(Err(e)) => return self.fail(seq, e),
            Some(Ok(text)) => text,
        };
        if self.is_closed() {
            tracing::info!(uid = %uid, seq, "session closed, discarding response");
            return TurnOutcome::Stale;
        }

        let reply = Message::new(Sender::Ai, text.clone());
        self.messages.lock().unwrap().push(reply.clone());

        // The assistant turn must land after the user turn of the same
        // exchange.
        let transcripts = self.deps.transcripts.clone();
        let turn = Turn::new(Role::Assistant, text);
        self.writes.spawn(async move {
            let _ = user_write.await;
            if let Err(e) = transcripts.append(&uid, &turn).await {
                tracing::warn!(uid = %uid, error = %e, "failed to append assistant turn to transcript");
            }
        });

        self.set_phase(seq, TurnPhase::Succeeded);
        TurnOutcome::Answered(reply)
    }

    /// Mark in-flight turns stale and refuse new ones.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(uid = %self.user().uid, "session closed");
        }
        self.closed.cancel();
    }

    /// Wait until every transcript write started so far has finished.
    pub async fn wait_for_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    fn spawn_append(&self, turn: Turn) -> tokio::task::JoinHandle<()> {
        let transcripts = self.deps.transcripts.clone();
        let uid = self.user().uid;
        self.writes.spawn(async move {
            if let Err(e) = transcripts.append(&uid, &turn).await {
                tracing::warn!(uid = %uid, role = %turn.role, error = %e, "failed to append turn to transcript");
            }
        })
    }

    fn fail(&self, seq: u64, error: InferenceError) -> TurnOutcome {
        tracing::warn!(uid = %self.user().uid, seq, code = error.code(), error = %error, "turn failed");
        self.set_phase(seq, TurnPhase::Failed);
        TurnOutcome::Failed(error)
    }

    fn set_phase(&self, seq: u64, phase: TurnPhase) {
        let mut current = self.phase.lock().unwrap();
        if seq >= current.0 {
            tracing::debug!(seq, ?phase, "turn phase");
            *current = (seq, phase);
        }
    }

    /// Phase changes outside a turn only apply when no turn is running.
    fn set_idle_phase(&self, phase: TurnPhase) {
        let mut current = self.phase.lock().unwrap();
        if matches!(
            current.1,
            TurnPhase::Idle | TurnPhase::AwaitingDocument | TurnPhase::Succeeded | TurnPhase::Failed
        ) {
            current.1 = phase;
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
