//! End-to-end tests of the chat turn protocol: transcript lifecycle, prompt
//! assembly, the session controller, and sign-out.
//!
//! Everything runs over the in-memory blob store with a scripted inference
//! backend that records the prompts it receives.

use async_trait::async_trait;
use docai::assistant::DocAssistant;
use docai::blob::BlobStore;
use docai::blob_fs::FilesystemBlobStore;
use docai::blob_memory::InMemoryBlobStore;
use docai::config::Config;
use docai::blob::BlobEntry;
use docai::error::{InferenceError, StorageError};
use docai::identity::LocalIdentityProvider;
use docai::inference::{BackendRegistry, InferenceBackend, ModelSelector, PromptMessage};
use docai::models::{Role, Sender, Turn, UserId};
use docai::prompt::{build_prompt, DOCUMENTATION_LABEL, HISTORY_LABEL, INPUT_LABEL, NO_DOCUMENT};
use docai::session::TurnOutcome;
use docai::transcript::{transcript_path, TranscriptStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ─── Scripted backend ───────────────────────────────────────────────

enum Script {
    Reply(&'static str),
    NoChoices,
}

struct ScriptedBackend {
    script: Script,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, InferenceError> {
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        self.prompts
            .lock()
            .unwrap()
            .push(messages[0].content.clone());
        match self.script {
            Script::Reply(text) => Ok(text.to_string()),
            Script::NoChoices => Err(InferenceError::NoChoices {
                backend: "scripted".to_string(),
            }),
        }
    }
}

struct Harness {
    blobs: Arc<InMemoryBlobStore>,
    backend: Arc<ScriptedBackend>,
    assistant: DocAssistant,
}

/// Assistant over `blobs` with account `u1@example.com` (uid `u1`) already
/// registered and `backend` serving the Ollama selector.
fn assistant_over(blobs: Arc<dyn BlobStore>, backend: Arc<dyn InferenceBackend>) -> DocAssistant {
    let identity = Arc::new(LocalIdentityProvider::new(6));
    identity
        .add_user(UserId::new("u1"), "u1@example.com", "password1")
        .unwrap();

    let mut registry = BackendRegistry::new();
    registry.register(ModelSelector::Ollama, backend);

    let mut config = Config::minimal();
    config.chat.default_model = "ollama".to_string();

    DocAssistant::new(&config, blobs, identity, registry).unwrap()
}

fn harness(script: Script) -> Harness {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let backend = ScriptedBackend::new(script);
    let assistant = assistant_over(blobs.clone(), backend.clone());
    Harness {
        blobs,
        backend,
        assistant,
    }
}

// ─── Failing reads ──────────────────────────────────────────────────

/// In-memory store whose downloads fail with an I/O error while
/// `fail_reads` is set.
struct FlakyReads {
    inner: InMemoryBlobStore,
    fail_reads: AtomicBool,
}

impl FlakyReads {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryBlobStore::new(),
            fail_reads: AtomicBool::new(false),
        })
    }

    fn break_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    async fn raw(&self, path: &str) -> String {
        self.inner.download_text(path).await.unwrap()
    }
}

#[async_trait]
impl BlobStore for FlakyReads {
    fn backend(&self) -> &str {
        "flaky"
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.inner.upload(path, data).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path).await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Transient(anyhow::anyhow!(
                "disk unavailable: {}",
                path
            )));
        }
        self.inner.download(path).await
    }

    fn url(&self, path: &str) -> String {
        self.inner.url(path)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.inner.delete(path).await
    }
}

fn section<'a>(prompt: &'a str, label: &str, next: Option<&str>) -> &'a str {
    let start = prompt.find(label).unwrap() + label.len();
    let rest = &prompt[start..];
    match next {
        Some(next) => &rest[..rest.find(next).unwrap()],
        None => rest,
    }
}

// ─── Transcript store ───────────────────────────────────────────────

#[tokio::test]
async fn new_transcript_names_its_owner_and_has_no_turns() {
    let transcripts = TranscriptStore::new(Arc::new(InMemoryBlobStore::new()));
    for uid in ["u1", "someone-else", "0f9a"] {
        let uid = UserId::new(uid);
        transcripts.ensure_exists(&uid).await.unwrap();
        let text = transcripts.read(&uid).await;
        assert!(!text.is_empty());
        assert!(text.contains(uid.as_str()));
        assert!(!text.contains("user: "));
        assert!(!text.contains("assistant: "));
    }
}

#[tokio::test]
async fn ensure_exists_twice_changes_nothing() {
    let transcripts = TranscriptStore::new(Arc::new(InMemoryBlobStore::new()));
    let uid = UserId::new("u1");
    transcripts.ensure_exists(&uid).await.unwrap();
    transcripts
        .append(&uid, &Turn::new(Role::User, "keep me"))
        .await
        .unwrap();
    let before = transcripts.read(&uid).await;
    transcripts.ensure_exists(&uid).await.unwrap();
    assert_eq!(transcripts.read(&uid).await, before);
}

#[tokio::test]
async fn sequential_appends_keep_order() {
    let transcripts = TranscriptStore::new(Arc::new(InMemoryBlobStore::new()));
    let uid = UserId::new("u1");
    transcripts.ensure_exists(&uid).await.unwrap();
    transcripts
        .append(&uid, &Turn::new(Role::User, "a"))
        .await
        .unwrap();
    transcripts
        .append(&uid, &Turn::new(Role::Assistant, "b"))
        .await
        .unwrap();

    let text = transcripts.read(&uid).await;
    assert!(text.find("user: a").unwrap() < text.find("assistant: b").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_serialized() {
    let transcripts = Arc::new(TranscriptStore::new(Arc::new(InMemoryBlobStore::new())));
    let uid = UserId::new("u1");
    transcripts.ensure_exists(&uid).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let transcripts = transcripts.clone();
        let uid = uid.clone();
        handles.push(tokio::spawn(async move {
            transcripts
                .append(&uid, &Turn::new(Role::User, format!("turn-{}", i)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let text = transcripts.read(&uid).await;
    for i in 0..16 {
        assert!(text.contains(&format!("user: turn-{}\n", i)), "lost turn-{}", i);
    }
}

#[tokio::test]
async fn filesystem_transcript_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let uid = UserId::new("u1");
    {
        let store = Arc::new(FilesystemBlobStore::new(tmp.path().to_path_buf()).unwrap());
        let transcripts = TranscriptStore::new(store);
        transcripts.ensure_exists(&uid).await.unwrap();
        transcripts
            .append(&uid, &Turn::new(Role::User, "persisted"))
            .await
            .unwrap();
    }

    assert!(tmp.path().join("chatHistory/u1/chatHistory.txt").is_file());
    let store = Arc::new(FilesystemBlobStore::new(tmp.path().to_path_buf()).unwrap());
    let transcripts = TranscriptStore::new(store);
    assert!(transcripts.read(&uid).await.contains("user: persisted"));
}

#[tokio::test]
async fn unreadable_transcript_reads_empty_and_blocks_appends() {
    let blobs = FlakyReads::new();
    let transcripts = TranscriptStore::new(blobs.clone());
    let uid = UserId::new("u1");
    transcripts
        .append(&uid, &Turn::new(Role::User, "before"))
        .await
        .unwrap();
    let path = transcript_path(&uid);
    let before = blobs.raw(&path).await;

    blobs.break_reads();
    assert_eq!(transcripts.read(&uid).await, "");
    let err = transcripts
        .append(&uid, &Turn::new(Role::User, "after"))
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert_eq!(blobs.raw(&path).await, before);
}

#[tokio::test]
async fn unreadable_transcript_still_answers() {
    let blobs = FlakyReads::new();
    let backend = ScriptedBackend::new(Script::Reply("answer"));
    let assistant = assistant_over(blobs.clone(), backend.clone());
    let user = assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = assistant.require_session().unwrap();
    session.wait_for_writes().await;
    let path = transcript_path(&user.uid);
    let before = blobs.raw(&path).await;

    blobs.break_reads();
    assert!(session.submit("What is this?").await.is_answered());

    let prompts = backend.prompts();
    let history = section(&prompts[0], HISTORY_LABEL, Some(INPUT_LABEL));
    assert!(history.trim().is_empty());
    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "What is this?");
    assert_eq!(messages[1].text, "answer");

    session.wait_for_writes().await;
    assert_eq!(blobs.raw(&path).await, before);
}

// ─── Prompt assembly ────────────────────────────────────────────────

#[test]
fn empty_prompt_keeps_all_sections_in_order() {
    let prompt = build_prompt("I", None, "", "hi");
    assert!(prompt.starts_with('I'));

    let doc = section(&prompt, DOCUMENTATION_LABEL, Some(HISTORY_LABEL));
    assert_eq!(doc.trim(), NO_DOCUMENT);
    let history = section(&prompt, HISTORY_LABEL, Some(INPUT_LABEL));
    assert!(history.trim().is_empty());
    assert_eq!(section(&prompt, INPUT_LABEL, None).trim(), "hi");
}

// ─── Session controller ─────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_turn() {
    let h = harness(Script::Reply("It is the project readme."));
    let user = h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    assert_eq!(user.uid.as_str(), "u1");

    h.assistant
        .library()
        .upload(&user.uid, "readme.md", b"Hello World")
        .await
        .unwrap();

    let session = h.assistant.require_session().unwrap();
    assert!(session.select_document("readme.md").await);

    let outcome = session.submit("What is this?").await;
    assert!(outcome.is_answered());

    let prompts = h.backend.prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(section(prompt, DOCUMENTATION_LABEL, Some(HISTORY_LABEL)).contains("Hello World"));
    assert_eq!(section(prompt, INPUT_LABEL, None).trim(), "What is this?");

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[0].text, "What is this?");
    assert_eq!(messages[1].sender, Sender::Ai);
    assert_eq!(messages[1].text, "It is the project readme.");

    session.wait_for_writes().await;
    let transcript = h
        .blobs
        .download_text(&transcript_path(&user.uid))
        .await
        .unwrap();
    let q = transcript.find("user: What is this?").unwrap();
    let a = transcript.find("assistant: It is the project readme.").unwrap();
    assert!(q < a);
}

#[tokio::test]
async fn history_feeds_the_next_prompt() {
    let h = harness(Script::Reply("answer"));
    h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = h.assistant.require_session().unwrap();

    session.submit("first question").await;
    session.wait_for_writes().await;
    session.submit("why?").await;

    let prompts = h.backend.prompts();
    let history = section(&prompts[1], HISTORY_LABEL, Some(INPUT_LABEL));
    assert!(history.contains("user: first question"));
    assert!(history.contains("assistant: answer"));
    assert!(section(&prompts[1], DOCUMENTATION_LABEL, Some(HISTORY_LABEL))
        .trim()
        .starts_with(NO_DOCUMENT));
}

#[tokio::test]
async fn unreadable_document_falls_back_to_null() {
    let h = harness(Script::Reply("Please upload some documentation."));
    h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = h.assistant.require_session().unwrap();

    assert!(!session.select_document("missing.md").await);
    assert!(session.submit("hello").await.is_answered());

    let prompts = h.backend.prompts();
    let doc = section(&prompts[0], DOCUMENTATION_LABEL, Some(HISTORY_LABEL));
    assert_eq!(doc.trim(), NO_DOCUMENT);
}

#[tokio::test]
async fn no_choices_adds_no_reply_and_no_transcript_line() {
    let h = harness(Script::NoChoices);
    let user = h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = h.assistant.require_session().unwrap();

    let outcome = session.submit("What is this?").await;
    assert!(matches!(
        outcome,
        TurnOutcome::Failed(InferenceError::NoChoices { .. })
    ));

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, Sender::User);

    session.wait_for_writes().await;
    let transcript = h
        .blobs
        .download_text(&transcript_path(&user.uid))
        .await
        .unwrap();
    assert!(!transcript.contains("assistant:"));

    // The session stays usable after a failed turn.
    assert!(matches!(session.submit("again").await, TurnOutcome::Failed(_)));
    assert_eq!(session.messages().len(), 2);
}

#[tokio::test]
async fn blank_input_does_nothing() {
    let h = harness(Script::Reply("unused"));
    h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = h.assistant.require_session().unwrap();

    assert!(matches!(session.submit("  \t ").await, TurnOutcome::Rejected));
    assert!(session.messages().is_empty());
    assert!(h.backend.prompts().is_empty());
}

/// Answers `slow` after a delay and everything else at once.
struct PacedBackend;

#[async_trait]
impl InferenceBackend for PacedBackend {
    fn name(&self) -> &str {
        "paced"
    }

    fn model(&self) -> &str {
        "paced-1"
    }

    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, InferenceError> {
        let input = section(&messages[0].content, INPUT_LABEL, None).trim().to_string();
        if input == "slow" {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(format!("re: {}", input))
    }
}

#[tokio::test]
async fn replies_land_in_arrival_order() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let assistant = assistant_over(blobs.clone(), Arc::new(PacedBackend));
    let user = assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = assistant.require_session().unwrap();

    let (first, second) = tokio::join!(session.submit("slow"), session.submit("fast"));
    assert!(first.is_answered());
    assert!(second.is_answered());

    let texts: Vec<String> = session.messages().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["slow", "fast", "re: fast", "re: slow"]);

    session.wait_for_writes().await;
    let transcript = blobs
        .download_text(&transcript_path(&user.uid))
        .await
        .unwrap();
    for line in ["user: slow", "user: fast", "assistant: re: fast", "assistant: re: slow"] {
        assert!(transcript.contains(line), "missing {:?}", line);
    }
    assert!(transcript.find("user: slow").unwrap() < transcript.find("assistant: re: slow").unwrap());
    assert!(transcript.find("user: fast").unwrap() < transcript.find("assistant: re: fast").unwrap());
}

// ─── Sign-out ───────────────────────────────────────────────────────

#[tokio::test]
async fn sign_out_resets_transcript() {
    let h = harness(Script::Reply("answer"));
    let user = h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = h.assistant.require_session().unwrap();
    session.submit("remember this").await;
    session.wait_for_writes().await;

    let path = transcript_path(&user.uid);
    assert!(h.blobs.download_text(&path).await.unwrap().contains("remember this"));

    h.assistant.sign_out().await.unwrap();
    assert_eq!(h.blobs.download_text(&path).await.unwrap(), "");
    assert!(h.assistant.current_user().is_none());
    assert!(session.is_closed());

    // Signing back in starts from the empty transcript.
    h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    assert_eq!(h.assistant.transcript().await.unwrap(), "");
    assert!(h.assistant.require_session().unwrap().messages().is_empty());
}

#[tokio::test]
async fn switching_to_unavailable_backend_fails_the_turn() {
    let h = harness(Script::Reply("answer"));
    h.assistant.sign_in("u1@example.com", "password1").await.unwrap();
    let session = h.assistant.require_session().unwrap();

    session.set_model(ModelSelector::OpenAi);
    assert!(matches!(
        session.submit("hi").await,
        TurnOutcome::Failed(InferenceError::UnknownBackend(_))
    ));

    session.set_model(ModelSelector::Ollama);
    assert!(session.submit("hi").await.is_answered());
}
