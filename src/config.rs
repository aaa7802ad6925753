//! TOML configuration parsing.
//!
//! ```toml
//! [storage]
//! backend = "filesystem"
//! root = "./data/blobs"
//!
//! [chat]
//! default_model = "openai"
//!
//! [inference.openai]
//! model = "gpt-3.5-turbo"
//! max_tokens = 500
//!
//! [inference.ollama]
//! model = "llama2"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```
//!
//! Every section except `[storage]` may be omitted.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_accept_globs")]
    pub accept_globs: Vec<String>,
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

fn default_storage_backend() -> String {
    "filesystem".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_accept_globs() -> Vec<String> {
    vec!["*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    #[serde(default)]
    pub users_file: Option<PathBuf>,
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            users_file: None,
            min_password_len: default_min_password_len(),
        }
    }
}

fn default_min_password_len() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Replaces the built-in instruction preamble when set.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            instructions: None,
        }
    }
}

fn default_model() -> String {
    "openai".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InferenceConfig {
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_openai_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_retries")]
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            url: default_openai_url(),
            model: default_openai_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_openai_timeout(),
            max_retries: default_openai_retries(),
        }
    }
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_max_tokens() -> u32 {
    500
}
fn default_openai_timeout() -> u64 {
    60
}
fn default_openai_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_ollama_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_ollama_model(),
            stream: false,
            timeout_secs: default_ollama_timeout(),
            max_retries: 0,
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama2".to_string()
}
fn default_ollama_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// In-memory configuration with every default applied.
    ///
    /// Used by tests and by commands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            storage: StorageConfig {
                backend: "memory".to_string(),
                root: default_storage_root(),
                accept_globs: default_accept_globs(),
                s3: None,
            },
            identity: IdentityConfig::default(),
            chat: ChatConfig::default(),
            inference: InferenceConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.storage.backend.as_str() {
        "filesystem" | "memory" => {}
        "s3" => {
            if config.storage.s3.is_none() {
                anyhow::bail!("storage.backend = \"s3\" requires a [storage.s3] section");
            }
        }
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be filesystem, memory, or s3.",
            other
        ),
    }

    if config.storage.accept_globs.is_empty() {
        anyhow::bail!("storage.accept_globs must not be empty");
    }

    if config.identity.min_password_len == 0 {
        anyhow::bail!("identity.min_password_len must be >= 1");
    }

    if config.chat.default_model.parse::<crate::inference::ModelSelector>().is_err() {
        anyhow::bail!(
            "Unknown chat.default_model: '{}'. Must be openai or ollama.",
            config.chat.default_model
        );
    }

    if config.inference.openai.max_tokens == 0 {
        anyhow::bail!("inference.openai.max_tokens must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_sections() {
        let config: Config = toml::from_str("[storage]\n").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.storage.backend, "filesystem");
        assert_eq!(config.storage.accept_globs, vec!["*.md".to_string()]);
        assert_eq!(config.chat.default_model, "openai");
        assert_eq!(config.inference.openai.model, "gpt-3.5-turbo");
        assert_eq!(config.inference.openai.max_tokens, 500);
        assert_eq!(config.inference.ollama.model, "llama2");
        assert_eq!(config.identity.min_password_len, 6);
    }

    #[test]
    fn s3_backend_requires_section() {
        let config: Config = toml::from_str("[storage]\nbackend = \"s3\"\n").unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("[storage.s3]"));
    }

    #[test]
    fn rejects_unknown_model() {
        let config: Config =
            toml::from_str("[storage]\n[chat]\ndefault_model = \"bard\"\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("docai.toml");
        std::fs::write(
            &path,
            r#"
[storage]
backend = "memory"

[chat]
default_model = "ollama"

[inference.ollama]
stream = true
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.chat.default_model, "ollama");
        assert!(config.inference.ollama.stream);
    }

    #[test]
    fn example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/docai.example.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.backend, "filesystem");
        assert_eq!(config.server.bind, "127.0.0.1:7341");
        assert!(config.identity.users_file.is_some());
    }
}
