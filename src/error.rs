//! Error taxonomy for the places where callers must tell failures apart.
//!
//! Everything else in the crate uses `anyhow::Result`. These enums exist at
//! the three seams the UI layer cares about:
//!
//! | Type | Raised by | Surfaced to the user? |
//! |------|-----------|-----------------------|
//! | [`AuthError`] | [`IdentityProvider`](crate::identity::IdentityProvider) | Yes, via [`AuthError::user_message`] |
//! | [`StorageError`] | [`BlobStore`](crate::blob::BlobStore) | No, logged and degraded |
//! | [`InferenceError`] | [`InferenceBackend`](crate::inference::InferenceBackend) | Yes, as a failed turn outcome |

use thiserror::Error;

/// Identity provider failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email address")]
    InvalidEmail,

    #[error("wrong password")]
    WrongPassword,

    #[error("no user registered with that email")]
    UserNotFound,

    #[error("password must be at least {min_len} characters")]
    WeakPassword { min_len: usize },

    #[error("email already in use")]
    EmailInUse,

    #[error("not signed in")]
    NotSignedIn,

    #[error("identity provider error: {0}")]
    Other(String),
}

impl AuthError {
    /// The short, actionable message shown in the sign-in / sign-up form.
    ///
    /// All credential failures map to the same message.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidEmail | AuthError::WrongPassword | AuthError::UserNotFound => {
                "Invalid email/password".to_string()
            }
            AuthError::WeakPassword { min_len } => {
                format!("Password should be at least {} characters long", min_len)
            }
            AuthError::EmailInUse => {
                "This email is already in use. Please use a different email or sign in."
                    .to_string()
            }
            AuthError::NotSignedIn | AuthError::Other(_) => {
                "An error occurred, try again".to_string()
            }
        }
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidEmail => "auth/invalid-email",
            AuthError::WrongPassword => "auth/wrong-password",
            AuthError::UserNotFound => "auth/user-not-found",
            AuthError::WeakPassword { .. } => "auth/weak-password",
            AuthError::EmailInUse => "auth/email-already-in-use",
            AuthError::NotSignedIn => "auth/not-signed-in",
            AuthError::Other(_) => "auth/internal",
        }
    }
}

/// Blob store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage error: {0:#}")]
    Transient(#[from] anyhow::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Inference backend failures.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Non-2xx response from the backend.
    #[error("{backend} returned HTTP {status}: {message}")]
    Http {
        backend: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    /// Connection, timeout, or body-read failure.
    #[error("{backend} request failed: {message}")]
    Network { backend: String, message: String },

    /// Well-formed response carrying no completion.
    #[error("{backend} returned no choices")]
    NoChoices { backend: String },

    /// Response body could not be parsed.
    #[error("{backend} returned a malformed response: {message}")]
    Malformed { backend: String, message: String },

    #[error("no inference backend registered for model '{0}'")]
    UnknownBackend(String),
}

impl InferenceError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Http { retryable, .. } => *retryable,
            InferenceError::Network { .. } => true,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InferenceError::Http { .. } => "inference_http",
            InferenceError::Network { .. } => "inference_network",
            InferenceError::NoChoices { .. } => "inference_no_choices",
            InferenceError::Malformed { .. } => "inference_malformed",
            InferenceError::UnknownBackend(_) => "inference_unknown_backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_share_one_message() {
        for err in [
            AuthError::InvalidEmail,
            AuthError::WrongPassword,
            AuthError::UserNotFound,
        ] {
            assert_eq!(err.user_message(), "Invalid email/password");
        }
    }

    #[test]
    fn unmapped_auth_errors_fall_back_to_generic_message() {
        let err = AuthError::Other("backend down".into());
        assert_eq!(err.user_message(), "An error occurred, try again");
        assert_eq!(
            AuthError::WeakPassword { min_len: 6 }.user_message(),
            "Password should be at least 6 characters long"
        );
    }

    #[test]
    fn retryability() {
        let http = |status: u16, retryable| InferenceError::Http {
            backend: "openai".into(),
            status,
            message: String::new(),
            retryable,
        };
        assert!(http(429, true).is_retryable());
        assert!(!http(400, false).is_retryable());
        assert!(!InferenceError::NoChoices {
            backend: "openai".into()
        }
        .is_retryable());
    }
}
