use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Session expired or rejected: {0}")]
    SessionExpired(String),

    #[error("Device {0} not found on this account")]
    DeviceNotFound(String),

    #[error("Directory server {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}, code {code}): {message}")]
    Api {
        status: u16,
        code: i64,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Returns true if retrying won't help without operator intervention.
    /// Repeated logins with bad credentials risk locking the account.
    ///
    /// A missing device is not fatal: the page list is sometimes returned
    /// empty while the account is being synced.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthError::InvalidCredentials(_))
    }

    /// Returns true if the session token is no longer accepted
    pub fn is_session_expired(&self) -> bool {
        matches!(self, AuthError::SessionExpired(_))
    }

    /// Returns true if this error is transient and a retry might succeed
    pub fn is_transient(&self) -> bool {
        !self.is_fatal() && !self.is_session_expired()
    }
}
