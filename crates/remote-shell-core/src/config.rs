//! Connection parameters for remote shell sessions.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::ShellError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Credential material handed opaquely to the transport.
///
/// The core only checks whether a secret is present; `Debug` never prints it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw secret. Only transports should call this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How the session authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Password authentication.
    Password,
    /// Private key authentication.
    Key,
}

/// Connection parameters for a session. Immutable once the session exists.
///
/// Secrets are read from JSON but never written back out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Auth selector.
    pub auth_type: AuthType,
    /// Password, for `AuthType::Password`.
    #[serde(default, skip_serializing)]
    pub password: Option<Secret>,
    /// Private key material or path, for `AuthType::Key`.
    #[serde(default, skip_serializing)]
    pub private_key: Option<Secret>,
    /// Optional passphrase protecting the private key.
    #[serde(default, skip_serializing)]
    pub passphrase: Option<Secret>,
    /// Ask the transport to keep the connection alive.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Timeout hint for the transport, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_keep_alive() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl SessionConfig {
    /// Config using password authentication.
    #[must_use]
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<Secret>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth_type: AuthType::Password,
            password: Some(password.into()),
            private_key: None,
            passphrase: None,
            keep_alive: default_keep_alive(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Config using private key authentication.
    #[must_use]
    pub fn with_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        private_key: impl Into<Secret>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth_type: AuthType::Key,
            password: None,
            private_key: Some(private_key.into()),
            passphrase: None,
            keep_alive: default_keep_alive(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Set the key passphrase.
    #[must_use]
    pub fn passphrase(mut self, passphrase: impl Into<Secret>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Set the keep-alive flag.
    #[must_use]
    pub const fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the timeout hint.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Timeout hint as a duration.
    #[must_use]
    pub const fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parse a config from JSON and validate it.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self, ShellError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ShellError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the config is structurally well-formed.
    ///
    /// Secrets are checked for presence only.
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), ShellError> {
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        if self.username.trim().is_empty() {
            return Err(invalid("username must not be empty"));
        }

        let has_password = self.password.as_ref().is_some_and(|s| !s.is_empty());
        let has_key = self.private_key.as_ref().is_some_and(|s| !s.is_empty());

        match self.auth_type {
            AuthType::Password => {
                if !has_password {
                    return Err(invalid("password auth requires a password"));
                }
                if has_key {
                    return Err(invalid("password auth must not carry a private key"));
                }
            }
            AuthType::Key => {
                if !has_key {
                    return Err(invalid("key auth requires a private key"));
                }
                if has_password {
                    return Err(invalid("key auth must not carry a password"));
                }
            }
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> ShellError {
    ShellError::InvalidConfig(reason.to_string())
}
