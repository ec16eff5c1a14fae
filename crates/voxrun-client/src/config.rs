//! Client configuration.

use std::time::Duration;

use uuid::Uuid;
use voxrun_core::DEFAULT_RETENTION_DAYS;

use crate::error::ClientError;

/// Default address of the task service.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Default interval between authoritative status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default page size when listing tasks.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Configuration shared by every client component.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the task service.
    pub base_url: String,

    /// Session id sent as `X-Session-Id`; the service scopes tasks by it.
    pub session_id: String,

    /// Interval between status polls while tasks are active.
    pub poll_interval: Duration,

    /// How long terminal tasks are kept before purging.
    pub retention: chrono::Duration,

    /// Query the service once before failing a task whose progress channel
    /// dropped.
    pub verify_on_disconnect: bool,

    /// Maximum number of tasks fetched per listing.
    pub list_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            session_id: Uuid::new_v4().to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
            verify_on_disconnect: false,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_verify_on_disconnect(mut self, verify: bool) -> Self {
        self.verify_on_disconnect = verify;
        self
    }

    pub fn with_list_limit(mut self, limit: u32) -> Self {
        self.list_limit = limit;
        self
    }

    /// Check the configuration before use.
    pub fn validate(&self) -> Result<(), ClientError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base URL must be http(s): {}",
                self.base_url
            )));
        }
        if self.session_id.trim().is_empty() {
            return Err(ClientError::Config("session id is empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ClientError::Config("poll interval must be positive".to_string()));
        }
        Ok(())
    }
}
