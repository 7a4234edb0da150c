use std::time::Duration;

const TIMEOUT_SECS: u64 = 5;

/// Timing and retry policy shared by both session kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a sender waits for the opening request. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// How long to wait for each ACK (sender) or DATA (retriever).
    pub timeout: Option<Duration>,
    /// Re-sends of the last packet allowed per block before giving up.
    /// Zero aborts on the first timeout.
    pub retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            timeout: Some(Duration::from_secs(TIMEOUT_SECS)),
            retries: 0,
        }
    }
}

impl SessionConfig {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}
