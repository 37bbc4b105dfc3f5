use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to parse provider response: {0}")]
    Parse(String),
    #[error("interval '{0}' is not supported by this provider")]
    UnsupportedInterval(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Timeouts, throttling and server-side failures are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::RateLimited(_) => true,
            ProviderError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Transport("timeout".into()).is_transient());
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::Http { status: 502, body: String::new() }.is_transient());
        assert!(!ProviderError::Http { status: 404, body: String::new() }.is_transient());
        assert!(!ProviderError::Parse("bad".into()).is_transient());
        assert!(!ProviderError::UnknownProvider("x".into()).is_transient());
    }
}
