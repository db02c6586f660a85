use thiserror::Error;

/// Troubleshooting text surfaced when a provider cannot be reached and no
/// fallback is left to try.
pub const NETWORK_TROUBLESHOOTING: &str = "Network connection failed. Possible causes:\n\
    1. The network connection is down or unstable\n\
    2. A firewall or proxy is blocking requests to the provider\n\
    3. The provider base URL is wrong or unreachable\n\
    4. The API key has expired or is invalid\n\n\
    Suggested fixes:\n\
    - Retry the request\n\
    - Check the network connection\n\
    - Verify the base URL and API key in the configuration\n\
    - Check whether a firewall or proxy intercepts the request";

/// Structured failure taxonomy used for routing in the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimited,
    Overloaded,
    Network,
    Parse,
    Cancelled,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing API key for {provider} (set {setting})")]
    MissingCredential { provider: String, setting: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("{provider} model {model} is overloaded: {message}")]
    Overloaded {
        provider: String,
        model: String,
        message: String,
    },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    /// A success response whose body could not be used. Built locally, so
    /// the text is never classified.
    #[error("invalid response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("network failure reaching {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to parse provider response: {message}")]
    Parse { message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Extract provider name from structured error variants.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::MissingCredential { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::Overloaded { provider, .. } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::InvalidResponse { provider, .. } => Some(provider),
            Self::Network { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Route this error into the taxonomy. Variants built from an HTTP status
    /// map structurally; only provider-supplied text goes through
    /// `classify_message`.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingCredential { .. } | Self::AuthFailed { .. } => ErrorClass::Auth,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Overloaded { .. } => ErrorClass::Overloaded,
            Self::Network { .. } => ErrorClass::Network,
            Self::Parse { .. } => ErrorClass::Parse,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Upstream {
                status: Some(_), ..
            } => ErrorClass::Unknown,
            Self::Upstream {
                message,
                status: None,
                ..
            } => classify_message(message),
            Self::InvalidResponse { .. } => ErrorClass::Unknown,
            Self::Request(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
                    ErrorClass::Network
                } else {
                    ErrorClass::Unknown
                }
            }
            Self::Config(_) => ErrorClass::Unknown,
            Self::Other(msg) => classify_message(msg),
        }
    }

    /// Auth, rate limits, parse failures and cancellation are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Overloaded | ErrorClass::Network | ErrorClass::Unknown
        )
    }

    /// Produce a sanitized message safe for showing to end users.
    /// Does not leak URLs or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingCredential { provider, setting } => {
                format!("Please enter your {provider} API key first ({setting}).")
            }
            Self::AuthFailed { provider, .. } => {
                format!("Invalid {provider} API key. Please check the key in your configuration.")
            }
            Self::RateLimited { provider } => format!(
                "You have reached the rate limit for {provider}. Please try again in a few minutes. \
                 If this keeps happening, the daily quota is probably used up."
            ),
            Self::Overloaded { provider, .. } => format!(
                "{provider} is currently overloaded. Enable the fallback in the configuration; \
                 if it is already enabled, the fallback is overloaded too."
            ),
            Self::Network { .. } => NETWORK_TROUBLESHOOTING.to_string(),
            Self::Request(_) if self.class() == ErrorClass::Network => {
                NETWORK_TROUBLESHOOTING.to_string()
            }
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Upstream { provider, status, .. } => match status {
                Some(code) => format!("{provider} returned an error (HTTP {code})"),
                None => format!("{provider} returned an error"),
            },
            Self::InvalidResponse { provider, .. } => {
                format!("{provider} sent a response that could not be read")
            }
            Self::Parse { .. } => "failed to parse provider response as JSON".to_string(),
            Self::Cancelled => "request cancelled".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}

/// Classify free-form provider error text. Matching is substring based and
/// every adapter keeps these markers in the text it produces.
pub fn classify_message(message: &str) -> ErrorClass {
    const AUTH: &[&str] = &["API key not valid", "invalid_api_key", "401", "403"];
    const NETWORK: &[&str] = &[
        "Failed to fetch",
        "NetworkError",
        "fetch failed",
        "ERR_NETWORK",
        "ERR_INTERNET_DISCONNECTED",
        "error sending request",
        "connection refused",
        "Connection refused",
    ];

    if AUTH.iter().any(|m| message.contains(m)) {
        ErrorClass::Auth
    } else if message.contains("429") {
        ErrorClass::RateLimited
    } else if message.contains("503") || message.contains("500") {
        ErrorClass::Overloaded
    } else if NETWORK.iter().any(|m| message.contains(m)) {
        ErrorClass::Network
    } else {
        ErrorClass::Unknown
    }
}
