use std::sync::Mutex;

use crate::error::{ErrorClass, RelayError};

/// What the outside world learns about a request that could not be served.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub class: ErrorClass,
    pub provider: Option<String>,
    pub user_message: String,
    /// Internal detail (not sanitized). For logs only.
    pub detail: String,
    pub retryable: bool,
    /// Set for network failures: the user message is a troubleshooting list.
    pub troubleshooting: bool,
}

impl ErrorReport {
    pub fn from_error(error: &RelayError) -> Self {
        let class = error.class();
        Self {
            class,
            provider: error.provider().map(str::to_string),
            user_message: error.user_message(),
            detail: error.to_string(),
            retryable: matches!(
                class,
                ErrorClass::Network | ErrorClass::Overloaded | ErrorClass::RateLimited
            ),
            troubleshooting: class == ErrorClass::Network,
        }
    }
}

/// External error sink. Receives each unresolved failure exactly once per
/// logical request.
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: &ErrorReport);
}

/// Default sink: log through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, report: &ErrorReport) {
        tracing::error!(
            class = report.class.as_str(),
            provider = report.provider.as_deref().unwrap_or("unknown"),
            retryable = report.retryable,
            "{}",
            report.detail
        );
    }
}

/// Sink that keeps every report in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<ErrorReport> {
        self.reports().pop()
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, report: &ErrorReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}
