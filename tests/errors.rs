//! Tests for error classification, retryability and sanitized messages.

use storyrelay::error::{ErrorClass, NETWORK_TROUBLESHOOTING, RelayError, classify_message};
use storyrelay::sink::{ErrorReport, ErrorSink, TracingSink};

#[test]
fn free_text_classification() {
    let cases = [
        ("[400] API key not valid. Please pass a valid API key.", ErrorClass::Auth),
        ("Error code: invalid_api_key", ErrorClass::Auth),
        ("got status 429 from upstream", ErrorClass::RateLimited),
        ("503 UNAVAILABLE: The model is overloaded.", ErrorClass::Overloaded),
        ("500 INTERNAL", ErrorClass::Overloaded),
        ("TypeError: Failed to fetch", ErrorClass::Network),
        ("net::ERR_INTERNET_DISCONNECTED", ErrorClass::Network),
        ("something odd happened", ErrorClass::Unknown),
    ];
    for (message, class) in cases {
        assert_eq!(classify_message(message), class, "{message}");
    }
}

#[test]
fn structured_variants_classify_without_text() {
    let upstream = RelayError::Upstream {
        provider: "openai".to_string(),
        message: "OpenAI API Error: 503 - busy".to_string(),
        status: Some(503),
    };
    assert_eq!(upstream.class(), ErrorClass::Unknown);
    assert!(upstream.is_retryable());

    let stream_error = RelayError::Upstream {
        provider: "gemini".to_string(),
        message: "503 UNAVAILABLE: overloaded".to_string(),
        status: None,
    };
    assert_eq!(stream_error.class(), ErrorClass::Overloaded);

    // Locally built decode failures carry serde positions that must not be
    // read as status codes.
    let decode = RelayError::InvalidResponse {
        provider: "gemini".to_string(),
        message: "unreadable body: expected value at line 1 column 429".to_string(),
    };
    assert_eq!(decode.class(), ErrorClass::Unknown);
    assert!(decode.is_retryable());
    assert!(!decode.user_message().contains("429"));

    assert_eq!(RelayError::Cancelled.class(), ErrorClass::Cancelled);
    assert!(!RelayError::Cancelled.is_retryable());
}

#[test]
fn user_messages_do_not_leak_detail() {
    let err = RelayError::Upstream {
        provider: "gemini".to_string(),
        message: "secret internal body https://internal.example".to_string(),
        status: Some(500),
    };
    let msg = err.user_message();
    assert!(!msg.contains("internal.example"));
    assert!(msg.contains("500"));

    let network = RelayError::Network {
        provider: "openai".to_string(),
        message: "connection refused".to_string(),
    };
    assert_eq!(network.user_message(), NETWORK_TROUBLESHOOTING);
}

#[test]
fn report_carries_class_and_provider() {
    let err = RelayError::RateLimited {
        provider: "gemini".to_string(),
    };
    let report = ErrorReport::from_error(&err);
    assert_eq!(report.class, ErrorClass::RateLimited);
    assert_eq!(report.provider.as_deref(), Some("gemini"));
    assert!(report.user_message.contains("rate limit"));
    assert!(!report.troubleshooting);

    // Smoke: the default sink only logs.
    TracingSink.report(&report);
}
