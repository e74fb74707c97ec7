//! Error classification for SIS API failures.
//!
//! Maps an arbitrary transport failure into a structured classification:
//! type, retryability, severity, transient/permanent category, a fixed
//! PII-free user message, and an optional server-suggested retry delay.
//! Classification is total: every input shape, including garbage, yields a
//! result without panicking.
//!
//! Raw error detail never reaches a user message. When it is logged for
//! diagnostics it first passes through [`redact`], which scrubs known
//! sensitive patterns (SSNs, emails, phone numbers, internal hostnames).

use crate::errors::SisApiError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Maximum number of body bytes inspected during classification.
///
/// Oversized bodies are truncated before parsing so a pathological response
/// cannot stall the failure path.
const MAX_BODY_INSPECT_BYTES: usize = 16 * 1024;

/// Primary classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NetworkError,
    TimeoutError,
    AuthenticationError,
    AuthorizationError,
    ResourceNotFound,
    RateLimitError,
    ServerError,
    ServiceUnavailable,
    DataValidationError,
    UnknownError,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorType::NetworkError => "network_error",
            ErrorType::TimeoutError => "timeout_error",
            ErrorType::AuthenticationError => "authentication_error",
            ErrorType::AuthorizationError => "authorization_error",
            ErrorType::ResourceNotFound => "resource_not_found",
            ErrorType::RateLimitError => "rate_limit_error",
            ErrorType::ServerError => "server_error",
            ErrorType::ServiceUnavailable => "service_unavailable",
            ErrorType::DataValidationError => "data_validation_error",
            ErrorType::UnknownError => "unknown_error",
        };
        write!(f, "{name}")
    }
}

/// How serious a failure is for alerting and triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Whether a failure is expected to resolve on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retried, then dead-lettered on exhaustion.
    Transient,
    /// Surfaced immediately; retries cannot fix it.
    Permanent,
}

/// Result of classifying a single failure. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub is_retryable: bool,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    /// Fixed, generic, PII-free message suitable for end users.
    pub user_message: String,
    /// Server-suggested delay (Retry-After), when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<Duration>,
    /// Field-level detail for validation failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
}

impl ErrorClassification {
    fn new(
        error_type: ErrorType,
        is_retryable: bool,
        severity: ErrorSeverity,
        user_message: &'static str,
    ) -> Self {
        let category = if is_retryable {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Permanent
        };
        Self {
            error_type,
            is_retryable,
            severity,
            category,
            user_message: user_message.to_string(),
            retry_delay: None,
            validation_errors: None,
        }
    }
}

/// Strategy trait for failure classification.
///
/// Callers can inject custom policy; [`StandardErrorClassifier`] is the
/// default used throughout the crate.
pub trait ErrorClassifier: Send + Sync {
    /// Classify a transport failure. Must never panic.
    fn classify(&self, error: &SisApiError) -> ErrorClassification;

    /// Name for identification in logs.
    fn classifier_name(&self) -> &'static str;
}

/// Standard classifier implementing the fixed-precedence SIS API rules.
#[derive(Debug, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_http(
        &self,
        status: u16,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> ErrorClassification {
        match status {
            401 => ErrorClassification::new(
                ErrorType::AuthenticationError,
                false,
                ErrorSeverity::Critical,
                "The connection to the student information system is not authorized. Please contact your administrator.",
            ),
            403 => ErrorClassification::new(
                ErrorType::AuthorizationError,
                false,
                ErrorSeverity::Critical,
                "This account does not have permission for the requested records.",
            ),
            404 => ErrorClassification::new(
                ErrorType::ResourceNotFound,
                false,
                ErrorSeverity::Low,
                "The requested record was not found in the student information system.",
            ),
            429 => {
                let mut classification = ErrorClassification::new(
                    ErrorType::RateLimitError,
                    true,
                    ErrorSeverity::Medium,
                    "The student information system is receiving too many requests. The operation will be retried shortly.",
                );
                classification.retry_delay = extract_retry_after(headers);
                classification
            }
            500 => ErrorClassification::new(
                ErrorType::ServerError,
                true,
                ErrorSeverity::High,
                "The student information system reported an internal error. The operation will be retried.",
            ),
            503 => ErrorClassification::new(
                ErrorType::ServiceUnavailable,
                true,
                ErrorSeverity::High,
                "The student information system is temporarily unavailable. The operation will be retried.",
            ),
            400 => {
                if let Some(errors) = body.and_then(extract_validation_errors) {
                    let mut classification = ErrorClassification::new(
                        ErrorType::DataValidationError,
                        false,
                        ErrorSeverity::Medium,
                        "The submitted data was rejected by the student information system. Please review and correct it.",
                    );
                    classification.validation_errors = Some(errors);
                    classification
                } else {
                    unknown_classification()
                }
            }
            _ => unknown_classification(),
        }
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &SisApiError) -> ErrorClassification {
        let classification = match error {
            SisApiError::Network { .. } => ErrorClassification::new(
                ErrorType::NetworkError,
                true,
                ErrorSeverity::High,
                "Unable to reach the student information system. The operation will be retried.",
            ),
            SisApiError::Timeout { .. } => ErrorClassification::new(
                ErrorType::TimeoutError,
                true,
                ErrorSeverity::Medium,
                "The student information system took too long to respond. The operation will be retried.",
            ),
            SisApiError::Http {
                status,
                headers,
                body,
            } => self.classify_http(*status, headers, body.as_deref().map(truncate_body)),
            SisApiError::Malformed { .. } | SisApiError::Other(_) => unknown_classification(),
        };

        debug!(
            classifier = self.classifier_name(),
            error_type = %classification.error_type,
            is_retryable = classification.is_retryable,
            raw_error = %redact(&error.to_string()),
            "Classified SIS API failure"
        );

        classification
    }

    fn classifier_name(&self) -> &'static str {
        "StandardErrorClassifier"
    }
}

fn unknown_classification() -> ErrorClassification {
    ErrorClassification::new(
        ErrorType::UnknownError,
        false,
        ErrorSeverity::Medium,
        "An unexpected error occurred while communicating with the student information system.",
    )
}

/// Parse a Retry-After header value: integer seconds first, then HTTP date.
fn extract_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    let value = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("retry-after"))
        .map(|(_, value)| value.trim())?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let diff = date.signed_duration_since(Utc::now());
        if diff.num_seconds() > 0 {
            return Some(Duration::from_secs(diff.num_seconds() as u64));
        }
    }

    None
}

/// Pull field-level messages out of a structured 400 body.
///
/// Recognizes `{"errors": [...]}` where entries are strings or objects
/// carrying a `message`/`detail` field.
fn extract_validation_errors(body: &str) -> Option<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let entries = value.get("errors")?.as_array()?;

    let messages: Vec<String> = entries
        .iter()
        .filter_map(|entry| match entry {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(obj) => obj
                .get("message")
                .or_else(|| obj.get("detail"))
                .and_then(|m| m.as_str())
                .map(str::to_string),
            _ => None,
        })
        .collect();

    if messages.is_empty() {
        None
    } else {
        Some(messages)
    }
}

fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_BODY_INSPECT_BYTES {
        return body;
    }
    let mut end = MAX_BODY_INSPECT_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

static SSN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid SSN pattern"));
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email pattern")
});
static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").expect("valid phone pattern")
});
static INTERNAL_HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9][A-Za-z0-9-]*(?:\.[A-Za-z0-9-]+)*\.(?:internal|local|corp|lan)\b")
        .expect("valid hostname pattern")
});

/// Scrub known sensitive patterns from raw diagnostic text.
///
/// Applied to every raw error string before it is logged or persisted.
pub fn redact(input: &str) -> String {
    let pass = SSN_PATTERN.replace_all(input, "[REDACTED-SSN]");
    let pass = EMAIL_PATTERN.replace_all(&pass, "[REDACTED-EMAIL]");
    let pass = PHONE_PATTERN.replace_all(&pass, "[REDACTED-PHONE]");
    let pass = INTERNAL_HOST_PATTERN.replace_all(&pass, "[REDACTED-HOST]");
    pass.into_owned()
}
