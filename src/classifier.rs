//! Maps a failure cause to a (category, severity, retry-decision) triple and
//! tracks per-operation error history so retry counts and backoff delays can
//! be computed deterministically.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use rand::Rng;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClassifierError>;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Category {
    Network,
    Timeout,
    Authentication,
    FileSystem,
    Storage,
    Security,
    Resource,
    Configuration,
    Protocol,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A decided retry outcome for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// The fully classified shape of one failure, as handed back to callers.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: Category,
    pub severity: Severity,
    pub decision: RetryDecision,
    pub recommended_action: &'static str,
}

/// A raw description of what went wrong, cheap for call sites to build from
/// whatever error they are holding (an I/O error, a transport failure, ...).
#[derive(Debug, Clone)]
pub struct FailureCause {
    pub message: String,
}

impl FailureCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// History kept for one operation id (typically a `(transfer_id, chunk_index)`
/// pair encoded as a string, or a connection id).
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub first_occurrence: SystemTime,
    pub last_occurrence: SystemTime,
    pub attempts: u32,
    pub history: Vec<Classification>,
}

const MAX_HISTORY: usize = 32;

fn categorize(message: &str) -> (Category, Severity) {
    let lower = message.to_lowercase();
    if lower.contains("connect") || lower.contains("resolve") || lower.contains("resolution") {
        (Category::Network, Severity::Medium)
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("deadline") {
        (Category::Timeout, Severity::Medium)
    } else if lower.contains("permission denied") {
        (Category::Authentication, Severity::Critical)
    } else if lower.contains("file not found") || lower.contains("directory not found") || lower.contains("no such file") {
        (Category::FileSystem, Severity::Low)
    } else if lower.contains("disk") && (lower.contains("full") || lower.contains("i/o") || lower.contains("io error")) {
        (Category::Storage, Severity::Medium)
    } else if lower.contains("crypto") || lower.contains("integrity") || lower.contains("checksum") || lower.contains("hash mismatch") {
        (Category::Security, Severity::High)
    } else if lower.contains("out of memory") || lower.contains("oom") {
        (Category::Resource, Severity::Critical)
    } else if lower.contains("invalid argument") || lower.contains("invalid state") {
        (Category::Configuration, Severity::Medium)
    } else if lower.contains("parse") || lower.contains("invalid data") || lower.contains("malformed") {
        (Category::Protocol, Severity::Low)
    } else {
        (Category::Unknown, Severity::Medium)
    }
}

fn retry_cap(category: Category, global_max_attempts: u32) -> u32 {
    match category {
        Category::Network | Category::Timeout => global_max_attempts,
        Category::FileSystem | Category::Protocol => 2,
        Category::Storage | Category::Resource => 3,
        Category::Security | Category::Authentication | Category::Configuration => 0,
        Category::Unknown => 3,
    }
}

fn base_delay(category: Category) -> Duration {
    match category {
        Category::Network => Duration::from_secs(1),
        Category::Timeout => Duration::from_secs(2),
        Category::Storage => Duration::from_millis(500),
        Category::FileSystem => Duration::from_millis(200),
        Category::Protocol => Duration::from_millis(100),
        _ => Duration::from_secs(1),
    }
}

fn recommended_action(category: Category, severity: Severity) -> &'static str {
    if severity == Severity::Critical {
        return "abort and surface to the user";
    }
    match category {
        Category::Network | Category::Timeout => "retry with backoff",
        Category::FileSystem => "verify the path exists and retry",
        Category::Storage => "free disk space and retry",
        Category::Security => "re-fetch and re-verify the affected chunk",
        Category::Resource => "reduce concurrency and retry",
        Category::Configuration => "fix configuration before retrying",
        Category::Protocol => "re-negotiate and retry",
        Category::Unknown | Category::Authentication => "retry with backoff",
    }
}

/// Computes the exponential-backoff-with-jitter delay for `attempt` (1-based)
/// within a category, capped at `max_delay`.
pub fn backoff_delay(category: Category, attempt: u32, max_delay: Duration) -> Duration {
    let base = base_delay(category);
    let scaled = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
    let capped = scaled.min(max_delay);
    let jitter_bound_ms = (capped.as_millis() as u64) / 10;
    let jitter_ms = if jitter_bound_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_bound_ms)
    };
    (capped + Duration::from_millis(jitter_ms)).min(max_delay)
}

/// Stateless classification: deterministic given the message, attempt count
/// and configured caps. Jitter in the resulting delay is the only
/// non-determinism, per the Classifier purity property (delay is still
/// monotonic up to the cap in expectation).
pub fn classify(
    cause: &FailureCause,
    attempt: u32,
    global_max_attempts: u32,
    max_delay: Duration,
) -> Classification {
    let (category, severity) = categorize(&cause.message);
    let decision = if severity == Severity::Critical {
        RetryDecision::GiveUp
    } else {
        let cap = retry_cap(category, global_max_attempts);
        if attempt >= cap {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: backoff_delay(category, attempt, max_delay),
            }
        }
    };

    let classification = Classification {
        category,
        severity,
        decision,
        recommended_action: recommended_action(category, severity),
    };

    match classification.decision {
        RetryDecision::Retry { .. } => log::debug!(
            "classified failure as {:?}/{:?}: retry scheduled (attempt {})",
            category,
            severity,
            attempt
        ),
        RetryDecision::GiveUp if severity == Severity::Critical => log::warn!(
            "classified failure as {:?}/Critical: giving up (attempt {})",
            category,
            attempt
        ),
        RetryDecision::GiveUp => log::debug!(
            "classified failure as {:?}/{:?}: retry cap exhausted (attempt {})",
            category,
            severity,
            attempt
        ),
    }

    classification
}

/// Tracks error contexts per operation id, garbage-collecting entries whose
/// last occurrence is older than `retention`.
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    contexts: HashMap<String, ErrorContext>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `cause` for `operation_id`, updating its context, and
    /// returns the classification along with the attempt number it was
    /// evaluated at.
    pub fn classify_for(
        &mut self,
        operation_id: &str,
        cause: FailureCause,
        global_max_attempts: u32,
        max_delay: Duration,
    ) -> (u32, Classification) {
        let now = SystemTime::now();
        let context = self
            .contexts
            .entry(operation_id.to_string())
            .or_insert_with(|| ErrorContext {
                first_occurrence: now,
                last_occurrence: now,
                attempts: 0,
                history: Vec::new(),
            });

        context.attempts += 1;
        context.last_occurrence = now;
        let attempt = context.attempts;

        let classification = classify(&cause, attempt, global_max_attempts, max_delay);

        context.history.push(classification.clone());
        if context.history.len() > MAX_HISTORY {
            context.history.remove(0);
        }

        (attempt, classification)
    }

    pub fn context(&self, operation_id: &str) -> Option<&ErrorContext> {
        self.contexts.get(operation_id)
    }

    /// Removes contexts whose last occurrence predates `retention`.
    pub fn garbage_collect(&mut self, retention: Duration) {
        let now = SystemTime::now();
        self.contexts.retain(|_, ctx| {
            now.duration_since(ctx.last_occurrence)
                .map(|age| age <= retention)
                .unwrap_or(true)
        });
    }
}
