//! Maps broker failures to a recovery policy.
//!
//! [`classify`] is a pure function: the same error always yields the same
//! category, flags and base delay. The stateful part of retrying (how many
//! attempts so far, when to give up) lives in [`FailureTracker`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::time::Duration;

use rand::Rng;

use crate::error::BrokerError;

/// Exponent applied to the base delay saturates after this many doublings.
const MAX_BACKOFF_EXPONENT: u32 = 6;
const MAX_JITTER_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NetworkUnavailable,
    NameResolutionFailure,
    ConnectTimeout,
    ReadTimeout,
    ConnectionRefused,
    ConnectionReset,
    TlsHandshakeFailure,
    AuthenticationFailure,
    ResourceDeclarationConflict,
    ChannelAlreadyClosed,
    GenericTransportError,
}

struct CategoryPolicy {
    recoverable: bool,
    base_delay: Duration,
    reset_connection: bool,
    check_network: bool,
    max_attempts: Option<u32>,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "network-unavailable",
            Self::NameResolutionFailure => "name-resolution-failure",
            Self::ConnectTimeout => "connect-timeout",
            Self::ReadTimeout => "read-timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::ConnectionReset => "connection-reset",
            Self::TlsHandshakeFailure => "tls-handshake-failure",
            Self::AuthenticationFailure => "authentication-failure",
            Self::ResourceDeclarationConflict => "resource-declaration-conflict",
            Self::ChannelAlreadyClosed => "channel-already-closed",
            Self::GenericTransportError => "generic-transport-error",
        }
    }

    fn policy(self) -> CategoryPolicy {
        let secs = Duration::from_secs;
        let (recoverable, base_delay, reset_connection, check_network, max_attempts) = match self {
            Self::NetworkUnavailable => (true, secs(10), false, true, None),
            Self::NameResolutionFailure => (true, secs(15), false, true, None),
            Self::ConnectTimeout => (true, secs(5), true, false, None),
            Self::ReadTimeout => (true, secs(3), true, false, None),
            Self::ConnectionRefused => (true, secs(30), false, false, Some(10)),
            Self::ConnectionReset => (true, secs(5), false, false, None),
            Self::TlsHandshakeFailure => (true, secs(10), false, false, None),
            Self::AuthenticationFailure => (false, secs(60), false, false, Some(3)),
            Self::ResourceDeclarationConflict => (false, secs(60), false, false, Some(3)),
            Self::ChannelAlreadyClosed => (true, secs(3), false, false, None),
            Self::GenericTransportError => (true, secs(15), false, false, None),
        };
        CategoryPolicy {
            recoverable,
            base_delay,
            reset_connection,
            check_network,
            max_attempts,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub recoverable: bool,
    pub recommended_delay: Duration,
    pub reset_connection: bool,
    pub check_network: bool,
    pub max_attempts: Option<u32>,
    pub message: String,
}

impl ErrorClassification {
    fn new(category: ErrorCategory, message: String) -> Self {
        let policy = category.policy();
        Self {
            category,
            recoverable: policy.recoverable,
            recommended_delay: policy.base_delay,
            reset_connection: policy.reset_connection,
            check_network: policy.check_network,
            max_attempts: policy.max_attempts,
            message,
        }
    }
}

/// Classify a broker failure.
pub fn classify(error: &BrokerError) -> ErrorClassification {
    let message = error.to_string();
    match error {
        BrokerError::NetworkUnavailable(_) => {
            ErrorClassification::new(ErrorCategory::NetworkUnavailable, message)
        }
        BrokerError::DnsResolutionFailed(_) => {
            ErrorClassification::new(ErrorCategory::NameResolutionFailure, message)
        }
        BrokerError::ConnectTimeout(_) => {
            ErrorClassification::new(ErrorCategory::ConnectTimeout, message)
        }
        BrokerError::ReadTimeout(_) => ErrorClassification::new(ErrorCategory::ReadTimeout, message),
        BrokerError::ConnectionRefused(_) => {
            ErrorClassification::new(ErrorCategory::ConnectionRefused, message)
        }
        BrokerError::ConnectionReset(_) => {
            ErrorClassification::new(ErrorCategory::ConnectionReset, message)
        }
        BrokerError::TlsHandshakeFailed(_) => {
            ErrorClassification::new(ErrorCategory::TlsHandshakeFailure, message)
        }
        BrokerError::AuthenticationFailed(_) => {
            ErrorClassification::new(ErrorCategory::AuthenticationFailure, message)
        }
        BrokerError::ResourceConflict(_) => {
            ErrorClassification::new(ErrorCategory::ResourceDeclarationConflict, message)
        }
        BrokerError::ChannelClosed(_) => {
            ErrorClassification::new(ErrorCategory::ChannelAlreadyClosed, message)
        }
        BrokerError::Io(io) => {
            let category = categorize_io_kind(io.kind()).unwrap_or_else(|| categorize_message(&message));
            let mut classification = ErrorClassification::new(category, message);
            if category == ErrorCategory::GenericTransportError {
                classification.recommended_delay = Duration::from_secs(10);
            }
            classification
        }
        BrokerError::Transport(text) => {
            ErrorClassification::new(categorize_message(text), message)
        }
    }
}

fn categorize_io_kind(kind: ErrorKind) -> Option<ErrorCategory> {
    match kind {
        ErrorKind::ConnectionRefused => Some(ErrorCategory::ConnectionRefused),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => Some(ErrorCategory::ConnectionReset),
        ErrorKind::TimedOut => Some(ErrorCategory::ReadTimeout),
        ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::NetworkDown
        | ErrorKind::HostUnreachable => Some(ErrorCategory::NetworkUnavailable),
        _ => None,
    }
}

/// Keyword classification for errors that only arrive as text, such as
/// protocol close reasons relayed by the AMQP client.
pub fn categorize_message(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if has(&["authentication", "login was refused", "sasl", "invalid credentials"]) {
        ErrorCategory::AuthenticationFailure
    } else if has(&["precondition_failed", "inequivalent arg"]) {
        ErrorCategory::ResourceDeclarationConflict
    } else if has(&["connection refused"]) {
        ErrorCategory::ConnectionRefused
    } else if has(&["network is unreachable", "network is down", "no route to host"]) {
        ErrorCategory::NetworkUnavailable
    } else if has(&["connection reset", "broken pipe", "connection aborted", "unexpected eof"]) {
        ErrorCategory::ConnectionReset
    } else if has(&["failed to lookup", "dns", "name resolution", "resolve"]) {
        ErrorCategory::NameResolutionFailure
    } else if has(&["tls", "certificate", "ssl", "handshake"]) {
        ErrorCategory::TlsHandshakeFailure
    } else if has(&["timed out", "timeout", "missing heartbeat"]) {
        ErrorCategory::ReadTimeout
    } else if lower.contains("channel") && has(&["closed", "invalid channel state"]) {
        ErrorCategory::ChannelAlreadyClosed
    } else {
        ErrorCategory::GenericTransportError
    }
}

/// Upper bound for backoff derived from the magnitude of the base delay.
pub fn backoff_cap(base: Duration) -> Duration {
    if base <= Duration::from_secs(5) {
        Duration::from_secs(30)
    } else if base <= Duration::from_secs(15) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(120)
    }
}

/// `min(base * 2^min(attempt-1, 6) + jitter, cap)`. Attempt numbering
/// starts at 1; attempt 0 is treated as 1.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    let exponent = attempt.max(1).saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1 << exponent)
        .saturating_add(jitter)
        .min(backoff_cap(base))
}

/// [`backoff_delay`] with uniform jitter in `0..1000ms`.
pub fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let jitter = Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MS));
    backoff_delay(base, attempt, jitter)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempt: u32 },
}

/// Consecutive-failure bookkeeping for one connection. Reset on every
/// successful connect.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive: u32,
    per_category: HashMap<ErrorCategory, u32>,
    last_error: Option<String>,
    delay_ceiling: Option<Duration>,
}

impl FailureTracker {
    pub fn new(delay_ceiling: Option<Duration>) -> Self {
        Self {
            delay_ceiling,
            ..Self::default()
        }
    }

    pub fn record(&mut self, classification: &ErrorClassification) -> RetryDecision {
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_error = Some(classification.message.clone());

        let category_attempts = self
            .per_category
            .entry(classification.category)
            .or_insert(0);
        *category_attempts = category_attempts.saturating_add(1);

        if classification
            .max_attempts
            .is_some_and(|max| *category_attempts > max)
        {
            return RetryDecision::GiveUp {
                attempt: self.consecutive,
            };
        }

        let mut delay = jittered_backoff(classification.recommended_delay, self.consecutive);
        if let Some(ceiling) = self.delay_ceiling {
            delay = delay.min(ceiling);
        }

        RetryDecision::Retry {
            attempt: self.consecutive,
            delay,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.per_category.clear();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
