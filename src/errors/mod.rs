use thiserror::Error;

/// Classification of queue-service failures. Drives retry and settlement
/// decisions everywhere in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure, 5xx, or timeout. Retry with backoff.
    Transient,
    /// Rate limited. Retry with longer, jittered backoff.
    Throttled,
    /// Permission denied. Fatal for the listener, not the process.
    AuthZ,
    /// Queue does not exist. Fatal for the listener.
    NotFound,
    /// Receipt handle expired or was never valid. Drop the handle and let
    /// redelivery take over.
    InvalidHandle,
    /// Anything unexpected. Fatal for the listener.
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Throttled)
    }

    /// Kinds that terminate the affected poller but not the process.
    pub fn is_listener_fatal(self) -> bool {
        matches!(self, ErrorKind::AuthZ | ErrorKind::NotFound | ErrorKind::Fatal)
    }
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue service error ({kind:?}): {message}")]
    Queue { kind: ErrorKind, message: String },

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl ListenerError {
    pub fn queue(kind: ErrorKind, message: impl Into<String>) -> Self {
        ListenerError::Queue {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ListenerError::Queue { kind, .. } => *kind,
            _ => ErrorKind::Fatal,
        }
    }
}

/// Classify a queue-service error code (with its message as fallback).
///
/// Codes observed from the SQS API; substring checks cover the differing
/// spellings between the real service and local emulators.
pub fn classify_code(code: &str, message: &str) -> ErrorKind {
    let code_lower = code.to_lowercase();
    let msg_lower = message.to_lowercase();

    if code_lower.contains("receipthandleisinvalid")
        || code_lower.contains("messagenotinflight")
        || msg_lower.contains("receipt handle is invalid")
    {
        return ErrorKind::InvalidHandle;
    }

    if code_lower.contains("nonexistentqueue") || code_lower.contains("queuedoesnotexist") {
        return ErrorKind::NotFound;
    }

    if code_lower.contains("accessdenied")
        || code_lower.contains("invalidclienttokenid")
        || code_lower.contains("unrecognizedclient")
        || code_lower.contains("expiredtoken")
    {
        return ErrorKind::AuthZ;
    }

    if code_lower.contains("throttl")
        || code_lower.contains("toomanyrequests")
        || code_lower.contains("requestthrottled")
        || code_lower.contains("slowdown")
    {
        return ErrorKind::Throttled;
    }

    if code_lower.contains("serviceunavailable")
        || code_lower.contains("internalerror")
        || code_lower.contains("internalfailure")
        || code_lower.contains("requesttimeout")
        || msg_lower.contains("timeout")
        || msg_lower.contains("connection")
    {
        return ErrorKind::Transient;
    }

    ErrorKind::Fatal
}
