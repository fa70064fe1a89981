//! Error taxonomy shared by the Ask and Diagnose pipelines.
//!
//! Collaborators report [`BackendError`]; pipeline stages translate those
//! into [`AskError`] variants that name the failing stage. Only the stable
//! [`ErrorKind`] code and a fixed public message ever reach callers, the
//! collaborator detail stays in logs.

use serde::Serialize;
use thiserror::Error;

/// Failure reported by an external collaborator (corpus index, model endpoint).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Stable, caller-facing error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidQuery,
    RetrievalUnavailable,
    RerankTimeout,
    GenerationTimeout,
    GenerationUnavailable,
    VerifierUnavailable,
    AskTimeout,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::RetrievalUnavailable => "retrieval_unavailable",
            ErrorKind::RerankTimeout => "rerank_timeout",
            ErrorKind::GenerationTimeout => "generation_timeout",
            ErrorKind::GenerationUnavailable => "generation_unavailable",
            ErrorKind::VerifierUnavailable => "verifier_unavailable",
            ErrorKind::AskTimeout => "ask_timeout",
        }
    }

    /// Message safe to show to API callers.
    pub fn public_message(&self) -> &'static str {
        match self {
            ErrorKind::InvalidQuery => "query must not be empty",
            ErrorKind::RetrievalUnavailable => "the evidence index is currently unavailable",
            ErrorKind::RerankTimeout => "evidence ranking timed out",
            ErrorKind::GenerationTimeout => "answer generation timed out",
            ErrorKind::GenerationUnavailable => "the answer generation service is unavailable",
            ErrorKind::VerifierUnavailable => "the citation verifier is unavailable",
            ErrorKind::AskTimeout => "the request exceeded its deadline",
        }
    }

    /// Infrastructure failures (as opposed to bad input or deadline expiry).
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, ErrorKind::InvalidQuery | ErrorKind::AskTimeout)
    }
}

/// Failure of one Ask request. Never carries a partial answer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AskError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("re-ranking exceeded its time slice")]
    RerankTimeout,
    #[error("generation timed out")]
    GenerationTimeout,
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),
    #[error("verifier unavailable: {0}")]
    VerifierUnavailable(String),
    #[error("ask deadline of {0} ms exceeded")]
    AskTimeout(u64),
}

impl AskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AskError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            AskError::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            AskError::RerankTimeout => ErrorKind::RerankTimeout,
            AskError::GenerationTimeout => ErrorKind::GenerationTimeout,
            AskError::GenerationUnavailable(_) => ErrorKind::GenerationUnavailable,
            AskError::VerifierUnavailable(_) => ErrorKind::VerifierUnavailable,
            AskError::AskTimeout(_) => ErrorKind::AskTimeout,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Local retry is only safe for the read-only retrieval stage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AskError::RetrievalUnavailable(_))
    }
}

/// Errors raised while stepping a diagnostic session.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DiagnoseError {
    #[error("diagnostic session not found: {0}")]
    SessionNotFound(String),
    #[error("diagnostic session {0} is being stepped by another caller")]
    SessionBusy(String),
    #[error("diagnostic session {0} has already reached a decision")]
    SessionTerminated(String),
    #[error("invalid diagnose input: {0}")]
    InvalidInput(String),
    #[error("the intake stage requires signalment and complaint")]
    MissingIntake,
}

impl DiagnoseError {
    pub fn code(&self) -> &'static str {
        match self {
            DiagnoseError::SessionNotFound(_) => "not_found",
            DiagnoseError::SessionBusy(_) => "session_busy",
            DiagnoseError::SessionTerminated(_) => "session_terminated",
            DiagnoseError::InvalidInput(_) | DiagnoseError::MissingIntake => "bad_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_retrieval_is_retryable() {
        assert!(AskError::RetrievalUnavailable("down".into()).is_retryable());
        assert!(!AskError::GenerationTimeout.is_retryable());
        assert!(!AskError::AskTimeout(30_000).is_retryable());
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = AskError::GenerationUnavailable("connection refused 10.0.0.7:8000".into());
        let msg = err.kind().public_message();
        assert!(!msg.contains("10.0.0.7"));
        assert_eq!(err.code(), "generation_unavailable");
    }

    #[test]
    fn test_timeout_is_not_infrastructure() {
        assert!(!ErrorKind::AskTimeout.is_infrastructure());
        assert!(ErrorKind::VerifierUnavailable.is_infrastructure());
    }
}
