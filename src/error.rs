//! Error types shared by the decision pipeline.
//!
//! None of these escape [`crate::engine::SendPolicyEngine::evaluate`]; the
//! engine folds every failure into a [`crate::engine::Decision`] so the host
//! always receives exactly one completion.

use thiserror::Error;

use crate::address::RecipientField;

/// Failure reported by a host capability (recipient accessors, property
/// bag, subject/body mutators).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host call timed out after {0} ms")]
    Timeout(u64),
    #[error("host call failed: {0}")]
    Failed(String),
    #[error("operation not supported by host: {0}")]
    Unsupported(&'static str),
}

/// Outcome of a confirmation dialog that is not one of the recognised
/// reply tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("dialog could not be displayed: {0}")]
    DisplayFailed(String),
    #[error("dialog closed without a reply")]
    ClosedWithoutReply,
    #[error("unrecognised dialog reply '{0}'")]
    UnrecognizedReply(String),
    #[error("dialog reply of {len} bytes exceeds limit of {limit} bytes")]
    OversizedReply { len: usize, limit: usize },
}

/// Failure loading the trusted-domain configuration.
#[derive(Debug, Error)]
pub enum TrustSourceError {
    #[error("failed to read trust configuration '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse trust configuration '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The failure classes a send attempt can run into. Each maps to a fixed
/// fallback in the engine: fetch and persistence errors fail open, channel
/// and remediation errors fail closed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("could not read {field} recipients: {source}")]
    RecipientFetch {
        field: RecipientField,
        #[source]
        source: HostError,
    },
    #[error("warning flag could not be persisted: {0}")]
    StatePersistence(#[source] HostError),
    #[error("confirmation dialog failed: {0}")]
    ConfirmationChannel(#[source] ChannelError),
    /// `unrestored` lists fields already rewritten that could not be put
    /// back after the failure.
    #[error("could not rewrite {field} recipients: {reason}")]
    Remediation {
        field: RecipientField,
        reason: String,
        unrestored: Vec<RecipientField>,
    },
    #[error("removing external recipients would leave no recipients")]
    NoTrustedRecipients,
}

impl SendError {
    /// Whether the engine resolves this error by allowing the send.
    pub fn fails_open(&self) -> bool {
        matches!(
            self,
            SendError::RecipientFetch { .. } | SendError::StatePersistence(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_fail_open_and_ui_errors_fail_closed() {
        let fetch = SendError::RecipientFetch {
            field: RecipientField::To,
            source: HostError::Timeout(50),
        };
        assert!(fetch.fails_open());
        assert!(SendError::StatePersistence(HostError::Failed("quota".into())).fails_open());
        assert!(!SendError::ConfirmationChannel(ChannelError::ClosedWithoutReply).fails_open());
        assert!(!SendError::Remediation {
            field: RecipientField::Cc,
            reason: "read-only".into(),
            unrestored: Vec::new(),
        }
        .fails_open());
        assert!(!SendError::NoTrustedRecipients.fails_open());
    }

    #[test]
    fn messages_name_the_field() {
        let err = SendError::RecipientFetch {
            field: RecipientField::Bcc,
            source: HostError::Failed("boom".into()),
        };
        assert_eq!(err.to_string(), "could not read bcc recipients: host call failed: boom");
    }
}
