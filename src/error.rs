//! Error types for the worker agent.

/// Failure raised while resolving or driving a task module.
///
/// The variant records which part of the task lifecycle failed; the
/// `Display` string is the human-readable message reported to the control
/// plane in the job result.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Task payload failed structural or semantic checks, before any side
    /// effect from that task.
    #[error("Could not validate task data: {0}")]
    Validation(String),

    /// The named module could not be resolved or constructed.
    #[error("Could not initialize module: {0}")]
    Initialization(String),

    /// The task's effectful work failed (external-process exit, filesystem
    /// failure, ...).
    #[error("Failed to run task: {0}")]
    Run(String),

    /// Post-run resource release failed.
    #[error("Failed to cleanup task: {0}")]
    Cleanup(String),

    /// Anything module code produced that is not one of the named kinds,
    /// including a panic caught at the executor boundary.
    #[error("Unknown failure on task: {0}")]
    Unknown(String),
}

/// Transport-layer failure talking to the control plane.
///
/// Never aborts a claimed job; it only postpones the polling step that
/// raised it.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Could not reach {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Coarse class of a [`NetworkError`], comparable across occurrences so the
/// poller can tell whether a failure streak is still the same condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Status,
    Decode,
}

impl NetworkError {
    pub fn kind(&self) -> NetworkErrorKind {
        match self {
            Self::Timeout { .. } => NetworkErrorKind::Timeout,
            Self::Connect { .. } => NetworkErrorKind::Connect,
            Self::Status { .. } => NetworkErrorKind::Status,
            Self::Decode { .. } => NetworkErrorKind::Decode,
        }
    }

    /// Classify a transport error from `reqwest` against the URL it was
    /// sent to.
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            Self::Decode {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            Self::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_messages_carry_cause() {
        let err = TaskError::Run("disk full".into());
        assert_eq!(err.to_string(), "Failed to run task: disk full");

        let err = TaskError::Validation("'source' is missing".into());
        assert_eq!(
            err.to_string(),
            "Could not validate task data: 'source' is missing"
        );

        let err = TaskError::Initialization("no module registered under 'x'".into());
        assert_eq!(
            err.to_string(),
            "Could not initialize module: no module registered under 'x'"
        );
    }

    #[test]
    fn network_error_kinds_compare_across_occurrences() {
        let first = NetworkError::Timeout {
            url: "http://a/queue".into(),
        };
        let second = NetworkError::Timeout {
            url: "http://a/queue/poll".into(),
        };
        assert_eq!(first.kind(), second.kind());

        let other = NetworkError::Status {
            url: "http://a/queue".into(),
            status: 502,
        };
        assert_ne!(first.kind(), other.kind());
    }
}
