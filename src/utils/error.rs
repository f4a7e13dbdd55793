/// Utility enum that covers all possible errors raised by the controllers and their indices
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// The delay queue behind the batched queue triggers failed
    #[error("Trigger scheduling failed: {source}")]
    SchedulerError {
        #[from]
        source: kube_runtime::scheduler::Error,
    },

    #[error("Serialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    /// Object is missing a namespace where one is required.
    #[error("Expected {0} to be namespaced")]
    MissingNamespace(String),

    #[error("Queue {0} doesn't exist")]
    QueueNotFound(String),

    #[error("Queue {0} already exists")]
    QueueAlreadyExists(String),

    #[error("ClusterQueue {0} doesn't exist")]
    ClusterQueueNotFound(String),

    #[error("Workload {0} is not admitted")]
    WorkloadNotAdmitted(String),
}

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError {
                source: kube::Error::Api(response),
            } => Some(response.code),
            _ => None,
        }
    }

    /// The object is gone; callers stop quietly.
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Another writer got there first; the write should be retried against a
    /// fresh read.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }
}

/// Turns a not-found failure into success; nothing is left to do for an
/// object that is gone.
pub fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use kube::error::ErrorResponse;

    use super::{ignore_not_found, Error};

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_conflict());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::QueueNotFound("default/q1".to_string()).is_not_found());
    }

    #[test]
    fn only_not_found_is_ignored() {
        assert!(ignore_not_found(Err(api_error(404))).is_ok());
        assert!(ignore_not_found(Err(api_error(409))).is_err());
    }
}
