use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),

    #[error("worker for chunk {chunk} failed: {reason}")]
    WorkerFailed { chunk: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_failure_message_names_the_chunk() {
        let err = EngineError::WorkerFailed {
            chunk: 3,
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "worker for chunk 3 failed: boom");
    }
}
