use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("invalid batch: contains no items")]
    EmptyBatch,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    /// Backpressure rejection: the cached heap snapshot is over the configured
    /// ceiling. The items never entered the buffer.
    #[error("heap allocation {usage_bytes} bytes exceeds configured limit {limit_bytes} bytes")]
    HeapAllocLimit { usage_bytes: u64, limit_bytes: u64 },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl ControllerError {
    /// True when the insert was rejected for memory pressure rather than a
    /// buffer fault. Producers drop and move on; retrying immediately will
    /// see the same cached snapshot.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ControllerError::HeapAllocLimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_limit_is_backpressure() {
        let err = ControllerError::HeapAllocLimit {
            usage_bytes: 200,
            limit_bytes: 100,
        };
        assert!(err.is_backpressure());
        assert!(!ControllerError::Buffer(BufferError::EmptyBatch).is_backpressure());
    }
}
