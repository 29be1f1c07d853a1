//! Error types and result aliases shared across weft components.

/// The result type used throughout weft-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the id invalid.
        message: String,
    },

    /// The id counter for an entity kind has no fresh ids left.
    ///
    /// Ids are never reused, so exhausting the counter is unrecoverable
    /// for the running server.
    #[error("id space exhausted for {kind}")]
    IdSpaceExhausted {
        /// The entity kind whose counter overflowed.
        kind: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "not a number".into(),
        };
        assert!(err.to_string().contains("invalid identifier"));
    }

    #[test]
    fn exhausted_display_names_kind() {
        let err = Error::IdSpaceExhausted { kind: "worker" };
        assert!(err.to_string().contains("worker"));
    }
}
