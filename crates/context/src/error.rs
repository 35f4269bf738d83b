use std::error::Error as StdError;

use tether_common::FromMessage;

/// Crate-wide result type for context assembly.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while fetching messages or linked resources.
///
/// None of these abort a resolution: the resolver turns them into chain
/// boundaries or absent content plus a warning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform reports no such message (deleted or never existed).
    #[error("message not found: {id}")]
    NotFound { id: String },

    /// The message or resource exists but may not be read.
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    #[error("{0}")]
    Message(String),

    /// Wrapped source error from the platform or HTTP client.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

tether_common::impl_context!();
