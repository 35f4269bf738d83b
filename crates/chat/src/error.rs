use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The platform rejected a send or edit; the generation was aborted.
    #[error(transparent)]
    Channel(#[from] tether_channels::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl tether_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
