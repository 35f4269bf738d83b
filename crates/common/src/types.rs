//! Opaque platform identifiers.
//!
//! Platforms hand out identifiers in different shapes (Discord snowflakes are
//! `u64`, others use strings). The pipeline never does arithmetic on them, so
//! they are carried as strings and only compared, hashed and displayed.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id.to_string())
            }
        }
    };
}

opaque_id!(
    /// Identifier of a single platform message.
    MessageId
);

opaque_id!(
    /// Identifier of a message container (channel, thread, DM).
    ChannelId
);

opaque_id!(
    /// Identifier of a message author.
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_display_as_decimal() {
        assert_eq!(MessageId::from(1234u64).to_string(), "1234");
        assert_eq!(UserId::from(7u64).as_str(), "7");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ChannelId::new("general");
        assert_eq!(serde_json::to_string(&id).ok().as_deref(), Some("\"general\""));
    }
}
