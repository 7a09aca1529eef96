//! Common identifier types used throughout the SFU

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a session (one call / room)
    SessionId
);

string_id!(
    /// Identifier of a peer's transport within a session
    TransportId
);

string_id!(
    /// Identifier of a media track. Simulcast layers of one track get
    /// distinct identifiers (`<track>:<rid>`).
    TrackId
);

string_id!(
    /// Identifier of a media stream (the `msid` grouping tracks of one source)
    StreamId
);

impl TransportId {
    /// Generate a fresh random transport identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

/// Unique identity of a sender, used to unsubscribe it from receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(Uuid);

impl SenderId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SenderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids() {
        let id = TrackId::from("video-1");
        assert_eq!(id.as_str(), "video-1");
        assert_eq!(id.to_string(), "video-1");
        assert_eq!(id, TrackId::new(String::from("video-1")));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TransportId::generate();
        let b = TransportId::generate();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
        assert_ne!(SenderId::new(), SenderId::new());
    }
}
