use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

/// The two independent id namespaces avatars belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Space {
    User,
    Chat,
}

impl Space {
    pub fn as_str(&self) -> &'static str {
        match self {
            Space::User => "user",
            Space::Chat => "chat",
        }
    }

    /// The opposite identity space, used for cross-space reuse
    pub fn other(self) -> Space {
        match self {
            Space::User => Space::Chat,
            Space::Chat => Space::User,
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSpaceError(pub String);

impl fmt::Display for ParseSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown identity space: {}", self.0)
    }
}

impl std::error::Error for ParseSpaceError {}

impl FromStr for Space {
    type Err = ParseSpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Space::User),
            "chat" => Ok(Space::Chat),
            other => Err(ParseSpaceError(other.to_string())),
        }
    }
}

/// An entity id qualified by its identity space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub space: Space,
    pub id: String,
}

impl EntityKey {
    /// Build a key from an id that is already canonical
    pub fn new(space: Space, id: impl Into<String>) -> Self {
        Self {
            space,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(Space::User, id)
    }

    pub fn chat(id: impl Into<String>) -> Self {
        Self::new(Space::Chat, id)
    }

    /// Build a key from a raw id as it arrives from callers.
    ///
    /// Trims whitespace and canonicalises numeric ids so `"0042"` and `"42"`
    /// share one cache slot. Empty ids and the numeric id zero are rejected.
    pub fn parse(space: Space, raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let id = match trimmed.parse::<i64>() {
            Ok(0) => return None,
            Ok(n) => n.to_string(),
            Err(_) => trimmed.to_string(),
        };

        Some(Self { space, id })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.id)
    }
}
