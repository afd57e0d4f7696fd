//! Entity metadata as delivered by the messaging platform.
//!
//! The three entity shapes carry their photo under different structures.
//! Callers never inspect those directly: [`ProfilePhotoSource`] is the single
//! accessor that turns any entity into its content version (or nothing).

use avatar_protocol::{EntityKey, Space};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Extracts the content-version identifier of an entity's current profile photo.
///
/// Pure: no I/O, never fails. A missing or malformed photo yields `None`.
pub trait ProfilePhotoSource {
    fn profile_photo_version(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entity {
    User(UserEntity),
    Chat(ChatEntity),
    Channel(ChannelEntity),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::User(u) => &u.id,
            Entity::Chat(c) => &c.id,
            Entity::Channel(c) => &c.id,
        }
    }

    /// Users live in the user space; chats and channels share the chat space
    pub fn space(&self) -> Space {
        match self {
            Entity::User(_) => Space::User,
            Entity::Chat(_) | Entity::Channel(_) => Space::Chat,
        }
    }

    /// Canonical cache key; `None` for ids no key can be built from
    pub fn key(&self) -> Option<EntityKey> {
        EntityKey::parse(self.space(), self.id())
    }

    pub fn display_name(&self) -> Option<String> {
        match self {
            Entity::User(u) => match (&u.first_name, &u.last_name) {
                (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
                (Some(first), None) => Some(first.clone()),
                (None, Some(last)) => Some(last.clone()),
                (None, None) => u.username.clone(),
            },
            Entity::Chat(c) => c.title.clone(),
            Entity::Channel(c) => c.title.clone(),
        }
    }
}

impl ProfilePhotoSource for Entity {
    fn profile_photo_version(&self) -> Option<&str> {
        match self {
            Entity::User(u) => u.profile_photo_version(),
            Entity::Chat(c) => c.profile_photo_version(),
            Entity::Channel(c) => c.profile_photo_version(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub photo: Option<UserProfilePhoto>,
}

impl UserEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_photo(mut self, photo_id: impl Into<String>) -> Self {
        self.photo = Some(UserProfilePhoto {
            photo_id: photo_id.into(),
            dc_id: None,
            has_video: false,
        });
        self
    }
}

impl ProfilePhotoSource for UserEntity {
    fn profile_photo_version(&self) -> Option<&str> {
        self.photo.as_ref().and_then(|p| non_empty(&p.photo_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfilePhoto {
    #[serde(deserialize_with = "id_string")]
    pub photo_id: String,
    #[serde(default)]
    pub dc_id: Option<i32>,
    #[serde(default)]
    pub has_video: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntity {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub photo: Option<ChatPhoto>,
}

impl ChatEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_photo(mut self, photo_id: impl Into<String>) -> Self {
        self.photo = Some(ChatPhoto::new(photo_id));
        self
    }
}

impl ProfilePhotoSource for ChatEntity {
    fn profile_photo_version(&self) -> Option<&str> {
        self.photo.as_ref().and_then(|p| non_empty(&p.photo_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntity {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub photo: Option<ChatPhoto>,
}

impl ChannelEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_photo(mut self, photo_id: impl Into<String>) -> Self {
        self.photo = Some(ChatPhoto::new(photo_id));
        self
    }
}

impl ProfilePhotoSource for ChannelEntity {
    fn profile_photo_version(&self) -> Option<&str> {
        self.photo.as_ref().and_then(|p| non_empty(&p.photo_id))
    }
}

/// Photo attached to a chat or channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPhoto {
    #[serde(deserialize_with = "id_string")]
    pub photo_id: String,
    #[serde(default)]
    pub dc_id: Option<i32>,
}

impl ChatPhoto {
    pub fn new(photo_id: impl Into<String>) -> Self {
        Self {
            photo_id: photo_id.into(),
            dc_id: None,
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "0" {
        None
    } else {
        Some(trimmed)
    }
}

/// Platform ids arrive as either JSON strings or 64-bit integers
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        UInt(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => s,
        RawId::Int(n) => n.to_string(),
        RawId::UInt(n) => n.to_string(),
    })
}

/// Malformed photo structures become `None` instead of failing the entity
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_photo_version() {
        let entity = Entity::User(UserEntity::new("42").with_photo("5001"));
        assert_eq!(entity.profile_photo_version(), Some("5001"));
        assert_eq!(entity.space(), Space::User);
        assert_eq!(entity.key(), Some(EntityKey::user("42")));
    }

    #[test]
    fn test_key_is_canonical() {
        let padded = Entity::User(UserEntity::new(" 0042 "));
        assert_eq!(padded.key(), Some(EntityKey::user("42")));

        assert_eq!(Entity::User(UserEntity::new("0")).key(), None);
        assert_eq!(Entity::Chat(ChatEntity::new("")).key(), None);
    }

    #[test]
    fn test_channel_maps_to_chat_space() {
        let entity = Entity::Channel(ChannelEntity::new("-1001").with_photo("77"));
        assert_eq!(entity.space(), Space::Chat);
        assert_eq!(entity.profile_photo_version(), Some("77"));
    }

    #[test]
    fn test_missing_photo_is_absent() {
        let entity = Entity::Chat(ChatEntity::new("9"));
        assert_eq!(entity.profile_photo_version(), None);
    }

    #[test]
    fn test_empty_photo_id_is_absent() {
        let entity = Entity::User(UserEntity::new("1").with_photo(""));
        assert_eq!(entity.profile_photo_version(), None);

        let entity = Entity::User(UserEntity::new("1").with_photo("0"));
        assert_eq!(entity.profile_photo_version(), None);
    }

    #[test]
    fn test_deserialize_numeric_ids() {
        let json = r#"{"type":"user","id":42,"firstName":"Ada","photo":{"photoId":5001,"dcId":2}}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.id(), "42");
        assert_eq!(entity.profile_photo_version(), Some("5001"));
        assert_eq!(entity.display_name().as_deref(), Some("Ada"));
    }

    #[test]
    fn test_malformed_photo_yields_absent_not_error() {
        let json = r#"{"type":"chat","id":"7","title":"Ops","photo":{"unexpected":true}}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.profile_photo_version(), None);
        assert_eq!(entity.display_name().as_deref(), Some("Ops"));

        let json = r#"{"type":"channel","id":"8","photo":"photoEmpty"}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.profile_photo_version(), None);
    }

    #[test]
    fn test_null_photo() {
        let json = r#"{"type":"user","id":"3","photo":null}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.profile_photo_version(), None);
    }
}
