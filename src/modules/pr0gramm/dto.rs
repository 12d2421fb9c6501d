use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::modules::post::adapter::outgoing::sea_orm_entity::post::PostType;

/// Wire format of `GET /items/get`.
#[derive(Debug, Deserialize)]
pub struct ItemsResponse {
    #[serde(rename = "atStart")]
    pub at_start: bool,
    #[serde(default)]
    pub items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
pub struct Item {
    pub id: i64,
    pub created: i64,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub thumb: Option<String>,
    #[serde(default)]
    pub fullsize: Option<String>,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub flags: i32,
    #[serde(default)]
    pub user: String,
}

/// Wire format of `GET /tags/latest`.
#[derive(Debug, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub tags: Vec<TagItem>,
}

#[derive(Debug, Deserialize)]
pub struct TagItem {
    pub id: i64,
    #[serde(rename = "itemId")]
    pub item_id: i64,
    #[serde(default)]
    pub up: i32,
    #[serde(default)]
    pub down: i32,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub ban: Option<serde_json::Value>,
}

impl LoginResponse {
    /// The upstream sends `ban: null` for unbanned accounts and a ban object
    /// otherwise.
    pub fn is_banned(&self) -> bool {
        !matches!(self.ban, None | Some(serde_json::Value::Null))
    }
}

/// A post as seen on the upstream feed, before it is persisted locally.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamPost {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub image: String,
    pub thumb: Option<String>,
    pub fullsize: Option<String>,
    pub width: i32,
    pub height: i32,
    pub audio: bool,
    pub source: Option<String>,
    pub flags: i32,
    pub user: String,
    pub post_type: PostType,
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl From<Item> for UpstreamPost {
    fn from(item: Item) -> Self {
        let post_type = PostType::from_media_path(&item.image);
        UpstreamPost {
            id: item.id,
            created: DateTime::from_timestamp(item.created, 0).unwrap_or(DateTime::UNIX_EPOCH),
            image: item.image,
            thumb: none_if_empty(item.thumb),
            fullsize: none_if_empty(item.fullsize),
            width: item.width,
            height: item.height,
            audio: item.audio,
            source: none_if_empty(item.source),
            flags: item.flags,
            user: item.user,
            post_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTag {
    pub id: i64,
    pub post_id: i64,
    pub tag: String,
    pub up: i32,
    pub down: i32,
    pub confidence: f32,
}

impl From<TagItem> for UpstreamTag {
    fn from(item: TagItem) -> Self {
        UpstreamTag {
            id: item.id,
            post_id: item.item_id,
            tag: item.tag,
            up: item.up,
            down: item.down,
            confidence: item.confidence,
        }
    }
}
