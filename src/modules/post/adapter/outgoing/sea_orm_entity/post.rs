use sea_orm::entity::prelude::*;

/// Kind of media attached to a post, derived from the media path extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "post_type")]
pub enum PostType {
    /// Static images. (jpg, jpeg, png)
    #[sea_orm(string_value = "image")]
    Image,

    /// Animated images. (gif)
    #[sea_orm(string_value = "animated")]
    Animated,

    /// Videos. (mp4, webm)
    #[sea_orm(string_value = "video")]
    Video,

    #[sea_orm(string_value = "unknown")]
    Unknown,
}

impl PostType {
    pub fn from_media_path(path: &str) -> PostType {
        let ending = match path.rsplit_once('.') {
            Some((_, ending)) => ending.to_ascii_lowercase(),
            None => String::new(),
        };
        match ending.as_str() {
            "jpg" | "jpeg" | "png" => PostType::Image,
            "gif" => PostType::Animated,
            "mp4" | "webm" => PostType::Video,
            _ => {
                tracing::error!(path, ending, "could not deduce post type from media path");
                PostType::Unknown
            }
        }
    }
}

impl std::str::FromStr for PostType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(PostType::Image),
            "animated" => Ok(PostType::Animated),
            "video" => Ok(PostType::Video),
            "unknown" => Ok(PostType::Unknown),
            other => Err(format!("unknown post type: {other}")),
        }
    }
}

/// Error state recorded on a post when its media cannot be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "post_error_status")]
pub enum PostErrorStatus {
    /// No media was found on pr0gramm servers.
    #[sea_orm(string_value = "no_media_found")]
    NoMediaFound,

    /// The downloaded media cannot be read.
    #[sea_orm(string_value = "media_broken")]
    MediaBroken,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "post")]
pub struct Model {
    /// Post id, assigned upstream. Never auto-incremented locally.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,

    /// Timestamp this post was created upstream.
    pub created: DateTimeUtc,

    /// Path of the media on pr0gramm servers.
    pub image: String,
    /// Path of the thumbnail on pr0gramm servers.
    pub thumb: Option<String>,
    /// Path of the fullsize image on pr0gramm servers.
    pub fullsize: Option<String>,

    pub width: i32,
    pub height: i32,
    pub audio: bool,

    /// URL of the source of the image, as reported upstream.
    pub source: Option<String>,

    /// Flag bitset. Bit 0: SFW, bit 1: NSFW, bit 2: NSFL, bit 3: NSFP,
    /// bit 4: POL.
    pub flags: i32,

    /// Name of the user that uploaded the post.
    pub username: String,

    pub post_type: PostType,

    pub error_status: Option<PostErrorStatus>,

    /// True if the post is deleted on pr0gramm.
    pub deleted: bool,

    /// True if feature vectors exist for this post and are current.
    pub features_indexed: bool,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    FeatureVectors,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::FeatureVectors => Entity::has_many(super::feature_vector::Entity).into(),
        }
    }
}

impl Related<super::feature_vector::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FeatureVectors.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_type_from_media_path() {
        assert_eq!(PostType::from_media_path("2024/01/cat.jpg"), PostType::Image);
        assert_eq!(PostType::from_media_path("a.JPEG"), PostType::Image);
        assert_eq!(PostType::from_media_path("b.png"), PostType::Image);
        assert_eq!(PostType::from_media_path("c.gif"), PostType::Animated);
        assert_eq!(PostType::from_media_path("d.mp4"), PostType::Video);
        assert_eq!(PostType::from_media_path("e.webm"), PostType::Video);
        assert_eq!(PostType::from_media_path("f.tiff"), PostType::Unknown);
        assert_eq!(PostType::from_media_path("no-extension"), PostType::Unknown);
    }
}
