use serde::Serialize;

use crate::modules::post::adapter::outgoing::sea_orm_entity::post;

/// Content flag of a post. Stored on the post row as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Sfw,
    Nsfw,
    Nsfl,
    Nsfp,
    Pol,
}

impl Flag {
    fn bit(self) -> i32 {
        match self {
            Flag::Sfw => 1,
            Flag::Nsfw => 2,
            Flag::Nsfl => 4,
            Flag::Nsfp => 8,
            Flag::Pol => 16,
        }
    }
}

impl std::str::FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sfw" => Ok(Flag::Sfw),
            "nsfw" => Ok(Flag::Nsfw),
            "nsfl" => Ok(Flag::Nsfl),
            "nsfp" => Ok(Flag::Nsfp),
            "pol" => Ok(Flag::Pol),
            other => Err(format!("unknown flag: {other}")),
        }
    }
}

pub fn flags_to_flagbits(flags: &[Flag]) -> i32 {
    flags.iter().fold(0, |bits, flag| bits | flag.bit())
}

pub fn flagbits_to_flags(bits: i32) -> Vec<Flag> {
    [Flag::Sfw, Flag::Nsfw, Flag::Nsfl, Flag::Nsfp, Flag::Pol]
        .into_iter()
        .filter(|flag| bits & flag.bit() != 0)
        .collect()
}

/// Public representation of a post, as returned by the search API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostInfo {
    pub id: i64,
    pub user: String,
    pub created: String,
    pub is_sfw: bool,
    pub is_nsfw: bool,
    pub is_nsfl: bool,
    pub is_nsfp: bool,
    pub is_pol: bool,
    pub image: String,
    pub thumb: Option<String>,
    pub fullsize: Option<String>,
}

impl From<post::Model> for PostInfo {
    fn from(model: post::Model) -> Self {
        let flags = flagbits_to_flags(model.flags);
        let has = |flag: Flag| flags.contains(&flag);
        PostInfo {
            id: model.id,
            user: model.username,
            created: model.created.to_rfc3339(),
            is_sfw: has(Flag::Sfw),
            is_nsfw: has(Flag::Nsfw),
            is_nsfl: has(Flag::Nsfl),
            is_nsfp: has(Flag::Nsfp),
            is_pol: has(Flag::Pol),
            image: model.image,
            thumb: model.thumb,
            fullsize: model.fullsize,
        }
    }
}
