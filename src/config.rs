use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context};

use crate::modules::post::adapter::outgoing::sea_orm_entity::post::PostType;

/// Runtime environment. Controls log format and template caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn from_env() -> anyhow::Result<Self> {
        match env::var("ENVIRONMENT").as_deref() {
            Ok("PRODUCTION") | Ok("production") => Ok(Environment::Production),
            Ok("DEVELOPMENT") | Ok("development") | Err(_) => Ok(Environment::Development),
            Ok(other) => bail!("unknown ENVIRONMENT value: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pr0grammApiConfig {
    pub user: String,
    pub password: String,
    pub baseurl_api: String,
    pub baseurl_img: String,
    pub baseurl_vid: String,
    pub baseurl_full: String,
    /// If set, the client pretends posts at or above this id do not exist.
    /// Used to build a small corpus locally.
    pub limit_id_to: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct JobSchedules {
    pub update_posts: String,
    pub update_features: String,
    pub update_all_posts: String,
    pub update_tags: String,
}

#[derive(Debug, Clone)]
pub struct WebserverConfig {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_uri: String,
    pub media_path: PathBuf,
    pub api: Pr0grammApiConfig,
    pub schedules: JobSchedules,
    pub update_features_post_type: PostType,
    pub webserver: Option<WebserverConfig>,
    pub environment: Environment,
}

/// Reads a config value that may either be given directly or via a
/// `<NAME>_FILE` variable pointing to a file holding the value.
fn secret(name: &str) -> anyhow::Result<String> {
    if let Ok(path) = env::var(format!("{name}_FILE")) {
        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {name}_FILE from {path}"))?;
        return Ok(value.trim_end_matches(['\r', '\n']).to_string());
    }
    env::var(name).with_context(|| format!("{name} or {name}_FILE must be set"))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn with_default(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let database_uri = {
            let uri = env::var("REP0ST_DATABASE_URI").context("REP0ST_DATABASE_URI is not set")?;
            match optional("REP0ST_DATABASE_PASSWORD_FILE") {
                None => uri,
                Some(path) => {
                    let password = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading database password from {path}"))?;
                    let mut url = url::Url::parse(&uri).context("REP0ST_DATABASE_URI is not a valid URL")?;
                    url.set_password(Some(password.trim_end_matches(['\r', '\n'])))
                        .ok()
                        .context("REP0ST_DATABASE_URI does not accept a password")?;
                    url.to_string()
                }
            }
        };

        let media_path = PathBuf::from(
            env::var("REP0ST_MEDIA_PATH").context("REP0ST_MEDIA_PATH is not set")?,
        );
        if !media_path.is_dir() {
            bail!(
                "REP0ST_MEDIA_PATH has to be set to an existing directory, got {}",
                media_path.display()
            );
        }

        let api = Pr0grammApiConfig {
            user: secret("PR0GRAMM_API_USER")?,
            password: secret("PR0GRAMM_API_PASSWORD")?,
            baseurl_api: with_default("PR0GRAMM_API_BASEURL_API", "https://pr0gramm.com/api"),
            baseurl_img: with_default("PR0GRAMM_API_BASEURL_IMG", "https://img.pr0gramm.com"),
            baseurl_vid: with_default("PR0GRAMM_API_BASEURL_VID", "https://vid.pr0gramm.com"),
            baseurl_full: with_default("PR0GRAMM_API_BASEURL_FULL", "https://full.pr0gramm.com"),
            limit_id_to: optional("PR0GRAMM_API_LIMIT_ID_TO")
                .map(|v| v.parse().context("PR0GRAMM_API_LIMIT_ID_TO must be an integer"))
                .transpose()?,
        };

        let schedules = JobSchedules {
            update_posts: optional("REP0ST_UPDATE_POSTS_JOB_SCHEDULE").unwrap_or_default(),
            update_features: optional("REP0ST_UPDATE_FEATURES_JOB_SCHEDULE").unwrap_or_default(),
            update_all_posts: optional("REP0ST_UPDATE_ALL_POSTS_JOB_SCHEDULE").unwrap_or_default(),
            update_tags: optional("REP0ST_UPDATE_TAGS_JOB_SCHEDULE").unwrap_or_default(),
        };

        let update_features_post_type = optional("REP0ST_UPDATE_FEATURES_POST_TYPE")
            .map(|v| v.parse())
            .transpose()
            .map_err(|e: String| anyhow::anyhow!(e))?
            .unwrap_or(PostType::Image);

        let webserver = match (optional("WEBSERVER_BIND_HOSTNAME"), optional("WEBSERVER_BIND_PORT")) {
            (Some(hostname), Some(port)) => Some(WebserverConfig {
                hostname,
                port: port.parse().context("WEBSERVER_BIND_PORT must be a port number")?,
            }),
            (None, None) => None,
            _ => bail!("WEBSERVER_BIND_HOSTNAME and WEBSERVER_BIND_PORT must be set together"),
        };

        Ok(Config {
            database_uri,
            media_path,
            api,
            schedules,
            update_features_post_type,
            webserver,
            environment: Environment::from_env()?,
        })
    }
}
