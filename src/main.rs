pub mod config;
pub mod health;
pub mod modules;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use crate::config::{Config, Environment};
use crate::modules::feature::application::feature_service::FeatureService;
use crate::modules::media::store::MediaStore;
use crate::modules::post::application::ports::outgoing::post_repository::PostRepository;
use crate::modules::post::adapter::outgoing::post_repository_postgres::PostRepositoryPostgres;
use crate::modules::post::application::services::post_service::PostService;
use crate::modules::pr0gramm::api::{Pr0grammApi, Pr0grammApiClient};
use crate::modules::scheduler::{Scheduler, JOB_SHUTDOWN_TIMEOUT};
use crate::modules::search::application::post_search_service::{PostSearchService, SearchPosts};
use crate::modules::tag::adapter::outgoing::tag_repository_postgres::TagRepositoryPostgres;
use crate::modules::tag::application::ports::outgoing::tag_repository::TagRepository;
use crate::modules::tag::application::services::tag_service::TagService;

// Logging
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
mod tests;

pub const COMMIT_SHA: &str = match option_env!("GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

#[derive(Clone)]
pub struct AppState {
    pub search_posts_use_case: Arc<dyn SearchPosts>,
    pub post_repository: Arc<dyn PostRepository>,
    /// Client used to fetch query images given by URL.
    pub http: reqwest::Client,
}

fn init_tracing(environment: Environment) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,actix_web=info".into());
    match environment {
        Environment::Production => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        Environment::Development => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
        _ = quit.recv() => info!("received SIGQUIT"),
    }
    Ok(())
}

#[actix_web::main]
#[cfg(not(tarpaulin_include))]
async fn start() -> anyhow::Result<()> {
    // get env vars
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(config.environment);
    info!(git_sha = COMMIT_SHA, "starting rep0st");

    // 1) establish connection to database
    let mut opt = ConnectOptions::new(config.database_uri.clone());
    opt
        // Core pool sizing
        .max_connections(50)
        .min_connections(10)
        // Timeouts (fail fast instead of piling up)
        .connect_timeout(Duration::from_secs(5))
        .acquire_timeout(Duration::from_secs(5))
        // Hygiene
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        // Noise reduction
        .sqlx_logging(false);
    let conn = Database::connect(opt).await?;
    let db: Arc<DatabaseConnection> = Arc::new(conn);

    // 2) upstream client, media store and repositories
    let api: Arc<dyn Pr0grammApiClient> = Arc::new(Pr0grammApi::new(config.api.clone())?);
    let media = Arc::new(MediaStore::new(config.media_path.clone(), api.clone()));
    let post_repository: Arc<dyn PostRepository> =
        Arc::new(PostRepositoryPostgres::new(Arc::clone(&db)));
    let tag_repository: Arc<dyn TagRepository> =
        Arc::new(TagRepositoryPostgres::new(Arc::clone(&db)));

    // 3) services
    let post_service = Arc::new(PostService::new(
        api.clone(),
        media.clone(),
        post_repository.clone(),
    ));
    let feature_service = Arc::new(FeatureService::new(post_repository.clone(), media.clone()));
    let tag_service = Arc::new(TagService::new(api.clone(), tag_repository.clone()));
    let search_service: Arc<dyn SearchPosts> =
        Arc::new(PostSearchService::new(post_repository.clone()));

    // 4) jobs
    let scheduler = Arc::new(Scheduler::new());
    {
        let post_service = post_service.clone();
        scheduler
            .schedule(&config.schedules.update_posts, "update_posts", move |cancel| {
                let post_service = post_service.clone();
                Box::pin(async move {
                    post_service.update_posts(None, &cancel).await?;
                    Ok(())
                })
            })
            .await?;
    }
    {
        let post_service = post_service.clone();
        scheduler
            .schedule(
                &config.schedules.update_all_posts,
                "update_all_posts",
                move |cancel| {
                    let post_service = post_service.clone();
                    Box::pin(async move {
                        post_service.update_all_posts(None, None, &cancel).await?;
                        Ok(())
                    })
                },
            )
            .await?;
    }
    {
        let feature_service = feature_service.clone();
        let post_type = config.update_features_post_type;
        scheduler
            .schedule(
                &config.schedules.update_features,
                "update_features",
                move |cancel| {
                    let feature_service = feature_service.clone();
                    Box::pin(async move {
                        feature_service.update_features(post_type, &cancel).await?;
                        Ok(())
                    })
                },
            )
            .await?;
    }
    {
        let tag_service = tag_service.clone();
        scheduler
            .schedule(&config.schedules.update_tags, "update_tags", move |cancel| {
                let tag_service = tag_service.clone();
                Box::pin(async move {
                    tag_service.update_tags(&cancel).await?;
                    Ok(())
                })
            })
            .await?;
    }

    // 5) web server, if configured
    let server_handle = match &config.webserver {
        None => {
            info!("webserver disabled, running jobs only");
            None
        }
        Some(webserver) => {
            let state = AppState {
                search_posts_use_case: search_service,
                post_repository: post_repository.clone(),
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()?,
            };
            let db = Arc::clone(&db);
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .app_data(web::Data::new(Arc::clone(&db)))
                    .configure(init_routes)
            })
            .bind((webserver.hostname.as_str(), webserver.port))?
            .run();
            info!(
                hostname = %webserver.hostname,
                port = webserver.port,
                "webserver listening"
            );
            let handle = server.handle();
            tokio::spawn(server);
            Some(handle)
        }
    };

    // 6) run until a shutdown signal arrives
    wait_for_shutdown_signal().await?;

    // Hard-shutdown watchdog: the scheduler waits up to 60 seconds per job,
    // so give the graceful phase that long plus slack before forcing exit.
    std::thread::spawn(|| {
        std::thread::sleep(JOB_SHUTDOWN_TIMEOUT + Duration::from_secs(5));
        error!("hard shutdown watchdog fired, forcing exit");
        std::process::exit(0);
    });

    // Close order is the reverse of startup: scheduler first, then the web
    // server, then the pools on drop.
    scheduler.shutdown().await;
    if let Some(handle) = server_handle {
        handle.stop(true).await;
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(not(tarpaulin_include))]
fn init_routes(cfg: &mut web::ServiceConfig) {
    // Search API
    cfg.service(crate::modules::search::adapter::incoming::web::routes::api_index::api_index_handler);
    cfg.service(
        crate::modules::search::adapter::incoming::web::routes::search_upload::search_upload_handler,
    );
    cfg.service(
        crate::modules::search::adapter::incoming::web::routes::search_url::search_url_handler,
    );
    // Probes
    cfg.service(crate::health::health);
    cfg.service(crate::health::readiness);
}

#[cfg(not(tarpaulin_include))]
fn main() {
    if let Err(e) = start() {
        eprintln!("Error starting app: {e:#}");
        std::process::exit(1);
    }
}
