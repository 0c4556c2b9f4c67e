use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use harvester::challenge::ChallengeHandler;
use harvester::challenge::behavior::RandomizedBehavior;
use harvester::config::{Command, Config};
use harvester::db;
use harvester::extractors::Registry;
use harvester::models::ProxyEndpoint;
use harvester::pipeline::Pipeline;
use harvester::proxy_pool::{HttpProber, ProxyPool};
use harvester::routes::api::{self, AppState};
use harvester::scheduler::Scheduler;
use harvester::session::http::HttpBrowser;
use harvester::session::webdriver::WebDriverBrowser;
use harvester::session::{Browser, SessionProvider};
use harvester::store::{JobStore, MemoryStore, PgStore, ProxyStore};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Stores {
    jobs: Arc<dyn JobStore>,
    proxies: Arc<dyn ProxyStore>,
    db: Option<PgPool>,
}

async fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, jobs and proxies are kept in memory only");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            jobs: store.clone(),
            proxies: store,
            db: None,
        });
    };

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(url).await?;

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;
        tracing::info!("Migrations complete");
    }

    let store = Arc::new(PgStore::new(pool.clone()));
    Ok(Stores {
        jobs: store.clone(),
        proxies: store,
        db: Some(pool),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn serve(
    config: &Config,
    listen_addr: &str,
    stores: Stores,
    proxies: Arc<ProxyPool>,
) -> anyhow::Result<()> {
    let browser: Arc<dyn Browser> = match &config.webdriver_url {
        Some(url) => {
            tracing::info!("Using WebDriver sessions at {url}");
            let browser = WebDriverBrowser::new(url.clone());
            if config.webdriver_headed {
                Arc::new(browser.headed())
            } else {
                Arc::new(browser)
            }
        }
        None => {
            tracing::info!("WEBDRIVER_URL not set, using plain HTTP sessions");
            Arc::new(HttpBrowser::new())
        }
    };

    let registry = Arc::new(Registry::builtin());
    let sites = registry.sites().join(", ");
    let sessions = Arc::new(
        SessionProvider::new(browser, Some(proxies.clone())).with_strategy(config.proxy_strategy),
    );
    let challenges = Arc::new(ChallengeHandler::new(
        config.bypass_config(),
        Arc::new(RandomizedBehavior::default()),
    ));
    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        sessions,
        challenges,
        config.pipeline_config(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        stores.jobs.clone(),
        pipeline,
        config.max_concurrent_jobs,
        config.backpressure,
    ));

    scheduler.recover().await?;

    let app = api::router(AppState {
        job_store: stores.jobs,
        scheduler: scheduler.clone(),
        proxies,
        registry,
        db: stores.db,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(
        "Listening on {listen_addr} (sites: {sites}, max concurrent jobs: {})",
        scheduler.width()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let cancelled = scheduler.cancel_all();
    if cancelled > 0 {
        tracing::info!("Cancelled {cancelled} active jobs");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while scheduler.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("harvester=info,tower_http=info")),
        )
        .init();

    let config = Config::parse();
    let stores = open_stores(&config).await?;
    let proxies = Arc::new(ProxyPool::new(
        stores.proxies.clone(),
        Arc::new(HttpProber::new(config.proxy_probe_url.clone())),
    ));

    match config.resolved_command() {
        Command::Serve { listen_addr } => serve(&config, &listen_addr, stores, proxies).await?,
        Command::CheckProxies => {
            let healthy = proxies.health_check_all().await?;
            println!("{healthy} healthy proxies");
        }
        Command::ImportProxies { file, verify } => {
            let text = tokio::fs::read_to_string(&file).await?;
            let endpoints: Vec<ProxyEndpoint> =
                text.lines().filter_map(ProxyEndpoint::parse).collect();
            let stored = if verify {
                proxies.discover(&endpoints).await?
            } else {
                proxies.import(&endpoints).await?
            };
            println!(
                "Stored {} of {} proxies from {}",
                stored.len(),
                endpoints.len(),
                file.display()
            );
        }
    }

    Ok(())
}
