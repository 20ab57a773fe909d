//! GitStash upload service.
//!
//! A single long-lived process that accepts multi-gigabyte byte streams
//! in independently retriable chunks, stages them on scratch disk, and
//! atomically materializes completed objects into a GitHub repository.

pub mod access;
pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod github;
pub mod materialize;
pub mod scratch;
pub mod session;
pub mod strategy;

use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use axum::http::header::{HeaderName, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::get;
use axum::Router;
use sea_orm_migration::MigratorTrait;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use config::Config;
use database::migration::Migrator;
use github::GitHubClient;
use scratch::ScratchStore;
use session::SessionService;

/// Shared server state handed to every handler.
#[derive(Clone)]
pub struct State(Arc<StateInner>);

pub struct StateInner {
    pub config: Arc<Config>,
    pub sessions: SessionService,
}

impl Deref for State {
    type Target = StateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl State {
    /// Connects the stores, runs migrations, and wires the services.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let db = database::connect(&config.database).await?;
        Migrator::up(&db, None).await?;

        let scratch = ScratchStore::new(config.scratch.root.clone());
        scratch.ensure_root().await?;

        let remote = Arc::new(GitHubClient::new(&config.github)?);
        let sessions = SessionService::new(config.clone(), db, scratch, remote);

        Ok(Self(Arc::new(StateInner { config, sessions })))
    }
}

/// Assembles the full router with tracing, timeout, and CORS layers.
pub fn make_router(state: State) -> Router {
    // The upstream proxy forwards browser requests, so the chunk headers
    // must survive preflight.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-chunk-index"),
            HeaderName::from_static("x-chunk-checksum"),
        ]);

    Router::new()
        .route("/healthz", get(api::healthz))
        .merge(api::v1::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(cors)
}

/// Builds the state and serves until the listener is torn down.
pub async fn run_server(config: Config) -> Result<()> {
    let state = State::new(config).await?;

    let listener = TcpListener::bind(state.config.listen).await?;
    info!("listening on {}", state.config.listen);
    axum::serve(listener, make_router(state)).await?;

    Ok(())
}
