pub mod auth;
pub mod config;
pub mod consultations;
mod error;
pub mod health;
mod model;
pub mod notes;
pub mod receipts;
mod schema;
pub mod seminaristes;
pub mod stats;
pub mod users;
pub mod validate;


use std::net::Ipv4Addr;
use std::sync::Arc;

use auth::{Keys, SecurityAddon};
use axum::Router;
use casbin::{CoreApi, Enforcer};
use crate::config::Settings;
use diesel::{pg::Pg, Connection, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

const AUTH_TAG: &str = "auth";
const USERS_TAG: &str = "users";
const SEMINARISTES_TAG: &str = "seminaristes";
const NOTES_TAG: &str = "notes";
const CONSULTATIONS_TAG: &str = "consultations";
const RECEIPTS_TAG: &str = "receipts";
const STATS_TAG: &str = "stats";
const HEALTH_TAG: &str = "health";

pub type Pool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct State {
    pool: Pool,
    enforcer: Arc<Enforcer>,
    keys: Arc<Keys>,
    settings: Arc<Settings>,
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    tags(
        (name = AUTH_TAG, description = "Login endpoints"),
        (name = USERS_TAG, description = "Staff account endpoints"),
        (name = SEMINARISTES_TAG, description = "Participant registry endpoints"),
        (name = NOTES_TAG, description = "Grades and report card endpoints"),
        (name = CONSULTATIONS_TAG, description = "Medical consultation endpoints"),
        (name = RECEIPTS_TAG, description = "Payment receipt endpoints"),
        (name = STATS_TAG, description = "Registry statistics endpoints"),
        (name = HEALTH_TAG, description = "Service status endpoints")
    )
)]
struct ApiDoc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn run_migrations(
    connection: &mut impl MigrationHarness<Pg>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    connection.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}

/// Builds the HTTP application: versioned API, health checks, media files
/// and the Swagger UI.
fn app(state: State) -> Router {
    let settings = state.settings.clone();
    let mut doc = ApiDoc::openapi();
    doc.info.title = settings.project_name.clone();

    let api = OpenApiRouter::new()
        .merge(users::auth_router())
        .merge(users::user_router())
        .merge(seminaristes::seminariste_router())
        .merge(notes::note_router())
        .merge(consultations::consultation_router())
        .merge(receipts::receipt_router())
        .merge(stats::stats_router());

    let (router, api) = OpenApiRouter::with_openapi(doc)
        .merge(health::health_router())
        .nest(&settings.api_prefix, api)
        .with_state(state)
        .split_for_parts();

    router
        .merge(SwaggerUi::new("/swagger-ui").url("/apidoc/openapi.json", api))
        .nest_service("/media", ServeDir::new(&settings.media_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_filter(filter),
        )
        .init();

    let settings = Settings::from_env()?;

    let mut migration_connection = PgConnection::establish(&settings.database_url)?;
    run_migrations(&mut migration_connection)?;
    drop(migration_connection);

    tokio::fs::create_dir_all(settings.media_dir.join("receipts")).await?;

    // set up connection pool
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&settings.database_url);
    let pool = bb8::Pool::builder().build(config).await?;

    if let Some(seed) = &settings.admin {
        users::seed_admin(&pool, seed).await?;
    }

    // casbin adapters want 'static paths
    let acl_model: &'static str = settings.acl_model.clone().leak();
    let acl_policy: &'static str = settings.acl_policy.clone().leak();
    let enforcer = Enforcer::new(acl_model, acl_policy)
        .await
        .map_err(|e| format!("cannot load access policy: {e}"))?;

    let port = settings.port;
    let router = app(State {
        pool,
        enforcer: Arc::new(enforcer),
        keys: Arc::new(Keys::new(&settings.secret_key)),
        settings: Arc::new(settings),
    });

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!("Listening on 0.0.0.0:{}", port);
    Ok(axum::serve(listener, router).await?)
}
