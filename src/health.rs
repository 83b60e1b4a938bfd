use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::error::ApiError;
use crate::{Pool, HEALTH_TAG};

pub fn health_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .routes(routes!(root))
}

#[derive(Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ServiceInfo {
    pub message: String,
    pub version: String,
}

async fn ping(pool: &Pool) -> Result<(), ApiError> {
    let mut conn = pool.get().await?;
    diesel::sql_query("SELECT 1")
        .execute(&mut conn)
        .await
        .map_err(|_| ApiError::DBConnection)?;
    Ok(())
}

/// Liveness check used by the deployment platform
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = OK, body = HealthStatus),
        (status = SERVICE_UNAVAILABLE, body = HealthStatus)
    ),
    tag = HEALTH_TAG
)]
async fn health(
    State(crate::State { pool, .. }): State<crate::State>,
) -> (StatusCode, Json<HealthStatus>) {
    match ping(&pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "healthy".to_string(),
                database: Some("PostgreSQL".to_string()),
            }),
        ),
        Err(e) => {
            tracing::warn!("health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unhealthy".to_string(),
                    database: None,
                }),
            )
        }
    }
}

/// Service name and version
#[utoipa::path(get, path = "/", responses((status = OK, body = ServiceInfo)), tag = HEALTH_TAG)]
async fn root(State(crate::State { settings, .. }): State<crate::State>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: settings.project_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
