//! Aggregate counts over the registry, and the values the client forms offer.

use axum::extract::State;
use axum::Json;
use bigdecimal::BigDecimal;
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{read_error, ApiError};
use crate::model::Genre;
use crate::notes::round2;
use crate::schema::{notes, seminaristes};
use crate::STATS_TAG;

pub fn stats_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(global_stats))
        .routes(routes!(grade_stats))
        .routes(routes!(metadata))
}

#[derive(Serialize, ToSchema, Debug, Default, PartialEq)]
pub struct GenreCounts {
    pub hommes: i64,
    pub femmes: i64,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct GlobalStats {
    pub total_seminaristes: i64,
    pub par_genre: GenreCounts,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct GradeStats {
    pub total_seminaristes: i64,
    pub total_notes: i64,
    /// Mean of every recorded grade, two decimals; 0 without grades.
    #[schema(value_type = String)]
    pub moyenne_generale: BigDecimal,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct Metadata {
    pub niveaux_etude: Vec<String>,
}

/// Folds `(genre, count)` rows into per-gender totals.
pub fn genre_counts(rows: impl IntoIterator<Item = (String, i64)>) -> GenreCounts {
    rows.into_iter()
        .fold(GenreCounts::default(), |mut counts, (raw, n)| {
            match raw.parse::<Genre>() {
                Ok(Genre::Homme) => counts.hommes += n,
                Ok(Genre::Femme) => counts.femmes += n,
                Err(e) => tracing::warn!("skipping participants with {}", e),
            }
            counts
        })
}

pub fn overall_average(mean: Option<BigDecimal>) -> BigDecimal {
    round2(mean.unwrap_or_default())
}

/// Registry totals
#[utoipa::path(get, path = "/stats/global", responses((status = OK, body = GlobalStats)), tag = STATS_TAG, security(
    ("jwt" = [])
))]
async fn global_stats(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
) -> Result<Json<GlobalStats>, ApiError> {
    claims.require(&enforcer, "stats", "read")?;
    let mut conn = pool.get().await?;
    let total_seminaristes: i64 = seminaristes::table
        .count()
        .get_result(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    let by_genre: Vec<(String, i64)> = seminaristes::table
        .group_by(seminaristes::genre)
        .select((seminaristes::genre, diesel::dsl::count_star()))
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    Ok(Json(GlobalStats {
        total_seminaristes,
        par_genre: genre_counts(by_genre),
    }))
}

/// Grade totals
#[utoipa::path(get, path = "/stats/scientifiques", responses((status = OK, body = GradeStats)), tag = STATS_TAG, security(
    ("jwt" = [])
))]
async fn grade_stats(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
) -> Result<Json<GradeStats>, ApiError> {
    claims.require(&enforcer, "stats_scientifiques", "read")?;
    let mut conn = pool.get().await?;
    let total_seminaristes: i64 = seminaristes::table
        .count()
        .get_result(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    let total_notes: i64 = notes::table
        .count()
        .get_result(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    let mean: Option<BigDecimal> = notes::table
        .select(diesel::dsl::avg(notes::valeur))
        .get_result(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    Ok(Json(GradeStats {
        total_seminaristes,
        total_notes,
        moyenne_generale: overall_average(mean),
    }))
}

/// Study levels already on file
#[utoipa::path(get, path = "/metadata", responses((status = OK, body = Metadata)), tag = STATS_TAG, security(
    ("jwt" = [])
))]
async fn metadata(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
) -> Result<Json<Metadata>, ApiError> {
    claims.require(&enforcer, "metadata", "read")?;
    let mut conn = pool.get().await?;
    let levels: Vec<Option<String>> = seminaristes::table
        .select(seminaristes::niveau_etude)
        .filter(seminaristes::niveau_etude.is_not_null())
        .distinct()
        .order(seminaristes::niveau_etude.asc())
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    Ok(Json(Metadata {
        niveaux_etude: levels.into_iter().flatten().collect(),
    }))
}
