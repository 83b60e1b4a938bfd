use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{delete_error, read_error, violates, write_error, ApiError};
use crate::model::{
    Consultation, ConsultationChanges, EntityId, NewConsultation, OptionalMatricule,
};
use crate::schema::consultations::dsl::*;
use crate::validate::ValidatedForm;
use crate::CONSULTATIONS_TAG;

const RESOURCE: &str = "consultations";
const PHYSICIAN_FK: &str = "fk_consultations_medecin";

/// expose the medical OpenAPI to parent module
pub fn consultation_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(
            get_consultation,
            create_consultation,
            delete_consultation,
            update_consultation
        ))
        .routes(routes!(list_consultations))
}

/// Get consultation
#[utoipa::path(get, path = "/consultations", responses((status = OK, body = Consultation)), tag = CONSULTATIONS_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "Consultation database id"),
)
)]
async fn get_consultation(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: consultation_id }): Query<EntityId>,
) -> Result<Json<Consultation>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let found = consultations
        .find(consultation_id)
        .select(Consultation::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::ConsultationNotFound))?;
    Ok(Json(found))
}

/// List consultations
#[utoipa::path(get, path = "/consultations/list", responses((status = OK, body = Vec<Consultation>)), tag = CONSULTATIONS_TAG, security(
    ("jwt" = [])
),
params(
    ("matricule" = Option<String>, Query, description = "Only visits of this participant"),
)
)]
async fn list_consultations(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(OptionalMatricule { matricule: code }): Query<OptionalMatricule>,
) -> Result<Json<Vec<Consultation>>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let mut query = consultations
        .select(Consultation::as_select())
        .into_boxed();
    if let Some(code) = code {
        query = query.filter(matricule.eq(code));
    }
    let found = query
        .order((date_consultation.desc(), id.desc()))
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    Ok(Json(found))
}

/// Delete consultation
#[utoipa::path(delete, path = "/consultations", responses((status = OK, body = ())), tag = CONSULTATIONS_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "Consultation database id"),
)
)]
async fn delete_consultation(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: consultation_id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.require(&enforcer, RESOURCE, "delete")?;
    let mut conn = pool.get().await?;
    let deleted = diesel::delete(consultations.find(consultation_id))
        .execute(&mut conn)
        .await
        .map_err(|e| delete_error(e, "Consultation is still referenced"))?;
    if deleted == 0 {
        Err(ApiError::ConsultationNotFound)
    } else {
        tracing::info!("{} deleted consultation {}", claims.username, consultation_id);
        Ok(())
    }
}

/// Update consultation
#[utoipa::path(put, path = "/consultations", responses((status = OK, body = Consultation)), tag = CONSULTATIONS_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "Consultation database id"),
)
)]
async fn update_consultation(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: consultation_id }): Query<EntityId>,
    Json(changes): Json<ConsultationChanges>,
) -> Result<Json<Consultation>, ApiError> {
    claims.require(&enforcer, RESOURCE, "update")?;
    if changes.is_empty() {
        return Err(ApiError::BadRequest("Nothing to update".to_string()));
    }
    let mut conn = pool.get().await?;
    let updated = diesel::update(consultations.find(consultation_id))
        .set(&changes)
        .returning(Consultation::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::ConsultationNotFound))?;
    Ok(Json(updated))
}

/// Record consultation
///
/// The attending physician is the authenticated account.
#[utoipa::path(post, path = "/consultations", responses((status = CREATED, body = Consultation), (status = NOT_FOUND)), tag = CONSULTATIONS_TAG, security(
    ("jwt" = [])
))]
async fn create_consultation(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Json(ValidatedForm(visit)): Json<ValidatedForm<NewConsultation>>,
) -> Result<(StatusCode, Json<Consultation>), ApiError> {
    claims.require(&enforcer, RESOURCE, "create")?;
    let record = visit.attended_by(claims.user_id()?);
    let mut conn = pool.get().await?;
    let created = insert_into(consultations)
        .values(&record)
        .returning(Consultation::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| {
            if violates(&e, PHYSICIAN_FK) {
                // account removed while its token is still valid
                tracing::warn!("consultation by deleted account {}", claims.username);
                ApiError::InvalidToken
            } else {
                write_error(e, ApiError::SeminaristeNotFound)
            }
        })?;
    tracing::info!(
        "{} recorded consultation {} for {}",
        claims.username,
        created.id,
        created.matricule
    );
    Ok((StatusCode::CREATED, Json(created)))
}
