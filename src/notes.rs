use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use bigdecimal::{BigDecimal, RoundingMode};
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{delete_error, read_error, write_error, ApiError};
use crate::model::{
    Bulletin, EntityId, MatriculeParam, NewNote, Note, NoteChanges, OptionalMatricule, Seminariste,
};
use crate::schema::notes::{self, dsl::*};
use crate::schema::seminaristes;
use crate::validate::ValidatedForm;
use crate::NOTES_TAG;

const RESOURCE: &str = "notes";

/// expose the grades OpenAPI to parent module
pub fn note_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(get_note, create_note, delete_note, update_note))
        .routes(routes!(list_notes))
        .routes(routes!(bulletin))
}

pub fn round2(value: BigDecimal) -> BigDecimal {
    value.with_scale_round(2, RoundingMode::HalfUp)
}

/// Mean of the grades, two decimals. A participant without grades averages 0.
pub fn average(values: &[BigDecimal]) -> BigDecimal {
    if values.is_empty() {
        return round2(BigDecimal::from(0));
    }
    let sum: BigDecimal = values.iter().sum();
    round2(sum / BigDecimal::from(values.len() as u64))
}

pub fn mention(moyenne: &BigDecimal) -> &'static str {
    const SCALE: [(i32, &str); 4] = [
        (16, "Excellent"),
        (14, "Très bien"),
        (12, "Bien"),
        (10, "Passable"),
    ];
    SCALE
        .iter()
        .find(|(floor, _)| *moyenne >= BigDecimal::from(*floor))
        .map(|(_, label)| *label)
        .unwrap_or("Insuffisant")
}

/// 1-based rank of `moyenne` among `all`; equal averages share a rank.
pub fn rank(moyenne: &BigDecimal, all: &[BigDecimal]) -> usize {
    1 + all.iter().filter(|other| *other > moyenne).count()
}

/// Get note
#[utoipa::path(get, path = "/notes", responses((status = OK, body = Note)), tag = NOTES_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "Note database id"),
)
)]
async fn get_note(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: note_id }): Query<EntityId>,
) -> Result<Json<Note>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let note = notes
        .find(note_id)
        .select(Note::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::NoteNotFound))?;
    Ok(Json(note))
}

/// List notes
#[utoipa::path(get, path = "/notes/list", responses((status = OK, body = Vec<Note>)), tag = NOTES_TAG, security(
    ("jwt" = [])
),
params(
    ("matricule" = Option<String>, Query, description = "Only notes of this participant"),
)
)]
async fn list_notes(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(OptionalMatricule { matricule: code }): Query<OptionalMatricule>,
) -> Result<Json<Vec<Note>>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let mut query = notes.select(Note::as_select()).into_boxed();
    if let Some(code) = code {
        query = query.filter(matricule.eq(code));
    }
    let found = query
        .order((date_enregistrement.asc(), id.asc()))
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    Ok(Json(found))
}

/// Delete note
#[utoipa::path(delete, path = "/notes", responses((status = OK, body = ())), tag = NOTES_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "Note database id"),
)
)]
async fn delete_note(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: note_id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.require(&enforcer, RESOURCE, "delete")?;
    let mut conn = pool.get().await?;
    let deleted = diesel::delete(notes.find(note_id))
        .execute(&mut conn)
        .await
        .map_err(|e| delete_error(e, "Note is still referenced"))?;
    if deleted == 0 {
        Err(ApiError::NoteNotFound)
    } else {
        Ok(())
    }
}

/// Update note
#[utoipa::path(put, path = "/notes", responses((status = OK, body = Note)), tag = NOTES_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "Note database id"),
)
)]
async fn update_note(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: note_id }): Query<EntityId>,
    Json(ValidatedForm(changes)): Json<ValidatedForm<NoteChanges>>,
) -> Result<Json<Note>, ApiError> {
    claims.require(&enforcer, RESOURCE, "update")?;
    if changes.is_empty() {
        return Err(ApiError::BadRequest("Nothing to update".to_string()));
    }
    let mut conn = pool.get().await?;
    let note = diesel::update(notes.find(note_id))
        .set(&changes)
        .returning(Note::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::NoteNotFound))?;
    Ok(Json(note))
}

/// Record note
#[utoipa::path(post, path = "/notes", responses((status = CREATED, body = Note), (status = NOT_FOUND)), tag = NOTES_TAG, security(
    ("jwt" = [])
))]
async fn create_note(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Json(ValidatedForm(note)): Json<ValidatedForm<NewNote>>,
) -> Result<(StatusCode, Json<Note>), ApiError> {
    claims.require(&enforcer, RESOURCE, "create")?;
    let mut conn = pool.get().await?;
    let created = insert_into(notes)
        .values(&note)
        .returning(Note::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::SeminaristeNotFound))?;
    tracing::info!(
        "{} recorded {} for {}",
        claims.username,
        created.valeur,
        created.matricule
    );
    Ok((StatusCode::CREATED, Json(created)))
}

/// Report card
#[utoipa::path(get, path = "/notes/bulletin", responses((status = OK, body = Bulletin), (status = NOT_FOUND)), tag = NOTES_TAG, security(
    ("jwt" = [])
),
params(
    ("matricule" = String, Query, description = "Registration code"),
)
)]
async fn bulletin(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(MatriculeParam { matricule: code }): Query<MatriculeParam>,
) -> Result<Json<Bulletin>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;

    let seminariste = seminaristes::table
        .find(&code)
        .select(Seminariste::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::SeminaristeNotFound))?;

    let own: Vec<Note> = notes
        .filter(matricule.eq(&code))
        .order((date_enregistrement.asc(), id.asc()))
        .select(Note::as_select())
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    let values: Vec<BigDecimal> = own.iter().map(|n| n.valeur.clone()).collect();
    let moyenne = average(&values);

    let per_participant: HashMap<String, Option<BigDecimal>> = notes::table
        .group_by(matricule)
        .select((matricule, diesel::dsl::avg(valeur)))
        .load::<(String, Option<BigDecimal>)>(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?
        .into_iter()
        .collect();
    let everyone: Vec<String> = seminaristes::table
        .select(seminaristes::matricule)
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    let class: Vec<BigDecimal> = everyone
        .iter()
        .map(|code| match per_participant.get(code) {
            Some(Some(mean)) => round2(mean.clone()),
            _ => round2(BigDecimal::from(0)),
        })
        .collect();

    Ok(Json(Bulletin {
        matricule: seminariste.matricule,
        nom: seminariste.nom,
        prenom: seminariste.prenom,
        notes: own,
        mention: mention(&moyenne).to_string(),
        rang: rank(&moyenne, &class),
        effectif: class.len(),
        moyenne,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grades(raw: &[&str]) -> Vec<BigDecimal> {
        raw.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn average_rounds_to_two_decimals() {
        assert_eq!(average(&grades(&["12", "13", "15"])).to_string(), "13.33");
        assert_eq!(average(&grades(&["10.005"])).to_string(), "10.01");
        assert_eq!(average(&grades(&["14.50", "15.50"])).to_string(), "15.00");
    }

    #[test]
    fn no_grades_average_zero() {
        assert_eq!(average(&[]), BigDecimal::from(0));
    }

    #[test]
    fn mentions_follow_thresholds() {
        let cases = [
            ("18", "Excellent"),
            ("16.00", "Excellent"),
            ("15.99", "Très bien"),
            ("12", "Bien"),
            ("10", "Passable"),
            ("9.99", "Insuffisant"),
            ("0", "Insuffisant"),
        ];
        for (value, expected) in cases {
            assert_eq!(mention(&value.parse().unwrap()), expected, "for {value}");
        }
    }

    #[test]
    fn ties_share_rank() {
        let class = grades(&["15", "12", "15", "9"]);
        assert_eq!(rank(&"15".parse().unwrap(), &class), 1);
        assert_eq!(rank(&"12".parse().unwrap(), &class), 3);
        assert_eq!(rank(&"9".parse().unwrap(), &class), 4);
    }
}
