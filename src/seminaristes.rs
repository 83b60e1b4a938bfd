use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use diesel::dsl::{exists, insert_into};
use diesel::pg::Pg;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, PgTextExpressionMethods, QueryDsl, SelectableHelper,
    TextExpressionMethods,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{delete_error, read_error, write_error, ApiError};
use crate::model::{
    MatriculeParam, NewSeminariste, Page, Seminariste, SeminaristeChanges, SeminaristeQuery,
};
use crate::schema::seminaristes::{self, dsl::*};
use crate::validate::{validated, ValidatedForm};
use crate::SEMINARISTES_TAG;

const RESOURCE: &str = "seminaristes";
/// Generated codes retried after losing a race to a concurrent registration.
const MATRICULE_ATTEMPTS: usize = 5;

/// expose the participant OpenAPI to parent module
pub fn seminariste_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(
            get_seminariste,
            create_seminariste,
            delete_seminariste,
            update_seminariste
        ))
        .routes(routes!(list_seminaristes))
}

/// Registration code for the `counter`-th participant under `prefix`.
pub fn format_matricule(prefix: &str, counter: i64) -> String {
    format!("{prefix}-{counter:03}")
}

/// `LIKE` pattern matching every code issued under `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("-%");
    pattern
}

/// Picks the next free code, starting after the number of codes already
/// issued under the prefix and skipping over collisions.
async fn next_matricule(conn: &mut AsyncPgConnection, prefix: &str) -> Result<String, ApiError> {
    let issued: i64 = seminaristes
        .filter(matricule.like(prefix_pattern(prefix)))
        .count()
        .get_result(conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;

    let mut counter = issued + 1;
    loop {
        let candidate = format_matricule(prefix, counter);
        let taken: bool = diesel::select(exists(seminaristes.find(&candidate)))
            .get_result(conn)
            .await
            .map_err(|e| read_error(e, ApiError::Internal))?;
        if !taken {
            return Ok(candidate);
        }
        counter += 1;
    }
}

fn filtered(params: &SeminaristeQuery) -> seminaristes::BoxedQuery<'static, Pg> {
    let mut query = seminaristes::table.into_boxed();
    if let Some(search) = params.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        query = query.filter(
            nom.ilike(pattern.clone())
                .or(prenom.ilike(pattern.clone()))
                .or(matricule.ilike(pattern)),
        );
    }
    if let Some(wanted) = params.genre {
        query = query.filter(genre.eq(wanted));
    }
    if let Some(wanted) = params.commune.clone() {
        query = query.filter(commune.eq(wanted));
    }
    if let Some(wanted) = params.statut.clone() {
        query = query.filter(statut.eq(wanted));
    }
    if let Some(wanted) = params.niveau_etude.clone() {
        query = query.filter(niveau_etude.eq(wanted));
    }
    query
}

/// Get participant
#[utoipa::path(get, path = "/seminaristes", responses((status = OK, body = Seminariste)), tag = SEMINARISTES_TAG, security(
    ("jwt" = [])
),
params(
    ("matricule" = String, Query, description = "Registration code"),
)
)]
async fn get_seminariste(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(MatriculeParam { matricule: code }): Query<MatriculeParam>,
) -> Result<Json<Seminariste>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let found = seminaristes
        .find(&code)
        .select(Seminariste::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::SeminaristeNotFound))?;
    Ok(Json(found))
}

/// List participants
#[utoipa::path(get, path = "/seminaristes/list", responses((status = OK, body = Page<Seminariste>)), tag = SEMINARISTES_TAG, security(
    ("jwt" = [])
),
params(
    ("page" = Option<i64>, Query, description = "Page number, from 1"),
    ("limit" = Option<i64>, Query, description = "Page size, 1 to 100"),
    ("search" = Option<String>, Query, description = "Case-insensitive match on name or code"),
    ("genre" = Option<String>, Query, description = "Homme or Femme"),
    ("commune" = Option<String>, Query, description = "Town of residence"),
    ("statut" = Option<String>, Query, description = "Status"),
    ("niveau_etude" = Option<String>, Query, description = "Education level"),
)
)]
async fn list_seminaristes(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(params): Query<SeminaristeQuery>,
) -> Result<Json<Page<Seminariste>>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let params = validated(params)?;
    let mut conn = pool.get().await?;

    let total: i64 = filtered(&params)
        .count()
        .get_result(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    let data = filtered(&params)
        .order((nom.asc(), prenom.asc()))
        .limit(params.limit)
        .offset((params.page - 1) * params.limit)
        .select(Seminariste::as_select())
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;

    Ok(Json(Page {
        total,
        page: params.page,
        limit: params.limit,
        data,
    }))
}

/// Delete participant
#[utoipa::path(delete, path = "/seminaristes", responses((status = OK, body = ()), (status = CONFLICT)), tag = SEMINARISTES_TAG, security(
    ("jwt" = [])
),
params(
    ("matricule" = String, Query, description = "Registration code"),
)
)]
async fn delete_seminariste(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(MatriculeParam { matricule: code }): Query<MatriculeParam>,
) -> Result<(), ApiError> {
    claims.require(&enforcer, RESOURCE, "delete")?;
    let mut conn = pool.get().await?;
    let deleted = diesel::delete(seminaristes.find(&code))
        .execute(&mut conn)
        .await
        .map_err(|e| delete_error(e, "Seminariste still has notes or consultations"))?;
    if deleted == 0 {
        Err(ApiError::SeminaristeNotFound)
    } else {
        tracing::info!("{} deleted seminariste {}", claims.username, code);
        Ok(())
    }
}

/// Update participant
#[utoipa::path(put, path = "/seminaristes", responses((status = OK, body = Seminariste)), tag = SEMINARISTES_TAG, security(
    ("jwt" = [])
),
params(
    ("matricule" = String, Query, description = "Registration code"),
)
)]
async fn update_seminariste(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(MatriculeParam { matricule: code }): Query<MatriculeParam>,
    Json(ValidatedForm(changes)): Json<ValidatedForm<SeminaristeChanges>>,
) -> Result<Json<Seminariste>, ApiError> {
    claims.require(&enforcer, RESOURCE, "update")?;
    if changes.is_empty() {
        return Err(ApiError::BadRequest("Nothing to update".to_string()));
    }
    let mut conn = pool.get().await?;
    let updated = diesel::update(seminaristes.find(&code))
        .set(&changes)
        .returning(Seminariste::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::SeminaristeNotFound))?;
    Ok(Json(updated))
}

/// Register participant
#[utoipa::path(post, path = "/seminaristes", responses((status = CREATED, body = Seminariste), (status = CONFLICT)), tag = SEMINARISTES_TAG, security(
    ("jwt" = [])
))]
async fn create_seminariste(
    claims: Claims,
    State(crate::State {
        pool,
        enforcer,
        settings,
        ..
    }): State<crate::State>,
    Json(ValidatedForm(form)): Json<ValidatedForm<NewSeminariste>>,
) -> Result<(StatusCode, Json<Seminariste>), ApiError> {
    claims.require(&enforcer, RESOURCE, "create")?;
    let mut conn = pool.get().await?;

    let given = form
        .matricule
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_owned);
    let mut record = form.into_record(given.clone().unwrap_or_default());

    let mut attempt = 1;
    let created = loop {
        if given.is_none() {
            record.matricule = next_matricule(&mut conn, &settings.matricule_prefix).await?;
        }
        match insert_into(seminaristes)
            .values(&record)
            .returning(Seminariste::as_returning())
            .get_result(&mut conn)
            .await
        {
            Ok(created) => break created,
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))
                if given.is_none() && attempt < MATRICULE_ATTEMPTS =>
            {
                tracing::debug!("matricule {} taken concurrently, retrying", record.matricule);
                attempt += 1;
            }
            Err(e) => return Err(write_error(e, ApiError::SeminaristeNotFound)),
        }
    };
    tracing::info!("{} registered {}", claims.username, created.matricule);
    Ok((StatusCode::CREATED, Json(created)))
}
