use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::{self, AuthBody, Claims};
use crate::config::AdminSeed;
use crate::error::{delete_error, read_error, write_error, ApiError};
use crate::model::{
    AuthUser, EntityId, NewUser, NewUtilisateur, Role, RoleFilter, UserUpdate, Utilisateur,
    UtilisateurChanges,
};
use crate::schema::utilisateurs::dsl::*;
use crate::validate::ValidatedForm;
use crate::{Pool, AUTH_TAG, USERS_TAG};

const RESOURCE: &str = "users";

/// Account management, administrators only.
pub fn user_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(get_user, create_user, delete_user, update_user))
        .routes(routes!(list_users))
}

/// Get user
#[utoipa::path(get, path = "/users", responses((status = OK, body = Utilisateur)), tag = USERS_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "User database id"),
)
)]
async fn get_user(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: user_id }): Query<EntityId>,
) -> Result<Json<Utilisateur>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let user = utilisateurs
        .find(user_id)
        .select(Utilisateur::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::UserNotFound))?;
    Ok(Json(user))
}

/// List users
#[utoipa::path(get, path = "/users/list", responses((status = OK, body = Vec<Utilisateur>)), tag = USERS_TAG, security(
    ("jwt" = [])
),
params(
    ("role" = Option<Role>, Query, description = "Only accounts with this role"),
)
)]
async fn list_users(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(RoleFilter { role: wanted }): Query<RoleFilter>,
) -> Result<Json<Vec<Utilisateur>>, ApiError> {
    claims.require(&enforcer, RESOURCE, "read")?;
    let mut conn = pool.get().await?;
    let mut query = utilisateurs.select(Utilisateur::as_select()).into_boxed();
    if let Some(wanted) = wanted {
        query = query.filter(role.eq(wanted));
    }
    let users = query
        .order(username.asc())
        .load(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::UserNotFound))?;
    Ok(Json(users))
}

/// Delete user
#[utoipa::path(delete, path = "/users", responses((status = OK, body = ())), tag = USERS_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "User database id"),
)
)]
async fn delete_user(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: user_id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.require(&enforcer, RESOURCE, "delete")?;
    if claims.user_id()? == user_id {
        return Err(ApiError::BadRequest(
            "You cannot delete your own account".to_string(),
        ));
    }
    let mut conn = pool.get().await?;
    let deleted = diesel::delete(utilisateurs.find(user_id))
        .execute(&mut conn)
        .await
        .map_err(|e| delete_error(e, "User still has consultations on record"))?;
    if deleted == 0 {
        Err(ApiError::UserNotFound)
    } else {
        tracing::info!("{} deleted user {}", claims.username, user_id);
        Ok(())
    }
}

/// Update user
#[utoipa::path(put, path = "/users", responses((status = OK, body = Utilisateur)), tag = USERS_TAG, security(
    ("jwt" = [])
),
params(
    ("id" = i32, Query, description = "User database id"),
)
)]
async fn update_user(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(EntityId { id: user_id }): Query<EntityId>,
    Json(ValidatedForm(user)): Json<ValidatedForm<UserUpdate>>,
) -> Result<Json<Utilisateur>, ApiError> {
    claims.require(&enforcer, RESOURCE, "update")?;
    let changes = UtilisateurChanges {
        username: user.username,
        role: user.role,
        password_hash: user.password.as_deref().map(auth::hash_password).transpose()?,
    };
    if changes.is_empty() {
        return Err(ApiError::BadRequest("Nothing to update".to_string()));
    }
    let mut conn = pool.get().await?;
    let user = diesel::update(utilisateurs.find(user_id))
        .set(&changes)
        .returning(Utilisateur::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::UserNotFound))?;
    Ok(Json(user))
}

/// Create user
#[utoipa::path(post, path = "/users", responses((status = CREATED, body = Utilisateur)), tag = USERS_TAG, security(
    ("jwt" = [])
))]
async fn create_user(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Json(ValidatedForm(user)): Json<ValidatedForm<NewUser>>,
) -> Result<(StatusCode, Json<Utilisateur>), ApiError> {
    claims.require(&enforcer, RESOURCE, "create")?;
    let new_user = NewUtilisateur {
        username: user.username,
        role: user.role,
        password_hash: auth::hash_password(&user.password)?,
    };
    let mut conn = pool.get().await?;
    let created = insert_into(utilisateurs)
        .values(&new_user)
        .returning(Utilisateur::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::UserNotFound))?;
    tracing::info!(
        "{} created {} account {}",
        claims.username,
        created.role,
        created.username
    );
    Ok((StatusCode::CREATED, Json(created)))
}

/// Login and session endpoints.
pub fn auth_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(login))
        .routes(routes!(me))
}

/// Get bearer token
#[utoipa::path(
    post,
    path = "/auth/login",
    responses((status = OK, body = AuthBody), (status = UNAUTHORIZED)),
    tag = AUTH_TAG
)]
async fn login(
    State(crate::State { pool, keys, .. }): State<crate::State>,
    Json(credentials): Json<AuthUser>,
) -> Result<Json<AuthBody>, ApiError> {
    let mut conn = pool.get().await?;
    let user = utilisateurs
        .filter(username.eq(&credentials.username))
        .select(Utilisateur::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::WrongCredentials))?;

    if !auth::verify_password(&credentials.password, &user.password_hash) {
        tracing::debug!("login: bad password for {}", credentials.username);
        return Err(ApiError::WrongCredentials);
    }

    Ok(Json(auth::issue_token(&keys, &user)?))
}

/// Current account
#[utoipa::path(
    get,
    path = "/auth/me",
    responses((status = OK, body = Utilisateur)),
    tag = AUTH_TAG,
    security(
        ("jwt" = [])
    )
)]
async fn me(
    claims: Claims,
    State(crate::State { pool, .. }): State<crate::State>,
) -> Result<Json<Utilisateur>, ApiError> {
    let mut conn = pool.get().await?;
    let user = utilisateurs
        .find(claims.user_id()?)
        .select(Utilisateur::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::UserNotFound))?;
    Ok(Json(user))
}

/// Creates the configured administrator when the account table is empty.
pub async fn seed_admin(pool: &Pool, seed: &AdminSeed) -> Result<(), ApiError> {
    let mut conn = pool.get().await?;
    let existing: i64 = utilisateurs
        .count()
        .get_result(&mut conn)
        .await
        .map_err(|e| read_error(e, ApiError::Internal))?;
    if existing > 0 {
        tracing::debug!("seed_admin: {} accounts present, skipping", existing);
        return Ok(());
    }
    insert_into(utilisateurs)
        .values(&NewUtilisateur {
            username: seed.username.clone(),
            role: Role::Admin,
            password_hash: auth::hash_password(&seed.password)?,
        })
        .execute(&mut conn)
        .await
        .map_err(|e| write_error(e, ApiError::Internal))?;
    tracing::info!("created bootstrap administrator {}", seed.username);
    Ok(())
}
