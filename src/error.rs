use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("User not found")]
    UserNotFound,
    #[error("Seminariste not found")]
    SeminaristeNotFound,
    #[error("Note not found")]
    NoteNotFound,
    #[error("Consultation not found")]
    ConsultationNotFound,
    #[error("Wrong credentials")]
    WrongCredentials,
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token creation error")]
    TokenCreation,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Db connection error")]
    DBConnection,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Constraint(String),
    #[error("OCR failure: {0}")]
    Ocr(String),
    #[error("Internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::UserNotFound
            | ApiError::SeminaristeNotFound
            | ApiError::NoteNotFound
            | ApiError::ConsultationNotFound => StatusCode::NOT_FOUND,
            ApiError::WrongCredentials | ApiError::InvalidToken | ApiError::MissingCredentials => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PermissionDenied => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Constraint(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Ocr(_) => StatusCode::BAD_GATEWAY,
            ApiError::TokenCreation | ApiError::DBConnection | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl<E> From<bb8::RunError<E>> for ApiError
where
    E: std::error::Error + 'static,
{
    fn from(err: bb8::RunError<E>) -> Self {
        tracing::error!("pool: {}", err);
        ApiError::DBConnection
    }
}

/// Maps a failed insert or update. A foreign key violation means the
/// referenced participant or account does not exist, so `missing` is returned.
pub fn write_error(err: DieselError, missing: ApiError) -> ApiError {
    match err {
        DieselError::NotFound => missing,
        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => missing,
        other => constraint_error(other),
    }
}

/// True when `err` is a violation of the named constraint.
pub fn violates(err: &DieselError, constraint: &str) -> bool {
    matches!(err, DieselError::DatabaseError(_, info) if info.constraint_name() == Some(constraint))
}

/// Maps a failed delete. A foreign key violation means other rows still
/// reference the target.
pub fn delete_error(err: DieselError, in_use: &str) -> ApiError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
            tracing::debug!("delete blocked: {}", info.message());
            ApiError::Conflict(in_use.to_owned())
        }
        other => constraint_error(other),
    }
}

fn constraint_error(err: DieselError) -> ApiError {
    match err {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::UniqueViolation => {
                ApiError::Conflict(format!("Already exists: {}", info.message()))
            }
            DatabaseErrorKind::CheckViolation | DatabaseErrorKind::NotNullViolation => {
                ApiError::Constraint(info.message().to_owned())
            }
            other => {
                tracing::error!("database error {:?}: {}", other, info.message());
                ApiError::Internal
            }
        },
        other => {
            tracing::error!("database error: {}", other);
            ApiError::Internal
        }
    }
}

/// Maps a failed lookup: `NotFound` becomes `missing`, anything else is logged.
pub fn read_error(err: DieselError, missing: ApiError) -> ApiError {
    match err {
        DieselError::NotFound => missing,
        other => {
            tracing::error!("database error: {}", other);
            ApiError::Internal
        }
    }
}
