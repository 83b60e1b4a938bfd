use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts, RequestPartsExt};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use casbin::{CoreApi, Enforcer};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, ToSchema};

use crate::error::ApiError;
use crate::model::{Role, Utilisateur};

/// Tokens stay valid for one day.
const TOKEN_LIFETIME_HOURS: i64 = 24;

pub struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    pub username: String,
    pub role: Role,
    pub exp: i64,
}

impl Claims {
    pub fn for_user(user: &Utilisateur) -> Self {
        Self {
            sub: user.id.to_string(),
            username: user.username.clone(),
            role: user.role,
            exp: (Utc::now() + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
        }
    }

    pub fn user_id(&self) -> Result<i32, ApiError> {
        self.sub.parse().map_err(|_| ApiError::InvalidToken)
    }

    /// Checks the casbin policy for `(role, resource, action)`.
    pub fn require(
        &self,
        enforcer: &Enforcer,
        resource: &str,
        action: &str,
    ) -> Result<(), ApiError> {
        if enforcer
            .enforce((self.role.as_str(), resource, action))
            .unwrap_or_default()
        {
            Ok(())
        } else {
            tracing::debug!(
                "{} ({}) denied {} on {}",
                self.username,
                self.role,
                action,
                resource
            );
            Err(ApiError::PermissionDenied)
        }
    }
}

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct AuthBody {
    pub access_token: String,
    pub token_type: String,
}

pub fn issue_token(keys: &Keys, user: &Utilisateur) -> Result<AuthBody, ApiError> {
    let access_token = encode(&Header::default(), &Claims::for_user(user), &keys.encoding)
        .map_err(|_| ApiError::TokenCreation)?;
    Ok(AuthBody {
        access_token,
        token_type: "Bearer".to_string(),
    })
}

#[async_trait]
impl FromRequestParts<crate::State> for Claims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::State,
    ) -> Result<Self, Self::Rejection> {
        // Extract the token from the authorization header
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::MissingCredentials)?;
        let token_data = decode::<Claims>(
            bearer.token(),
            &state.keys.decoding,
            &Validation::default(),
        )
        .map_err(|e| {
            tracing::debug!("decode token: {}", e);
            ApiError::InvalidToken
        })?;

        Ok(token_data.claims)
    }
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            tracing::error!("hash_password: {}", e);
            ApiError::Internal
        })
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("stored password hash is malformed: {}", e);
            false
        }
    }
}

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
