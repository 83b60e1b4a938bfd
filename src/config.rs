use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Bootstrap account created when no user exists yet.
#[derive(Debug, Clone)]
pub struct AdminSeed {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub api_prefix: String,
    pub project_name: String,
    pub media_dir: PathBuf,
    pub port: u16,
    pub secret_key: String,
    pub acl_model: String,
    pub acl_policy: String,
    pub tesseract_cmd: String,
    pub tesseract_langs: String,
    pub matricule_prefix: String,
    pub receipt_merchant: String,
    pub admin: Option<AdminSeed>,
}

/// Environment as read: one field per variable, lowercased.
#[derive(Deserialize)]
struct RawSettings {
    database_url: String,
    secret_key: String,
    #[serde(default = "default_api_prefix")]
    api_v1_str: String,
    #[serde(default = "default_project_name")]
    project_name: String,
    #[serde(default = "default_media_dir")]
    media_dir: PathBuf,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_acl_model")]
    acl_model: String,
    #[serde(default = "default_acl_policy")]
    acl_policy: String,
    #[serde(default = "default_tesseract_cmd")]
    tesseract_cmd: String,
    #[serde(default = "default_tesseract_langs")]
    tesseract_langs: String,
    #[serde(default = "default_matricule_prefix")]
    matricule_prefix: String,
    #[serde(default = "default_receipt_merchant")]
    receipt_merchant: String,
    admin_username: Option<String>,
    admin_password: Option<String>,
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_project_name() -> String {
    "Inscription System".to_string()
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_port() -> u16 {
    8000
}

fn default_acl_model() -> String {
    "acl/model.conf".to_string()
}

fn default_acl_policy() -> String {
    "acl/policy.csv".to_string()
}

fn default_tesseract_cmd() -> String {
    "tesseract".to_string()
}

fn default_tesseract_langs() -> String {
    "fra+eng".to_string()
}

fn default_matricule_prefix() -> String {
    "ANNOUR25".to_string()
}

fn default_receipt_merchant() -> String {
    "AN-NOUR".to_string()
}

impl Settings {
    /// Reads settings from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = ::config::Config::builder()
            .add_source(::config::Environment::default().ignore_empty(true))
            .build()?
            .try_deserialize::<RawSettings>()?;
        Self::try_from(raw)
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let raw = ::config::Config::builder()
            .add_source(
                ::config::Environment::default()
                    .source(Some(vars))
                    .ignore_empty(true),
            )
            .build()?
            .try_deserialize::<RawSettings>()?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawSettings> for Settings {
    type Error = ConfigError;

    fn try_from(raw: RawSettings) -> Result<Self, Self::Error> {
        let api_prefix = raw.api_v1_str;
        if !api_prefix.starts_with('/') || api_prefix.len() < 2 || api_prefix.ends_with('/') {
            return Err(ConfigError::Invalid {
                name: "API_V1_STR",
                reason: format!("`{api_prefix}` must look like /api/v1"),
            });
        }

        let admin = match (raw.admin_username, raw.admin_password) {
            (Some(username), Some(password)) => Some(AdminSeed { username, password }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("ADMIN_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("ADMIN_USERNAME")),
        };

        Ok(Settings {
            database_url: raw.database_url,
            api_prefix,
            project_name: raw.project_name,
            media_dir: raw.media_dir,
            port: raw.port,
            secret_key: raw.secret_key,
            acl_model: raw.acl_model,
            acl_policy: raw.acl_policy,
            tesseract_cmd: raw.tesseract_cmd,
            tesseract_langs: raw.tesseract_langs,
            matricule_prefix: raw.matricule_prefix,
            receipt_merchant: raw.receipt_merchant,
            admin,
        })
    }
}
