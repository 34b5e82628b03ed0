//! Authentication configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Role;

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept `dev:<user>` tokens and the `X-Dev-User` header.
    pub dev_mode: bool,

    /// HS256 secret. Supports `env:VAR_NAME`. Required when dev_mode is false.
    pub jwt_secret: Option<String>,

    /// Users available in dev mode.
    pub dev_users: Vec<DevUser>,

    /// Allowed CORS origins. Empty disables CORS outside dev mode.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            jwt_secret: None,
            dev_users: Vec::new(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        self.jwt_secret.as_deref().map(resolve_secret).transpose()
    }

    /// Validate the configuration for the current mode.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dev_mode {
            return Ok(());
        }

        match self.resolve_jwt_secret()? {
            None => Err(ConfigValidationError::MissingJwtSecret),
            Some(secret) if secret.len() < 32 => Err(ConfigValidationError::JwtSecretTooShort),
            Some(_) => Ok(()),
        }
    }
}

/// Resolve a secret value, expanding `env:VAR_NAME` syntax.
pub fn resolve_secret(value: &str) -> Result<String, ConfigValidationError> {
    match value.strip_prefix("env:") {
        Some(var_name) => match std::env::var(var_name) {
            Ok(secret) if !secret.is_empty() => Ok(secret),
            Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
            Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
        },
        None => Ok(value.to_string()),
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error(
        "JWT secret is required when dev_mode is false. Set APPHOST__AUTH__JWT_SECRET or jwt_secret in config."
    )]
    MissingJwtSecret,

    #[error("JWT secret must be at least 32 characters long.")]
    JwtSecretTooShort,

    #[error("Environment variable '{0}' not found (referenced via env:{0} in config).")]
    EnvVarNotFound(String),

    #[error("Environment variable '{0}' is empty (referenced via env:{0} in config).")]
    EnvVarEmpty(String),
}

/// Development user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevUser {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: Vec<String>,
}
