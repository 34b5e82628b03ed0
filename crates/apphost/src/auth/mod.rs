//! Authentication.
//!
//! - HS256 JWT validation with dev-mode users
//! - Shared-secret verification for repository webhooks

mod claims;
mod config;
mod error;
mod token;
mod webhook;

pub use claims::{Claims, MANAGE_INSTANCE, Role};
pub use config::{AuthConfig, ConfigValidationError, DevUser, resolve_secret};
pub use error::AuthError;
pub use token::{AUTH_COOKIE, AuthState, BearerToken, DEV_USER_HEADER};
pub use webhook::{SharedSecretVerifier, WebhookSignature, sign_body};
