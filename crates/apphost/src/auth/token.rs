//! Token extraction and validation.

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{
        HeaderMap,
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};

use super::{AuthConfig, AuthError, Claims};

/// Cookie carrying a token for browser clients.
pub const AUTH_COOKIE: &str = "auth_token";

/// Header naming a dev user (dev mode only).
pub const DEV_USER_HEADER: &str = "x-dev-user";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Raw token presented with a request, not yet validated.
///
/// Looked up in priority order:
/// 1. `Authorization: Bearer <token>`
/// 2. `auth_token` cookie
/// 3. `token` query parameter
/// 4. `X-Dev-User` header, turned into a `dev:<user>` token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerToken(pub Option<String>);

impl BearerToken {
    pub fn from_parts(headers: &HeaderMap, query: Option<&str>) -> Result<Self, AuthError> {
        if let Some(header) = headers.get(AUTHORIZATION) {
            let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
            return Ok(Self(Some(bearer_token_from_header(value)?.to_string())));
        }

        let cookie_token = headers
            .get(COOKIE)
            .and_then(|h| h.to_str().ok())
            .and_then(|cookie_header| token_from_cookie_header(cookie_header, AUTH_COOKIE));
        if let Some(token) = cookie_token {
            return Ok(Self(Some(token.to_string())));
        }

        if let Some(token) = query.and_then(token_from_query) {
            return Ok(Self(Some(token)));
        }

        if let Some(user_id) = headers.get(DEV_USER_HEADER).and_then(|h| h.to_str().ok()) {
            debug!("Using dev user: {}", user_id);
            return Ok(Self(Some(format!("dev:{}", user_id))));
        }

        Ok(Self(None))
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(&parts.headers, parts.uri.query())
    }
}

/// Token validation state.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("dev_mode", &self.config.dev_mode)
            .field("has_secret", &self.decoding_key.is_some())
            .finish()
    }
}

impl AuthState {
    /// Create auth state. `env:VAR_NAME` secrets are resolved here.
    pub fn new(mut config: AuthConfig) -> Self {
        match config.resolve_jwt_secret() {
            Ok(resolved) => config.jwt_secret = resolved,
            Err(e) => {
                warn!("{}", e);
                config.jwt_secret = None;
            }
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if let Some(user_id) = token.strip_prefix("dev:") {
            if self.config.dev_mode {
                return self.dev_user_claims(user_id);
            }
            return Err(AuthError::InvalidToken("dev tokens are disabled".to_string()));
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::InvalidToken("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    fn dev_user_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        let user = self
            .config
            .dev_users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or(AuthError::UserNotFound)?;

        Ok(Claims {
            sub: user.id.clone(),
            iss: Some("dev".to_string()),
            exp: Utc::now().timestamp() + 3600,
            iat: Some(Utc::now().timestamp()),
            name: Some(user.name.clone()),
            roles: vec![user.role.to_string()],
            role: Some(user.role.to_string()),
            permissions: user.permissions.clone(),
        })
    }

    /// Sign a token for `subject`, valid for `ttl_secs`.
    pub fn generate_token(
        &self,
        subject: &str,
        role: &str,
        permissions: &[String],
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            iss: Some("apphost".to_string()),
            exp: now + ttl_secs,
            iat: Some(now),
            name: None,
            roles: vec![role.to_string()],
            role: Some(role.to_string()),
            permissions: permissions.to_vec(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DevUser, MANAGE_INSTANCE, Role};
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    fn state(dev_mode: bool) -> AuthState {
        AuthState::new(AuthConfig {
            dev_mode,
            jwt_secret: Some(SECRET.to_string()),
            dev_users: vec![DevUser {
                id: "dev".to_string(),
                name: "Developer".to_string(),
                role: Role::Admin,
                permissions: Vec::new(),
            }],
            allowed_origins: Vec::new(),
        })
    }

    #[test]
    fn test_bearer_token_from_header() {
        assert_eq!(bearer_token_from_header("Bearer abc.def").unwrap(), "abc.def");
        assert_eq!(bearer_token_from_header("bearer   t1").unwrap(), "t1");
        for case in ["", "Bearer", "Token x", "Bearer a b"] {
            assert!(bearer_token_from_header(case).is_err(), "{case} should fail");
        }
    }

    #[test]
    fn test_token_sources_in_priority_order() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; auth_token=from-cookie"));
        headers.insert(DEV_USER_HEADER, HeaderValue::from_static("dev"));

        let token = BearerToken::from_parts(&headers, Some("token=from%20query")).unwrap();
        assert_eq!(token.as_deref(), Some("from-cookie"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        let token = BearerToken::from_parts(&headers, None).unwrap();
        assert_eq!(token.as_deref(), Some("from-header"));

        let mut headers = HeaderMap::new();
        headers.insert(DEV_USER_HEADER, HeaderValue::from_static("dev"));
        let token = BearerToken::from_parts(&headers, Some("limit=5&token=from%20query")).unwrap();
        assert_eq!(token.as_deref(), Some("from query"));

        let token = BearerToken::from_parts(&headers, None).unwrap();
        assert_eq!(token.as_deref(), Some("dev:dev"));

        assert_eq!(
            BearerToken::from_parts(&HeaderMap::new(), None).unwrap(),
            BearerToken(None)
        );
    }

    #[test]
    fn test_generate_and_validate_token() {
        let state = state(false);
        let token = state
            .generate_token("ci", "user", &[MANAGE_INSTANCE.to_string()], 60)
            .unwrap();

        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "ci");
        assert!(claims.has_permission(MANAGE_INSTANCE));
        assert!(!claims.is_admin());
    }

    #[test]
    fn test_expired_token_rejected() {
        let state = state(false);
        let token = state.generate_token("ci", "admin", &[], -3600).unwrap();
        assert_eq!(state.validate_token(&token).unwrap_err(), AuthError::TokenExpired);
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let other = AuthState::new(AuthConfig {
            jwt_secret: Some("another-secret-that-is-long-enough-000000".to_string()),
            ..AuthConfig::default()
        });
        let token = other.generate_token("ci", "admin", &[], 60).unwrap();
        assert!(matches!(
            state(false).validate_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_dev_tokens() {
        let claims = state(true).validate_token("dev:dev").unwrap();
        assert!(claims.is_admin());
        assert_eq!(state(true).validate_token("dev:nobody").unwrap_err(), AuthError::UserNotFound);
        assert!(state(false).validate_token("dev:dev").is_err());
    }
}
