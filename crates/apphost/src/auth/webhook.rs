//! Shared-secret verification for repository webhooks.

use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Signature material sent along with a webhook.
#[derive(Debug, Clone, Default)]
pub struct WebhookSignature {
    /// `X-Hub-Signature-256` value, `sha256=<hex>`.
    pub hub_signature: Option<String>,
    /// `X-Gitlab-Token` value.
    pub token: Option<String>,
}

/// Checks webhooks against one shared secret.
///
/// Accepts either an HMAC-SHA256 signature of the raw body or the plain secret
/// token. Without a configured secret every webhook is rejected.
#[derive(Clone)]
pub struct SharedSecretVerifier {
    secret: Option<String>,
}

impl std::fmt::Debug for SharedSecretVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretVerifier")
            .field("configured", &self.secret.is_some())
            .finish()
    }
}

impl SharedSecretVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn verify(&self, signature: &WebhookSignature, body: &[u8]) -> bool {
        let Some(ref secret) = self.secret else {
            warn!("Rejecting webhook: no webhook secret configured");
            return false;
        };

        if let Some(ref header) = signature.hub_signature {
            return verify_hmac(secret.as_bytes(), header, body);
        }

        if let Some(ref token) = signature.token {
            return bool::from(token.as_bytes().ct_eq(secret.as_bytes()));
        }

        false
    }
}

fn verify_hmac(secret: &[u8], header: &str, body: &[u8]) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the `X-Hub-Signature-256` header value for a body.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
