//! Bearer-token validation.
//!
//! RS256 only; the header is inspected before any cryptography so
//! algorithm-confusion and key-smuggling attempts die early. Role claims
//! are advisory: a missing or malformed `roles` claim authenticates to an
//! empty role set rather than failing, and routing then yields no servers.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use super::jwks::JwksProvider;
use super::revocation::RevocationCache;
use crate::config::AuthSettings;
use crate::errors::GatewayError;
use crate::model::UserContext;

/// Claims the gateway reads. Unknown claims are ignored.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Expected to be an array of strings; anything else counts as absent.
    #[serde(default)]
    pub roles: Option<serde_json::Value>,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub jti: Option<String>,
}

/// Validates bearer tokens against the provider key set.
pub struct TokenValidator {
    settings: AuthSettings,
    jwks: Option<JwksProvider>,
    static_key: Option<Arc<DecodingKey>>,
}

impl TokenValidator {
    /// Build from settings; requires `jwks_uri` (enforced by config
    /// validation).
    pub fn from_settings(settings: AuthSettings) -> anyhow::Result<Self> {
        let jwks = match &settings.jwks_uri {
            Some(uri) => Some(JwksProvider::with_options(
                uri.clone(),
                settings.allow_private_jwks,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            jwks,
            static_key: None,
        })
    }

    /// Validator pinned to a single RSA public key (tests, air-gapped dev).
    pub fn with_static_key(settings: AuthSettings, key_pem: &[u8]) -> anyhow::Result<Self> {
        let key = DecodingKey::from_rsa_pem(key_pem)
            .map_err(|e| anyhow::anyhow!("invalid static RSA key: {}", e))?;
        Ok(Self {
            settings,
            jwks: None,
            static_key: Some(Arc::new(key)),
        })
    }

    /// Whether the upstream key set answered its last fetch.
    pub fn keyset_available(&self) -> bool {
        self.jwks.as_ref().map_or(true, JwksProvider::is_available)
    }

    /// Validate a bearer token and derive the request's [`UserContext`].
    pub async fn validate(
        &self,
        token: &str,
        revocations: &RevocationCache,
    ) -> Result<UserContext, GatewayError> {
        // 1. Structural + header hardening before any crypto.
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(GatewayError::auth("malformed token"));
        }
        let header_json = URL_SAFE_NO_PAD
            .decode(parts[0])
            .map_err(|_| GatewayError::auth("malformed token header"))?;
        let header_value: serde_json::Value = serde_json::from_slice(&header_json)
            .map_err(|_| GatewayError::auth("malformed token header"))?;

        if let Some(obj) = header_value.as_object() {
            if obj.contains_key("crit") {
                return Err(GatewayError::auth("unsupported critical extensions"));
            }
            if ["jku", "jwk", "x5u", "x5c"].iter().any(|k| obj.contains_key(*k)) {
                return Err(GatewayError::auth("key-reference headers not accepted"));
            }
        }

        let header =
            decode_header(token).map_err(|e| GatewayError::auth(format!("bad header: {}", e)))?;

        // 2. Algorithm allowlist. `none` and symmetric algorithms never
        // reach signature verification.
        if header.alg != Algorithm::RS256 {
            return Err(GatewayError::auth(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        // 3. Key resolution: static key, else JWKS by kid (refresh happens
        // inside the provider only on a miss).
        let key = if let Some(sk) = &self.static_key {
            Arc::clone(sk)
        } else if let Some(provider) = &self.jwks {
            let kid = header
                .kid
                .as_deref()
                .ok_or_else(|| GatewayError::auth("token missing key id"))?;
            provider
                .get_key(kid)
                .await
                .map_err(|e| GatewayError::auth(format!("unable to resolve signing key: {}", e)))?
        } else {
            return Err(GatewayError::auth("no signing keys configured"));
        };

        // 4. Signature + registered claims.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.settings.clock_skew_leeway_secs;
        if let Some(iss) = &self.settings.issuer {
            validation.set_issuer(&[iss]);
        }
        if !self.settings.audience.is_empty() {
            validation.set_audience(&self.settings.audience);
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| GatewayError::auth(format!("token rejected: {}", e)))?;
        let claims = data.claims;

        // 5. Revocation. Tokens without a jti cannot be revoked but still
        // validate.
        if let Some(jti) = &claims.jti {
            if revocations.is_revoked(jti)? {
                return Err(GatewayError::auth("token revoked"));
            }
        }

        Ok(Self::context_from_claims(claims))
    }

    fn context_from_claims(claims: Claims) -> UserContext {
        let roles: BTreeSet<String> = match &claims.roles {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            // Absent or malformed: authenticated but roleless.
            _ => BTreeSet::new(),
        };

        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);

        UserContext {
            subject: claims.sub,
            display_name: claims.name,
            roles,
            expires_at,
        }
    }
}
