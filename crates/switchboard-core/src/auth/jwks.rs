//! JWKS key-set client.
//!
//! Keys are cached per `kid`; the set is re-fetched only when a lookup
//! misses (an unknown key id usually means the provider rotated), never
//! per request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonwebtoken::DecodingKey;
use moka::sync::Cache;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// Cap on cached keys; a provider advertising more than this is broken
/// or hostile.
const MAX_CACHED_KEYS: u64 = 64;

/// Cap on the JWKS response body.
const MAX_JWKS_BYTES: u64 = 512 * 1024;

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Fetches and caches the identity provider's signing keys.
#[derive(Clone)]
pub struct JwksProvider {
    cache: Cache<String, Arc<DecodingKey>>,
    client: Client,
    jwks_uri: Url,
    /// False after a failed refresh, until the next success. Read by the
    /// health endpoint.
    available: Arc<AtomicBool>,
}

impl JwksProvider {
    pub fn new(jwks_uri: Url) -> Result<Self> {
        Self::with_options(jwks_uri, false)
    }

    /// `allow_private_hosts` skips the address-space check for development
    /// setups whose identity provider lives on a private network.
    pub fn with_options(jwks_uri: Url, allow_private_hosts: bool) -> Result<Self> {
        if !allow_private_hosts {
            Self::validate_uri(&jwks_uri)?;
        }

        Ok(Self {
            cache: Cache::builder()
                .max_capacity(MAX_CACHED_KEYS)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            // Outbound requests carry no request-derived headers, and the
            // key endpoint must not redirect us elsewhere.
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
                .redirect(reqwest::redirect::Policy::none())
                .build()?,
            jwks_uri,
            available: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Reject key URIs that point into private address space. The JWKS
    /// endpoint is operator-configured, but a copy-pasted internal URL
    /// must not turn the gateway into an SSRF hop.
    fn validate_uri(uri: &Url) -> Result<()> {
        if let Some(host) = uri.host() {
            let ip = match host {
                url::Host::Ipv4(addr) => Some(std::net::IpAddr::V4(addr)),
                url::Host::Ipv6(addr) => Some(std::net::IpAddr::V6(addr)),
                url::Host::Domain(_) => None,
            };
            if let Some(ip) = ip {
                if Self::is_private_ip(&ip) {
                    anyhow::bail!("unsafe IP address in JWKS URI: {}", ip);
                }
            }
        }
        Ok(())
    }

    fn is_private_ip(ip: &std::net::IpAddr) -> bool {
        match ip {
            std::net::IpAddr::V4(addr) => {
                let octets = addr.octets();
                addr.is_loopback()
                    || addr.is_link_local()
                    || addr.is_multicast()
                    || addr.is_unspecified()
                    || octets[0] == 10
                    || (octets[0] == 192 && octets[1] == 168)
                    || (octets[0] == 172 && (16..=31).contains(&octets[1]))
            }
            std::net::IpAddr::V6(addr) => {
                addr.is_loopback()
                    || addr.is_multicast()
                    || addr.is_unspecified()
                    || (addr.segments()[0] & 0xfe00) == 0xfc00
            }
        }
    }

    /// Resolve a decoding key by `kid`. Cache hit is the hot path; a miss
    /// triggers one refresh and a second lookup.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<DecodingKey>> {
        if let Some(key) = self.cache.get(kid) {
            return Ok(key);
        }

        self.refresh().await?;

        self.cache
            .get(kid)
            .ok_or_else(|| anyhow::anyhow!("signing key not found for kid '{}'", kid))
    }

    /// Whether the last key-set fetch succeeded.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn refresh(&self) -> Result<()> {
        tracing::info!(event = "jwks_refresh", uri = %self.jwks_uri);

        let result = self.refresh_inner().await;
        self.available.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    async fn refresh_inner(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .context("fetching JWKS")?;

        if let Some(len) = resp.content_length() {
            if len > MAX_JWKS_BYTES {
                anyhow::bail!("JWKS response too large: {} bytes", len);
            }
        }

        let doc: JwksDocument = resp.json().await.context("parsing JWKS")?;

        for key in doc.keys {
            if key.kty != "RSA" {
                continue;
            }
            if let (Some(n), Some(e)) = (&key.n, &key.e) {
                if let Ok(decoding_key) = DecodingKey::from_rsa_components(n, e) {
                    self.cache.insert(key.kid.clone(), Arc::new(decoding_key));
                }
            }
        }

        Ok(())
    }
}
