// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Delegated access tokens
//!
//! The service identity signs a short-lived RS256 assertion naming the
//! end-user it wants to act as, and exchanges it at the identity provider's
//! token endpoint for a bearer token. Tokens are cached per impersonated
//! identity and reused while more than five minutes of validity remain.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::metrics;
use crate::transport::{ApiRequest, Transport, TransportError};

/// Default OAuth token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes requested for every impersonated identity
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/drive.file",
    "https://www.googleapis.com/auth/spreadsheets",
];

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Validity requested for each signed assertion
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// A cached token is replaced once less than this much validity remains
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Token acquisition errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Failed to sign assertion for {subject}: {message}")]
    Signing { subject: String, message: String },

    #[error("Token exchange for {subject} failed: {status} - {body}")]
    Exchange {
        subject: String,
        status: u16,
        body: String,
    },

    #[error("Token exchange for {subject} failed: {source}")]
    Transport {
        subject: String,
        #[source]
        source: TransportError,
    },

    #[error("Malformed token response for {subject}: {message}")]
    MalformedResponse { subject: String, message: String },
}

/// Signing key and issuer used to impersonate end-users
pub struct ServiceIdentity {
    issuer: String,
    key: EncodingKey,
}

impl ServiceIdentity {
    /// Build from an issuer (the service account address) and PEM key material.
    pub fn from_pem(issuer: impl Into<String>, private_key: &SecretString) -> Result<Self, AuthError> {
        let issuer = issuer.into();
        if issuer.trim().is_empty() {
            return Err(AuthError::InvalidKey("issuer must not be empty".to_string()));
        }

        let key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;

        Ok(Self { issuer, key })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

impl fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("issuer", &self.issuer)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Bearer token scoped to one impersonated identity
#[derive(Clone)]
pub struct AccessToken {
    bearer: SecretString,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(bearer: SecretString, expires_at: Instant) -> Self {
        Self { bearer, expires_at }
    }

    pub fn bearer(&self) -> &SecretString {
        &self.bearer
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// True if the token still has more than [`REFRESH_MARGIN`] left at `now`.
    pub fn is_usable_at(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("bearer", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: u64,
    iat: u64,
    sub: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Mints and caches per-identity bearer tokens.
///
/// All minting goes through one lock: two identities never exchange
/// assertions concurrently.
pub struct TokenManager {
    identity: ServiceIdentity,
    transport: Arc<dyn Transport>,
    token_url: Url,
    scope: String,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl TokenManager {
    pub fn new(
        identity: ServiceIdentity,
        transport: Arc<dyn Transport>,
        token_url: Url,
        scopes: &[&str],
    ) -> Self {
        Self {
            identity,
            transport,
            token_url,
            scope: scopes.join(" "),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The service identity's own issuer address
    pub fn issuer(&self) -> &str {
        self.identity.issuer()
    }

    /// Return a usable token for `subject`, minting one if needed.
    pub async fn get_token(&self, subject: &str) -> Result<AccessToken, AuthError> {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();

        if let Some(token) = cache.get(subject)
            && token.is_usable_at(now)
        {
            debug!(identity = %subject, "Using cached access token");
            return Ok(token.clone());
        }

        let token = self.mint(subject, now).await?;
        cache.insert(subject.to_string(), token.clone());

        info!(identity = %subject, "Cached new access token");
        Ok(token)
    }

    /// Number of identities with a cached token
    pub async fn cached_identities(&self) -> usize {
        self.cache.lock().await.len()
    }

    fn sign_assertion(&self, subject: &str) -> Result<String, AuthError> {
        let iat = jsonwebtoken::get_current_timestamp();
        let claims = AssertionClaims {
            iss: self.identity.issuer(),
            scope: &self.scope,
            aud: self.token_url.as_str(),
            exp: iat + ASSERTION_LIFETIME_SECS,
            iat,
            sub: subject,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.identity.key).map_err(
            |e| AuthError::Signing {
                subject: subject.to_string(),
                message: e.to_string(),
            },
        )
    }

    async fn mint(&self, subject: &str, now: Instant) -> Result<AccessToken, AuthError> {
        let assertion = self.sign_assertion(subject)?;

        let request = ApiRequest::post_form(
            self.token_url.clone(),
            vec![
                ("grant_type".to_string(), JWT_BEARER_GRANT.to_string()),
                ("assertion".to_string(), assertion),
            ],
        );

        metrics::record_token_mint();

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|source| AuthError::Transport {
                subject: subject.to_string(),
                source,
            })?;

        if response.status != 200 {
            return Err(AuthError::Exchange {
                subject: subject.to_string(),
                status: response.status,
                body: response.body,
            });
        }

        let parsed: TokenExchangeResponse =
            serde_json::from_str(&response.body).map_err(|e| AuthError::MalformedResponse {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;

        let lifetime = parsed.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);

        Ok(AccessToken::new(
            SecretString::from(parsed.access_token),
            now + Duration::from_secs(lifetime),
        ))
    }
}
