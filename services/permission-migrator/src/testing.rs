// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Scripted transport and fixtures shared by the unit tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use reqwest::{Method, Url};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{DEFAULT_SCOPES, ServiceIdentity, TokenManager};
use crate::executor::{RateLimiterState, RequestExecutor};
use crate::transport::{ApiRequest, ApiResponse, RequestBody, Transport, TransportError};

pub(crate) const TOKEN_URL: &str = "https://oauth2.test/token";
pub(crate) const ISSUER: &str = "migrator@project.iam.example.com";
pub(crate) const TEST_BEARER: &str = "test-bearer";

#[derive(Clone)]
enum Reply {
    Respond(ApiResponse),
    Fail(String),
    Delayed(Duration, ApiResponse),
}

struct Route {
    method: Method,
    fragment: String,
    replies: VecDeque<Reply>,
    last: Option<Reply>,
}

/// A request as the scripted transport saw it
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub bearer: Option<String>,
    pub json: Option<serde_json::Value>,
    pub form: Option<Vec<(String, String)>>,
}

/// Replies from per-route queues; the last reply of a route repeats once
/// its queue is exhausted. Routes match on method and a URL substring, in
/// registration order.
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, method: Method, fragment: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        match routes
            .iter_mut()
            .find(|r| r.method == method && r.fragment == fragment)
        {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                method,
                fragment: fragment.to_string(),
                replies: VecDeque::from([reply]),
                last: None,
            }),
        }
    }

    pub fn respond(&self, method: Method, fragment: &str, status: u16, body: impl Into<String>) {
        self.push(method, fragment, Reply::Respond(ApiResponse::new(status, body)));
    }

    pub fn respond_after(
        &self,
        method: Method,
        fragment: &str,
        delay: Duration,
        status: u16,
        body: impl Into<String>,
    ) {
        self.push(
            method,
            fragment,
            Reply::Delayed(delay, ApiResponse::new(status, body)),
        );
    }

    pub fn fail(&self, method: Method, fragment: &str, message: &str) {
        self.push(method, fragment, Reply::Fail(message.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: Method, fragment: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.url.as_str().contains(fragment))
            .collect()
    }

    pub fn count(&self, method: Method, fragment: &str) -> usize {
        self.requests_to(method, fragment).len()
    }

    fn next_reply(&self, method: &Method, url: &str) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .find(|r| &r.method == method && url.contains(&r.fragment))?;
        let reply = route.replies.pop_front().or_else(|| route.last.clone())?;
        route.last = Some(reply.clone());
        Some(reply)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let (json, form) = match &request.body {
            RequestBody::Empty => (None, None),
            RequestBody::Json(value) => (Some(value.clone()), None),
            RequestBody::Form(pairs) => (None, Some(pairs.clone())),
        };
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            bearer: request.bearer.as_ref().map(|b| b.expose_secret().to_string()),
            json,
            form,
        });

        match self.next_reply(&request.method, request.url.as_str()) {
            None => Ok(ApiResponse::new(
                404,
                format!("no scripted route for {} {}", request.method, request.url),
            )),
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(message)) => Err(TransportError::Connection(message)),
            Some(Reply::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
        }
    }
}

fn key_pair() -> &'static (String, String) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private = RsaPrivateKey::new(&mut rand_core::OsRng, 2048).expect("generate key");
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private key")
            .to_string();
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public key");
        (private_pem, public_pem)
    })
}

/// PKCS#8 PEM of a throwaway signing key
pub(crate) fn private_key_pem() -> SecretString {
    SecretString::from(key_pair().0.clone())
}

pub(crate) fn service_identity() -> ServiceIdentity {
    ServiceIdentity::from_pem(ISSUER, &private_key_pem()).expect("valid test key")
}

/// Verify an assertion against the test key and return its claims.
pub(crate) fn decode_claims(assertion: &str) -> serde_json::Value {
    let key = DecodingKey::from_rsa_pem(key_pair().1.as_bytes()).expect("public key");
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[TOKEN_URL]);
    jsonwebtoken::decode::<serde_json::Value>(assertion, &key, &validation)
        .expect("valid assertion")
        .claims
}

pub(crate) fn token_body(token: &str) -> String {
    serde_json::json!({
        "access_token": token,
        "expires_in": 3600,
        "token_type": "Bearer",
    })
    .to_string()
}

/// A scripted transport whose token endpoint always succeeds
pub(crate) fn scripted_transport() -> Arc<ScriptedTransport> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(Method::POST, "/token", 200, token_body(TEST_BEARER));
    transport
}

pub(crate) fn token_manager(transport: &Arc<ScriptedTransport>) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        service_identity(),
        Arc::clone(transport) as Arc<dyn Transport>,
        Url::parse(TOKEN_URL).unwrap(),
        DEFAULT_SCOPES,
    ))
}

pub(crate) fn executor(
    transport: &Arc<ScriptedTransport>,
    limiter: Arc<RateLimiterState>,
    max_retries: u32,
) -> RequestExecutor {
    RequestExecutor::new(
        token_manager(transport),
        Arc::clone(transport) as Arc<dyn Transport>,
        limiter,
        max_retries,
    )
}
