// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Outbound HTTP seam
//!
//! Every remote call (token exchange, object store, tracking store) goes
//! through a [`Transport`]. Production uses [`HttpTransport`]; tests swap in
//! scripted implementations so retries and pacing can run on a paused clock.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Transport-level failures (no HTTP status was received)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Request body variants used by the engine
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs
    Form(Vec<(String, String)>),
}

/// A single outbound request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub bearer: Option<SecretString>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            bearer: None,
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url,
            bearer: None,
            body: RequestBody::Json(body),
        }
    }

    pub fn put_json(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::PUT,
            url,
            bearer: None,
            body: RequestBody::Json(body),
        }
    }

    pub fn post_form(url: Url, pairs: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            url,
            bearer: None,
            body: RequestBody::Form(pairs),
        }
    }

    /// Attach a bearer token, replacing any previous one.
    pub fn with_bearer(mut self, token: SecretString) -> Self {
        self.bearer = Some(token);
        self
    }
}

/// A response with any HTTP status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and returns whatever status came back.
///
/// Implementations must not retry; retry policy lives in the executor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new transport with the given per-request timeout
    pub fn new(timeout_secs: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self.client.request(request.method, request.url);

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token.expose_secret());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter())
                    .finish();
                builder
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        "application/x-www-form-urlencoded",
                    )
                    .body(encoded)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(ApiResponse { status, body })
    }
}
