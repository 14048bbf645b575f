//! Authenticated client for the portal's data endpoints.
//!
//! Every request carries the live bearer token. A 401 from any endpoint
//! ends the session that issued the request (not a newer one) and is
//! reported as [`AuthError::Unauthorized`], which the rendering layer turns
//! into a redirect to the login surface.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::AuthError;
use crate::session::SessionStore;

/// JSON API client bound to a session.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    session: SessionStore,
}

impl ApiClient {
    /// Client for `base_url` (e.g. `http://localhost:5000/api`).
    pub fn new(base_url: &str, timeout: Duration, session: SessionStore) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, base_url, session))
    }

    /// Reuse an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: &str, session: SessionStore) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    /// `GET path`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    /// `POST path` with a JSON body.
    pub async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AuthError> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// `PUT path`, optionally with a JSON body.
    pub async fn put<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, AuthError> {
        self.send(Method::PUT, path, body).await
    }

    async fn send<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, AuthError> {
        let snapshot = self.session.snapshot();
        let Some(credential) = snapshot.credential else {
            return Err(AuthError::Unauthorized);
        };

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(reqwest::header::AUTHORIZATION, credential.bearer());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            log::warn!("[Api] {} {} returned 401", method, path);
            self.session.expire(snapshot.epoch);
            return Err(AuthError::Unauthorized);
        }
        if !status.is_success() {
            return Err(AuthError::NetworkError(format!("{method} {path} returned {status}")));
        }

        let bytes = response.bytes().await?;
        // Empty 2xx bodies decode as JSON null so callers can ask for `()`
        // or `serde_json::Value`.
        let bytes: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(bytes)
            .map_err(|e| AuthError::NetworkError(format!("invalid {path} response: {e}")))
    }
}
