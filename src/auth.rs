//! Identity endpoint client and authentication types.
//!
//! Talks to the remote identity API:
//!
//! - `POST /auth/login {email, password} -> {token, user}`
//! - `POST /auth/signup {...} -> {token, user?}`
//! - `GET  /auth/me` (bearer) `-> profile`
//!
//! The [`IdentityApi`] trait is the seam the session store depends on, so
//! the store can be driven by a fake in tests.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Server-assigned user identifier. Push frames address users by this id.
pub type UserId = i64;

/// Errors surfaced by session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Login or signup rejected by the identity endpoint.
    InvalidCredentials,
    /// The credential is missing, expired or revoked (HTTP 401).
    Unauthorized,
    /// The identity endpoint could not be reached or answered unusably.
    NetworkError(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "Invalid credentials"),
            Self::Unauthorized => write!(f, "Session is not authorized"),
            Self::NetworkError(msg) => write!(f, "Network error: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}

/// Identity and organizational attributes of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Server-side numeric id.
    pub id: UserId,
    /// Stable external identifier.
    #[serde(default)]
    pub uuid: String,
    /// Given name.
    #[serde(default)]
    pub first_name: String,
    /// Family name.
    #[serde(default)]
    pub last_name: String,
    /// Login email.
    #[serde(default)]
    pub email: String,
    /// Department name.
    #[serde(default)]
    pub department: String,
    /// Job title.
    #[serde(default)]
    pub position: String,
    /// Portal role (e.g. `employee`, `manager`, `admin`).
    #[serde(default)]
    pub role: String,
}

impl UserProfile {
    /// "First Last", falling back to the email when no name is set.
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

/// Opaque bearer token. Zeroed on drop and redacted from `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    /// Wrap a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    /// The raw token, for the `Authorization` header and the push URL.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.as_str())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} chars>)", self.0.len())
    }
}

/// Body of `POST /auth/login`.
#[derive(Clone, Serialize)]
pub struct LoginRequest {
    /// Login identifier (email).
    #[serde(rename = "email")]
    pub identifier: String,
    /// Password.
    #[serde(rename = "password")]
    pub secret: Zeroizing<String>,
}

impl LoginRequest {
    /// Build a login request.
    pub fn new(identifier: &str, secret: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            secret: Zeroizing::new(secret.to_string()),
        }
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// Body of `POST /auth/signup`.
#[derive(Clone, Serialize)]
pub struct SignupRequest {
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Login email.
    pub email: String,
    /// Password.
    pub password: Zeroizing<String>,
    /// Department the new employee joins.
    pub department_id: i64,
    /// Job title.
    pub position: String,
    /// Requested role; the server picks a default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl fmt::Debug for SignupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignupRequest")
            .field("email", &self.email)
            .field("department_id", &self.department_id)
            .field("position", &self.position)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Successful login/signup response.
#[derive(Deserialize)]
pub struct AuthResponse {
    /// Newly issued bearer token.
    pub token: String,
    /// Profile of the authenticated user. Signup may omit it.
    #[serde(default, alias = "profile")]
    pub user: Option<UserProfile>,
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Remote identity collaborator.
#[async_trait]
pub trait IdentityApi: Send + Sync + fmt::Debug {
    /// Exchange credentials for a token and profile.
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, AuthError>;

    /// Register a new account and receive a token.
    async fn signup(&self, request: &SignupRequest) -> Result<AuthResponse, AuthError>;

    /// Fetch the profile tied to `credential`.
    async fn me(&self, credential: &Credential) -> Result<UserProfile, AuthError>;
}

/// [`IdentityApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpIdentityApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityApi {
    /// Create a client for `base_url` (e.g. `http://localhost:5000/api`).
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn exchange<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<AuthResponse, AuthError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<AuthResponse>()
                .await
                .map_err(|e| AuthError::NetworkError(format!("invalid {path} response: {e}")));
        }

        if is_rejection(status) {
            log::info!("[Session] {} rejected with {}", path, status);
            return Err(AuthError::InvalidCredentials);
        }

        let body = response.text().await.unwrap_or_default();
        Err(AuthError::NetworkError(format!(
            "{path} returned {status}: {}",
            truncate(&body, 200)
        )))
    }
}

/// Statuses the identity endpoint uses to refuse a credential exchange.
fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::CONFLICT
            | StatusCode::UNPROCESSABLE_ENTITY
    )
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl IdentityApi for HttpIdentityApi {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, AuthError> {
        self.exchange("/auth/login", request).await
    }

    async fn signup(&self, request: &SignupRequest) -> Result<AuthResponse, AuthError> {
        self.exchange("/auth/signup", request).await
    }

    async fn me(&self, credential: &Credential) -> Result<UserProfile, AuthError> {
        let response = self
            .client
            .get(self.url("/auth/me"))
            .header(reqwest::header::AUTHORIZATION, credential.bearer())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => response
                .json::<UserProfile>()
                .await
                .map_err(|e| AuthError::NetworkError(format!("invalid /auth/me response: {e}"))),
            StatusCode::UNAUTHORIZED => Err(AuthError::Unauthorized),
            status => Err(AuthError::NetworkError(format!(
                "/auth/me returned {status}"
            ))),
        }
    }
}
