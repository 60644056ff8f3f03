//! Email/password accounts against a hosted GoTrue auth service, plus the
//! PostgREST `profiles` table that holds usernames.
//!
//! The signed-in session is persisted in the key-value store. Every change
//! is queued to each subscriber so other components can react to sign-in
//! and sign-out without missing a transition.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::ValidationError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AuthConfig;
use crate::store::KeyValueStore;

const SESSION_KEY: &str = "auth_session";

/// Refresh this many seconds before the token actually expires
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Auth is not configured (set auth_url and anon_key)")]
    NotConfigured,

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Invalid auth link: {0}")]
    InvalidLink(String),

    /// Message reported by the auth service
    #[error("{0}")]
    Api(String),

    #[error("{0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Session store: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

impl AuthSession {
    /// Username, else the local part of the email, else `User`.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.username.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or("User")
            .to_string()
    }

    pub fn initials(&self) -> String {
        self.display_name()
            .chars()
            .take(2)
            .flat_map(char::to_uppercase)
            .collect()
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at
            .map(|at| at - EXPIRY_MARGIN_SECS <= now)
            .unwrap_or(false)
    }
}

/// Result of a sign-up request
#[derive(Debug, Clone, PartialEq)]
pub struct SignUp {
    /// Email the service registered, if it echoed one
    pub email: Option<String>,
    /// Present when the service signs the user in without email confirmation
    pub session: Option<AuthSession>,
}

/// Session from an emailed confirmation or recovery link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSession {
    pub session: AuthSession,
    /// Link type as issued by the service: `signup`, `recovery`, `magiclink`, ...
    pub kind: Option<String>,
}

impl LinkSession {
    pub fn is_recovery(&self) -> bool {
        self.kind.as_deref() == Some("recovery")
    }
}

/// The session at subscription time and a queue of every change after it.
///
/// `changes` ends once the publishing client is dropped.
pub struct SessionEvents {
    pub initial: Option<AuthSession>,
    pub changes: mpsc::UnboundedReceiver<Option<AuthSession>>,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    fn current_session(&self) -> Option<AuthSession>;

    fn subscribe(&self) -> SessionEvents;

    /// Current session, refreshed first if its token has expired.
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError>;

    async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUp, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    async fn request_password_reset(&self, email: &str) -> Result<(), AuthError>;

    async fn update_password(&self, password: &str) -> Result<(), AuthError>;

    /// Turn the URL of a confirmation or recovery email into a session.
    async fn complete_link(&self, link: &str) -> Result<LinkSession, AuthError>;
}

#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Create or update the profile row keyed by the session's user id.
    async fn upsert_profile(&self, session: &AuthSession, username: &str) -> Result<(), AuthError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Value,
}

impl GoTrueUser {
    fn username(&self) -> Option<String> {
        self.user_metadata
            .get("username")
            .and_then(Value::as_str)
            .map(String::from)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: GoTrueUser,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| chrono::Utc::now().timestamp() + secs));
        AuthSession {
            username: self.user.username(),
            user_id: self.user.id,
            email: self.user.email,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Sign-up answers with a full session when confirmation is off, a bare user otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(GoTrueUser),
}

/// Pull a readable message out of a GoTrue or PostgREST error body.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["error_description", "msg", "message", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(String::from))
        })
        .unwrap_or_else(|| status.to_string())
}

/// Query and fragment parameters of an emailed link. The fragment wins on clashes.
fn link_params(link: &str) -> Result<HashMap<String, String>, AuthError> {
    let url = Url::parse(link.trim()).map_err(|e| AuthError::InvalidLink(e.to_string()))?;
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(fragment) = url.fragment() {
        for pair in fragment.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(decode_component(key), decode_component(value));
        }
    }
    Ok(params)
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

async fn check(resp: Response) -> Result<Response, AuthError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = error_message(status, &body);
    tracing::warn!("Auth request failed ({}): {}", status, message);
    Err(AuthError::Api(message))
}

// ============================================================================
// Hosted auth client
// ============================================================================

#[derive(Clone)]
struct Endpoint {
    http: Client,
    url: String,
    anon_key: String,
}

impl Endpoint {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.url, path);
        tracing::debug!("{} {}", method, url);
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
    }
}

#[derive(Default)]
struct SessionHub {
    current: Option<AuthSession>,
    subscribers: Vec<mpsc::UnboundedSender<Option<AuthSession>>>,
}

pub struct SupabaseAuth {
    endpoint: Endpoint,
    app_url: String,
    store: Arc<dyn KeyValueStore>,
    hub: Mutex<SessionHub>,
}

impl SupabaseAuth {
    /// Build a client and restore any session persisted by an earlier run.
    pub fn new(config: &AuthConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, AuthError> {
        let (url, anon_key) = match (config.url.as_deref(), config.anon_key.as_deref()) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => (url, key),
            _ => return Err(AuthError::NotConfigured),
        };

        let restored = match store.get(SESSION_KEY) {
            Ok(Some(raw)) => serde_json::from_str::<AuthSession>(&raw)
                .map_err(|e| tracing::warn!("Discarding unreadable stored session: {}", e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read stored session: {}", e);
                None
            }
        };

        Ok(Self {
            endpoint: Endpoint {
                http: Client::new(),
                url: url.trim_end_matches('/').to_string(),
                anon_key: anon_key.to_string(),
            },
            app_url: config.app_url.trim_end_matches('/').to_string(),
            store,
            hub: Mutex::new(SessionHub {
                current: restored,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Profile client sharing this client's connection and key.
    pub fn profiles(&self) -> ProfileClient {
        ProfileClient {
            endpoint: self.endpoint.clone(),
        }
    }

    fn publish(&self, session: Option<AuthSession>) -> Result<(), AuthError> {
        match &session {
            Some(s) => self.store.set(SESSION_KEY, &serde_json::to_string(s).map_err(anyhow::Error::from)?)?,
            None => self.store.remove(SESSION_KEY)?,
        }
        let mut hub = self.hub();
        hub.subscribers.retain(|tx| tx.send(session.clone()).is_ok());
        hub.current = session;
        Ok(())
    }

    fn hub(&self) -> MutexGuard<'_, SessionHub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_user(&self, access_token: &str) -> Result<GoTrueUser, AuthError> {
        let resp = self
            .endpoint
            .request(Method::GET, "/auth/v1/user")
            .bearer_auth(access_token)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        let resp = self
            .endpoint
            .request(Method::POST, "/auth/v1/token?grant_type=refresh_token")
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let token: TokenResponse = check(resp).await?.json().await?;
        Ok(token.into_session())
    }

    fn access_token(&self) -> Result<String, AuthError> {
        self.hub()
            .current
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(AuthError::NotSignedIn)
    }
}

#[async_trait]
impl AuthService for SupabaseAuth {
    fn current_session(&self) -> Option<AuthSession> {
        self.hub().current.clone()
    }

    fn subscribe(&self) -> SessionEvents {
        let (tx, changes) = mpsc::unbounded_channel();
        let mut hub = self.hub();
        hub.subscribers.push(tx);
        SessionEvents {
            initial: hub.current.clone(),
            changes,
        }
    }

    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
        let Some(current) = self.current_session() else {
            return Ok(None);
        };
        if !current.is_expired(chrono::Utc::now().timestamp()) {
            return Ok(Some(current));
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            tracing::info!("Session expired and cannot be refreshed");
            self.publish(None)?;
            return Ok(None);
        };
        match self.refresh(refresh_token).await {
            Ok(session) => {
                tracing::debug!("Refreshed session for {}", session.user_id);
                self.publish(Some(session.clone()))?;
                Ok(Some(session))
            }
            Err(AuthError::Api(msg)) => {
                tracing::info!("Session refresh rejected: {}", msg);
                self.publish(None)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let resp = self
            .endpoint
            .request(Method::POST, "/auth/v1/token?grant_type=password")
            .json(&json!({ "email": email.trim(), "password": password }))
            .send()
            .await?;
        let token: TokenResponse = check(resp).await?.json().await?;
        let session = token.into_session();

        tracing::info!("Signed in as {}", session.user_id);
        self.publish(Some(session.clone()))?;
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUp, AuthError> {
        let path = format!(
            "/auth/v1/signup?redirect_to={}",
            urlencoding::encode(&format!("{}/auth/callback", self.app_url))
        );
        let resp = self
            .endpoint
            .request(Method::POST, &path)
            .json(&json!({
                "email": email.trim(),
                "password": password,
                "data": { "username": username.trim() },
            }))
            .send()
            .await?;

        match check(resp).await?.json::<SignUpResponse>().await? {
            SignUpResponse::Session(token) => {
                let session = token.into_session();
                tracing::info!("Signed up and signed in as {}", session.user_id);
                self.publish(Some(session.clone()))?;
                Ok(SignUp {
                    email: session.email.clone(),
                    session: Some(session),
                })
            }
            SignUpResponse::User(user) => {
                tracing::info!("Signed up {}, awaiting email confirmation", user.id);
                Ok(SignUp {
                    email: user.email,
                    session: None,
                })
            }
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if let Ok(token) = self.access_token() {
            let res = self
                .endpoint
                .request(Method::POST, "/auth/v1/logout")
                .bearer_auth(token)
                .send()
                .await;
            // The local session is dropped regardless; the server token just expires
            match res {
                Ok(resp) => {
                    if let Err(e) = check(resp).await {
                        tracing::warn!("Server sign-out failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Server sign-out failed: {}", e),
            }
        }
        self.publish(None)
    }

    async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let path = format!(
            "/auth/v1/recover?redirect_to={}",
            urlencoding::encode(&format!("{}/reset-password", self.app_url))
        );
        let resp = self
            .endpoint
            .request(Method::POST, &path)
            .json(&json!({ "email": email.trim() }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn update_password(&self, password: &str) -> Result<(), AuthError> {
        let token = self.access_token()?;
        let resp = self
            .endpoint
            .request(Method::PUT, "/auth/v1/user")
            .bearer_auth(token)
            .json(&json!({ "password": password }))
            .send()
            .await?;
        check(resp).await?;
        tracing::info!("Password updated");
        Ok(())
    }

    async fn complete_link(&self, link: &str) -> Result<LinkSession, AuthError> {
        let params = link_params(link)?;
        if let Some(message) = params.get("error_description").or_else(|| params.get("error")) {
            return Err(AuthError::Api(message.clone()));
        }
        let kind = params.get("type").cloned();

        let session = if let Some(access_token) = params.get("access_token") {
            // Implicit flow: tokens ride in the fragment, the user has to be looked up
            let user = self.fetch_user(access_token).await?;
            TokenResponse {
                access_token: access_token.clone(),
                refresh_token: params.get("refresh_token").cloned(),
                expires_in: params.get("expires_in").and_then(|v| v.parse().ok()),
                expires_at: params.get("expires_at").and_then(|v| v.parse().ok()),
                user,
            }
            .into_session()
        } else if let Some(token_hash) = params.get("token_hash") {
            let resp = self
                .endpoint
                .request(Method::POST, "/auth/v1/verify")
                .json(&json!({
                    "type": kind.as_deref().unwrap_or("email"),
                    "token_hash": token_hash,
                }))
                .send()
                .await?;
            check(resp).await?.json::<TokenResponse>().await?.into_session()
        } else {
            return Err(AuthError::InvalidLink("no access_token or token_hash".to_string()));
        };

        tracing::info!(
            "Link ({}) signed in {}",
            kind.as_deref().unwrap_or("unknown"),
            session.user_id
        );
        self.publish(Some(session.clone()))?;
        Ok(LinkSession { session, kind })
    }
}

#[derive(Clone)]
pub struct ProfileClient {
    endpoint: Endpoint,
}

#[async_trait]
impl ProfileService for ProfileClient {
    async fn upsert_profile(&self, session: &AuthSession, username: &str) -> Result<(), AuthError> {
        let resp = self
            .endpoint
            .request(Method::POST, "/rest/v1/profiles?on_conflict=id")
            .bearer_auth(&session.access_token)
            .header("Prefer", "resolution=merge-duplicates")
            .json(&json!({ "id": session.user_id, "username": username }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}
