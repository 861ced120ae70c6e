//! REST client for the chatsense backend.
//!
//! Authentication is a bearer token returned by `/api/login`. The backend
//! also sets a session cookie, so the underlying `reqwest::Client` keeps a
//! cookie store; share it with the SSE transport via [`ApiClient::http_client`].

use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::aggregate::{Contributor, SentimentCounts};
use crate::error::ApiError;
use crate::session::ChannelApi;

/// A logged-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

impl User {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() { self.email.clone() } else { name.to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    user: User,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    user: User,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct SaveHistoryResponse {
    #[serde(default)]
    history_id: String,
}

impl SaveHistoryResponse {
    fn into_id(self) -> Result<String, ApiError> {
        if self.history_id.is_empty() {
            return Err(ApiError::MissingField("history_id"));
        }
        Ok(self.history_id)
    }
}

/// Payload stored by `POST /api/history/save`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub streamer_name: String,
    pub total_chats: u64,
    pub sentiment_count: SentimentCounts,
    pub top_positive: Vec<Contributor>,
    pub top_negative: Vec<Contributor>,
    pub top_neutral: Vec<Contributor>,
    /// Session length in whole seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

/// One saved analysis as returned by `GET /api/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub streamer_name: String,
    #[serde(default)]
    pub total_chats: u64,
    #[serde(default)]
    pub sentiment_count: HistoryCounts,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Kept as the backend sends it; the format is not stable.
    #[serde(default)]
    pub created_at: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCounts {
    #[serde(default)]
    pub positive: u64,
    #[serde(default)]
    pub neutral: u64,
    #[serde(default)]
    pub negative: u64,
}

/// Turn a bare channel name into the Twitch URL the backend expects.
pub fn twitch_url(input: &str) -> String {
    let input = input.trim();
    if input.contains("twitch.tv/") {
        input.to_string()
    } else {
        format!("https://www.twitch.tv/{}", input.trim_start_matches('@'))
    }
}

#[derive(Debug, Clone)]
struct AuthState {
    token: String,
    user: User,
}

/// Client for the backend's REST endpoints.
#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: RwLock<Option<AuthState>>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(concat!("chatsense/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying client, sharing this client's cookie store.
    pub fn http_client(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.auth.read().as_ref().map(|a| a.user.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth.read().is_some()
    }

    /// Log in with email and password.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let resp: LoginResponse = self
            .send(
                self.request(Method::POST, "/api/login")
                    .json(&json!({ "email": email, "password": password })),
            )
            .await?;
        tracing::info!(email = %resp.user.email, "Logged in");
        *self.auth.write() = Some(AuthState {
            token: resp.access_token,
            user: resp.user.clone(),
        });
        Ok(resp.user)
    }

    /// Re-validate the current token and refresh the cached user.
    pub async fn authenticate(&self) -> Result<User, ApiError> {
        let resp: UserResponse = self.send(self.request(Method::GET, "/api/authenticate")).await?;
        if let Some(auth) = self.auth.write().as_mut() {
            auth.user = resp.user.clone();
        }
        Ok(resp.user)
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self
            .send::<serde_json::Value>(self.request(Method::POST, "/api/logout"))
            .await;
        // Local credentials go regardless of what the backend said.
        *self.auth.write() = None;
        result.map(|_| ())
    }

    /// Ask the backend to start reading a channel. Returns the canonical name.
    pub async fn start_channel(&self, url: &str) -> Result<String, ApiError> {
        let resp: ConnectResponse = self
            .send(
                self.request(Method::POST, "/api/twitch/connect")
                    .json(&json!({ "url": twitch_url(url) })),
            )
            .await?;
        Ok(resp.channel)
    }

    pub async fn stop_channel(&self, channel: &str) -> Result<(), ApiError> {
        self.send::<serde_json::Value>(
            self.request(Method::POST, "/api/twitch/disconnect")
                .json(&json!({ "channel": channel })),
        )
        .await
        .map(|_| ())
    }

    pub async fn log_analysis_start(&self, channel: &str) -> Result<(), ApiError> {
        self.send::<serde_json::Value>(
            self.request(Method::POST, "/api/log/analysis-start")
                .json(&json!({ "streamer": channel })),
        )
        .await
        .map(|_| ())
    }

    /// Store a finished analysis. Returns the new history id.
    pub async fn save_history(&self, summary: &AnalysisSummary) -> Result<String, ApiError> {
        let resp: SaveHistoryResponse = self
            .send(self.request(Method::POST, "/api/history/save").json(summary))
            .await?;
        resp.into_id()
    }

    pub async fn list_history(&self) -> Result<Vec<HistoryEntry>, ApiError> {
        self.send(self.request(Method::GET, "/api/history")).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base_url, path));
        match self.auth.read().as_ref() {
            Some(auth) => req.bearer_auth(&auth.token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthenticated);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_detail(&body),
            });
        }
        Ok(resp.json().await?)
    }
}

/// The backend reports errors as `{"detail": "..."}`.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

impl ChannelApi for ApiClient {
    fn is_authenticated(&self) -> bool {
        self.is_logged_in()
    }

    async fn start_channel(&self, url: &str) -> Result<String, ApiError> {
        ApiClient::start_channel(self, url).await
    }

    async fn stop_channel(&self, channel: &str) -> Result<(), ApiError> {
        ApiClient::stop_channel(self, channel).await
    }

    async fn log_analysis_start(&self, channel: &str) -> Result<(), ApiError> {
        ApiClient::log_analysis_start(self, channel).await
    }

    async fn save_history(&self, summary: &AnalysisSummary) -> Result<String, ApiError> {
        ApiClient::save_history(self, summary).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        ApiClient::logout(self).await
    }
}
