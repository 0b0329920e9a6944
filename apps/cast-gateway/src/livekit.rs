//! Room and egress management against a LiveKit server.
//!
//! Talks to the server's Twirp JSON API with short-lived HS256 tokens
//! signed by the configured API secret.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LiveKitSettings;

/// Length of generated room names and participant identities.
pub const RANDOM_ID_LEN: usize = 10;

const PARTICIPANT_TOKEN_TTL_HOURS: i64 = 6;
const SERVICE_TOKEN_TTL_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum LiveKitError {
    #[error("livekit request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("livekit answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to sign livekit token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Room {
    #[serde(default)]
    pub sid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EgressInfo {
    #[serde(alias = "egressId")]
    pub egress_id: String,
    #[serde(default, alias = "roomName")]
    pub room_name: String,
}

/// Room and egress operations the REST surface needs.
#[async_trait]
pub trait RoomService: Send + Sync + 'static {
    async fn create_room(&self, name: &str) -> Result<Room, LiveKitError>;

    /// Mints a join token for `identity` in `room`.
    fn participant_token(
        &self,
        room: &str,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<String, LiveKitError>;

    /// Starts a composite recording of `room` pushed to `url` over RTMP.
    async fn start_rtmp_egress(&self, room: &str, url: &str) -> Result<EgressInfo, LiveKitError>;

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo, LiveKitError>;
}

pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_join: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_create: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    room_record: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    can_publish: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    can_subscribe: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AccessClaims {
    iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    nbf: i64,
    exp: i64,
    video: VideoGrant,
}

pub struct LiveKitClient {
    base_url: String,
    api_key: String,
    encoding_key: EncodingKey,
    http: reqwest::Client,
}

impl LiveKitClient {
    pub fn new(settings: &LiveKitSettings) -> Self {
        Self {
            base_url: http_base_url(&settings.host),
            api_key: settings.api_key.clone(),
            encoding_key: EncodingKey::from_secret(settings.api_secret.as_bytes()),
            http: reqwest::Client::new(),
        }
    }

    fn sign(
        &self,
        identity: Option<&str>,
        display_name: Option<&str>,
        video: VideoGrant,
        ttl: Duration,
    ) -> Result<String, LiveKitError> {
        let now = Utc::now();
        let claims = AccessClaims {
            iss: self.api_key.clone(),
            sub: identity.map(str::to_string),
            name: display_name.map(str::to_string),
            nbf: now.timestamp(),
            exp: (now + ttl).timestamp(),
            video,
        };
        let header = Header::new(Algorithm::HS256);
        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }

    fn service_token(&self, video: VideoGrant) -> Result<String, LiveKitError> {
        self.sign(
            None,
            None,
            video,
            Duration::minutes(SERVICE_TOKEN_TTL_MINUTES),
        )
    }

    async fn twirp<B, R>(&self, method: &str, body: &B, video: VideoGrant) -> Result<R, LiveKitError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let token = self.service_token(video)?;
        let url = format!("{}/twirp/{method}", self.base_url);
        debug!(%url, "livekit request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LiveKitError::Status { status, body });
        }
        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl RoomService for LiveKitClient {
    async fn create_room(&self, name: &str) -> Result<Room, LiveKitError> {
        let room: Room = self
            .twirp(
                "livekit.RoomService/CreateRoom",
                &serde_json::json!({ "name": name }),
                VideoGrant {
                    room_create: true,
                    ..Default::default()
                },
            )
            .await?;
        info!(room = %room.name, sid = %room.sid, "livekit room created");
        Ok(room)
    }

    fn participant_token(
        &self,
        room: &str,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<String, LiveKitError> {
        self.sign(
            Some(identity),
            display_name,
            VideoGrant {
                room: Some(room.to_string()),
                room_join: true,
                can_publish: Some(true),
                can_subscribe: Some(true),
                ..Default::default()
            },
            Duration::hours(PARTICIPANT_TOKEN_TTL_HOURS),
        )
    }

    async fn start_rtmp_egress(&self, room: &str, url: &str) -> Result<EgressInfo, LiveKitError> {
        let egress: EgressInfo = self
            .twirp(
                "livekit.Egress/StartRoomCompositeEgress",
                &serde_json::json!({
                    "room_name": room,
                    "preset": "H264_720P_30",
                    "stream_outputs": [{ "protocol": "RTMP", "urls": [url] }],
                }),
                VideoGrant {
                    room: Some(room.to_string()),
                    room_record: true,
                    ..Default::default()
                },
            )
            .await?;
        info!(room, egress_id = %egress.egress_id, "rtmp egress started");
        Ok(egress)
    }

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo, LiveKitError> {
        let egress: EgressInfo = self
            .twirp(
                "livekit.Egress/StopEgress",
                &serde_json::json!({ "egress_id": egress_id }),
                VideoGrant {
                    room_record: true,
                    ..Default::default()
                },
            )
            .await?;
        info!(egress_id, room = %egress.room_name, "egress stopped");
        Ok(egress)
    }
}

/// LiveKit hosts are often configured with their websocket scheme.
fn http_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if let Some(rest) = host.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = host.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}
