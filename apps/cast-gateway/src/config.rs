use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use cast_signal::webrtc_engine::DEFAULT_STUN_SERVER;
use cast_signal::{CoordinatorConfig, WebRtcEngineConfig};
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MediaEngineKind {
    /// Real peer connections through the `webrtc` crate.
    Webrtc,
    /// In-memory endpoints; answers offers without touching the network.
    Loopback,
}

#[derive(Debug, Parser)]
#[command(
    name = "cast-gateway",
    author,
    version,
    about = "Signaling and room/egress gateway for browser screen sharing"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CAST_GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// STUN servers handed to every peer connection.
    #[arg(
        long,
        env = "CAST_STUN_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    pub stun_servers: Vec<String>,

    /// First UDP port for ICE host candidates.
    #[arg(long, env = "CAST_ICE_PORT_START")]
    pub ice_port_start: Option<u16>,

    /// Last UDP port for ICE host candidates.
    #[arg(long, env = "CAST_ICE_PORT_END")]
    pub ice_port_end: Option<u16>,

    /// Public address advertised in host candidates (NAT 1:1).
    #[arg(long, env = "CAST_ICE_PUBLIC_IP", value_delimiter = ',')]
    pub ice_public_ip: Vec<String>,

    #[arg(long, env = "CAST_MEDIA_ENGINE", value_enum, default_value_t = MediaEngineKind::Webrtc)]
    pub media_engine: MediaEngineKind,

    /// Remove sessions stuck mid-negotiation after this many seconds (0 disables).
    #[arg(long, env = "CAST_STALE_NEGOTIATION_SECS", default_value_t = 0)]
    pub stale_negotiation_secs: u64,

    #[arg(long, env = "CAST_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CAST_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "CAST_GATEWAY_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,

    #[arg(long, env = "LIVEKIT_HOST")]
    pub livekit_host: Option<String>,

    #[arg(long, env = "LIVEKIT_API_KEY")]
    pub livekit_api_key: Option<String>,

    #[arg(long, env = "LIVEKIT_API_SECRET", hide_env_values = true)]
    pub livekit_api_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub media_engine: MediaEngineKind,
    pub webrtc: WebRtcEngineConfig,
    pub coordinator: CoordinatorConfig,
    pub shutdown_grace: Duration,
    pub otel_stdout: bool,
    pub livekit: Option<LiveKitSettings>,
}

#[derive(Clone)]
pub struct LiveKitSettings {
    pub host: String,
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for LiveKitSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveKitSettings")
            .field("host", &self.host)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let udp_port_range = match (cli.ice_port_start, cli.ice_port_end) {
            (Some(start), Some(end)) if start <= end => Some((start, end)),
            (Some(start), Some(end)) => {
                bail!("ICE port range is inverted: {start} > {end}")
            }
            (None, None) => None,
            _ => bail!("--ice-port-start and --ice-port-end must be set together"),
        };

        let stale_negotiation_timeout = match cli.stale_negotiation_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let livekit = match (
            normalize_opt(cli.livekit_host),
            normalize_opt(cli.livekit_api_key),
            normalize_opt(cli.livekit_api_secret),
        ) {
            (Some(host), Some(api_key), Some(api_secret)) => Some(LiveKitSettings {
                host,
                api_key,
                api_secret,
            }),
            _ => None,
        };

        Ok(GatewayConfig {
            listen_addr,
            media_engine: cli.media_engine,
            webrtc: WebRtcEngineConfig {
                stun_servers: normalize_list(cli.stun_servers),
                udp_port_range,
                public_ips: normalize_list(cli.ice_public_ip),
            },
            coordinator: CoordinatorConfig {
                stale_negotiation_timeout,
                reap_interval: Duration::from_secs(cli.reap_interval_secs.max(1)),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            otel_stdout: cli.otel_stdout,
            livekit,
        })
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn normalize_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|value| normalize_opt(Some(value)))
        .collect()
}
