use std::env;
use std::time::Duration;

use clap::ValueEnum;
use relay_proto::IceServer;
use url::Url;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "web page channel";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on a single reliable-channel chunk regardless of what the peer
/// negotiates.
pub const CHUNK_CAP: usize = 16 * 1024;
/// Maximum message size advertised for the local side of the channel.
pub const LOCAL_MAX_MESSAGE_SIZE: usize = 64 * 1024;
/// Ceiling on outbound bytes buffered by an incremental transfer.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid relay endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("{name} must be a number, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{name} has unsupported value {value:?}")]
    InvalidChoice { name: &'static str, value: String },
}

/// Relay address split into the parts the page origin would supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".into(),
            host: "localhost".into(),
            port: None,
            path: "ws".into(),
        }
    }
}

impl EndpointConfig {
    /// `scheme://host[:port]/path`
    pub fn to_url(&self) -> Result<Url, ConfigError> {
        let mut raw = format!("{}://{}", self.scheme, self.host);
        if let Some(port) = self.port {
            raw.push(':');
            raw.push_str(&port.to_string());
        }
        raw.push('/');
        raw.push_str(self.path.trim_start_matches('/'));
        let url = Url::parse(&raw).map_err(|err| ConfigError::InvalidEndpoint {
            url: raw.clone(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidEndpoint {
                url: raw,
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }
}

/// Which side produces the first offer of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationRole {
    /// Wait for the remote device to offer.
    #[default]
    Answer,
    Offer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CodecPreference {
    H264,
    Vp8,
    Vp9,
}

impl CodecPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "h264" => Some(CodecPreference::H264),
            "vp8" => Some(CodecPreference::Vp8),
            "vp9" => Some(CodecPreference::Vp9),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            CodecPreference::H264 => "video/H264",
            CodecPreference::Vp8 => "video/VP8",
            CodecPreference::Vp9 => "video/VP9",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub local_max_message_size: usize,
    pub chunk_cap: usize,
    pub max_buffered: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            local_max_message_size: LOCAL_MAX_MESSAGE_SIZE,
            chunk_cap: CHUNK_CAP,
            max_buffered: MAX_BUFFERED_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,
    pub reconnect_delay: Duration,
    /// Servers used for the first session; later sessions use whatever the
    /// relay announced last.
    pub ice_servers: Vec<IceServer>,
    pub role: NegotiationRole,
    pub talk_back: bool,
    pub recording: bool,
    pub codec_preference: Option<CodecPreference>,
    pub channel_label: String,
    pub transfer: TransferLimits,
    pub status_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            role: NegotiationRole::default(),
            talk_back: true,
            recording: true,
            codec_preference: None,
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            transfer: TransferLimits::default(),
            status_interval: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };

        let endpoint = EndpointConfig {
            scheme: lookup("LOOKOUT_RELAY_SCHEME").unwrap_or(defaults.endpoint.scheme),
            host: lookup("LOOKOUT_RELAY_HOST").unwrap_or(defaults.endpoint.host),
            port: parse_number(&lookup, "LOOKOUT_RELAY_PORT")?,
            path: lookup("LOOKOUT_RELAY_PATH").unwrap_or(defaults.endpoint.path),
        };

        let reconnect_delay = parse_number::<u64, _>(&lookup, "LOOKOUT_RECONNECT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay);

        let ice_servers = if flag("LOOKOUT_DISABLE_STUN", false) {
            Vec::new()
        } else {
            let url = lookup("LOOKOUT_STUN_URL").unwrap_or_else(|| DEFAULT_STUN_URL.into());
            vec![IceServer::stun(url)]
        };

        let role = match lookup("LOOKOUT_ROLE").as_deref() {
            None | Some("answer") => NegotiationRole::Answer,
            Some("offer") => NegotiationRole::Offer,
            Some(other) => {
                return Err(ConfigError::InvalidChoice {
                    name: "LOOKOUT_ROLE",
                    value: other.into(),
                });
            }
        };

        let codec_preference = match lookup("LOOKOUT_CODEC") {
            Some(value) => Some(CodecPreference::parse(&value).ok_or(
                ConfigError::InvalidChoice {
                    name: "LOOKOUT_CODEC",
                    value,
                },
            )?),
            None => None,
        };

        let status_interval = parse_number::<u64, _>(&lookup, "LOOKOUT_STATUS_INTERVAL_MS")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(Self {
            endpoint,
            reconnect_delay,
            ice_servers,
            role,
            talk_back: flag("LOOKOUT_TALK_BACK", defaults.talk_back),
            recording: flag("LOOKOUT_RECORDING", defaults.recording),
            codec_preference,
            channel_label: lookup("LOOKOUT_CHANNEL_LABEL").unwrap_or(defaults.channel_label),
            transfer: defaults.transfer,
            status_interval,
        })
    }

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        self.endpoint.to_url()
    }
}

fn parse_number<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(None),
    }
}
