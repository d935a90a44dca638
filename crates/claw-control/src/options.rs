//! Client options.

use std::time::Duration;

use crate::protocol::PROTOCOL_VERSION;
use crate::reconnect::ReconnectPolicy;

/// Client version reported in the connect descriptor.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Scopes an operator client asks for by default.
pub const DEFAULT_OPERATOR_SCOPES: [&str; 3] =
    ["operator.admin", "operator.approvals", "operator.pairing"];

/// How a [`crate::GatewayClient`] connects and identifies itself.
#[derive(Debug, Clone)]
pub struct GatewayClientOptions {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Explicit gateway token, used when no device token is cached.
    pub token: Option<String>,
    /// Shared gateway password.
    pub password: Option<String>,
    /// Role requested in the handshake.
    pub role: String,
    /// Scopes requested in the handshake.
    pub scopes: Vec<String>,
    /// Client id.
    pub client_id: String,
    /// Client mode.
    pub client_mode: String,
    /// Client version.
    pub client_version: String,
    /// Human-readable client name.
    pub display_name: Option<String>,
    /// Platform string.
    pub platform: String,
    /// Per-process instance id.
    pub instance_id: String,
    /// User agent.
    pub user_agent: String,
    /// Locale tag.
    pub locale: String,
    /// Lowest protocol revision offered.
    pub min_protocol: u32,
    /// Highest protocol revision offered.
    pub max_protocol: u32,
    /// Wait after transport open before sending `connect` unprompted.
    pub handshake_delay: Duration,
    /// Upper bound on opening the transport.
    pub connect_timeout: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectPolicy,
    /// Sign the handshake with the device identity and use cached device
    /// tokens.
    pub device_auth: bool,
}

impl GatewayClientOptions {
    /// Options for `url` with defaults for everything else.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            password: None,
            role: "operator".to_string(),
            scopes: DEFAULT_OPERATOR_SCOPES.iter().map(|s| (*s).to_string()).collect(),
            client_id: "cli".to_string(),
            client_mode: "cli".to_string(),
            client_version: CLIENT_VERSION.to_string(),
            display_name: None,
            platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            instance_id: uuid::Uuid::new_v4().to_string(),
            user_agent: format!("claw-control/{CLIENT_VERSION}"),
            locale: "en-US".to_string(),
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            handshake_delay: Duration::from_millis(750),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            device_auth: true,
        }
    }

    /// Set the explicit gateway token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = non_blank(token.into());
        self
    }

    /// Set the shared password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = non_blank(password.into());
        self
    }

    /// Set the requested role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Set the requested scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Set client id and mode.
    #[must_use]
    pub fn with_client(mut self, id: impl Into<String>, mode: impl Into<String>) -> Self {
        self.client_id = id.into();
        self.client_mode = mode.into();
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the handshake debounce.
    #[must_use]
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Set the transport open timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnection backoff.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable or disable device signing and the device token cache.
    #[must_use]
    pub fn with_device_auth(mut self, enabled: bool) -> Self {
        self.device_auth = enabled;
        self
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
