use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use url::Url;

use crate::auth::DEFAULT_AUTH_COOKIE;

#[derive(Debug, Parser)]
#[command(
    name = "memo-relay",
    author,
    version,
    about = "Realtime memo collaboration relay"
)]
pub struct Cli {
    /// Interface to bind the websocket listener to.
    #[arg(long, env = "MEMO_RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the websocket listener to.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// HMAC secret shared with the token issuer.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Base URL of the REST backend that owns memo state.
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:3000")]
    pub api_base_url: String,

    /// Token presented to the backend on every forwarded mutation.
    #[arg(long, env = "INTERNAL_SERVICE_TOKEN", hide_env_values = true)]
    pub internal_service_token: Option<String>,

    /// Cookie that carries the session token.
    #[arg(long, env = "MEMO_RELAY_AUTH_COOKIE", default_value = DEFAULT_AUTH_COOKIE)]
    pub auth_cookie: String,

    /// Upper bound on a single backend call.
    #[arg(long, env = "MEMO_RELAY_BRIDGE_TIMEOUT_SECS", default_value_t = 10)]
    pub bridge_timeout_secs: u64,

    /// Frames buffered per connection before broadcasts start dropping.
    #[arg(long, env = "MEMO_RELAY_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "MEMO_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    pub api_base_url: Url,
    pub internal_service_token: Option<String>,
    pub auth_cookie: String,
    pub bridge_timeout: Duration,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("jwt_secret", &"<redacted>")
            .field("api_base_url", &self.api_base_url.as_str())
            .field(
                "internal_service_token",
                &self.internal_service_token.as_ref().map(|_| "<redacted>"),
            )
            .field("auth_cookie", &self.auth_cookie)
            .field("bridge_timeout", &self.bridge_timeout)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.jwt_secret.trim().is_empty() {
            bail!("JWT_SECRET must not be empty");
        }
        let host: IpAddr = cli
            .host
            .parse()
            .with_context(|| format!("invalid listen host: {}", cli.host))?;
        let api_base_url = Url::parse(&cli.api_base_url)
            .with_context(|| format!("invalid API base url: {}", cli.api_base_url))?;
        if !matches!(api_base_url.scheme(), "http" | "https") {
            bail!(
                "API base url must be http or https, got {}",
                api_base_url.scheme()
            );
        }
        if cli.bridge_timeout_secs == 0 {
            bail!("bridge timeout must be at least one second");
        }
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }
        let auth_cookie = cli.auth_cookie.trim().to_string();
        if auth_cookie.is_empty() {
            bail!("auth cookie name must not be empty");
        }

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(host, cli.port),
            jwt_secret: cli.jwt_secret,
            api_base_url,
            internal_service_token: cli
                .internal_service_token
                .filter(|token| !token.trim().is_empty()),
            auth_cookie,
            bridge_timeout: Duration::from_secs(cli.bridge_timeout_secs),
            outbound_buffer: cli.outbound_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
