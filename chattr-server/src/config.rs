use clap::Parser;

pub const DEFAULT_COMPANION_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Parser, Debug, Clone)]
#[command(name = "chattr-server", about = "Real-time group chat server")]
pub struct ServerConfig {
    /// Address to listen on for HTTP and WebSocket clients.
    #[arg(long, env = "CHATTR_LISTEN_ADDR", default_value = "127.0.0.1:5000")]
    pub listen_addr: String,

    /// SQLite database path. Use `:memory:` for an ephemeral store.
    #[arg(long, env = "CHATTR_DB_PATH", default_value = "chattr.db")]
    pub db_path: String,

    /// Trust X-Forwarded-For / X-Real-IP (only behind a reverse proxy).
    #[arg(long, env = "CHATTR_TRUST_PROXY")]
    pub trust_proxy: bool,

    /// Allowed CORS origin. Any origin is accepted when unset.
    #[arg(long, env = "CHATTR_CLIENT_ORIGIN")]
    pub client_origin: Option<String>,

    /// Bearer token for the admin API and admin observer sessions.
    /// The admin API is disabled when unset.
    #[arg(long, env = "CHATTR_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Directory of uploaded media, served under `/uploads/`.
    #[arg(long, env = "CHATTR_UPLOADS_DIR")]
    pub uploads_dir: Option<String>,

    /// Directory of the built web client, served as a SPA fallback.
    #[arg(long, env = "CHATTR_WEB_STATIC_DIR")]
    pub web_static_dir: Option<String>,

    /// Number of messages sent to a client on join.
    #[arg(long, env = "CHATTR_RECENT_MESSAGES", default_value = "50")]
    pub recent_messages: usize,

    /// Seconds without traffic before a WebSocket is pinged, then dropped.
    #[arg(long, env = "CHATTR_IDLE_TIMEOUT_SECS", default_value = "60")]
    pub idle_timeout_secs: u64,

    /// Interval between expired-message sweeps.
    #[arg(long, env = "CHATTR_PURGE_INTERVAL_SECS", default_value = "300")]
    pub purge_interval_secs: u64,

    /// Enable the companion participant.
    #[arg(long, env = "CHATTR_COMPANION")]
    pub companion: bool,

    #[arg(long, env = "CHATTR_COMPANION_NAME", default_value = "Kira")]
    pub companion_name: String,

    /// OpenAI-compatible chat-completions endpoint.
    #[arg(long, env = "CHATTR_COMPANION_API_URL", default_value = DEFAULT_COMPANION_API_URL)]
    pub companion_api_url: String,

    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub companion_api_key: Option<String>,

    #[arg(long, env = "CHATTR_COMPANION_MODEL", default_value = "google/gemini-2.0-flash-001")]
    pub companion_model: String,

    /// Upper bound on a single text-generation call.
    #[arg(long, env = "CHATTR_COMPANION_TIMEOUT_SECS", default_value = "20")]
    pub companion_timeout_secs: u64,

    /// TOML file overriding the companion persona.
    #[arg(long, env = "CHATTR_COMPANION_PROFILE")]
    pub companion_profile: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_string(),
            db_path: ":memory:".to_string(),
            trust_proxy: false,
            client_origin: None,
            admin_token: None,
            uploads_dir: None,
            web_static_dir: None,
            recent_messages: 50,
            idle_timeout_secs: 60,
            purge_interval_secs: 300,
            companion: false,
            companion_name: "Kira".to_string(),
            companion_api_url: DEFAULT_COMPANION_API_URL.to_string(),
            companion_api_key: None,
            companion_model: "google/gemini-2.0-flash-001".to_string(),
            companion_timeout_secs: 20,
            companion_profile: None,
        }
    }
}

impl ServerConfig {
    pub fn is_ephemeral(&self) -> bool {
        self.db_path == ":memory:"
    }

    /// Constant-time comparison against the configured admin token.
    pub fn admin_token_matches(&self, presented: &str) -> bool {
        match &self.admin_token {
            Some(expected) if !expected.is_empty() => {
                let a = expected.as_bytes();
                let b = presented.as_bytes();
                a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
            }
            _ => false,
        }
    }
}
