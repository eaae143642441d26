//! Server state and HTTP/WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::companion::{self, Companion, TextGenerator};
use crate::config::ServerConfig;
use crate::db::Db;
use crate::error::{ChatError, ChatResult};
use crate::model::GlobalSettings;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::router::BroadcastRouter;

/// Everything the connection actors, admin surface and background tasks
/// share. Locks are never held across an await.
pub struct SharedState {
    pub config: ServerConfig,
    pub db: Mutex<Db>,
    pub registry: SessionRegistry,
    pub limiter: RateLimiter,
    pub router: BroadcastRouter,
    /// Present when the companion is enabled.
    pub companion: Option<Companion>,
    pub started_at: Instant,
}

impl SharedState {
    /// Build state around an open store. The companion, if enabled, talks
    /// to the configured chat-completions endpoint.
    pub fn new(config: ServerConfig, db: Db) -> Result<Self> {
        let persona = load_persona(&config)?;
        let name = persona.as_ref().map_or(config.companion_name.as_str(), |p| p.name.as_str());
        let generator: Arc<dyn TextGenerator> = Arc::new(companion::OpenAiCompatible::from_config(&config, name));
        Self::assemble(config, db, persona, generator)
    }

    /// Build state with a custom text generator (for testing).
    pub fn with_generator(config: ServerConfig, db: Db, generator: Arc<dyn TextGenerator>) -> Result<Self> {
        let persona = load_persona(&config)?;
        Self::assemble(config, db, persona, generator)
    }

    fn assemble(
        config: ServerConfig,
        db: Db,
        persona: Option<companion::Persona>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self> {
        let companion = match persona {
            Some(persona) => {
                let identity = companion::ensure_identity(&db, &persona.name)
                    .context("Failed to create companion identity")?;
                tracing::info!(name = %identity.username, user_id = %identity.id, "Companion enabled");
                Some(Companion::new(
                    persona,
                    identity,
                    generator,
                    Duration::from_secs(config.companion_timeout_secs),
                )?)
            }
            None => None,
        };

        Ok(Self {
            config,
            db: Mutex::new(db),
            registry: SessionRegistry::new(),
            limiter: RateLimiter::new(),
            router: BroadcastRouter::new(),
            companion,
            started_at: Instant::now(),
        })
    }

    /// Run a closure with the store. Store failures propagate as
    /// [`ChatError::Store`] and are logged.
    pub fn with_db<F, R, E>(&self, f: F) -> ChatResult<R>
    where
        F: FnOnce(&Db) -> Result<R, E>,
        E: Into<ChatError>,
    {
        let db = self.db.lock();
        f(&db).map_err(|e| {
            let err = e.into();
            if let ChatError::Store(ref inner) = err {
                tracing::error!("Database error: {inner}");
            }
            err
        })
    }

    /// Current runtime policy, created with defaults on first read.
    pub fn settings(&self) -> ChatResult<GlobalSettings> {
        self.with_db(|db| db.get_global_settings())
    }

    /// Delete expired messages and forget stale limiter windows.
    pub fn purge(&self) -> ChatResult<usize> {
        let removed = self.with_db(|db| db.purge_expired(chrono::Utc::now()))?;
        let window = Duration::from_secs(self.settings()?.rate_limit_window_seconds as u64);
        self.limiter.prune(window);
        Ok(removed)
    }
}

/// The companion's persona, when it is enabled.
fn load_persona(config: &ServerConfig) -> Result<Option<companion::Persona>> {
    if !config.companion {
        return Ok(None);
    }
    let persona = match &config.companion_profile {
        Some(path) => companion::Persona::load(path, &config.companion_name)?,
        None => companion::Persona::for_name(&config.companion_name),
    };
    Ok(Some(persona))
}

pub struct Server {
    config: ServerConfig,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, generator: None }
    }

    /// Create a server with a custom text generator (for testing).
    pub fn with_generator(config: ServerConfig, generator: Arc<dyn TextGenerator>) -> Self {
        Self { config, generator: Some(generator) }
    }

    /// Build SharedState, opening the database.
    pub fn build_state(&self) -> Result<Arc<SharedState>> {
        let db = if self.config.is_ephemeral() {
            tracing::warn!("Using an in-memory database; nothing survives a restart");
            Db::open_memory()
        } else {
            tracing::info!("Opening database: {}", self.config.db_path);
            Db::open(&self.config.db_path)
        }
        .map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?;

        let config = self.config.clone();
        let state = match &self.generator {
            Some(generator) => SharedState::with_generator(config, db, Arc::clone(generator))?,
            None => SharedState::new(config, db)?,
        };
        Ok(Arc::new(state))
    }

    /// Serve until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("HTTP/WebSocket listener on {}", self.config.listen_addr);

        spawn_maintenance(Arc::clone(&state));

        let app = crate::web::router(state);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutting down");
            })
            .await?;
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        spawn_maintenance(Arc::clone(&state));

        let app = crate::web::router(Arc::clone(&state));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
            Ok(())
        });

        Ok((addr, state, handle))
    }
}

/// Periodic expiry sweep.
fn spawn_maintenance(state: Arc<SharedState>) {
    let every = Duration::from_secs(state.config.purge_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip first immediate tick
        loop {
            interval.tick().await;
            match state.purge() {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "Purged expired messages"),
                Err(e) => tracing::error!("Expiry sweep failed: {e}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_db_maps_store_errors() {
        let state = SharedState::new(ServerConfig::default(), Db::open_memory().unwrap()).unwrap();
        let err = state
            .with_db(|_db| -> rusqlite::Result<()> { Err(rusqlite::Error::InvalidQuery) })
            .unwrap_err();
        assert!(matches!(err, ChatError::Store(_)));

        let err = state
            .with_db(|_db| -> ChatResult<()> { Err(ChatError::not_found("gone")) })
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn companion_only_when_enabled() {
        let state = SharedState::new(ServerConfig::default(), Db::open_memory().unwrap()).unwrap();
        assert!(state.companion.is_none());

        let config = ServerConfig { companion: true, ..Default::default() };
        let state = SharedState::new(config, Db::open_memory().unwrap()).unwrap();
        let companion = state.companion.as_ref().unwrap();
        assert_eq!(companion.identity().username, "Kira");
        // Identity persisted, but never online
        assert!(state.with_db(|db| db.find_user_by_username("kira")).unwrap().is_some());
        assert_eq!(state.registry.online_count(), 0);
    }

    #[test]
    fn purge_sweeps_expired() {
        let state = SharedState::new(ServerConfig::default(), Db::open_memory().unwrap()).unwrap();
        assert_eq!(state.purge().unwrap(), 0);
    }
}
