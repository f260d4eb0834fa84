use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use quarry_core::{EngineConfig, HuntEngine, RateGate};
use quarry_events::EventBus;
use quarry_judge::JudgeClient;
use quarry_providers::ModelGateway;
use quarry_store::{HeartbeatBoard, JobLog, SessionStore};

mod http;

pub use http::router;

/// Everything the HTTP handlers need, built once at process startup and
/// threaded through axum state. No module-scoped singletons.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub bus: EventBus,
    pub engine: HuntEngine,
    pub jobs: Arc<JobLog>,
    pub heartbeats: Arc<HeartbeatBoard>,
    pub config: Arc<EngineConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn build(config: EngineConfig) -> Self {
        let store = Arc::new(SessionStore::new(config.session_ttl()));
        let bus = EventBus::new();
        let gateway = Arc::new(ModelGateway::new(&config.providers));
        let judge = Arc::new(JudgeClient::from_env());
        let gate = Arc::new(RateGate::new(config.rate_limit_entries()));
        let engine = HuntEngine::new(store.clone(), bus.clone(), gateway, judge, gate);
        let jobs = Arc::new(JobLog::new());
        let heartbeats = Arc::new(HeartbeatBoard::new(config.heartbeat_ttl()));
        Self {
            store,
            bus,
            engine,
            jobs,
            heartbeats,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "quarry server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
