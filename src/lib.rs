pub mod auth;
pub mod batch;
pub mod config;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod ratelimit;
pub mod redact;
pub mod refresh;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;
pub mod trace;

use std::sync::Arc;

use anyhow::{Context as _, Result};

use auth::AuthVerifier;
use config::FleetConfig;
use orchestrator::Orchestrator;
use queue::{QueueEvent, QueueManager};
use ratelimit::RateLimiter;
use refresh::RefreshManager;
use registry::ConnectionRegistry;
use router::MessageRouter;
use storage::Storage;
use trace::{CollectorEvent, TraceCollector};

/// Shared application state passed to every connection handler and
/// background worker.
pub struct AppContext {
    pub config: Arc<FleetConfig>,
    pub storage: Arc<Storage>,
    pub auth: Arc<AuthVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub router: Arc<MessageRouter>,
    pub queues: Arc<QueueManager>,
    pub collector: Arc<TraceCollector>,
    pub orchestrator: Arc<Orchestrator>,
    pub refresh: Arc<RefreshManager>,
    pub started_at: std::time::Instant,

    // Event receivers held until `start_background` hands them to their
    // consumer tasks.
    queue_events: std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<QueueEvent>>>,
    collector_events:
        std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<CollectorEvent>>>,
}

impl AppContext {
    /// Build and wire every component. Channels are connected here; nothing
    /// runs until [`AppContext::start_background`].
    pub async fn new(config: FleetConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let storage = Arc::new(
            Storage::new(&config.data_dir)
                .await
                .context("open storage")?,
        );

        let secret = match &config.jwt_secret {
            Some(secret) => secret.clone(),
            None => auth::get_or_create_secret(&config.data_dir).context("jwt secret")?,
        };
        let auth = Arc::new(AuthVerifier::new(&secret));

        let registry = Arc::new(ConnectionRegistry::new(std::time::Duration::from_secs(
            config.heartbeat_secs,
        )));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let router = Arc::new(MessageRouter::new(registry.clone(), config.router.clone()));
        let (queues, queue_events) = QueueManager::new(config.queue.clone());
        let queues = Arc::new(queues);
        let (collector, collector_events) =
            TraceCollector::new(storage.clone(), config.trace.clone());
        let collector = Arc::new(collector);
        let orchestrator = Orchestrator::new(
            registry.clone(),
            router.clone(),
            queues.clone(),
            storage.clone(),
            collector.clone(),
        );
        let refresh = Arc::new(RefreshManager::new(
            auth.clone(),
            registry.clone(),
            config.refresh.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            storage,
            auth,
            registry,
            rate_limiter,
            router,
            queues,
            collector,
            orchestrator,
            refresh,
            started_at: std::time::Instant::now(),
            queue_events: std::sync::Mutex::new(Some(queue_events)),
            collector_events: std::sync::Mutex::new(Some(collector_events)),
        }))
    }

    /// Spawn the background workers: router tick loop, dispatcher, event
    /// consumers, refresh manager, trace sweeper.
    pub fn start_background(&self) {
        tokio::spawn(self.router.clone().run());
        self.orchestrator.start_dispatcher();
        self.orchestrator.start_disconnect_watch();
        if let Some(rx) = self
            .queue_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.orchestrator.start_queue_events(rx);
        }
        if let Some(rx) = self
            .collector_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.orchestrator.start_collector_events(rx);
        }
        self.refresh.start();
        self.collector.start_sweeper();
    }
}
