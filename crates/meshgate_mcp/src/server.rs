//! Gateway assembly.
//!
//! Builds the full component graph (state plane, stores, policy, backends,
//! dispatcher, router, transport) from one config, spawns the background
//! tasks (SSE pump, keep-alive pings, session sweep), and serves HTTP until
//! shutdown.

use anyhow::Result;
use meshgate_protocol::capabilities::{AuthoringCapabilities, Limits};
use meshgate_protocol::{CapabilitiesEnvelope, ToolRegistryInfo};
use meshgate_security::{Authenticator, PolicyEngine};
use meshgate_state::{
    Clock, EventLog, JobQueue, LockManager, SessionStore, Sleeper, SystemClock, TokioSleeper,
};
use meshgate_store::{
    MemoryProjectRepository, MemoryWorkspaceRepository, ProjectRepository, WorkspaceRepository,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::BackendRegistry;
use crate::dispatch::{DispatchPolicy, Dispatcher};
use crate::engine::EngineBackend;
use crate::http::{HttpConfig, HttpServer};
use crate::resources::{MemoryResourceStore, ResourceStore};
use crate::router::{Router, RouterConfig};
use crate::sse::SseBroker;
use crate::tools::{self, DefaultRegistryResolver, RegistryResolver};

/// Everything tunable about one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub router: RouterConfig,
    pub http: HttpConfig,
    pub dispatch: DispatchPolicy,
    pub session_ttl_ms: u64,
    pub session_sweep_interval_ms: u64,
    pub max_sse_per_session: usize,
    pub sse_ping_interval_ms: u64,
    pub limits: Limits,
    pub formats: Vec<String>,
    pub blockbench_version: String,
    pub tool_schema_version: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            http: HttpConfig::default(),
            dispatch: DispatchPolicy::default(),
            session_ttl_ms: 300_000,
            session_sweep_interval_ms: 60_000,
            max_sse_per_session: 4,
            sse_ping_interval_ms: 15_000,
            limits: Limits::default(),
            formats: vec![
                "bbmodel".to_string(),
                "gltf".to_string(),
                "java_block".to_string(),
            ],
            blockbench_version: "4.12".to_string(),
            tool_schema_version: "1".to_string(),
        }
    }
}

/// A fully wired gateway. Fields are shared handles so embedders (the
/// binary, the worker, tests) can reach into the planes they need.
pub struct Gateway {
    pub config: GatewayConfig,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventLog>,
    pub sessions: Arc<SessionStore>,
    pub locks: Arc<LockManager>,
    pub queue: Arc<JobQueue>,
    pub projects: Arc<dyn ProjectRepository>,
    pub workspaces: Arc<dyn WorkspaceRepository>,
    pub registry: Arc<BackendRegistry>,
    pub broker: Arc<SseBroker>,
    pub router: Arc<Router>,
}

impl Gateway {
    /// Build with the system clock and in-memory stores.
    pub fn build(config: GatewayConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self::build_with_clock(
            config,
            authenticator,
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
        )
    }

    /// Build with an injected time source (tests drive a manual clock).
    pub fn build_with_clock(
        config: GatewayConfig,
        authenticator: Arc<dyn Authenticator>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let events = Arc::new(EventLog::new(clock.clone()));
        let sessions = Arc::new(SessionStore::new(
            clock.clone(),
            config.session_ttl_ms,
            config.max_sse_per_session,
        ));
        let locks = Arc::new(LockManager::new(clock.clone(), events.clone()));
        let queue = Arc::new(JobQueue::new(clock.clone(), events.clone()));
        let projects: Arc<dyn ProjectRepository> = Arc::new(MemoryProjectRepository::new(
            clock.clone(),
            sleeper.clone(),
        ));
        let workspaces: Arc<dyn WorkspaceRepository> = Arc::new(MemoryWorkspaceRepository::new());
        let policy_engine = Arc::new(PolicyEngine::new(workspaces.clone()));

        let mut registry = BackendRegistry::new("engine");
        let engine = Arc::new(EngineBackend::new(
            "engine",
            projects.clone(),
            clock.clone(),
        ));
        registry.register("engine", engine.clone());
        registry.register("blockbench", engine);
        let registry = Arc::new(registry);

        let registry_info = ToolRegistryInfo {
            hash: tools::registry_hash(&tools::gateway_tools()),
            count: tools::gateway_tools().len(),
        };
        let capabilities = CapabilitiesEnvelope {
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
            tool_schema_version: config.tool_schema_version.clone(),
            blockbench_version: config.blockbench_version.clone(),
            limits: config.limits,
            tool_registry: registry_info.clone(),
            authoring: AuthoringCapabilities::default(),
            formats: config.formats.clone(),
        };

        let broker = Arc::new(SseBroker::new(sessions.clone()));

        let dispatcher = Arc::new(
            Dispatcher::new(
                registry.clone(),
                locks.clone(),
                events.clone(),
                queue.clone(),
                sessions.clone(),
                policy_engine,
                projects.clone(),
                clock.clone(),
                sleeper,
                config.dispatch.clone(),
                capabilities,
            )
            .with_viewport_notifier(broker.clone()),
        );

        let resolver: Arc<dyn RegistryResolver> =
            Arc::new(DefaultRegistryResolver::new(workspaces.clone()));

        let mut resources = MemoryResourceStore::new();
        resources.add(
            "meshgate://docs/usage",
            "Gateway usage",
            "text/markdown",
            "# Meshgate\n\nCall tools/list, then drive project tools. \
             Mutations are serialized per project and guarded by ifRevision.",
        );
        resources.add_template("meshgate://projects/{projectId}/state", "Project state");
        let resources: Arc<dyn ResourceStore> = Arc::new(resources);

        let router = Arc::new(Router::new(
            config.router.clone(),
            sessions.clone(),
            authenticator,
            resolver,
            dispatcher,
            resources,
            events.clone(),
            locks.clone(),
            broker.clone(),
            registry_info,
        ));

        Self {
            config,
            clock,
            events,
            sessions,
            locks,
            queue,
            projects,
            workspaces,
            registry,
            broker,
            router,
        }
    }

    /// Spawn the gateway's background tasks.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.broker.clone().spawn_event_pump(&self.events),
            self.broker
                .clone()
                .spawn_ping(self.config.sse_ping_interval_ms),
        ];

        let sessions = self.sessions.clone();
        let interval = self.config.session_sweep_interval_ms.max(1_000);
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval));
            loop {
                ticker.tick().await;
                sessions.prune_stale();
            }
        }));

        handles
    }

    /// Bind, spawn background tasks, and serve until `shutdown` flips.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let background = self.spawn_background();
        let server = HttpServer::bind(self.config.http.clone(), self.router.clone()).await?;
        info!("Gateway ready");
        let result = server.serve(shutdown).await;
        for handle in background {
            handle.abort();
        }
        result
    }
}
