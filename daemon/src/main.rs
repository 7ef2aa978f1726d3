use anyhow::{Context, Result};
use chrono::{DateTime, Duration as Span, Utc};
use minerguard_daemon::{
    config::Config,
    events::EventBus,
    gate::MiningGate,
    link::TcpMinerLink,
    protocol::{QueryTelemetryParams, Request, Response},
    socket::{handle_client, RequestHandler, SocketServer},
    supervisor::{DesiredState, Supervisor, SupervisorHandle},
    telemetry::TelemetryStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Used when a telemetry query does not say how many pixels it has.
const DEFAULT_QUERY_DENSITY: f64 = 800.0;

/// Longest window a telemetry query may ask for.
const MAX_QUERY_SPAN_SECS: u64 = 366 * 24 * 60 * 60;

struct DaemonState {
    supervisor: SupervisorHandle,
    store: Arc<TelemetryStore>,
    gate: Mutex<MiningGate>,
    events: EventBus,
}

impl DaemonState {
    async fn request_state(&self, state: DesiredState) -> Response {
        let mut gate = self.gate.lock().await;
        match gate.request(state) {
            Some(state) => match self.supervisor.set_desired_state(state).await {
                Ok(()) => Response::data(json!({ "desired": state })),
                Err(e) => Response::error(e),
            },
            None => {
                info!("Important process running, deferring {:?}", state);
                Response::data(json!({ "desired": state, "deferred": true }))
            }
        }
    }

    /// Returns false once the watchdog is gone.
    async fn observe_important(&self) -> bool {
        let detected = match self.supervisor.is_important_process_running().await {
            Ok(detected) => detected,
            Err(_) => return false,
        };
        let mut gate = self.gate.lock().await;
        if let Some(transition) = gate.observe(detected) {
            info!("{}", transition.message);
            self.events.message(transition.message);
            if let Some(state) = transition.apply {
                return self.supervisor.set_desired_state(state).await.is_ok();
            }
        }
        true
    }

    async fn query(&self, params: QueryTelemetryParams) -> Response {
        let span = Span::seconds(params.span_secs.min(MAX_QUERY_SPAN_SECS) as i64);
        let start = params
            .start_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| Utc::now() - span);
        let density = params.density.unwrap_or(DEFAULT_QUERY_DENSITY);
        match self.store.query(start, span, density).await {
            Ok(points) => Response::data(json!(points)),
            Err(e) => Response::error(e),
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DaemonState {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::Status => match self.supervisor.status().await {
                Ok(status) => {
                    let gate = self.gate.lock().await;
                    Response::data(json!({
                        "supervisor": status,
                        "requested": gate.requested(),
                        "paused": gate.is_paused(),
                    }))
                }
                Err(e) => Response::error(e),
            },

            Request::Start => self.request_state(DesiredState::Running).await,

            Request::Stop => self.request_state(DesiredState::Stopped).await,

            Request::SetVisible { params } => {
                match self.supervisor.set_visible(params.visible).await {
                    Ok(()) => Response::data(json!({ "visible": params.visible })),
                    Err(e) => Response::error(e),
                }
            }

            Request::GetIntensity => match self.supervisor.read_intensity().await {
                Ok(intensity) => Response::data(json!({ "intensity": intensity })),
                Err(e) => Response::error(e),
            },

            Request::SetIntensity { params } => {
                match self.supervisor.write_intensity(params.value).await {
                    Ok(()) => Response::data(json!({ "intensity": params.value })),
                    Err(e) => Response::error(e),
                }
            }

            Request::GetVersion => match self.supervisor.read_version().await {
                Ok(version) => Response::data(json!({ "version": version })),
                Err(e) => Response::error(e),
            },

            Request::QueryTelemetry { params } => self.query(params).await,
        }
    }
}

async fn watch_important(state: Arc<DaemonState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if !state.observe_important().await {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("minerguard daemon starting...");

    // Load configuration
    let config_path = Config::config_path();
    let config = if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })
    } else {
        info!("No config file found at {:?}, writing defaults", config_path);
        let config = Config::default();
        if let Err(e) = config.save(&config_path) {
            warn!("Failed to write default config: {}", e);
        }
        config
    };
    let (config, adjustments) = config.validated();
    for note in &adjustments {
        warn!("{}", note);
    }

    let events = EventBus::default();

    // Telemetry store, fed from the event stream
    let store = Arc::new(TelemetryStore::new(
        config.store_path(),
        config.save_interval(),
        events.clone(),
    ));
    let ingest_events = events.subscribe();
    store.preload().await;
    tokio::spawn(Arc::clone(&store).run_flusher());
    tokio::spawn(Arc::clone(&store).run_ingest(ingest_events));

    // Watchdog
    let mut supervisor = Supervisor::new(
        TcpMinerLink::from_config(&config),
        events.clone(),
        config.polling_period(),
    );
    supervisor.set_visible(config.miner.visible);
    let (handle, watchdog) = supervisor.spawn();

    let initial = if config.miner.autostart { DesiredState::Running } else { DesiredState::Unknown };
    let state = Arc::new(DaemonState {
        supervisor: handle,
        store: Arc::clone(&store),
        gate: Mutex::new(MiningGate::new(initial)),
        events: events.clone(),
    });

    if !config.important.process_names.is_empty() {
        state.observe_important().await;
        let every = Duration::from_secs(config.important.check_interval_secs);
        tokio::spawn(watch_important(Arc::clone(&state), every));
    }
    if initial != DesiredState::Unknown {
        state.request_state(initial).await;
    }

    // Create socket server
    let socket_path = SocketServer::socket_path();
    let server = SocketServer::bind(&socket_path)
        .await
        .with_context(|| format!("Failed to bind {:?}", socket_path))?;

    info!("Daemon ready, listening for connections...");

    // Accept client connections
    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    let state = Arc::clone(&state);
                    let events = events.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, events, state).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    watchdog.abort();
    let final_store = Arc::clone(&store);
    tokio::task::spawn_blocking(move || final_store.flush())
        .await
        .context("Final telemetry flush panicked")?;
    Ok(())
}
