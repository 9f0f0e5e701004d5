//! Gateway binary entry point: config load, SSDP/agent startup, seed-list refresh, and the
//! two fanout HTTP listeners. The interactive console is an external collaborator and is not
//! implemented here — only this startup flag surface is in scope.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use cctv_gateway::agent::Agent;
use cctv_gateway::config::Config;
use cctv_gateway::events::{AgentEvent, EventBus, SsdpEvent};
use cctv_gateway::fanout::mjpeg::mjpeg_handler;
use cctv_gateway::fanout::ws::ws_handler;
use cctv_gateway::fanout::FanoutState;
use cctv_gateway::net::Sender;
use cctv_gateway::seed;
use cctv_gateway::ssdp::SsdpService;

#[derive(Parser, Debug)]
#[command(name = "cctv-gateway", about = "LAN ONVIF camera discovery and RTSP-to-browser fanout gateway")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    seed: Option<PathBuf>,
    #[arg(long)]
    search: bool,
}

fn init_logging(level: &str) {
    let env = tracing_subscriber::EnvFilter::try_new(level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = Config::load_or_create(&args.config).context("loading config")?;

    let ssdp_events = EventBus::<SsdpEvent>::new();
    let ssdp = Arc::new(SsdpService::new(ssdp_events, None, None).context("starting ssdp engine")?);
    let wsdiscovery_sender = Arc::new(Sender::with_default_ttl().context("opening wsdiscovery socket")?);
    let agent_events = EventBus::<AgentEvent>::new();
    let agent = Arc::new(Agent::new(Arc::clone(&ssdp), wsdiscovery_sender, agent_events.clone()));

    agent_events
        .subscribe(|event: &AgentEvent| info!(?event, "agent event"))
        .await;

    agent
        .start(
            config.ssdp_search_targets.clone(),
            std::time::Duration::from_secs(config.ssdp_search_cycle_secs),
            config.own_usn.clone(),
            config.own_location.clone(),
            std::time::Duration::from_secs(config.ssdp_notify_cycle_secs),
        )
        .await;

    let seed_path = args.seed.unwrap_or_else(|| PathBuf::from(&config.seed_path));
    if seed_path.exists() {
        match seed::load(&seed_path) {
            Ok(seeds) => agent.renew_seed_list(&seeds).await,
            Err(err) => tracing::warn!(error = %err, path = ?seed_path, "failed to load seed camera list"),
        }
    }

    if args.search {
        agent
            .discover_and_probe(std::time::Duration::from_secs(config.wsdiscovery_timeout_secs), true)
            .await;
    }

    let fanout = Arc::new(FanoutState::new());
    register_live_ids(&fanout, &agent).await;

    let ws_app = Router::new().route("/", get(ws_handler)).with_state(Arc::clone(&fanout));
    let mjpeg_app = Router::new()
        .route("/live/:id", get(mjpeg_handler))
        .with_state(Arc::clone(&fanout));

    let ws_listener = TcpListener::bind(config.ws_bind).await.context("binding ws fanout listener")?;
    let mjpeg_listener = TcpListener::bind(config.mjpeg_bind).await.context("binding mjpeg listener")?;

    info!(ws = %config.ws_bind, mjpeg = %config.mjpeg_bind, "cctv-gateway listening");

    let ws_server = tokio::spawn(async move { axum::serve(ws_listener, ws_app).await });
    let mjpeg_server = tokio::spawn(async move { axum::serve(mjpeg_listener, mjpeg_app).await });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    agent.stop().await;
    fanout.stop_all().await;
    ws_server.abort();
    mjpeg_server.abort();

    Ok(())
}

/// Populate the MJPEG `/live/<id>` registry from every registered camera's selected profile,
/// matching the `id` the seed list assigns.
async fn register_live_ids(fanout: &Arc<FanoutState>, agent: &Arc<Agent>) {
    for camera in agent.find(None, None).await {
        let Some(profiles) = &camera.profiles else { continue };
        let Some(selected) = profiles.iter().find(|p| p.selected) else { continue };
        let Some(stream_url) = &selected.stream_url else { continue };
        if !camera.id.is_empty() {
            fanout.register_live_id(camera.id.clone(), stream_url.clone()).await;
        }
    }
}
