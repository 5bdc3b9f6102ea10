use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use rand::RngCore;
use tokio::fs::read_to_string;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use zreplicate::config::Config;
use zreplicate::datastore::{ConfigStore, FileDatastore};
use zreplicate::events::LogEventSink;
use zreplicate::error::EngineError;
use zreplicate::link::PeerResolver;
use zreplicate::peer::{LoopbackPeer, RemotePeer};
use zreplicate::services::NoopServices;
use zreplicate::transport::{TransportKind, TransportPluginConfig};
use zreplicate::Engine;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = concat!("v", env!("CARGO_PKG_VERSION"), "+", env!("GIT_SHA")))]
struct Args {
    /// Run `replication.sync` once for a single link and exit.
    #[arg(long)]
    single_shot: Option<String>,

    /// Configuration file path.
    #[arg(long, short = 'c', default_value = "config.toml")]
    config: String,

    /// Encrypt sync traffic with the AES128 transport plugin instead of
    /// the default plain one.
    #[arg(long)]
    encrypt: bool,
}

/// Stands in for the out-of-scope RPC client: resolves every partner IP to
/// the same in-process peer. A real deployment wires `PeerResolver` to its
/// existing connection-pooled RPC client instead.
struct LoopbackResolver(Arc<LoopbackPeer>);

#[async_trait::async_trait]
impl PeerResolver for LoopbackResolver {
    async fn resolve(&self, _ip: &str) -> Result<Arc<dyn RemotePeer>, EngineError> {
        Ok(self.0.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();

    let file = read_to_string(&args.config).await?;
    let config = Config::try_from(&file)?;

    let datastore = Arc::new(FileDatastore::open(&config.datastore.path).await?);
    let node_key = match datastore.get_node_key().await? {
        Some(key) => key,
        None => {
            let mut key = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut key);
            datastore.set_node_key(key.clone()).await?;
            key
        }
    };

    let transport_plugins: Vec<TransportPluginConfig> = if args.encrypt {
        let mut properties = std::collections::HashMap::new();
        properties.insert("key".to_string(), encode_hex(&node_key));
        vec![TransportPluginConfig {
            name: "node-key-aes128".to_string(),
            kind: TransportKind::Aes128,
            properties,
        }]
    } else {
        Vec::new()
    };

    let loopback = Arc::new(LoopbackPeer::new());
    let engine = Arc::new(Engine::new(
        datastore.clone(),
        Arc::new(LogEventSink),
        Arc::new(LoopbackResolver(loopback)),
        Arc::new(NoopServices),
        Arc::new(NoopServices),
        config.node.local_ips.clone(),
    ));

    if let Some(name) = args.single_shot {
        let (actions, size) = engine
            .links
            .sync(&name, false, false, false, &transport_plugins)
            .await?;
        log::info!("replication.sync {name}: {} actions, {size} bytes", actions.len());
        engine.role_update(&name).await?;
        return Ok(());
    }

    let cancel_token = CancellationToken::new();
    let signal_cancel_token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel_token.cancel();
    });

    let transport_plugins: Arc<[TransportPluginConfig]> = transport_plugins.into();

    let mut handles: Vec<JoinHandle<Result<(), Box<dyn std::error::Error + Send + Sync>>>> = Vec::new();
    for link_schedule in &config.links {
        let handle = tokio::task::spawn(run_scheduled_sync(
            link_schedule.name.clone(),
            link_schedule.schedule(),
            engine.clone(),
            transport_plugins.clone(),
            cancel_token.clone(),
        ));
        handles.push(handle);
    }

    for handle in handles {
        handle.await??;
    }

    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handler");

    select! {
        _ = sigterm.recv() => {
            log::info!("received SIGTERM");
        }
        _ = sigint.recv() => {
            log::info!("received SIGINT");
        }
    }
}

async fn run_scheduled_sync(
    name: String,
    schedule: Result<cron::Schedule, zreplicate::config::ConfigError>,
    engine: Arc<Engine>,
    transport_plugins: Arc<[TransportPluginConfig]>,
    cancel_token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let schedule = schedule?;

    while !cancel_token.is_cancelled() {
        let now = Utc::now();
        let next = schedule
            .after(&now)
            .next()
            .ok_or("no upcoming sync on schedule")?;
        let duration = (next - now).to_std()?;

        select! {
            _ = sleep(duration) => {}
            _ = cancel_token.cancelled() => break,
        }

        match engine.links.sync(&name, false, false, false, &transport_plugins).await {
            Ok((actions, size)) => {
                log::info!("replication.sync {name}: {} actions, {size} bytes", actions.len());
            }
            Err(e) => {
                log::error!("replication.sync {name} failed: {e}");
                continue;
            }
        }

        if let Err(e) = engine.role_update(&name).await {
            log::error!("replication.role_update {name} failed: {e}");
        }
    }

    Ok(())
}
