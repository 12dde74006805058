mod adblock;
mod blocklist;
mod cache;
mod codec;
mod config;
mod engine;
mod error;
mod query_log;
mod transport;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::adblock::{MatchOptions, RuleSet};
use crate::blocklist::Blocklist;
use crate::cache::{spawn_sweeper, CorrelationCache, DEFAULT_TTL};
use crate::config::{Args, Config, EnvMode};
use crate::engine::Engine;
use crate::query_log::{MemoryRepository, QueryRepository};
use crate::transport::UdpTransport;

/// How long shutdown waits for in-flight datagram work before giving up.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::from_args(args).context("invalid configuration")?;
    init_tracing(cfg.mode);

    let blocklist = Arc::new(Blocklist::new());
    if let Some(path) = &cfg.blocklist_file {
        let added = blocklist
            .load_file(path)
            .with_context(|| format!("load blocklist file {}", path.display()))?;
        info!(path = %path.display(), entries = added, "blocklist loaded");
    }

    let rules = RuleSet::load_files(&cfg.rule_files);
    info!(
        files = cfg.rule_files.len(),
        rules = rules.rule_count(),
        "rule database compiled"
    );
    let rules = Arc::new(ArcSwap::from_pointee(rules));

    let cache = Arc::new(CorrelationCache::new(DEFAULT_TTL));
    let repository: Arc<dyn QueryRepository> = Arc::new(MemoryRepository::new());

    let transport = Arc::new(UdpTransport::bind(cfg.listen).context("bind local DNS socket")?);
    info!(listen = %cfg.listen, upstream = %cfg.upstream, "dns forwarder started");

    let engine = Arc::new(Engine::new(
        transport.clone(),
        cfg.upstream,
        blocklist,
        rules.clone(),
        cache.clone(),
        repository,
        MatchOptions::default(),
    ));

    let sweeper = spawn_sweeper(cache);
    watcher::spawn(cfg.rule_files.clone(), rules);

    let receive_loop = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    transport.close();
    match tokio::time::timeout(DRAIN_DEADLINE, receive_loop).await {
        Ok(Ok(())) => info!("receive loop drained"),
        Ok(Err(err)) => error!(error = %err, "receive loop panicked"),
        Err(_) => warn!("receive loop did not drain in time, abandoning it"),
    }
    sweeper.abort();

    info!("bye");
    Ok(())
}

fn init_tracing(mode: EnvMode) {
    let default_level = match mode {
        EnvMode::Dev => "sinkdns=debug",
        EnvMode::Prod => "sinkdns=info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(matches!(mode, EnvMode::Dev));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
