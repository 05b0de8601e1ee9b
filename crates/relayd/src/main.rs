use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod broker;
mod config;
mod dispatch;
mod dns;
mod events;
mod forwarder;
mod lifecycle;
mod message;
mod metrics;
mod pool;
mod recorder;
mod smtp;
mod unavailability;
mod virtual_mta;

use crate::broker::MemoryBroker;
use crate::config::RelaydConfig;
use crate::dispatch::{MessageSender, MessageSenderParams};
use crate::dns::DnsMxResolver;
use crate::events::MemoryEventStore;
use crate::forwarder::{EventHttpForwarder, ReqwestPoster};
use crate::lifecycle::LifeCycle;
use crate::pool::SmtpClientPool;
use crate::recorder::{DispositionRecorder, MemoryStatusStore};
use crate::smtp::TcpConnector;
use crate::unavailability::UnavailabilityRegistry;
use crate::virtual_mta::GroupRegistry;

/// Outbound SMTP relay daemon
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// TOML configuration file
    #[arg(long, default_value = "/etc/relayd/relayd.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RELAYD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relayd=info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")?
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config = RelaydConfig::load(&opts.config)?;
    let mut life_cycle = LifeCycle::new();

    let registry = Arc::new(UnavailabilityRegistry::new());
    let connector = Arc::new(TcpConnector::new(config.smtp_timeouts, config.smtp_port));
    let pool = Arc::new(SmtpClientPool::new(
        connector,
        registry.clone(),
        config.pool.clone(),
    ));
    let resolver =
        Arc::new(DnsMxResolver::from_system_conf().context("initializing the resolver")?);
    let groups = Arc::new(GroupRegistry::from_config(&config.groups)?);

    // The broker and the two stores default to their in-memory
    // implementations; deployments with durable backends swap these
    // behind the same traits.
    let broker = Arc::new(MemoryBroker::new(Duration::from_secs(60)));
    let status_store = Arc::new(MemoryStatusStore::new());
    let event_store = Arc::new(MemoryEventStore::new());
    let recorder = Arc::new(DispositionRecorder::new(
        status_store,
        event_store.clone(),
    ));

    let sender = MessageSender::new(MessageSenderParams {
        broker,
        resolver,
        groups,
        pool,
        recorder,
        registry,
        max_time_in_queue: config.max_time_in_queue(),
        idle_sleep: config.idle_sleep(),
    });
    sender.start().context("starting the dispatch loop")?;

    let forwarder = EventHttpForwarder::new(
        config.event_forwarding_http_post_url.clone(),
        event_store,
        Arc::new(ReqwestPoster::new()),
    );
    forwarder.start().context("starting the event forwarder")?;

    life_cycle.wait_for_shutdown().await;
    sender.stop().await;
    forwarder.stop().await;
    Ok(())
}
