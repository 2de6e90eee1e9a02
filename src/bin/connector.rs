//! tapeline-connector: capture one feed shard into the bus.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use tapeline::admin;
use tapeline::bus::consumer::ChangeFeedConsumer;
use tapeline::bus::publisher::FramePublisher;
use tapeline::bus::Bus;
use tapeline::clock::{Clock, TscClock};
use tapeline::config::{EnvConfig, FeedConfig};
use tapeline::feed::auth::Signer;
use tapeline::feed::session::{Session, SessionCommand, SessionEvent, SessionHandle};
use tapeline::feed::{build_wire, FeedError};
use tapeline::intern::Interner;
use tapeline::ring::ring;
use tapeline::submgr::{ManagerConfig, SubscriptionManager};

#[derive(Parser, Debug)]
#[command(name = "tapeline-connector")]
#[command(about = "WebSocket market-data connector: exchange -> ring -> bus")]
struct Args {
    /// Feed YAML (wire, endpoint, auth scheme, instrument seed)
    #[arg(long)]
    feed_config: PathBuf,

    /// Environment YAML (bus, shard, admin port)
    #[arg(long)]
    env_config: PathBuf,

    /// CPU core to pin the process to
    #[arg(long)]
    core_id: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let feed = match FeedConfig::load(&args.feed_config) {
        Ok(mut feed) => match feed.resolve_endpoint() {
            Ok(()) => feed,
            Err(e) => {
                error!("feed config: {e}");
                return ExitCode::from(1);
            }
        },
        Err(e) => {
            error!("feed config: {e}");
            return ExitCode::from(1);
        }
    };
    let env = match EnvConfig::load(&args.env_config) {
        Ok(env) => env,
        Err(e) => {
            error!("env config: {e}");
            return ExitCode::from(1);
        }
    };

    // Credentials resolve before anything connects; a missing secret is a
    // startup failure the orchestrator fixes by injecting a fresh one.
    if let Err(e) = Signer::from_config(&feed) {
        error!("credentials: {e}");
        return ExitCode::from(1);
    }

    match run(args, feed, env).await {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                // A session died on credentials mid-run.
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!("unrecoverable: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args, feed: FeedConfig, env: EnvConfig) -> Result<bool> {
    if let Some(core_id) = args.core_id {
        let core_ids = core_affinity::get_core_ids().context("get core ids")?;
        let core = core_ids
            .into_iter()
            .find(|core| core.id == core_id)
            .with_context(|| format!("core {core_id} not available"))?;
        info!("pinning to core {core_id}");
        core_affinity::set_for_current(core);
    }

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    let conditions = admin::Conditions::new();
    tokio::spawn(admin::serve(env.admin_port, conditions.clone(), prometheus));

    // The process cannot time frames without a calibrated clock.
    let clock = Arc::new(TscClock::calibrate().context("clock calibration")?);
    info!("clock calibrated, drift {:?}", clock.drift());

    let interner = Arc::new(Interner::with_capacity(feed.interner_capacity));

    let bus = Bus::connect(&env.env, &env.bus.url)
        .await
        .context("bus connect")?;
    bus.ensure_feed_stream(&feed.feed, &env.bus)
        .await
        .context("feed stream")?;
    bus.ensure_cdc_stream().await.context("cdc stream")?;
    bus.ensure_dlq_stream("connector").await.context("dlq stream")?;

    let sessions_per_shard = feed.max_connections;
    let drain_deadline = Duration::from_secs(feed.drain_deadline_secs);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();

    let mut session_tasks: JoinSet<Result<(), FeedError>> = JoinSet::new();
    let mut drain_tasks: JoinSet<()> = JoinSet::new();
    let mut handles: Vec<SessionHandle> = Vec::new();

    for slot in 0..sessions_per_shard {
        let global_shard = env.shard.index * sessions_per_shard as u32 + slot as u32;
        let (producer, consumer) = ring(feed.ring_capacity);
        let ring_stats = consumer.stats();

        let signer = Signer::from_config(&feed).map_err(|e| anyhow::anyhow!("{e}"))?;
        let wire = build_wire(&feed);
        let (session, handle) = Session::new(
            feed.clone(),
            env.env.clone(),
            global_shard,
            wire,
            signer,
            Arc::clone(&clock),
            Arc::clone(&interner),
            producer,
            events_tx.clone(),
        );

        let reconnect_flag =
            conditions.register(&format!("session_{global_shard}_reconnecting"));
        tokio::spawn(admin::watch_session_state(
            handle.state.clone(),
            reconnect_flag,
            Duration::from_secs(120),
        ));
        let drop_flag = conditions.register(&format!("ring_{global_shard}_drop_rate"));
        tokio::spawn(admin::watch_ring_drops(
            ring_stats,
            drop_flag,
            feed.max_drops_per_min,
        ));

        let publisher = FramePublisher::new(bus.clone(), &feed.feed, global_shard);
        drain_tasks.spawn(async move { publisher.run_drain(consumer, drain_deadline).await });

        session_tasks.spawn(session.run());
        handles.push(handle);
    }

    // Subscription reconciler: seed set plus the catalog change feed.
    let manager_config = ManagerConfig {
        feed: feed.feed.clone(),
        shard_index: env.shard.index,
        shard_count: env.shard.count,
        sessions_per_shard,
        max_instruments_per_connection: feed.max_instruments_per_connection,
        confirm_timeout_ns: 30_000_000_000,
    };
    let mut manager = SubscriptionManager::new(manager_config, feed.instruments.clone());
    let cdc = ChangeFeedConsumer::durable(&bus, &feed.feed, env.shard.index)
        .await
        .context("cdc consumer")?;

    let mut reconcile_tick =
        tokio::time::interval(Duration::from_secs(feed.reconcile_interval_secs.max(1)));
    reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut credential_failure = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            joined = session_tasks.join_next() => {
                match joined {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(e))) => {
                        error!("session terminated: {e}");
                        credential_failure = matches!(e, FeedError::Auth(_));
                        break;
                    }
                    Some(Err(e)) => {
                        error!("session task panicked: {e}");
                        break;
                    }
                    None => {
                        warn!("all sessions ended");
                        break;
                    }
                }
            }
            _ = reconcile_tick.tick() => {
                let plan = manager.reconcile(clock.now_ns());
                for planned in plan {
                    if let Some(handle) = handles.get(planned.local_slot) {
                        if let Err(e) = handle.commands.send(planned.action.into_command()).await {
                            warn!("session {} command channel closed: {e}", planned.local_slot);
                        }
                    }
                }
            }
            events = cdc.fetch(64, Duration::from_millis(500)) => {
                match events {
                    Ok(events) => {
                        for event in &events {
                            manager.apply_change(event);
                        }
                    }
                    Err(e) => warn!("change feed fetch: {e}"),
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(SessionEvent::Subscribed(instruments)) => manager.confirm(&instruments),
                    Some(SessionEvent::SubscribeFailed { instruments, reason }) => {
                        manager.fail(&instruments, &reason, clock.now_ns());
                    }
                    None => {}
                }
            }
        }
    }

    // Bounded drain: close every session, let the drainers flush what the
    // rings still hold, then leave.
    for handle in &handles {
        let _ = handle.commands.send(SessionCommand::Close).await;
    }
    let shutdown = async {
        while session_tasks.join_next().await.is_some() {}
        while drain_tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(drain_deadline + Duration::from_secs(5), shutdown)
        .await
        .is_err()
    {
        warn!("shutdown drain exceeded deadline, abandoning queued frames");
        session_tasks.abort_all();
        drain_tasks.abort_all();
    }

    info!("connector stopped");
    Ok(!credential_failure)
}
