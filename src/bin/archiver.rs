//! tapeline-archiver: bus -> gzip JSONL segments -> object store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use tokio::sync::watch;

use tapeline::admin;
use tapeline::archive::writer::WriteFrame;
use tapeline::archive::{ArchiveWriter, WriterConfig};
use tapeline::bus::consumer::FrameConsumer;
use tapeline::bus::Bus;
use tapeline::clock::{Clock, SystemClock};
use tapeline::config::{EnvConfig, FeedConfig};
use tapeline::upload::{Uploader, UploaderConfig};

const FETCH_BATCH: usize = 256;
const FETCH_WAIT: Duration = Duration::from_secs(1);
const PAUSE_PROBE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "tapeline-archiver")]
#[command(about = "Durable archiver: bus subjects -> rotated gzip JSONL + manifest -> object store")]
struct Args {
    /// Feed YAML (names the feed whose subjects to archive)
    #[arg(long)]
    feed_config: PathBuf,

    /// Environment YAML (bus, archive root, rotation, upload)
    #[arg(long)]
    env_config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let feed = match FeedConfig::load(&args.feed_config) {
        Ok(feed) => feed,
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
    if env.archive_root.as_os_str().is_empty() {
        error!("archive_root is not set (env yaml or ARCHIVE_ROOT)");
        return ExitCode::from(1);
    }

    match run(feed, env).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("unrecoverable: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(feed: FeedConfig, env: EnvConfig) -> Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    let conditions = admin::Conditions::new();
    tokio::spawn(admin::serve(env.admin_port, conditions.clone(), prometheus));

    let clock = Arc::new(SystemClock);
    let bus = Bus::connect(&env.env, &env.bus.url)
        .await
        .context("bus connect")?;
    bus.ensure_feed_stream(&feed.feed, &env.bus)
        .await
        .context("feed stream")?;
    let consumer = FrameConsumer::durable(&bus, &feed.feed)
        .await
        .context("durable consumer")?;

    let mut writer = ArchiveWriter::open(
        WriterConfig {
            root: env.archive_root.clone(),
            feed: feed.feed.clone(),
            rotation: env.rotation.clone(),
            pause_free_bytes: env.pause_free_bytes,
        },
        Arc::clone(&clock),
    )
    .context("open archive writer")?;
    info!(
        "archiving {} into {} (resuming at bus seq {})",
        feed.feed,
        env.archive_root.display(),
        writer.last_sequence()
    );

    let paused_flag = conditions.register("writer_paused_storage");
    let blocked_flag = conditions.register("manifest_rotation_blocked");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Uploader sweeps sealed files on its own cadence.
    let upload_enabled = !env.upload.bucket.is_empty();
    let mut uploader = if upload_enabled {
        let store: Arc<dyn ObjectStore> = if let Some(local) =
            env.upload.bucket.strip_prefix("file://")
        {
            // Local-directory store, used by development deployments.
            std::fs::create_dir_all(local)?;
            Arc::new(LocalFileSystem::new_with_prefix(local)?)
        } else {
            Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(&env.upload.bucket)
                    .build()
                    .context("s3 store")?,
            )
        };
        Some(Uploader::new(
            store,
            UploaderConfig {
                root: env.archive_root.clone(),
                feed: feed.feed.clone(),
                prefix: env.upload.prefix.clone(),
                multipart_threshold_bytes: env.upload.multipart_threshold_bytes,
                local_retention: Duration::from_secs(env.upload.local_retention_secs),
            },
        )?)
    } else {
        info!("no bucket configured, local capture only");
        None
    };
    let mut upload_task = {
        let mut shutdown = shutdown_rx.clone();
        let sweep_interval = Duration::from_secs(env.upload.sweep_interval_secs.max(1));
        let clock = Arc::clone(&clock);
        let mut uploader_loop = uploader.take();
        tokio::spawn(async move {
            if let Some(uploader) = uploader_loop.as_mut() {
                let mut backoff = sweep_interval;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    match uploader.sweep(clock.now_ns()).await {
                        Ok(stats) => {
                            if stats.segments_uploaded > 0 || stats.manifests_uploaded > 0 {
                                info!(
                                    "upload sweep: {} segments, {} manifests, {} local deletes",
                                    stats.segments_uploaded,
                                    stats.manifests_uploaded,
                                    stats.locals_deleted
                                );
                            }
                            backoff = sweep_interval;
                        }
                        Err(e) => {
                            // Never delete locals on a failing path; retry
                            // with backoff and let the disk absorb the
                            // outage.
                            warn!("upload sweep failed: {e}; backing off");
                            backoff = (backoff * 2).min(Duration::from_secs(300));
                        }
                    }
                }
            }
            uploader_loop
        })
    };

    // Consume loop: fetch, append, checkpoint, ack.
    let mut shutdown = shutdown_rx.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        blocked_flag.store(writer.rotation_blocked(), Ordering::Relaxed);

        if writer.storage_pressure() {
            // Stop fetching (and acking); bus retention absorbs the outage
            // until the uploader drains the volume.
            if !paused_flag.swap(true, Ordering::Relaxed) {
                warn!(
                    "archive volume under pressure ({} bytes free), pausing consumption",
                    writer.free_bytes()
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(PAUSE_PROBE) => continue,
                _ = shutdown.changed() => break,
            }
        }
        if paused_flag.swap(false, Ordering::Relaxed) {
            info!("storage pressure cleared, resuming consumption");
        }

        let batch = tokio::select! {
            batch = consumer.fetch(FETCH_BATCH, FETCH_WAIT) => batch,
            _ = shutdown.changed() => break,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!("fetch failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if batch.is_empty() {
            writer.tick().context("writer tick")?;
            continue;
        }

        let mut append_failed = false;
        let mut appended = 0usize;
        for frame in &batch {
            let result = writer.append(&WriteFrame {
                subject: &frame.subject,
                kind: frame.kind,
                instrument: &frame.instrument,
                ts_ns: frame.ts_ns,
                stream_seq: frame.stream_seq,
                payload: &frame.payload,
            });
            match result {
                Ok(_) => appended += 1,
                Err(e) => {
                    // Unacked frames redeliver; the sequence cursor makes
                    // the replay idempotent.
                    error!("append failed at bus seq {}: {e}", frame.stream_seq);
                    append_failed = true;
                    break;
                }
            }
        }

        // Everything appended is flushed before anything is acked.
        writer.checkpoint().context("writer checkpoint")?;
        for frame in batch.iter().take(appended) {
            if let Err(e) = frame.ack().await {
                warn!("ack failed at bus seq {}: {e}", frame.stream_seq);
            }
        }
        if append_failed {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        writer.tick().context("writer tick")?;
    }

    info!("sealing open segments");
    writer.close().context("close writer")?;

    // Give the uploader one final pass over the sealed tail.
    if let Ok(Some(mut uploader)) = (&mut upload_task).await.map_err(|e| {
        warn!("upload task join: {e}");
        e
    }) {
        match uploader.sweep(clock.now_ns()).await {
            Ok(stats) => info!(
                "final upload sweep: {} segments, {} manifests",
                stats.segments_uploaded, stats.manifests_uploaded
            ),
            Err(e) => warn!("final upload sweep failed: {e}"),
        }
    }

    info!("archiver stopped");
    Ok(())
}
