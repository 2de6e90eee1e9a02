//! Health, readiness, and metrics endpoints.
//!
//! - `GET /health`  — liveness: the process is up and serving.
//! - `GET /ready`   — readiness: 503 while any registered condition fails
//!   (a session stuck in `Reconnecting` past the threshold, ring drop rate
//!   over the threshold, the writer paused on storage pressure).
//! - `GET /metrics` — Prometheus render of the `metrics` recorder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::ring::RingStats;

/// One registered readiness condition; `true` means failing.
struct Condition {
    name: String,
    failing: Arc<AtomicBool>,
}

/// Registry of readiness conditions, shared between components and the
/// admin server.
#[derive(Clone, Default)]
pub struct Conditions {
    inner: Arc<Mutex<Vec<Condition>>>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named condition and returns the flag its owner flips.
    pub fn register(&self, name: &str) -> Arc<AtomicBool> {
        let failing = Arc::new(AtomicBool::new(false));
        self.inner
            .lock()
            .expect("conditions lock poisoned")
            .push(Condition {
                name: name.to_owned(),
                failing: Arc::clone(&failing),
            });
        failing
    }

    pub fn failing(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("conditions lock poisoned")
            .iter()
            .filter(|condition| condition.failing.load(Ordering::Relaxed))
            .map(|condition| condition.name.clone())
            .collect()
    }
}

#[derive(Clone)]
struct AdminState {
    started_at: Instant,
    conditions: Conditions,
    prometheus: PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failing: Vec<String>,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn ready(State(state): State<AdminState>) -> (StatusCode, Json<ReadyResponse>) {
    let failing = state.conditions.failing();
    if failing.is_empty() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                failing,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                failing,
            }),
        )
    }
}

async fn metrics(State(state): State<AdminState>) -> String {
    state.prometheus.render()
}

/// Serves the admin endpoints until the process exits.
pub async fn serve(
    port: u16,
    conditions: Conditions,
    prometheus: PrometheusHandle,
) -> std::io::Result<()> {
    let state = AdminState {
        started_at: Instant::now(),
        conditions,
        prometheus,
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("admin endpoints on :{port}");
    axum::serve(listener, app).await
}

/// Flags the condition when the ring's drop counter grows faster than
/// `max_drops_per_min`, sampled once a minute.
pub async fn watch_ring_drops(
    stats: Arc<RingStats>,
    flag: Arc<AtomicBool>,
    max_drops_per_min: u64,
) {
    let mut last = stats.dropped();
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let now = stats.dropped();
        let rate = now.saturating_sub(last);
        last = now;
        let over = rate > max_drops_per_min;
        if over {
            warn!("ring dropped {rate} frames in the last minute");
        }
        flag.store(over, Ordering::Relaxed);
    }
}

/// Flags the condition when a session sits in `Reconnecting` longer than
/// `threshold`.
#[cfg(feature = "connector")]
pub async fn watch_session_state(
    mut state: tokio::sync::watch::Receiver<crate::feed::SessionState>,
    flag: Arc<AtomicBool>,
    threshold: Duration,
) {
    use crate::feed::SessionState;

    let mut reconnecting_since: Option<Instant> = None;
    loop {
        let current = *state.borrow();
        match current {
            SessionState::Reconnecting => {
                let since = *reconnecting_since.get_or_insert_with(Instant::now);
                flag.store(since.elapsed() >= threshold, Ordering::Relaxed);
            }
            SessionState::Closed => {
                flag.store(true, Ordering::Relaxed);
                return;
            }
            _ => {
                reconnecting_since = None;
                flag.store(false, Ordering::Relaxed);
            }
        }
        // Re-evaluate on state changes and on a timer while reconnecting.
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)), if reconnecting_since.is_some() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_report_failing_names() {
        let conditions = Conditions::new();
        let a = conditions.register("session_reconnecting");
        let b = conditions.register("writer_paused");
        assert!(conditions.failing().is_empty());

        a.store(true, Ordering::Relaxed);
        assert_eq!(conditions.failing(), vec!["session_reconnecting".to_string()]);

        b.store(true, Ordering::Relaxed);
        assert_eq!(conditions.failing().len(), 2);

        a.store(false, Ordering::Relaxed);
        assert_eq!(conditions.failing(), vec!["writer_paused".to_string()]);
    }
}
