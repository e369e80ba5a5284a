// src/core/control/health.rs

//! Two background tasks: a periodic `PRAGMA quick_check` health loop, and a
//! follower revision poller that re-announces `control.commit` for tables
//! whose high-water mark has advanced since last observed, so followers
//! without direct access to the primary's write path still see commit
//! notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::core::control::store::ControlStore;
use crate::core::events::{ControlCommitEvent, ControlHealthEvent, Event, EventBus};

const TABLES: [&str; 4] = ["meta", "auth_state", "remote_config", "apps"];

pub async fn run_quick_check_loop(
    store: Arc<ControlStore>,
    events: Arc<EventBus>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.quick_check() {
                    Ok(true) => {
                        events.publish(Event::ControlHealth(ControlHealthEvent { ok: true, detail: None }));
                    }
                    Ok(false) => {
                        error!("control store quick_check reported corruption");
                        events.publish(Event::ControlHealth(ControlHealthEvent {
                            ok: false,
                            detail: Some("quick_check failed".to_string()),
                        }));
                    }
                    Err(e) => {
                        error!(error = %e, "control store quick_check errored");
                        events.publish(Event::ControlHealth(ControlHealthEvent {
                            ok: false,
                            detail: Some(e.to_string()),
                        }));
                    }
                }
                if let Err(e) = store.checkpoint() {
                    error!(error = %e, "wal checkpoint failed");
                }
            }
            _ = shutdown.recv() => {
                info!("control store health loop shutting down");
                return;
            }
        }
    }
}

pub async fn run_follower_poller(
    store: Arc<ControlStore>,
    events: Arc<EventBus>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last_seen: HashMap<&'static str, u64> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for table in TABLES {
                    match store.table_high_water_mark(table) {
                        Ok(revision) => {
                            let prev = last_seen.get(table).copied().unwrap_or(0);
                            if revision > prev {
                                last_seen.insert(table, revision);
                                events.publish(Event::ControlCommit(ControlCommitEvent {
                                    table: table.to_string(),
                                    revision,
                                }));
                            }
                        }
                        Err(e) => error!(table, error = %e, "failed to poll table revision"),
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("control store follower poller shutting down");
                return;
            }
        }
    }
}
