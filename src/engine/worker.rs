//! Background Worker
//!
//! One thread per engine, driven by crossbeam channels:
//! - sealed segment ids from the segment manager → write their hint files
//! - a `tick` timer → reap retired segments, run the compaction policy
//! - a shutdown channel → exit the loop

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorCode, IgniteError, Result};
use crate::hint::write_segment_hint;

use super::Shared;

/// Handle to the running worker thread
pub(crate) struct Worker {
    handle: JoinHandle<()>,
    shutdown_tx: Sender<()>,
}

impl Worker {
    pub(crate) fn spawn(shared: Arc<Shared>, sealed_rx: Receiver<u16>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);

        let handle = thread::Builder::new()
            .name("ignite-worker".to_string())
            .spawn(move || run(shared, sealed_rx, shutdown_rx))
            .map_err(|e| IgniteError::from_io(e, "failed to spawn background worker"))?;

        Ok(Self { handle, shutdown_tx })
    }

    /// Signal shutdown and wait for the current job to finish
    pub(crate) fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if self.handle.join().is_err() {
            error!("background worker panicked");
        }
    }
}

fn run(shared: Arc<Shared>, sealed_rx: Receiver<u16>, shutdown_rx: Receiver<()>) {
    let interval = shared.config.compaction_interval;
    let ticker = if interval.is_zero() {
        channel::never::<Instant>()
    } else {
        channel::tick(interval)
    };
    debug!(interval_ms = interval.as_millis() as u64, "background worker started");

    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(sealed_rx) -> msg => match msg {
                Ok(segment_id) => write_hint(&shared, segment_id),
                Err(_) => break,
            },
            recv(ticker) -> _ => on_tick(&shared),
        }
    }

    debug!("background worker stopped");
}

fn write_hint(shared: &Shared, segment_id: u16) {
    if !shared.config.hint_files || shared.shutdown.is_cancelled() {
        return;
    }
    // Retired by a compaction in the meantime
    let Some(segment) = shared.segments.handle(segment_id) else {
        return;
    };
    if segment.hint_path().exists() {
        return;
    }

    match write_segment_hint(&segment) {
        Ok(summary) => debug!(segment_id, entries = summary.entry_count, "sealed segment hinted"),
        Err(e) => warn!(segment_id, error = %e, "failed to write hint file"),
    }
}

fn on_tick(shared: &Shared) {
    if let Err(e) = shared.compactor.reap(&shared.segments) {
        warn!(error = %e, "failed to reap retired segments");
    }
    if shared.shutdown.is_cancelled() {
        return;
    }

    match shared
        .compactor
        .maybe_run(&shared.segments, &shared.index, &shared.shutdown)
    {
        Ok(Some(report)) if !report.is_empty() => info!(
            sources = report.sources.len(),
            outputs = report.outputs.len(),
            bytes_reclaimed = report.bytes_reclaimed,
            "background compaction completed"
        ),
        Ok(_) => {}
        Err(e) if e.code() == ErrorCode::Cancelled => debug!("background compaction cancelled"),
        Err(e) => error!(error = %e, "background compaction failed"),
    }
}
