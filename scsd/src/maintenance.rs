//! Periodic housekeeping.
//!
//! Every 100 ms the maintenance task:
//!
//! * mails due compile error reports (on a detached task, one batch at a time)
//! * appends queued cache records to `Cache.dat`
//! * merges shader request lines into `ShaderList/` every `ShaderListInterval`
//!
//! Each step runs on its own blocking thread. A step that fails or panics is
//! logged and the remaining steps, and later ticks, still run.

use std::fmt::Display;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::error_log::ErrorBatch;
use crate::mailer::{ErrorMailer, MailError, MailReport};

pub const TICK: Duration = Duration::from_millis(100);

/// Run `step` on a blocking thread; `false` when it failed or panicked.
async fn run_step<F, T, E>(name: &'static str, step: F) -> bool
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    match tokio::task::spawn_blocking(step).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            warn!(step = name, "maintenance step failed: {err}");
            false
        }
        Err(join) if join.is_panic() => {
            error!(step = name, "maintenance step panicked");
            false
        }
        Err(join) => {
            warn!(step = name, "maintenance step cancelled: {join}");
            false
        }
    }
}

/// Mail every group of the batch. Returns the number of mails sent, or the
/// last delivery error once all groups were attempted. Entries of groups that
/// could not be delivered go back into the error log for the next report.
pub fn send_batch(mailer: &dyn ErrorMailer, batch: ErrorBatch) -> Result<usize, MailError> {
    let mut sent = 0;
    let mut last_error = None;
    let mut undelivered = Vec::new();
    for group in batch.groups() {
        let report = MailReport::from_group(&group);
        match mailer.send(&report) {
            Ok(()) => sent += 1,
            Err(err) => {
                warn!(
                    subject = %report.subject,
                    entries = group.entries.len(),
                    "error report not delivered, requeued: {err}"
                );
                undelivered.extend(group.entries.iter().map(|&e| e.clone()));
                last_error = Some(err);
            }
        }
    }
    batch.requeue(undelivered);
    // `batch` drops here, allowing the next report.
    match last_error {
        Some(err) => Err(err),
        None => Ok(sent),
    }
}

fn report_slot(ctx: &ServerContext) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    ctx.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_report(ctx: &ServerContext, batch: ErrorBatch) -> JoinHandle<()> {
    let mailer = Arc::clone(&ctx.mailer);
    debug!(entries = batch.entries.len(), "sending compile error report");
    tokio::spawn(async move {
        run_step("error report", move || send_batch(mailer.as_ref(), batch)).await;
    })
}

/// State carried between ticks.
pub struct Maintenance {
    ctx: ServerContext,
    last_shader_flush: Instant,
}

impl Maintenance {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            last_shader_flush: Instant::now(),
        }
    }

    /// One pass over every step.
    pub async fn tick(&mut self, now: Instant) {
        {
            let mut report = report_slot(&self.ctx);
            let reporting = report.as_ref().is_some_and(|h| !h.is_finished());
            if !reporting && let Some(batch) = self.ctx.errors.take_batch(now) {
                *report = Some(spawn_report(&self.ctx, batch));
            }
        }

        if self.ctx.cache.stats().pending_records > 0 {
            let cache = Arc::clone(&self.ctx.cache);
            run_step("cache flush", move || cache.flush_pending()).await;
        }

        if now.saturating_duration_since(self.last_shader_flush)
            >= self.ctx.config.shader_list_interval
        {
            self.last_shader_flush = now;
            if self.ctx.shader_lists.pending_lines() > 0 {
                let lists = Arc::clone(&self.ctx.shader_lists);
                let dir = self.ctx.config.shader_list_dir();
                run_step("shader list flush", move || lists.flush(&dir)).await;
            }
        }
    }

    /// Wait for the report started by the latest tick, if any.
    #[cfg(test)]
    pub async fn wait_for_report(&mut self) {
        wait_for_report(&self.ctx).await;
    }
}

/// Start the maintenance loop.
pub fn start(ctx: ServerContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut maintenance = Maintenance::new(ctx);
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?TICK, "maintenance task started");
        loop {
            ticker.tick().await;
            maintenance.tick(Instant::now()).await;
        }
    })
}

async fn wait_for_report(ctx: &ServerContext) {
    let in_flight = report_slot(ctx).take();
    if let Some(handle) = in_flight {
        let _ = handle.await;
    }
}

/// Final drain on shutdown: cache records, shader lists and any queued
/// compile errors, regardless of their timers. Waits for an in-flight error
/// report first.
pub async fn flush_all(ctx: &ServerContext) {
    let cache = Arc::clone(&ctx.cache);
    run_step("final cache flush", move || cache.flush_pending()).await;

    let lists = Arc::clone(&ctx.shader_lists);
    let dir = ctx.config.shader_list_dir();
    run_step("final shader list flush", move || lists.flush(&dir)).await;

    // A report still in flight holds the log; let it finish before draining.
    wait_for_report(ctx).await;
    if let Some(batch) = ctx.errors.take_all() {
        let _ = spawn_report(ctx, batch).await;
    }
}
