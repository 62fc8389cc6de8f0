//! The sync client.
//!
//! A cycle drains the change log, merges what it read, posts the batch and
//! reconciles the server's verdict back into the log:
//!
//! ```text
//! Idle --drain--> Draining --post--> AwaitingResponse --reconcile--> Idle
//! ```
//!
//! [`SyncClient::run`] drives cycles from new log rows, debounced so a burst
//! of edits goes out as one batch.

use crate::apply::ApplyEngine;
use crate::changes::{ChangeLog, CHANGES_TABLE, TASKS_TABLE};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::tabs::CrossTabChannel;
use crate::transport::SyncTransport;
use curio_storage::{Key, Listener, ListenerId, Transaction, TransactionOptions};
use curio_sync_protocol::{merge_changes, Change, MergedChanges, SyncResponse, IGNORED_SOURCE};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// The current state of the sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle running.
    Idle,
    /// Reading and merging the log.
    Draining,
    /// Batch posted, waiting for the server.
    AwaitingResponse,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of cycles that reached the server and were reconciled.
    pub cycles_completed: u64,
    /// Total number of changes posted.
    pub changes_sent: u64,
    /// Total number of changes the server allowed or applied.
    pub acknowledged: u64,
    /// Total number of changes the server refused or failed.
    pub rejected: u64,
    /// Total number of returned changes applied locally.
    pub applied: u64,
    /// Total number of cycles that failed.
    pub failed_cycles: u64,
    /// Last successful cycle.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Number of merged changes posted.
    pub sent: usize,
    /// Log rows removed because merging annihilated them.
    pub discarded: usize,
    /// Changes reported allowed or successful.
    pub acknowledged: usize,
    /// Changes reported disallowed or errored.
    pub rejected: usize,
    /// Returned changes that altered the local store.
    pub applied: usize,
    /// Duration of the cycle.
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Reconciled {
    acknowledged: usize,
    rejected: usize,
}

/// Sends logged changes to the server and reconciles its answers.
pub struct SyncClient {
    ctx: SyncContext,
    log: ChangeLog,
    transport: Arc<dyn SyncTransport>,
    apply: Arc<ApplyEngine>,
    tabs: Option<Arc<CrossTabChannel>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cycle: Mutex<()>,
    wake: Arc<Notify>,
    listener: ListenerId,
    shutdown: watch::Sender<bool>,
}

impl SyncClient {
    /// Creates a client. New log rows wake [`SyncClient::run`].
    pub fn new(ctx: SyncContext, transport: Arc<dyn SyncTransport>, apply: Arc<ApplyEngine>) -> Self {
        let wake = Arc::new(Notify::new());
        let listener = {
            let wake = wake.clone();
            ctx.db().subscribe(Listener::callback(move |event| {
                if event.inserts_into(CHANGES_TABLE).next().is_some() {
                    wake.notify_one();
                }
            }))
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            log: ChangeLog::new(ctx.db().clone()),
            ctx,
            transport,
            apply,
            tabs: None,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle: Mutex::new(()),
            wake,
            listener,
            shutdown,
        }
    }

    /// Only runs cycles while this tab holds the fetcher role.
    pub fn with_tabs(mut self, tabs: Arc<CrossTabChannel>) -> Self {
        self.tabs = Some(tabs);
        self
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The log this client drains.
    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    /// Saves `change` to the log; the debounce loop picks it up.
    pub fn queue_change(&self, change: &Change) -> SyncResult<Option<i64>> {
        self.log.save(change)
    }

    /// Aborts the in-flight request, if any, and starts a fresh signal for
    /// later requests.
    pub fn navigate(&self) {
        self.ctx.abort().navigate();
    }

    /// Stops [`SyncClient::run`] after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn may_sync(&self) -> bool {
        match &self.tabs {
            Some(tabs) => tabs.is_leader() || tabs.try_claim(),
            None => true,
        }
    }

    /// Runs one full cycle.
    ///
    /// Cycles never overlap; a call made while one is running waits for it.
    /// On failure the log is left as it was, apart from rows merging
    /// annihilated, so the next cycle resends the same changes.
    pub async fn sync(&self) -> SyncResult<SyncCycleResult> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let result = self.run_cycle().await;
        self.set_state(SyncState::Idle);

        let mut stats = self.stats.write();
        match result {
            Ok(mut result) => {
                result.duration = started.elapsed();
                stats.cycles_completed += 1;
                stats.changes_sent += result.sent as u64;
                stats.acknowledged += result.acknowledged as u64;
                stats.rejected += result.rejected as u64;
                stats.applied += result.applied as u64;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                info!(
                    sent = result.sent,
                    acknowledged = result.acknowledged,
                    rejected = result.rejected,
                    applied = result.applied,
                    "sync cycle completed"
                );
                Ok(result)
            }
            Err(e) => {
                stats.failed_cycles += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> SyncResult<SyncCycleResult> {
        self.set_state(SyncState::Draining);
        let (merged, discarded) = self.drain()?;
        let payload: Vec<Value> = merged.flatten().iter().map(Change::to_wire).collect();
        let sent = payload.len();

        self.set_state(SyncState::AwaitingResponse);
        debug!(count = sent, "posting changes");
        let mut signal = self.ctx.abort().signal();
        let response = tokio::select! {
            response = self.transport.sync(payload) => response?,
            _ = signal.aborted() => {
                debug!("sync request aborted");
                return Err(SyncError::Cancelled);
            }
        };

        let reconciled = self.reconcile(&merged, &response)?;
        for channel in &response.max_revs {
            self.ctx.session().record_max_rev(&channel.channel_id, channel.rev);
        }
        let applied = self.apply.apply_entries(&response.returned).await?.len();

        Ok(SyncCycleResult {
            sent,
            discarded,
            acknowledged: reconciled.acknowledged,
            rejected: reconciled.rejected,
            applied,
            duration: Duration::ZERO,
        })
    }

    /// Merges every unacknowledged row up to the current max rev, removing
    /// rows the merge annihilated.
    fn drain(&self) -> SyncResult<(MergedChanges, usize)> {
        let cutoff = self.log.max_rev()?;
        let page_size = self.ctx.config().page_size;
        let mut merged = MergedChanges::new();
        let mut after = 0;
        loop {
            let page = self.log.page(after, cutoff, page_size)?;
            let pending = page
                .changes
                .into_iter()
                .filter(|c| c.server_rev.is_none() && !c.is_rejected());
            merge_changes(pending, &mut merged)?;
            match page.next_after {
                Some(next) => after = next,
                None => break,
            }
        }
        let discarded = self.log.delete(merged.discarded_revs())?;
        debug!(cutoff, merged = merged.len(), discarded, "log drained");
        Ok((merged, discarded))
    }

    /// Writes the server's verdict into the log and task tables.
    ///
    /// Each verdict names the rev the batch carried; it applies to every
    /// log row merged into that rev.
    fn reconcile(&self, merged: &MergedChanges, response: &SyncResponse) -> SyncResult<Reconciled> {
        let options = TransactionOptions::new()
            .with_tables([CHANGES_TABLE, TASKS_TABLE])
            .with_source(IGNORED_SOURCE);
        self.ctx.db().transaction(options, |txn| -> SyncResult<Reconciled> {
            let mut counts = Reconciled::default();
            for ack in &response.allowed {
                // An acknowledgement without a server rev still marks the row sent.
                stamp(txn, merged, ack.rev, &[("server_rev", json!(ack.server_rev.unwrap_or(0)))])?;
                counts.acknowledged += 1;
            }
            for refused in &response.disallowed {
                stamp(txn, merged, refused.rev, &[("disallowed", Value::Bool(true))])?;
                counts.rejected += 1;
            }
            for failure in &response.errors {
                let mut fields = vec![
                    ("errored", Value::Bool(true)),
                    ("errors", Value::Array(failure.errors.clone())),
                ];
                if let Some(server_rev) = failure.server_rev {
                    fields.push(("server_rev", json!(server_rev)));
                }
                stamp(txn, merged, failure.rev, &fields)?;
                counts.rejected += 1;
            }
            for success in &response.successes {
                for folded in merged.folded_revs(success.rev) {
                    txn.delete(CHANGES_TABLE, &Key::Int(*folded))?;
                }
                counts.acknowledged += 1;
            }
            for task in &response.tasks {
                txn.put(TASKS_TABLE, serde_json::to_value(task)?)?;
            }
            Ok(counts)
        })
    }

    /// The debounce loop.
    ///
    /// Waits for a new log row (or a poll tick), lets the burst settle for
    /// [`crate::SyncConfig::debounce`] but no longer than
    /// [`crate::SyncConfig::max_wait`], then runs a cycle. Failed cycles are
    /// logged and retried on the next trigger. Returns after
    /// [`SyncClient::shutdown`].
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let poll = self.ctx.config().poll_interval;
        while !*shutdown.borrow() {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tick(poll) => {}
                _ = shutdown.changed() => break,
            }
            if !self.settle(&mut shutdown).await {
                break;
            }
            if !self.may_sync() {
                debug!("another tab holds the fetcher role, skipping cycle");
                continue;
            }
            if let Err(e) = self.sync().await {
                warn!(error = %e, retryable = e.is_retryable(), "sync cycle failed");
            }
        }
        debug!("sync loop stopped");
    }

    /// Waits until no new row arrived for a full quiet period or the burst
    /// hit `max_wait`. Returns false on shutdown.
    async fn settle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let config = self.ctx.config();
        let deadline = tokio::time::Instant::now() + config.max_wait;
        loop {
            let quiet_until = (tokio::time::Instant::now() + config.debounce).min(deadline);
            tokio::select! {
                _ = self.wake.notified() => {
                    if tokio::time::Instant::now() >= deadline {
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(quiet_until) => return true,
                _ = shutdown.changed() => return false,
            }
        }
    }
}

/// Sets `fields` on every log row folded into `rev`.
fn stamp(
    txn: &mut Transaction<'_>,
    merged: &MergedChanges,
    rev: i64,
    fields: &[(&str, Value)],
) -> SyncResult<()> {
    for folded in merged.folded_revs(rev) {
        txn.update(CHANGES_TABLE, &Key::Int(*folded), |row| {
            if let Some(map) = row.as_object_mut() {
                for (field, value) in fields {
                    map.insert((*field).to_string(), value.clone());
                }
            }
        })?;
    }
    Ok(())
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.ctx.db().unsubscribe(self.listener);
    }
}

async fn tick(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}
