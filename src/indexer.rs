/*
 * Copyright 2025 Flamewire
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::bus::{ChannelBus, ViewRefresher};
use crate::config::ChainIndexerConfig;
use crate::debounce::{DebouncedNotifier, DebouncedViewRefresher};
use crate::driver::{EventDriver, WriteQueue};
use crate::error::IndexerError;
use crate::events::{
    Context, EventDispatch, IndexEvent, InSyncHook, Initializer, RollbackAction, RollbackHandler,
    TxFilter,
};
use crate::ingestor::BlockIngestor;
use crate::protocol::{NodeClient, Point, RawBlock, Tip};
use crate::sched::FixedBackoff;
use crate::slot_time::SlotTimeInterpreter;
use crate::storage::{BlockRow, ChainStore};
use crate::sync::{ChainSyncClient, SyncObserver, SyncOutcome};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of a [`ChainIndexer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl SyncStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Inactive => "inactive",
            SyncStatus::Starting => "starting",
            SyncStatus::Active => "active",
            SyncStatus::Stopping => "stopping",
        }
    }
}

/// Per-run mutable state. Guarded by a std mutex and never held across an
/// await.
struct RunState {
    interpreter: Option<SlotTimeInterpreter>,
    ingestor: BlockIngestor,
    in_sync: bool,
    first_callback_seen: bool,
    last_block: Option<BlockRow>,
    end_scheduled: bool,
    last_maintenance: Instant,
}

impl RunState {
    fn new(config: &ChainIndexerConfig) -> Self {
        Self {
            interpreter: None,
            ingestor: BlockIngestor::new(config.checkpoint_every, config.report_every),
            in_sync: false,
            first_callback_seen: false,
            last_block: None,
            end_scheduled: false,
            last_maintenance: Instant::now(),
        }
    }
}

struct Shared<E: IndexEvent> {
    config: ChainIndexerConfig,
    status: Mutex<SyncStatus>,
    store: Arc<dyn ChainStore>,
    notifier: DebouncedNotifier,
    refresher: Option<DebouncedViewRefresher>,
    filters: Vec<Arc<dyn TxFilter<E>>>,
    dispatch: EventDispatch<E>,
    rollback_handlers: Vec<Arc<dyn RollbackHandler>>,
    initializers: Vec<Arc<dyn Initializer>>,
    in_sync_hooks: Vec<Arc<dyn InSyncHook>>,
    run: Mutex<RunState>,
    pending_notify: Arc<Mutex<BTreeSet<String>>>,
    pending_refresh: Arc<Mutex<BTreeSet<String>>>,
    queue: Mutex<Option<WriteQueue>>,
    end_tx: Arc<watch::Sender<bool>>,
    error: Mutex<Option<IndexerError>>,
}

impl<E: IndexEvent> Shared<E> {
    /// Return a slot-time interpreter valid for `slot`, rebuilding the
    /// snapshot from the node when the current one has gone stale.
    async fn interpreter_for(
        &self,
        client: &mut dyn NodeClient,
        slot: u64,
    ) -> Result<SlotTimeInterpreter, IndexerError> {
        if let Some(current) = self.run.lock().unwrap().interpreter.clone() {
            if !current.is_stale_for(slot) {
                return Ok(current);
            }
        }
        let eras = client.era_summaries().await?;
        let system_start = client.system_start().await?;
        let ledger_tip = client.tip().await?;
        let rebuilt = SlotTimeInterpreter::new(system_start, eras, ledger_tip.slot);
        if rebuilt.is_stale_for(slot) {
            return Err(IndexerError::StaleInterpreter {
                slot,
                stale_slot: rebuilt.stale_slot(),
            });
        }
        debug!(
            target: "chainmirror",
            ledger_tip = ledger_tip.slot,
            "slot-time interpreter rebuilt"
        );
        self.run.lock().unwrap().interpreter = Some(rebuilt.clone());
        Ok(rebuilt)
    }

    async fn handle_roll_forward(
        &self,
        client: &mut dyn NodeClient,
        block: RawBlock,
        tip: Tip,
    ) -> Result<(), IndexerError> {
        let interpreter = self.interpreter_for(client, block.slot).await?;
        let time = interpreter.slot_to_time(block.slot)?;

        let (must_store, newly_in_sync, in_sync) = {
            let mut run = self.run.lock().unwrap();
            run.first_callback_seen = true;
            let newly = !run.in_sync && block.is_tip(&tip);
            if newly {
                run.in_sync = true;
                run.ingestor.set_in_sync(true);
            }
            let must_store = run.ingestor.roll_forward(&block, time);
            (must_store, newly, run.in_sync)
        };

        if newly_in_sync {
            info!(target: "chainmirror", slot = block.slot, "caught up with node tip");
            for hook in &self.in_sync_hooks {
                hook.once_in_sync()
                    .await
                    .map_err(|e| IndexerError::handler("in-sync hook", block.slot, e))?;
            }
        }

        let row = BlockRow {
            slot: block.slot,
            hash: block.hash.clone(),
            height: block.height,
            time,
        };
        let mut block_written = false;
        if must_store {
            self.store.insert_block(&row).await?;
            block_written = true;
        }

        let ctx = Context {
            slot: block.slot,
            block_hash: block.hash.clone(),
            block_height: block.height,
            time,
            in_sync,
        };
        let queue = self
            .queue
            .lock()
            .unwrap()
            .clone()
            .ok_or(IndexerError::WriteQueueClosed)?;

        let mut relevant = false;
        for tx in &block.transactions {
            let ctx = &ctx;
            // Filters run concurrently; events keep filter registration order.
            let filter_futures = self.filters.iter().map(|filter| async move {
                filter
                    .filter(tx, ctx)
                    .await
                    .map_err(|e| IndexerError::handler(filter.name(), ctx.slot, e))
            });
            let mut events: Vec<E> = Vec::new();
            for result in join_all(filter_futures).await {
                events.extend(result?);
            }

            if !events.is_empty() {
                relevant = true;
                if !block_written {
                    self.store.insert_block(&row).await?;
                    block_written = true;
                }
                let driver = EventDriver::new(
                    Arc::new(tx.clone()),
                    block.slot,
                    queue.clone(),
                    Arc::clone(&self.pending_notify),
                    Arc::clone(&self.pending_refresh),
                );

                // Distinct event types dispatch concurrently; within one type
                // handlers run in registration order, event by event.
                let mut groups: Vec<(&'static str, Vec<E>)> = Vec::new();
                for event in events {
                    let ty = event.event_type();
                    match groups.iter_mut().find(|(t, _)| *t == ty) {
                        Some((_, list)) => list.push(event),
                        None => groups.push((ty, vec![event])),
                    }
                }
                let driver = &driver;
                let dispatch_futures = groups.iter().map(|(ty, list)| async move {
                    let handlers = self.dispatch.handlers_for(ty)?;
                    for event in list {
                        for handler in handlers {
                            handler.handle(event, driver, ctx).await.map_err(|e| {
                                IndexerError::handler(handler.name(), ctx.slot, e)
                            })?;
                        }
                    }
                    Ok::<(), IndexerError>(())
                });
                for result in join_all(dispatch_futures).await {
                    result?;
                }
                driver.finish().await?;
            }

            if !tx.inputs.is_empty() {
                // Only spends of mirrored, still-unspent outputs matter; the
                // probe also tells us whether this block needs a row for the
                // spent_slot reference.
                let matches = self.store.unspent_matches(&tx.inputs).await?;
                if matches > 0 {
                    relevant = true;
                    if !block_written {
                        self.store.insert_block(&row).await?;
                        block_written = true;
                    }
                    queue.mark_spent(tx.inputs.clone(), block.slot).await?;
                }
            }
        }

        let maintenance_due = {
            let mut run = self.run.lock().unwrap();
            let due = run.in_sync
                || run.last_maintenance.elapsed() >= self.config.maintenance_interval;
            if due {
                run.last_maintenance = Instant::now();
            }
            due
        };
        if maintenance_due {
            let removed = self.store.gc_unreferenced_blocks().await?;
            if removed > 0 {
                debug!(target: "chainmirror", removed, "pruned unreferenced blocks");
            }
            self.flush_signals();
        }

        {
            let mut run = self.run.lock().unwrap();
            run.ingestor.roll_forward_done(&block, relevant);
            run.last_block = Some(row);
        }

        if let Some(end) = self.config.end_slot {
            if block.slot >= end {
                self.schedule_end(block.slot);
            }
        }
        Ok(())
    }

    async fn handle_roll_backward(
        &self,
        _client: &mut dyn NodeClient,
        point: Point,
        _tip: Tip,
    ) -> Result<(), IndexerError> {
        let action = {
            let mut run = self.run.lock().unwrap();
            let action = if run.first_callback_seen {
                RollbackAction::Rollback
            } else {
                RollbackAction::Begin
            };
            run.first_callback_seen = true;
            run.ingestor.roll_backward(&point);
            action
        };

        for handler in &self.rollback_handlers {
            handler
                .rollback(action, &point)
                .await
                .map_err(|e| {
                    IndexerError::handler(handler.name(), point.slot().unwrap_or(0), e)
                })?;
        }

        match &point {
            Point::Origin => self.store.wipe().await?,
            Point::Specific { slot, .. } => {
                let removed = self.store.delete_blocks_after(*slot).await?;
                if removed > 0 {
                    debug!(target: "chainmirror", slot, removed, "rolled back mirrored blocks");
                }
            }
            Point::Tip => {}
        }

        {
            let mut run = self.run.lock().unwrap();
            match (&run.last_block, point.slot()) {
                (Some(last), Some(slot)) if last.slot > slot => run.last_block = None,
                _ => {}
            }
            if matches!(point, Point::Origin) {
                run.last_block = None;
            }
            // The era rules may differ on the branch we are switching to; a
            // rollback behind the snapshot's ledger tip discards it so the
            // next block re-queries the node.
            let outdated = match (&run.interpreter, point.slot()) {
                (Some(interpreter), Some(slot)) => slot < interpreter.ledger_tip_slot(),
                (Some(_), None) => true,
                _ => false,
            };
            if outdated {
                run.interpreter = None;
            }
        }
        Ok(())
    }

    /// Hand the accumulated notify/refresh requests to their debouncers.
    fn flush_signals(&self) {
        let channels: Vec<String> =
            std::mem::take(&mut *self.pending_notify.lock().unwrap())
                .into_iter()
                .collect();
        for channel in channels {
            self.notifier.notify(&channel);
        }

        let views: Vec<String> = std::mem::take(&mut *self.pending_refresh.lock().unwrap())
            .into_iter()
            .collect();
        if views.is_empty() {
            return;
        }
        match &self.refresher {
            Some(refresher) => {
                for view in views {
                    refresher.refresh(&view);
                }
            }
            None => warn!(
                target: "chainmirror",
                ?views,
                "view refresh requested but no refresher is configured"
            ),
        }
    }

    /// Tear the run down after a fatal sync-lane failure. The error slot is
    /// already populated; staged writes drain, signals are discarded, and the
    /// status drops to inactive without waiting for the host to call `stop`.
    async fn force_stop(&self) {
        warn!(target: "chainmirror", "sync lane failed; forcing shutdown");
        let queue = self.queue.lock().unwrap().take();
        if let Some(queue) = queue {
            if let Err(e) = queue.drain().await {
                warn!(target: "chainmirror", error = %e, "write queue drain failed");
            }
        }
        self.pending_notify.lock().unwrap().clear();
        self.pending_refresh.lock().unwrap().clear();
        self.notifier.cancel_all();
        if let Some(refresher) = &self.refresher {
            refresher.cancel_all();
        }
        *self.status.lock().unwrap() = SyncStatus::Inactive;
    }

    fn schedule_end(&self, slot: u64) {
        {
            let mut run = self.run.lock().unwrap();
            if run.end_scheduled {
                return;
            }
            run.end_scheduled = true;
        }
        info!(target: "chainmirror", slot, "reached end of configured range");
        let end_tx = Arc::clone(&self.end_tx);
        let delay = self.config.end_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = end_tx.send(true);
        });
    }
}

struct Observer<E: IndexEvent> {
    shared: Arc<Shared<E>>,
}

#[async_trait]
impl<E: IndexEvent> SyncObserver for Observer<E> {
    async fn roll_forward(
        &self,
        client: &mut dyn NodeClient,
        block: RawBlock,
        tip: Tip,
    ) -> Result<(), IndexerError> {
        self.shared.handle_roll_forward(client, block, tip).await
    }

    async fn roll_backward(
        &self,
        client: &mut dyn NodeClient,
        point: Point,
        tip: Tip,
    ) -> Result<(), IndexerError> {
        self.shared.handle_roll_backward(client, point, tip).await
    }
}

/// The chain-following engine: resumes from the newest stored checkpoint,
/// ingests blocks through the chain-sync lane, extracts events, drives
/// handlers, and keeps the relational mirror rollback-consistent.
///
/// Built through [`ChainIndexerBuilder`](crate::builder::ChainIndexerBuilder).
pub struct ChainIndexer<E: IndexEvent> {
    shared: Arc<Shared<E>>,
    sync: Option<ChainSyncClient>,
    queue_task: Option<tokio::task::JoinHandle<()>>,
    end_rx: watch::Receiver<bool>,
}

impl<E: IndexEvent> ChainIndexer<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ChainIndexerConfig,
        store: Arc<dyn ChainStore>,
        bus: Arc<dyn ChannelBus>,
        refresher: Option<Arc<dyn ViewRefresher>>,
        refresh_concurrently: bool,
        filters: Vec<Arc<dyn TxFilter<E>>>,
        dispatch: EventDispatch<E>,
        rollback_handlers: Vec<Arc<dyn RollbackHandler>>,
        initializers: Vec<Arc<dyn Initializer>>,
        in_sync_hooks: Vec<Arc<dyn InSyncHook>>,
    ) -> Self {
        let notifier = DebouncedNotifier::new(bus, config.debounce_window);
        let refresher = refresher.map(|r| {
            DebouncedViewRefresher::new(r, config.debounce_window, refresh_concurrently)
        });
        let (end_tx, end_rx) = watch::channel(false);
        let run = RunState::new(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                status: Mutex::new(SyncStatus::Inactive),
                store,
                notifier,
                refresher,
                filters,
                dispatch,
                rollback_handlers,
                initializers,
                in_sync_hooks,
                run: Mutex::new(run),
                pending_notify: Arc::new(Mutex::new(BTreeSet::new())),
                pending_refresh: Arc::new(Mutex::new(BTreeSet::new())),
                queue: Mutex::new(None),
                end_tx: Arc::new(end_tx),
                error: Mutex::new(None),
            }),
            sync: None,
            queue_task: None,
            end_rx,
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.shared.status.lock().unwrap()
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.shared.store
    }

    /// Flips to `true` once, `end_delay` after the configured end slot was
    /// reached. Hosts select on this to drive their own shutdown.
    pub fn end_signal(&self) -> watch::Receiver<bool> {
        self.end_rx.clone()
    }

    /// The first failure recorded by the sync lane or at shutdown, if any.
    pub fn take_error(&self) -> Option<IndexerError> {
        self.shared.error.lock().unwrap().take()
    }

    /// Resume-or-begin: negotiate an intersection from stored checkpoints (or
    /// `begin` on an empty or reset mirror), then start the chain-sync lane.
    pub async fn start(&mut self, client: Box<dyn NodeClient>) -> Result<(), IndexerError> {
        {
            let mut status = self.shared.status.lock().unwrap();
            if *status != SyncStatus::Inactive {
                return Err(IndexerError::invalid_state("start", status.as_str()));
            }
            *status = SyncStatus::Starting;
        }
        match self.start_inner(client).await {
            Ok(()) => {
                // A fatal error in the sync lane may already have moved the
                // status on; only a still-starting run becomes active.
                let mut status = self.shared.status.lock().unwrap();
                if *status == SyncStatus::Starting {
                    *status = SyncStatus::Active;
                }
                Ok(())
            }
            Err(e) => {
                *self.shared.status.lock().unwrap() = SyncStatus::Inactive;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self, mut client: Box<dyn NodeClient>) -> Result<(), IndexerError> {
        let shared = Arc::clone(&self.shared);
        shared.store.init_schema().await?;
        for initializer in &shared.initializers {
            initializer.initialize(&shared.store).await?;
        }

        *shared.error.lock().unwrap() = None;
        shared.pending_notify.lock().unwrap().clear();
        shared.pending_refresh.lock().unwrap().clear();
        *shared.run.lock().unwrap() = RunState::new(&shared.config);
        // Reset silently: receivers taken after this start must not observe a
        // change until the end slot is actually reached.
        shared.end_tx.send_if_modified(|ended| {
            *ended = false;
            false
        });
        self.end_rx.mark_unchanged();

        let (queue, queue_task) = WriteQueue::spawn(Arc::clone(&shared.store));
        *shared.queue.lock().unwrap() = Some(queue);
        self.queue_task = Some(queue_task);

        let points = if shared.config.reset {
            shared.config.begin.clone()
        } else {
            let recent = shared
                .store
                .recent_blocks(shared.config.checkpoint_history)
                .await?;
            if recent.is_empty() {
                shared.config.begin.clone()
            } else {
                recent
                    .iter()
                    .map(|b| Point::Specific {
                        slot: b.slot,
                        hash: b.hash.clone(),
                    })
                    .collect()
            }
        };

        // Wait for the node to know about our intended start slot; a node
        // still catching up would reject the intersection.
        let intended = points.iter().filter_map(Point::slot).max().unwrap_or(0);
        let backoff = FixedBackoff::new(shared.config.node_ready_backoff);
        loop {
            let tip = client.tip().await?;
            if tip.slot >= intended {
                break;
            }
            info!(
                target: "chainmirror",
                node_tip = tip.slot,
                intended,
                "waiting for node to reach the intended start slot"
            );
            backoff.wait().await;
        }

        let observer = Arc::new(Observer {
            shared: Arc::clone(&shared),
        });
        let sink_shared = Arc::clone(&shared);
        let on_error = Arc::new(move |e: &IndexerError| {
            {
                let mut slot = sink_shared.error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(IndexerError::SyncTerminated {
                        message: e.to_string(),
                    });
                }
            }
            let takeover = {
                let mut status = sink_shared.status.lock().unwrap();
                match *status {
                    SyncStatus::Starting | SyncStatus::Active => {
                        *status = SyncStatus::Stopping;
                        true
                    }
                    _ => false,
                }
            };
            if takeover {
                let stopping = Arc::clone(&sink_shared);
                tokio::spawn(async move {
                    stopping.force_stop().await;
                });
            }
        });

        let (sync, intersection, tip) = ChainSyncClient::start(
            client,
            points,
            shared.config.in_flight_window,
            observer,
            on_error,
        )
        .await?;
        self.sync = Some(sync);

        info!(
            target: "chainmirror",
            ?intersection,
            tip = tip.slot,
            "chain indexer started"
        );

        if let Some(end) = shared.config.end_slot {
            if intersection.slot().unwrap_or(0) >= end {
                shared.schedule_end(end);
            }
        }
        Ok(())
    }

    /// Stop the sync lane, drain staged writes, replay a synthetic rollback to
    /// the last fully processed block, and persist that block as the resume
    /// checkpoint (unless `save_checkpoint` is off).
    pub async fn stop(
        &mut self,
        immediate: bool,
        save_checkpoint: bool,
    ) -> Result<(), IndexerError> {
        {
            let mut status = self.shared.status.lock().unwrap();
            if *status != SyncStatus::Active {
                return Err(IndexerError::invalid_state("stop", status.as_str()));
            }
            *status = SyncStatus::Stopping;
        }
        let shared = Arc::clone(&self.shared);

        if let Some(sync) = self.sync.take() {
            match sync.shutdown(immediate).await {
                SyncOutcome::Errored(e) => {
                    *shared.error.lock().unwrap() = Some(e);
                }
                outcome => {
                    debug!(target: "chainmirror", ?outcome, "chain sync lane stopped");
                }
            }
        }

        // Flush outstanding signals before tearing the debouncers down.
        let channels: Vec<String> =
            std::mem::take(&mut *shared.pending_notify.lock().unwrap())
                .into_iter()
                .collect();
        for channel in channels {
            if let Err(e) = shared.notifier.notify_now(&channel).await {
                warn!(target: "chainmirror", channel, error = %e, "final notify failed");
            }
        }
        let views: Vec<String> = std::mem::take(&mut *shared.pending_refresh.lock().unwrap())
            .into_iter()
            .collect();
        if let Some(refresher) = &shared.refresher {
            for view in views {
                if let Err(e) = refresher.refresh_now(&view).await {
                    warn!(target: "chainmirror", view, error = %e, "final refresh failed");
                }
            }
        }
        shared.notifier.cancel_all();
        if let Some(refresher) = &shared.refresher {
            refresher.cancel_all();
        }

        let queue = shared.queue.lock().unwrap().take();
        if let Some(queue) = queue {
            if let Err(e) = queue.drain().await {
                warn!(target: "chainmirror", error = %e, "write queue drain failed");
            }
        }
        if let Some(task) = self.queue_task.take() {
            let _ = task.await;
        }

        let last = shared.run.lock().unwrap().last_block.clone();
        if let Some(last) = last {
            let point = Point::Specific {
                slot: last.slot,
                hash: last.hash.clone(),
            };
            for handler in &shared.rollback_handlers {
                if let Err(e) = handler.rollback(RollbackAction::End, &point).await {
                    warn!(
                        target: "chainmirror",
                        handler = handler.name(),
                        error = %e,
                        "end rollback handler failed"
                    );
                }
            }
            shared.store.delete_blocks_after(last.slot).await?;
            if save_checkpoint {
                shared.store.insert_block(&last).await?;
            }
        }

        shared.run.lock().unwrap().ingestor.flush();
        *shared.status.lock().unwrap() = SyncStatus::Inactive;
        info!(target: "chainmirror", "chain indexer stopped");
        Ok(())
    }
}
