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

use crate::bus::ChannelBus;
use crate::config::PollingConfig;
use crate::error::IndexerError;
use crate::sched::jittered_delay;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

/// One fetch result: the tasks to dispatch plus whether more work is already
/// known to be available.
pub struct Batch<T> {
    pub tasks: Vec<T>,
    pub more: bool,
}

impl<T> Batch<T> {
    pub fn done(tasks: Vec<T>) -> Self {
        Self { tasks, more: false }
    }

    pub fn more(tasks: Vec<T>) -> Self {
        Self { tasks, more: true }
    }
}

/// A unit of derived work. The id keys the in-flight registry; re-fetching an
/// id already in flight must be tolerated by sources.
pub trait PollTask: Send + Sync + Clone + 'static {
    fn id(&self) -> String;
}

#[async_trait]
pub trait TaskSource<T: PollTask>: Send + Sync {
    /// One-time setup before the first cycle.
    async fn initialize(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    async fn fetch(&self) -> Result<Batch<T>, IndexerError>;
}

/// Explicit re-queue is distinct from failure: returning `Retry` puts the
/// task back on the queue, while an error is fatal to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Handled,
    Retry,
}

#[async_trait]
pub trait TaskHandler<T: PollTask>: Send + Sync {
    async fn handle(&self, task: &T) -> Result<TaskOutcome, IndexerError>;
}

/// Runs once per cycle over the fetched batch; used for fan-out notifications
/// rather than per-task side effects.
#[async_trait]
pub trait BatchHook<T: PollTask>: Send + Sync {
    async fn on_batch(&self, tasks: &[T]) -> Result<(), IndexerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskState {
    Queued,
    Running,
}

struct EngineShared<T: PollTask> {
    config: PollingConfig,
    source: Arc<dyn TaskSource<T>>,
    handler: Option<Arc<dyn TaskHandler<T>>>,
    batch_hook: Option<Arc<dyn BatchHook<T>>>,
    trigger: Notify,
    pending: AtomicBool,
    cycling: AtomicBool,
    fetch_skipped: AtomicBool,
    failed: AtomicBool,
    in_flight: Mutex<HashMap<String, TaskState>>,
    error: Arc<Mutex<Option<IndexerError>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    work_tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T: PollTask> EngineShared<T> {
    /// Queue a poll cycle. Triggers coalesce through the notify permit; a
    /// cycle already queued is not duplicated.
    fn trigger_cycle(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    /// Timer wake-up: a no-op while a cycle is queued or running.
    fn timer_fired(&self) {
        if !self.pending.load(Ordering::SeqCst) && !self.cycling.load(Ordering::SeqCst) {
            self.trigger_cycle();
        }
    }

    fn fatal(&self, error: IndexerError) {
        warn!(
            target: "chainmirror",
            indexer = %self.config.name,
            error = %error,
            "polling indexer failed"
        );
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn bounded(&self) -> bool {
        self.config.tasks.is_some()
    }
}

struct Running<T: PollTask> {
    shared: Arc<EngineShared<T>>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// A named, independently startable engine keeping derived state eventually
/// consistent: fetch, dispatch with bounded concurrency, de-duplicate by task
/// id, and re-poll on notifications and/or a jittered timer.
pub struct PollingIndexer<T: PollTask> {
    config: PollingConfig,
    source: Arc<dyn TaskSource<T>>,
    handler: Option<Arc<dyn TaskHandler<T>>>,
    batch_hook: Option<Arc<dyn BatchHook<T>>>,
    bus: Arc<dyn ChannelBus>,
    error: Arc<Mutex<Option<IndexerError>>>,
    running: Mutex<Option<Running<T>>>,
}

impl<T: PollTask> PollingIndexer<T> {
    pub fn new(
        config: PollingConfig,
        source: Arc<dyn TaskSource<T>>,
        bus: Arc<dyn ChannelBus>,
    ) -> Self {
        Self {
            config,
            source,
            handler: None,
            batch_hook: None,
            bus,
            error: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler<T>>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_batch_hook(mut self, hook: Arc<dyn BatchHook<T>>) -> Self {
        self.batch_hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Number of tasks currently queued or running. Zero while stopped.
    pub fn in_flight(&self) -> usize {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.shared.in_flight.lock().unwrap().len())
            .unwrap_or(0)
    }

    pub fn take_error(&self) -> Option<IndexerError> {
        self.error.lock().unwrap().take()
    }

    pub async fn start(&self) -> Result<(), IndexerError> {
        {
            let running = self.running.lock().unwrap();
            if running.is_some() {
                return Err(IndexerError::invalid_state("start", "already running"));
            }
        }

        self.source.initialize().await?;

        let shared = Arc::new(EngineShared {
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            handler: self.handler.clone(),
            batch_hook: self.batch_hook.clone(),
            trigger: Notify::new(),
            pending: AtomicBool::new(false),
            cycling: AtomicBool::new(false),
            fetch_skipped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            error: Arc::clone(&self.error),
            timer: Mutex::new(None),
            work_tx: Mutex::new(None),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::new();

        if shared.bounded() && shared.handler.is_some() {
            let (work_tx, work_rx) = mpsc::unbounded_channel();
            *shared.work_tx.lock().unwrap() = Some(work_tx);
            let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
            for _ in 0..shared.config.workers {
                handles.push(tokio::spawn(worker_loop(
                    Arc::clone(&shared),
                    Arc::clone(&work_rx),
                    stop_rx.clone(),
                )));
            }
        }

        for channel in &shared.config.channels {
            handles.push(tokio::spawn(listener_loop(
                Arc::clone(&shared),
                self.bus.subscribe(channel),
                stop_rx.clone(),
            )));
        }

        handles.push(tokio::spawn(poll_loop(Arc::clone(&shared), stop_rx)));

        shared.trigger_cycle();

        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            // Lost a start race; tear our lane down again.
            let _ = stop_tx.send(true);
            for handle in handles {
                handle.abort();
            }
            return Err(IndexerError::invalid_state("start", "already running"));
        }
        *running = Some(Running {
            shared,
            stop_tx,
            handles,
        });

        info!(target: "chainmirror", indexer = %self.config.name, "polling indexer started");
        Ok(())
    }

    /// Kill and drain: queued work is discarded, in-flight handling finishes,
    /// timers and listeners are detached.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        let running = self
            .running
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| IndexerError::invalid_state("stop", "inactive"))?;

        let _ = running.stop_tx.send(true);
        if let Some(timer) = running.shared.timer.lock().unwrap().take() {
            timer.abort();
        }
        *running.shared.work_tx.lock().unwrap() = None;
        for handle in running.handles {
            let _ = handle.await;
        }
        running.shared.in_flight.lock().unwrap().clear();

        info!(target: "chainmirror", indexer = %self.config.name, "polling indexer stopped");
        Ok(())
    }
}

async fn listener_loop<T: PollTask>(
    shared: Arc<EngineShared<T>>,
    mut rx: tokio::sync::broadcast::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            msg = rx.recv() => match msg {
                Ok(()) => shared.trigger_cycle(),
                // Lagged just means a burst; one more cycle covers it.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => shared.trigger_cycle(),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn poll_loop<T: PollTask>(shared: Arc<EngineShared<T>>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = shared.trigger.notified() => {
                if *stop_rx.borrow() || shared.failed.load(Ordering::SeqCst) {
                    break;
                }
                shared.pending.store(false, Ordering::SeqCst);
                shared.cycling.store(true, Ordering::SeqCst);
                let cycle_start = Instant::now();
                let continue_now = run_cycle(&shared).await;
                shared.cycling.store(false, Ordering::SeqCst);
                if shared.failed.load(Ordering::SeqCst) {
                    break;
                }
                if continue_now {
                    shared.trigger_cycle();
                } else if let Some(interval) = shared.config.interval {
                    arm_timer(&shared, cycle_start + jittered_delay(interval));
                }
            }
        }
    }
}

fn arm_timer<T: PollTask>(shared: &Arc<EngineShared<T>>, deadline: Instant) {
    let task_shared = Arc::clone(shared);
    let mut timer = shared.timer.lock().unwrap();
    if let Some(old) = timer.take() {
        old.abort();
    }
    *timer = Some(tokio::spawn(async move {
        sleep_until(deadline).await;
        task_shared.timer_fired();
    }));
}

/// One poll cycle. Returns whether the next cycle should be queued
/// immediately.
async fn run_cycle<T: PollTask>(shared: &Arc<EngineShared<T>>) -> bool {
    if let Some(ceiling) = shared.config.tasks {
        if shared.in_flight.lock().unwrap().len() >= ceiling {
            // Backpressure: skip the fetch entirely; task completion or the
            // timer queues the next cycle.
            shared.fetch_skipped.store(true, Ordering::SeqCst);
            return false;
        }
    }

    let batch = match shared.source.fetch().await {
        Ok(batch) => batch,
        Err(e) => {
            shared.fatal(e);
            return false;
        }
    };
    let fetched = batch.tasks;

    if shared.bounded() && shared.handler.is_some() {
        let mut fresh = Vec::new();
        {
            let mut registry = shared.in_flight.lock().unwrap();
            for task in &fetched {
                let id = task.id();
                if registry.contains_key(&id) {
                    continue;
                }
                registry.insert(id, TaskState::Queued);
                fresh.push(task.clone());
            }
        }
        let work_tx = shared.work_tx.lock().unwrap().clone();
        if let Some(work_tx) = work_tx {
            for task in fresh {
                let _ = work_tx.send(task);
            }
        }
    } else if let Some(handler) = &shared.handler {
        // Unbounded mode: process the batch to completion before the hook.
        futures::stream::iter(fetched.clone())
            .for_each_concurrent(shared.config.workers, |task| {
                let handler = Arc::clone(handler);
                let shared = Arc::clone(shared);
                async move {
                    loop {
                        match handler.handle(&task).await {
                            Ok(TaskOutcome::Handled) => break,
                            Ok(TaskOutcome::Retry) => continue,
                            Err(e) => {
                                shared.fatal(e);
                                break;
                            }
                        }
                    }
                }
            })
            .await;
        if shared.failed.load(Ordering::SeqCst) {
            return false;
        }
    }

    if let Some(hook) = &shared.batch_hook {
        if let Err(e) = hook.on_batch(&fetched).await {
            shared.fatal(e);
            return false;
        }
    }

    batch.more
}

async fn worker_loop<T: PollTask>(
    shared: Arc<EngineShared<T>>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let task = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = stop_rx.changed() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else { break };
        if *stop_rx.borrow() {
            break;
        }
        run_task(&shared, task).await;
    }
}

async fn run_task<T: PollTask>(shared: &Arc<EngineShared<T>>, task: T) {
    let id = task.id();
    {
        let mut registry = shared.in_flight.lock().unwrap();
        if registry.get(&id) == Some(&TaskState::Running) {
            shared.fatal(IndexerError::TaskAlreadyRunning { id });
            return;
        }
        registry.insert(id.clone(), TaskState::Running);
    }

    let Some(handler) = shared.handler.as_ref() else {
        shared.in_flight.lock().unwrap().remove(&id);
        return;
    };

    match handler.handle(&task).await {
        Ok(TaskOutcome::Handled) => {
            shared.in_flight.lock().unwrap().remove(&id);
            // A skipped fetch gets its cycle back once capacity frees up.
            if shared.fetch_skipped.swap(false, Ordering::SeqCst) {
                shared.trigger_cycle();
            }
        }
        Ok(TaskOutcome::Retry) => {
            shared
                .in_flight
                .lock()
                .unwrap()
                .insert(id, TaskState::Queued);
            let work_tx = shared.work_tx.lock().unwrap().clone();
            if let Some(work_tx) = work_tx {
                let _ = work_tx.send(task);
            }
        }
        Err(e) => {
            shared.in_flight.lock().unwrap().remove(&id);
            shared.fatal(e);
        }
    }
}
