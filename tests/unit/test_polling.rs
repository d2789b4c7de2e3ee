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

#[path = "../common/mod.rs"]
mod common;

use async_trait::async_trait;
use chainmirror::bus::{ChannelBus, MemoryBus};
use chainmirror::config::PollingConfig;
use chainmirror::polling::{
    Batch, BatchHook, PollTask, PollingIndexer, TaskHandler, TaskOutcome, TaskSource,
};
use chainmirror::IndexerError;
use common::wait_until;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
struct Job {
    id: String,
}

fn job(id: &str) -> Job {
    Job { id: id.into() }
}

impl PollTask for Job {
    fn id(&self) -> String {
        self.id.clone()
    }
}

/// Replays scripted batches, then keeps returning empty ones.
struct ScriptedSource {
    batches: Mutex<VecDeque<Batch<Job>>>,
    fetches: AtomicUsize,
    fail: bool,
}

impl ScriptedSource {
    fn new(batches: Vec<Batch<Job>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            fetches: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskSource<Job> for ScriptedSource {
    async fn fetch(&self) -> Result<Batch<Job>, IndexerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(IndexerError::invalid_state("fetch", "scripted failure"));
        }
        Ok(self
            .batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Batch::done(vec![])))
    }
}

/// Counts handled tasks; optionally gates completion on a semaphore and
/// retries a configured set of ids once.
struct CountingHandler {
    handled: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    retry_once: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl CountingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handled: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            retry_once: Mutex::new(HashSet::new()),
            gate: None,
        })
    }

    fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            handled: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            retry_once: Mutex::new(HashSet::new()),
            gate: Some(gate),
        })
    }

    fn retrying(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            handled: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            retry_once: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            gate: None,
        })
    }

    fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler<Job> for CountingHandler {
    async fn handle(&self, task: &Job) -> Result<TaskOutcome, IndexerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.retry_once.lock().unwrap().remove(&task.id) {
            return Ok(TaskOutcome::Retry);
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| {
                IndexerError::invalid_state("handle", "gate closed")
            })?
            .forget();
        }
        self.handled.lock().unwrap().push(task.id.clone());
        Ok(TaskOutcome::Handled)
    }
}

struct RecordingHook {
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingHook {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BatchHook<Job> for RecordingHook {
    async fn on_batch(&self, tasks: &[Job]) -> Result<(), IndexerError> {
        self.batches
            .lock()
            .unwrap()
            .push(tasks.iter().map(|t| t.id.clone()).collect());
        Ok(())
    }
}

fn bus() -> Arc<dyn ChannelBus> {
    Arc::new(MemoryBus::new())
}

#[tokio::test]
async fn processes_the_initial_batch() {
    let config = PollingConfig::builder("jobs")
        .interval(Duration::from_millis(50))
        .workers(2)
        .build()
        .unwrap();
    let source = ScriptedSource::new(vec![Batch::done(vec![job("a"), job("b")])]);
    let handler = CountingHandler::new();
    let indexer =
        PollingIndexer::new(config, source.clone(), bus()).with_handler(handler.clone());

    indexer.start().await.unwrap();
    assert!(wait_until(|| async { handler.handled().len() == 2 }).await);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn continuation_skips_the_timer() {
    // One-hour interval: the second batch can only arrive via `more`.
    let config = PollingConfig::builder("jobs")
        .interval(Duration::from_secs(3600))
        .workers(1)
        .build()
        .unwrap();
    let source = ScriptedSource::new(vec![
        Batch::more(vec![job("a")]),
        Batch::done(vec![job("b")]),
    ]);
    let handler = CountingHandler::new();
    let indexer =
        PollingIndexer::new(config, source.clone(), bus()).with_handler(handler.clone());

    indexer.start().await.unwrap();
    assert!(wait_until(|| async { handler.handled() == vec!["a", "b"] }).await);
    assert!(source.fetches() >= 2);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn channel_notification_triggers_a_cycle() {
    let config = PollingConfig::builder("jobs")
        .channel("tick")
        .workers(1)
        .build()
        .unwrap();
    let bus: Arc<dyn ChannelBus> = Arc::new(MemoryBus::new());
    let source = ScriptedSource::new(vec![
        Batch::done(vec![]),
        Batch::done(vec![job("a")]),
    ]);
    let handler = CountingHandler::new();
    let indexer =
        PollingIndexer::new(config, source.clone(), Arc::clone(&bus)).with_handler(handler.clone());

    indexer.start().await.unwrap();
    assert!(wait_until(|| async { source.fetches() >= 1 }).await);
    bus.publish("tick").await.unwrap();
    assert!(wait_until(|| async { handler.handled() == vec!["a"] }).await);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn retry_requeues_the_task() {
    let config = PollingConfig::builder("jobs")
        .interval(Duration::from_millis(50))
        .tasks(4)
        .workers(1)
        .build()
        .unwrap();
    let source = ScriptedSource::new(vec![Batch::done(vec![job("a")])]);
    let handler = CountingHandler::retrying(&["a"]);
    let indexer =
        PollingIndexer::new(config, source.clone(), bus()).with_handler(handler.clone());

    indexer.start().await.unwrap();
    assert!(wait_until(|| async { handler.handled() == vec!["a"] }).await);
    assert_eq!(handler.attempts(), 2);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn in_flight_ids_are_not_dispatched_twice() {
    let config = PollingConfig::builder("jobs")
        .channel("tick")
        .tasks(4)
        .workers(1)
        .build()
        .unwrap();
    let bus: Arc<dyn ChannelBus> = Arc::new(MemoryBus::new());
    let gate = Arc::new(Semaphore::new(0));
    let source = ScriptedSource::new(vec![
        Batch::done(vec![job("a")]),
        Batch::done(vec![job("a")]),
        Batch::done(vec![job("b")]),
    ]);
    let handler = CountingHandler::gated(Arc::clone(&gate));
    let indexer =
        PollingIndexer::new(config, source.clone(), Arc::clone(&bus)).with_handler(handler.clone());

    indexer.start().await.unwrap();
    assert!(wait_until(|| async { source.fetches() >= 1 }).await);
    // "a" is still running; refetching it must not dispatch a second copy.
    bus.publish("tick").await.unwrap();
    assert!(wait_until(|| async { source.fetches() >= 2 }).await);
    bus.publish("tick").await.unwrap();
    assert!(wait_until(|| async { source.fetches() >= 3 }).await);

    gate.add_permits(4);
    assert!(wait_until(|| async { handler.handled() == vec!["a", "b"] }).await);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn fetch_backs_off_at_the_task_ceiling() {
    let config = PollingConfig::builder("jobs")
        .channel("tick")
        .tasks(1)
        .workers(1)
        .build()
        .unwrap();
    let bus: Arc<dyn ChannelBus> = Arc::new(MemoryBus::new());
    let gate = Arc::new(Semaphore::new(0));
    let source = ScriptedSource::new(vec![
        Batch::done(vec![job("a")]),
        Batch::done(vec![job("b")]),
    ]);
    let handler = CountingHandler::gated(Arc::clone(&gate));
    let indexer =
        PollingIndexer::new(config, source.clone(), Arc::clone(&bus)).with_handler(handler.clone());

    indexer.start().await.unwrap();
    assert!(wait_until(|| async { indexer.in_flight() == 1 }).await);

    // At the ceiling the cycle skips its fetch entirely.
    bus.publish("tick").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.fetches(), 1);

    // Completion hands the skipped cycle back.
    gate.add_permits(2);
    assert!(wait_until(|| async { handler.handled() == vec!["a", "b"] }).await);
    assert!(source.fetches() >= 2);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn batch_hook_sees_each_fetched_batch() {
    let config = PollingConfig::builder("jobs")
        .interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let source = ScriptedSource::new(vec![Batch::more(vec![job("a"), job("b")])]);
    let hook = RecordingHook::new();
    let indexer = PollingIndexer::new(config, source, bus()).with_batch_hook(hook.clone());

    indexer.start().await.unwrap();
    assert!(
        wait_until(|| async { hook.batches.lock().unwrap().len() >= 2 }).await,
        "hook should run for the scripted batch and its continuation"
    );
    assert_eq!(hook.batches.lock().unwrap()[0], vec!["a", "b"]);
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn source_failure_is_fatal_and_recorded() {
    let config = PollingConfig::builder("jobs")
        .interval(Duration::from_millis(50))
        .build()
        .unwrap();
    let source = ScriptedSource::failing();
    let indexer = PollingIndexer::new(config, source, bus());

    indexer.start().await.unwrap();
    let mut recorded = None;
    assert!(
        wait_until(|| {
            let r = indexer.take_error();
            let hit = r.is_some();
            if hit {
                recorded = r;
            }
            async move { hit }
        })
        .await
    );
    assert!(matches!(recorded, Some(IndexerError::InvalidState { .. })));
    indexer.stop().await.unwrap();
}

#[tokio::test]
async fn start_and_stop_reject_wrong_states() {
    let config = PollingConfig::builder("jobs")
        .interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let source = ScriptedSource::new(vec![]);
    let indexer = PollingIndexer::new(config, source, bus());

    indexer.start().await.unwrap();
    assert!(matches!(
        indexer.start().await,
        Err(IndexerError::InvalidState { .. })
    ));
    indexer.stop().await.unwrap();
    assert!(matches!(
        indexer.stop().await,
        Err(IndexerError::InvalidState { .. })
    ));
}
