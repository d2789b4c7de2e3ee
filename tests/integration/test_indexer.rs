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

use chainmirror::builder::ChainIndexerBuilder;
use chainmirror::config::ChainIndexerConfig;
use chainmirror::events::RollbackAction;
use chainmirror::indexer::{ChainIndexer, SyncStatus};
use chainmirror::protocol::Point;
use chainmirror::storage::memory::MemoryStore;
use chainmirror::storage::ChainStore;
use chainmirror::IndexerError;
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const WATCHED: &str = "addr-watched";

fn test_config() -> ChainIndexerConfig {
    ChainIndexerConfig::builder()
        .debounce_window(Duration::from_millis(10))
        .end_delay(Duration::from_millis(20))
        .build()
        .unwrap()
}

struct Fixture {
    store: Arc<dyn ChainStore>,
    bus: Arc<RecordingBus>,
    rollbacks: Arc<RecordingRollback>,
    initializer: Arc<CountingInitializer>,
    hook: Arc<CountingInSyncHook>,
    handler: Arc<StoreHandler>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(RecordingBus::new()),
            rollbacks: Arc::new(RecordingRollback::new()),
            initializer: Arc::new(CountingInitializer::default()),
            hook: Arc::new(CountingInSyncHook::default()),
            handler: Arc::new(StoreHandler::new(Some("deposit"), Some("orders"))),
        }
    }

    async fn build(&self, config: ChainIndexerConfig) -> ChainIndexer<TaggedEvent> {
        ChainIndexerBuilder::new(config)
            .with_store(Arc::clone(&self.store))
            .with_bus(self.bus.clone())
            .declare_events(&["deposit"])
            .add_filter(Arc::new(AddressFilter {
                address: WATCHED.into(),
                ty: "deposit",
            }))
            .add_handler("deposit", self.handler.clone())
            .add_rollback_handler(self.rollbacks.clone())
            .add_initializer(self.initializer.clone())
            .add_in_sync_hook(self.hook.clone())
            .build()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn mirrors_deposits_and_spends_end_to_end() {
    init_tracing();
    let fixture = Fixture::new();
    let mut indexer = fixture.build(test_config()).await;

    let node_tip = tip(102, "h102", 3);
    let node = ScriptedNode::new(
        vec![
            backward(Point::Origin, node_tip.clone()),
            forward(
                block(
                    100,
                    "h100",
                    1,
                    vec![tx("tx-a", vec![], vec![out(WATCHED), out("addr-other")])],
                ),
                node_tip.clone(),
            ),
            forward(
                block(
                    101,
                    "h101",
                    2,
                    vec![tx("tx-b", vec![input("tx-a", 0)], vec![out("addr-other")])],
                ),
                node_tip.clone(),
            ),
            forward(block(102, "h102", 3, vec![]), node_tip.clone()),
        ],
        node_tip,
    );

    indexer.start(Box::new(node)).await.unwrap();
    assert_eq!(indexer.status(), SyncStatus::Active);

    let store = Arc::clone(&fixture.store);
    assert!(
        wait_until(|| {
            let store = Arc::clone(&store);
            async move {
                let outputs = store.outputs().await.unwrap();
                outputs.len() == 1 && outputs[0].spent_slot == Some(101)
            }
        })
        .await,
        "watched output should be mirrored and then marked spent"
    );

    let outputs = fixture.store.outputs().await.unwrap();
    assert_eq!(outputs[0].address, WATCHED);
    assert_eq!(outputs[0].tag.as_deref(), Some("deposit"));
    assert_eq!(outputs[0].created_slot, 100);

    // First callback was the intersection rollback.
    assert_eq!(
        fixture.rollbacks.calls(),
        vec![(RollbackAction::Begin, Point::Origin)]
    );
    assert_eq!(fixture.hook.fired.load(Ordering::SeqCst), 1);

    let bus = fixture.bus.clone();
    assert!(
        wait_until(|| {
            let bus = bus.clone();
            async move { bus.published().contains(&"orders".to_string()) }
        })
        .await,
        "debounced notification should reach the bus"
    );

    indexer.stop(false, true).await.unwrap();
    assert_eq!(indexer.status(), SyncStatus::Inactive);

    // End rollback replays against the last fully processed block, and the
    // checkpoint row for it survives the stop.
    let calls = fixture.rollbacks.calls();
    assert_eq!(calls.last().unwrap(), &(RollbackAction::End, specific(102, "h102")));
    let slots: Vec<u64> = fixture
        .store
        .recent_blocks(10)
        .await
        .unwrap()
        .iter()
        .map(|b| b.slot)
        .collect();
    assert!(slots.contains(&100) && slots.contains(&101) && slots.contains(&102));

    assert!(matches!(
        indexer.stop(false, true).await,
        Err(IndexerError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn rollback_rewinds_the_mirror() {
    init_tracing();
    let fixture = Fixture::new();
    let mut indexer = fixture.build(test_config()).await;

    let node_tip = tip(101, "h101b", 2);
    let node = ScriptedNode::new(
        vec![
            forward(
                block(100, "h100", 1, vec![tx("tx-a", vec![], vec![out(WATCHED)])]),
                node_tip.clone(),
            ),
            forward(
                block(101, "h101", 2, vec![tx("tx-b", vec![], vec![out(WATCHED)])]),
                node_tip.clone(),
            ),
            backward(specific(100, "h100"), node_tip.clone()),
            forward(block(101, "h101b", 2, vec![]), node_tip.clone()),
        ],
        node_tip,
    );

    indexer.start(Box::new(node)).await.unwrap();

    let rollbacks = fixture.rollbacks.clone();
    assert!(
        wait_until(|| {
            let rollbacks = rollbacks.clone();
            async move {
                rollbacks
                    .calls()
                    .contains(&(RollbackAction::Rollback, specific(100, "h100")))
            }
        })
        .await
    );

    let store = Arc::clone(&fixture.store);
    assert!(
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.output_count().await.unwrap() == 1 }
        })
        .await,
        "the output created past the rollback point should be gone"
    );
    let outputs = fixture.store.outputs().await.unwrap();
    assert_eq!(outputs[0].tx_id, "tx-a");

    indexer.stop(false, true).await.unwrap();
    let slots: Vec<u64> = fixture
        .store
        .recent_blocks(10)
        .await
        .unwrap()
        .iter()
        .map(|b| b.slot)
        .collect();
    assert_eq!(slots, vec![101, 100]);
}

#[tokio::test]
async fn restart_resumes_from_stored_checkpoints() {
    init_tracing();
    let fixture = Fixture::new();
    let mut first = fixture.build(test_config()).await;

    let node_tip = tip(100, "h100", 1);
    let node = ScriptedNode::new(
        vec![forward(
            block(100, "h100", 1, vec![tx("tx-a", vec![], vec![out(WATCHED)])]),
            node_tip.clone(),
        )],
        node_tip.clone(),
    );
    first.start(Box::new(node)).await.unwrap();

    let store = Arc::clone(&fixture.store);
    assert!(
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.output_count().await.unwrap() == 1 }
        })
        .await
    );
    first.stop(false, true).await.unwrap();

    let mut second = fixture.build(test_config()).await;
    let node = ScriptedNode::new(vec![], node_tip);
    let probe = node.probe();
    second.start(Box::new(node)).await.unwrap();

    let offered = probe.offered.lock().unwrap().clone();
    assert_eq!(offered.len(), 1);
    assert!(
        offered[0].contains(&specific(100, "h100")),
        "resume must offer the stored checkpoint, got {offered:?}"
    );
    assert_eq!(fixture.initializer.runs.load(Ordering::SeqCst), 2);

    second.stop(false, true).await.unwrap();
}

#[tokio::test]
async fn handler_failure_is_fatal_to_the_run() {
    init_tracing();
    let fixture = Fixture::new();
    let config = test_config();
    let mut indexer = ChainIndexerBuilder::<TaggedEvent>::new(config)
        .with_store(Arc::clone(&fixture.store))
        .declare_events(&["deposit"])
        .add_filter(Arc::new(AddressFilter {
            address: WATCHED.into(),
            ty: "deposit",
        }))
        .add_handler("deposit", Arc::new(FailingHandler))
        .build()
        .await
        .unwrap();

    let node_tip = tip(100, "h100", 1);
    let node = ScriptedNode::new(
        vec![forward(
            block(100, "h100", 1, vec![tx("tx-a", vec![], vec![out(WATCHED)])]),
            node_tip.clone(),
        )],
        node_tip,
    );
    indexer.start(Box::new(node)).await.unwrap();

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
    let message = format!("{}", recorded.unwrap());
    assert!(message.contains("failing-handler"), "got: {message}");

    // The failure tears the run down on its own; stop has nothing left to do.
    assert!(
        wait_until(|| {
            let status = indexer.status();
            async move { status == SyncStatus::Inactive }
        })
        .await,
        "a fatal handler error should force the indexer inactive"
    );
    assert!(matches!(
        indexer.stop(true, false).await,
        Err(IndexerError::InvalidState { .. })
    ));

    // A fresh start after the forced shutdown works.
    let node = ScriptedNode::new(vec![], tip(100, "h100", 1));
    indexer.start(Box::new(node)).await.unwrap();
    indexer.stop(false, false).await.unwrap();
}

#[tokio::test]
async fn distinct_event_types_dispatch_independently() {
    init_tracing();
    let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new());
    let deposits = Arc::new(StoreHandler::new(Some("deposit"), None));
    let withdrawals = Arc::new(StoreHandler::new(Some("withdrawal"), None));
    let mut indexer = ChainIndexerBuilder::<TaggedEvent>::new(test_config())
        .with_store(Arc::clone(&store))
        .declare_events(&["deposit", "withdrawal"])
        .add_filter(Arc::new(AddressFilter {
            address: "addr-in".into(),
            ty: "deposit",
        }))
        .add_filter(Arc::new(AddressFilter {
            address: "addr-out".into(),
            ty: "withdrawal",
        }))
        .add_handler("deposit", deposits.clone())
        .add_handler("withdrawal", withdrawals.clone())
        .build()
        .await
        .unwrap();

    let node_tip = tip(100, "h100", 1);
    let node = ScriptedNode::new(
        vec![forward(
            block(
                100,
                "h100",
                1,
                vec![tx("tx-a", vec![], vec![out("addr-in"), out("addr-out")])],
            ),
            node_tip.clone(),
        )],
        node_tip,
    );
    indexer.start(Box::new(node)).await.unwrap();

    let probe_store = Arc::clone(&store);
    assert!(
        wait_until(|| {
            let store = Arc::clone(&probe_store);
            async move { store.output_count().await.unwrap() == 2 }
        })
        .await
    );
    let outputs = store.outputs().await.unwrap();
    let tags: Vec<Option<&str>> = outputs.iter().map(|o| o.tag.as_deref()).collect();
    assert!(tags.contains(&Some("deposit")) && tags.contains(&Some("withdrawal")));
    assert_eq!(deposits.handled.load(Ordering::SeqCst), 1);
    assert_eq!(withdrawals.handled.load(Ordering::SeqCst), 1);
    indexer.stop(false, true).await.unwrap();
}

#[tokio::test]
async fn rollback_refreshes_slot_time_rules() {
    init_tracing();
    let fixture = Fixture::new();
    let mut indexer = fixture.build(test_config()).await;

    // The node tip pins the snapshot's ledger tip at slot 100; rolling back
    // to 50 lands behind it and must discard the snapshot.
    let node_tip = tip(100, "h100", 1);
    let node = ScriptedNode::new(
        vec![
            forward(block(100, "h100", 1, vec![]), node_tip.clone()),
            backward(specific(50, "h50"), node_tip.clone()),
            forward(block(60, "h60b", 1, vec![]), node_tip.clone()),
        ],
        node_tip,
    );
    let probe = node.probe();
    indexer.start(Box::new(node)).await.unwrap();

    assert!(
        wait_until(|| {
            let era_queries = Arc::clone(&probe.era_queries);
            async move { era_queries.load(Ordering::SeqCst) == 2 }
        })
        .await,
        "the era rules should be re-queried after the rollback"
    );
    indexer.stop(false, true).await.unwrap();
}

#[tokio::test]
async fn end_slot_fires_the_end_signal() {
    init_tracing();
    let fixture = Fixture::new();
    let config = ChainIndexerConfig::builder()
        .end_at_slot(101)
        .end_delay(Duration::from_millis(20))
        .debounce_window(Duration::from_millis(10))
        .build()
        .unwrap();
    let mut indexer = fixture.build(config).await;

    let node_tip = tip(102, "h102", 3);
    let node = ScriptedNode::new(
        vec![
            forward(block(100, "h100", 1, vec![]), node_tip.clone()),
            forward(block(101, "h101", 2, vec![]), node_tip.clone()),
            forward(block(102, "h102", 3, vec![]), node_tip.clone()),
        ],
        node_tip,
    );
    indexer.start(Box::new(node)).await.unwrap();

    let mut end = indexer.end_signal();
    tokio::time::timeout(Duration::from_secs(2), end.changed())
        .await
        .expect("end signal should fire")
        .unwrap();
    assert!(*end.borrow());

    indexer.stop(false, true).await.unwrap();
}

#[tokio::test]
async fn end_signal_reports_only_real_completions() {
    init_tracing();
    let fixture = Fixture::new();
    let config = ChainIndexerConfig::builder()
        .end_at_slot(100)
        .end_delay(Duration::from_millis(20))
        .debounce_window(Duration::from_millis(10))
        .build()
        .unwrap();
    let mut indexer = fixture.build(config).await;

    let node_tip = tip(100, "h100", 1);
    let node = ScriptedNode::new(
        vec![forward(block(100, "h100", 1, vec![]), node_tip.clone())],
        node_tip.clone(),
    );
    indexer.start(Box::new(node)).await.unwrap();
    let mut end = indexer.end_signal();
    tokio::time::timeout(Duration::from_secs(2), end.changed())
        .await
        .expect("end signal should fire")
        .unwrap();
    assert!(*end.borrow());
    indexer.stop(false, true).await.unwrap();

    // Restart resumes at the checkpoint past the end slot. A receiver taken
    // now must stay quiet until the end fires again for real; the previous
    // run's value must not leak through as a change.
    let node = ScriptedNode::new(vec![], node_tip);
    indexer.start(Box::new(node)).await.unwrap();
    let mut end = indexer.end_signal();
    tokio::time::timeout(Duration::from_secs(2), end.changed())
        .await
        .expect("end signal should fire after the restart")
        .unwrap();
    assert!(*end.borrow(), "restart leaked a stale end-signal value");
    indexer.stop(false, true).await.unwrap();
}

#[tokio::test]
async fn start_rejects_a_running_indexer() {
    init_tracing();
    let fixture = Fixture::new();
    let mut indexer = fixture.build(test_config()).await;

    let node_tip = tip(100, "h100", 1);
    let node = ScriptedNode::new(vec![], node_tip.clone());
    indexer.start(Box::new(node)).await.unwrap();

    let second_node = ScriptedNode::new(vec![], node_tip);
    assert!(matches!(
        indexer.start(Box::new(second_node)).await,
        Err(IndexerError::InvalidState { .. })
    ));
    indexer.stop(false, true).await.unwrap();
}
