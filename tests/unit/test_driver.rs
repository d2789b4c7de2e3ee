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

use chainmirror::driver::{EventDriver, WriteQueue};
use chainmirror::storage::memory::MemoryStore;
use chainmirror::storage::{BlockRow, ChainStore, NewOutput};
use chainmirror::IndexerError;
use common::{input, out, out_with_script, tx};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

async fn store_with_block() -> Arc<dyn ChainStore> {
    let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new());
    store.init_schema().await.unwrap();
    store
        .insert_block(&BlockRow {
            slot: 100,
            hash: "h100".into(),
            height: 1,
            time: 1_500_000_100,
        })
        .await
        .unwrap();
    store
}

fn driver_for(tx: chainmirror::protocol::Transaction, queue: WriteQueue) -> EventDriver {
    EventDriver::new(
        Arc::new(tx),
        100,
        queue,
        Arc::new(Mutex::new(BTreeSet::new())),
        Arc::new(Mutex::new(BTreeSet::new())),
    )
}

fn new_output(tx_id: &str, ix: u32) -> NewOutput {
    NewOutput {
        tag: None,
        tx_id: tx_id.into(),
        tx_ix: ix,
        address: "addr1".into(),
        value: "1".into(),
        datum: None,
        datum_hash: None,
        script_hash: None,
        created_slot: 100,
    }
}

#[tokio::test]
async fn queue_runs_jobs_in_submission_order() {
    let store = store_with_block().await;
    let (queue, worker) = WriteQueue::spawn(Arc::clone(&store));

    let ids = queue
        .insert_outputs(vec![new_output("tx1", 0), new_output("tx1", 1)])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let marked = queue.mark_spent(vec![input("tx1", 0)], 100).await.unwrap();
    assert_eq!(marked, 1);

    queue.drain().await.unwrap();
    drop(queue);
    worker.await.unwrap();

    let outputs = store.outputs().await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].spent_slot, Some(100));
    assert_eq!(outputs[1].spent_slot, None);
}

#[tokio::test]
async fn queue_reports_closure() {
    let store = store_with_block().await;
    let (queue, worker) = WriteQueue::spawn(Arc::clone(&store));
    worker.abort();
    let _ = worker.await;
    let result = queue.insert_outputs(vec![new_output("tx1", 0)]).await;
    assert!(matches!(result, Err(IndexerError::WriteQueueClosed)));
}

#[tokio::test]
async fn store_materializes_each_index_once() {
    let store = store_with_block().await;
    let (queue, _worker) = WriteQueue::spawn(Arc::clone(&store));
    let driver = driver_for(tx("tx1", vec![], vec![out("addr1"), out("addr2")]), queue);

    let first = driver
        .store(&[0], |_, output| {
            Some((Some("order".to_string()), output.address.clone()))
        })
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].index, 0);
    assert_eq!(first[0].tag.as_deref(), Some("order"));

    // Same index again, same tag: reuse the row, no second insert.
    let second = driver
        .store(&[0], |_, output| {
            Some((Some("order".to_string()), output.address.clone()))
        })
        .await
        .unwrap();
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(store.output_count().await.unwrap(), 1);
}

#[tokio::test]
async fn store_tag_conflict_keeps_first_row() {
    let store = store_with_block().await;
    let (queue, _worker) = WriteQueue::spawn(Arc::clone(&store));
    let driver = driver_for(tx("tx1", vec![], vec![out("addr1")]), queue);

    let first = driver
        .store(&[0], |_, _| Some((Some("order".to_string()), ())))
        .await
        .unwrap();
    let second = driver
        .store(&[0], |_, _| Some((Some("trade".to_string()), ())))
        .await
        .unwrap();
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(second[0].tag.as_deref(), Some("order"));
    assert_eq!(store.output_count().await.unwrap(), 1);
}

#[tokio::test]
async fn store_skips_declined_and_out_of_bounds_indices() {
    let store = store_with_block().await;
    let (queue, _worker) = WriteQueue::spawn(Arc::clone(&store));
    let driver = driver_for(tx("tx1", vec![], vec![out("addr1"), out("addr2")]), queue);

    let stored = driver
        .store(&[0, 1, 7], |ix, output| {
            if ix == 0 {
                Some((None, output.address.clone()))
            } else {
                None
            }
        })
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].index, 0);
    assert_eq!(store.output_count().await.unwrap(), 1);
}

#[tokio::test]
async fn finish_flushes_collected_scripts() {
    let store = store_with_block().await;
    let (queue, _worker) = WriteQueue::spawn(Arc::clone(&store));
    let driver = driver_for(
        tx("tx1", vec![], vec![out_with_script("addr1", "scripthash1")]),
        queue,
    );

    driver
        .store_with_script(&[0], |_, output| Some((None, output.address.clone())))
        .await
        .unwrap();
    assert_eq!(store.script_count().await.unwrap(), 0);
    driver.finish().await.unwrap();
    assert_eq!(store.script_count().await.unwrap(), 1);
}

#[tokio::test]
async fn plain_store_ignores_scripts() {
    let store = store_with_block().await;
    let (queue, _worker) = WriteQueue::spawn(Arc::clone(&store));
    let driver = driver_for(
        tx("tx1", vec![], vec![out_with_script("addr1", "scripthash1")]),
        queue,
    );

    driver
        .store(&[0], |_, output| Some((None, output.address.clone())))
        .await
        .unwrap();
    driver.finish().await.unwrap();
    assert_eq!(store.script_count().await.unwrap(), 0);
}

#[tokio::test]
async fn notify_and_refresh_accumulate_deduplicated() {
    let store = store_with_block().await;
    let (queue, _worker) = WriteQueue::spawn(Arc::clone(&store));
    let pending_notify = Arc::new(Mutex::new(BTreeSet::new()));
    let pending_refresh = Arc::new(Mutex::new(BTreeSet::new()));
    let driver = EventDriver::new(
        Arc::new(tx("tx1", vec![], vec![])),
        100,
        queue,
        Arc::clone(&pending_notify),
        Arc::clone(&pending_refresh),
    );

    driver.notify("orders");
    driver.notify("orders");
    driver.notify("trades");
    driver.refresh("order_book");

    let channels: Vec<String> = pending_notify.lock().unwrap().iter().cloned().collect();
    assert_eq!(channels, vec!["orders".to_string(), "trades".to_string()]);
    assert_eq!(pending_refresh.lock().unwrap().len(), 1);
}
