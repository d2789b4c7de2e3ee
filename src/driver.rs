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

use crate::error::IndexerError;
use crate::protocol::{OutputRef, Transaction};
use crate::storage::{ChainStore, NewOutput, ScriptRow};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

enum WriteJob {
    Outputs {
        rows: Vec<NewOutput>,
        reply: oneshot::Sender<Result<Vec<i64>, IndexerError>>,
    },
    Scripts {
        rows: Vec<ScriptRow>,
        reply: oneshot::Sender<Result<(), IndexerError>>,
    },
    MarkSpent {
        refs: Vec<OutputRef>,
        slot: u64,
        reply: oneshot::Sender<Result<u64, IndexerError>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// The global write-serialization lane. All mirror mutations staged by event
/// handlers pass through one worker in submission order; callers await the
/// reply to observe completion and errors.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriteQueue {
    pub fn spawn(store: Arc<dyn ChainStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Outputs { rows, reply } => {
                        let _ = reply.send(store.insert_outputs(&rows).await);
                    }
                    WriteJob::Scripts { rows, reply } => {
                        let _ = reply.send(store.insert_scripts(&rows).await);
                    }
                    WriteJob::MarkSpent { refs, slot, reply } => {
                        let _ = reply.send(store.mark_spent(&refs, slot).await);
                    }
                    WriteJob::Flush { reply } => {
                        let _ = reply.send(());
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub async fn insert_outputs(&self, rows: Vec<NewOutput>) -> Result<Vec<i64>, IndexerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Outputs { rows, reply })
            .map_err(|_| IndexerError::WriteQueueClosed)?;
        rx.await.map_err(|_| IndexerError::WriteQueueClosed)?
    }

    pub async fn insert_scripts(&self, rows: Vec<ScriptRow>) -> Result<(), IndexerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Scripts { rows, reply })
            .map_err(|_| IndexerError::WriteQueueClosed)?;
        rx.await.map_err(|_| IndexerError::WriteQueueClosed)?
    }

    pub async fn mark_spent(&self, refs: Vec<OutputRef>, slot: u64) -> Result<u64, IndexerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::MarkSpent { refs, slot, reply })
            .map_err(|_| IndexerError::WriteQueueClosed)?;
        rx.await.map_err(|_| IndexerError::WriteQueueClosed)?
    }

    /// Resolves once every previously submitted job has executed.
    pub async fn drain(&self) -> Result<(), IndexerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Flush { reply })
            .map_err(|_| IndexerError::WriteQueueClosed)?;
        rx.await.map_err(|_| IndexerError::WriteQueueClosed)
    }
}

/// A record staged by [`EventDriver::store`], with its surrogate id
/// back-filled after the batched insert completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stored<R> {
    pub id: i64,
    pub index: u32,
    pub tag: Option<String>,
    pub record: R,
}

#[derive(Clone)]
struct Memoized {
    id: i64,
    tag: Option<String>,
}

/// Per-transaction accumulator. Materializes outputs of interest at most once
/// per positional index, defers inserts to the write-serialization lane, and
/// collects scripts plus notify/refresh signals for later flushing.
pub struct EventDriver {
    tx: Arc<Transaction>,
    slot: u64,
    queue: WriteQueue,
    memo: Mutex<HashMap<u32, Memoized>>,
    scripts: Mutex<HashMap<String, ScriptRow>>,
    pending_notify: Arc<Mutex<BTreeSet<String>>>,
    pending_refresh: Arc<Mutex<BTreeSet<String>>>,
}

impl EventDriver {
    /// Normally constructed by the chain indexer, once per transaction with
    /// events. Public so handler code can be driven directly in tests.
    pub fn new(
        tx: Arc<Transaction>,
        slot: u64,
        queue: WriteQueue,
        pending_notify: Arc<Mutex<BTreeSet<String>>>,
        pending_refresh: Arc<Mutex<BTreeSet<String>>>,
    ) -> Self {
        Self {
            tx,
            slot,
            queue,
            memo: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            pending_notify,
            pending_refresh,
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Stage output rows for the given positional indices. `classify` returns
    /// the indexer-assigned tag plus a derived record, or `None` to skip the
    /// index. Each index is materialized at most once per transaction; a
    /// repeated index reuses the first classification's row and only warns if
    /// the tags disagree.
    pub async fn store<R, F>(
        &self,
        indices: &[u32],
        classify: F,
    ) -> Result<Vec<Stored<R>>, IndexerError>
    where
        F: Fn(u32, &crate::protocol::TxOutput) -> Option<(Option<String>, R)>,
    {
        self.store_inner(indices, classify, false).await
    }

    /// Like [`store`](EventDriver::store), additionally caching any script
    /// carried by the selected outputs for side-channel insertion on
    /// [`finish`](EventDriver::finish).
    pub async fn store_with_script<R, F>(
        &self,
        indices: &[u32],
        classify: F,
    ) -> Result<Vec<Stored<R>>, IndexerError>
    where
        F: Fn(u32, &crate::protocol::TxOutput) -> Option<(Option<String>, R)>,
    {
        self.store_inner(indices, classify, true).await
    }

    async fn store_inner<R, F>(
        &self,
        indices: &[u32],
        classify: F,
        with_script: bool,
    ) -> Result<Vec<Stored<R>>, IndexerError>
    where
        F: Fn(u32, &crate::protocol::TxOutput) -> Option<(Option<String>, R)>,
    {
        let mut fresh: Vec<(u32, Option<String>, R)> = Vec::new();
        let mut rows: Vec<NewOutput> = Vec::new();
        let mut reused: Vec<Stored<R>> = Vec::new();

        for &index in indices {
            let Some(output) = self.tx.outputs.get(index as usize) else {
                warn!(
                    target: "chainmirror",
                    tx = %self.tx.id,
                    index,
                    "requested output index out of bounds"
                );
                continue;
            };
            let Some((tag, record)) = classify(index, output) else {
                continue;
            };

            let memoized = self.memo.lock().unwrap().get(&index).cloned();
            if let Some(memoized) = memoized {
                if memoized.tag != tag {
                    warn!(
                        target: "chainmirror",
                        tx = %self.tx.id,
                        index,
                        previous = ?memoized.tag,
                        requested = ?tag,
                        "classification tag conflict for already-stored output"
                    );
                }
                reused.push(Stored {
                    id: memoized.id,
                    index,
                    tag: memoized.tag,
                    record,
                });
                continue;
            }

            if with_script {
                if let Some(script) = &output.script {
                    match &output.script_hash {
                        Some(hash) => {
                            self.scripts.lock().unwrap().insert(
                                hash.clone(),
                                ScriptRow {
                                    script_hash: hash.clone(),
                                    script_type: script.script_type.clone(),
                                    script: script.script.clone(),
                                },
                            );
                        }
                        None => warn!(
                            target: "chainmirror",
                            tx = %self.tx.id,
                            index,
                            "output carries a script but no script hash"
                        ),
                    }
                }
            }

            rows.push(NewOutput {
                tag: tag.clone(),
                tx_id: self.tx.id.clone(),
                tx_ix: index,
                address: output.address.clone(),
                value: output.value.clone(),
                datum: output.datum.clone(),
                datum_hash: output.datum_hash.clone(),
                script_hash: output.script_hash.clone(),
                created_slot: self.slot,
            });
            fresh.push((index, tag, record));
        }

        let mut stored = Vec::with_capacity(fresh.len() + reused.len());
        if !rows.is_empty() {
            let ids = self.queue.insert_outputs(rows).await?;
            let mut memo = self.memo.lock().unwrap();
            for ((index, tag, record), id) in fresh.into_iter().zip(ids) {
                memo.insert(
                    index,
                    Memoized {
                        id,
                        tag: tag.clone(),
                    },
                );
                stored.push(Stored {
                    id,
                    index,
                    tag,
                    record,
                });
            }
        }
        stored.extend(reused);
        Ok(stored)
    }

    /// Queue a channel for the indexer's next coalesced notification flush.
    pub fn notify(&self, channel: &str) {
        self.pending_notify
            .lock()
            .unwrap()
            .insert(channel.to_string());
    }

    /// Queue a materialized view for the next coalesced refresh flush.
    pub fn refresh(&self, view: &str) {
        self.pending_refresh
            .lock()
            .unwrap()
            .insert(view.to_string());
    }

    /// Flush scripts collected during this transaction. Runs once per
    /// transaction, after handler dispatch.
    pub async fn finish(&self) -> Result<(), IndexerError> {
        let scripts: Vec<ScriptRow> = self.scripts.lock().unwrap().drain().map(|(_, s)| s).collect();
        if scripts.is_empty() {
            return Ok(());
        }
        self.queue.insert_scripts(scripts).await
    }
}
