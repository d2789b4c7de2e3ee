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
use crate::protocol::OutputRef;
use crate::storage::{BlockRow, ChainStore, NewOutput, OutputRow, ScriptRow};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, BlockRow>,
    outputs: Vec<OutputRow>,
    scripts: HashMap<String, ScriptRow>,
    next_id: i64,
}

/// In-process mirror with the same cascade semantics as the SQL backends.
/// Used by tests and by embedders that do not need durability.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn init_schema(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    async fn insert_block(&self, block: &BlockRow) -> Result<(), IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.entry(block.slot).or_insert_with(|| block.clone());
        Ok(())
    }

    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockRow>, IndexerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .blocks
            .values()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn delete_blocks_after(&self, slot: u64) -> Result<u64, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<u64> = inner.blocks.range(slot + 1..).map(|(s, _)| *s).collect();
        for s in &doomed {
            inner.blocks.remove(s);
        }
        inner.outputs.retain(|o| o.created_slot <= slot);
        for output in inner.outputs.iter_mut() {
            if matches!(output.spent_slot, Some(s) if s > slot) {
                output.spent_slot = None;
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn wipe(&self) -> Result<(), IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.clear();
        inner.outputs.clear();
        Ok(())
    }

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<Vec<i64>, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids = Vec::with_capacity(outputs.len());
        for new in outputs {
            if let Some(existing) = inner
                .outputs
                .iter()
                .find(|o| o.tx_id == new.tx_id && o.tx_ix == new.tx_ix)
            {
                ids.push(existing.id);
                continue;
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.outputs.push(OutputRow {
                id,
                tag: new.tag.clone(),
                tx_id: new.tx_id.clone(),
                tx_ix: new.tx_ix,
                address: new.address.clone(),
                value: new.value.clone(),
                datum: new.datum.clone(),
                datum_hash: new.datum_hash.clone(),
                script_hash: new.script_hash.clone(),
                created_slot: new.created_slot,
                spent_slot: None,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn unspent_matches(&self, refs: &[OutputRef]) -> Result<u64, IndexerError> {
        let inner = self.inner.lock().unwrap();
        let count = inner
            .outputs
            .iter()
            .filter(|o| {
                o.spent_slot.is_none()
                    && refs
                        .iter()
                        .any(|r| r.tx_id == o.tx_id && r.index == o.tx_ix)
            })
            .count();
        Ok(count as u64)
    }

    async fn mark_spent(&self, refs: &[OutputRef], slot: u64) -> Result<u64, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let mut affected = 0;
        for output in inner.outputs.iter_mut() {
            if output.spent_slot.is_none()
                && refs
                    .iter()
                    .any(|r| r.tx_id == output.tx_id && r.index == output.tx_ix)
            {
                output.spent_slot = Some(slot);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_scripts(&self, scripts: &[ScriptRow]) -> Result<(), IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        for script in scripts {
            inner
                .scripts
                .entry(script.script_hash.clone())
                .or_insert_with(|| script.clone());
        }
        Ok(())
    }

    async fn gc_unreferenced_blocks(&self) -> Result<u64, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&max_slot) = inner.blocks.keys().next_back() else {
            return Ok(0);
        };
        let referenced: HashSet<u64> = inner
            .outputs
            .iter()
            .flat_map(|o| [Some(o.created_slot), o.spent_slot])
            .flatten()
            .collect();
        let before = inner.blocks.len();
        inner
            .blocks
            .retain(|slot, _| *slot == max_slot || referenced.contains(slot));
        Ok((before - inner.blocks.len()) as u64)
    }

    async fn block_count(&self) -> Result<u64, IndexerError> {
        Ok(self.inner.lock().unwrap().blocks.len() as u64)
    }

    async fn output_count(&self) -> Result<u64, IndexerError> {
        Ok(self.inner.lock().unwrap().outputs.len() as u64)
    }

    async fn outputs(&self) -> Result<Vec<OutputRow>, IndexerError> {
        Ok(self.inner.lock().unwrap().outputs.clone())
    }

    async fn script_count(&self) -> Result<u64, IndexerError> {
        Ok(self.inner.lock().unwrap().scripts.len() as u64)
    }
}
