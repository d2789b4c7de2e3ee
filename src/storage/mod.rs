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

pub mod init;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::error::IndexerError;
use crate::protocol::OutputRef;
use async_trait::async_trait;

/// A stored block. Only blocks that matter are stored: those carrying indexed
/// data, plus periodic checkpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRow {
    pub slot: u64,
    pub hash: String,
    pub height: u64,
    pub time: u64,
}

/// An output row before insertion assigns its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOutput {
    pub tag: Option<String>,
    pub tx_id: String,
    pub tx_ix: u32,
    pub address: String,
    pub value: String,
    pub datum: Option<String>,
    pub datum_hash: Option<String>,
    pub script_hash: Option<String>,
    pub created_slot: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRow {
    pub id: i64,
    pub tag: Option<String>,
    pub tx_id: String,
    pub tx_ix: u32,
    pub address: String,
    pub value: String,
    pub datum: Option<String>,
    pub datum_hash: Option<String>,
    pub script_hash: Option<String>,
    pub created_slot: u64,
    pub spent_slot: Option<u64>,
}

/// Content-addressed script bytes, written at most once per hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptRow {
    pub script_hash: String,
    pub script_type: String,
    pub script: String,
}

/// The relational mirror. Append-mostly: outputs are only ever mutated to set
/// `spent_slot`, blocks are deleted on rollback or garbage collection.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Idempotent schema creation, including the indexes rollback and
    /// spend-marking rely on.
    async fn init_schema(&self) -> Result<(), IndexerError>;

    /// Insert a block; a row already present at that slot is left untouched.
    async fn insert_block(&self, block: &BlockRow) -> Result<(), IndexerError>;

    /// Most recent blocks, descending by slot. The newest of these is the
    /// resume checkpoint.
    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockRow>, IndexerError>;

    /// Delete blocks strictly after `slot`, cascading created outputs and
    /// un-spending outputs whose spend happened past the cut. Returns the
    /// number of blocks removed.
    async fn delete_blocks_after(&self, slot: u64) -> Result<u64, IndexerError>;

    /// Drop the whole mirror (rollback to origin).
    async fn wipe(&self) -> Result<(), IndexerError>;

    /// Batched insert returning generated ids, in input order. A row already
    /// present at `(tx_id, tx_ix)` keeps its id.
    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<Vec<i64>, IndexerError>;

    /// How many of the given refs correspond to mirrored, still-unspent rows.
    async fn unspent_matches(&self, refs: &[OutputRef]) -> Result<u64, IndexerError>;

    /// Set `spent_slot` on the rows matching the refs. Returns rows affected.
    async fn mark_spent(&self, refs: &[OutputRef], slot: u64) -> Result<u64, IndexerError>;

    /// Insert scripts, ignoring hashes already present.
    async fn insert_scripts(&self, scripts: &[ScriptRow]) -> Result<(), IndexerError>;

    /// Remove blocks no output references as creator or spender. The
    /// highest-slot block always survives so the checkpoint does.
    async fn gc_unreferenced_blocks(&self) -> Result<u64, IndexerError>;

    async fn block_count(&self) -> Result<u64, IndexerError>;

    async fn output_count(&self) -> Result<u64, IndexerError>;

    /// All output rows ordered by id. Intended for tests and small mirrors.
    async fn outputs(&self) -> Result<Vec<OutputRow>, IndexerError>;

    async fn script_count(&self) -> Result<u64, IndexerError>;
}
