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

pub mod builder;
pub mod bus;
pub mod config;
pub mod debounce;
pub mod driver;
pub mod error;
pub mod events;
pub mod indexer;
pub mod ingestor;
pub mod polling;
pub mod prelude;
pub mod protocol;
pub mod sched;
pub mod slot_time;
pub mod storage;
pub mod sync;
pub mod validated_types;

pub use crate::builder::ChainIndexerBuilder;
pub use crate::bus::{ChannelBus, MemoryBus, ViewRefresher};
pub use crate::config::{ChainIndexerConfig, PollingConfig};
pub use crate::debounce::{Debounce, DebouncedNotifier, DebouncedViewRefresher};
pub use crate::driver::{EventDriver, Stored, WriteQueue};
pub use crate::error::IndexerError;
pub use crate::events::{
    Context, EventDispatch, EventHandler, InSyncHook, IndexEvent, Initializer, RollbackAction,
    RollbackHandler, TxFilter,
};
pub use crate::indexer::{ChainIndexer, SyncStatus};
pub use crate::ingestor::BlockIngestor;
pub use crate::polling::{Batch, BatchHook, PollTask, PollingIndexer, TaskHandler, TaskOutcome, TaskSource};
pub use crate::protocol::{
    EraSummary, NextResponse, NodeClient, OutputRef, Point, RawBlock, ScriptRef, Tip, Transaction,
    TxOutput,
};
pub use crate::slot_time::SlotTimeInterpreter;
pub use crate::storage::{BlockRow, ChainStore, NewOutput, OutputRow, ScriptRow};
pub use crate::sync::{ChainSyncClient, SyncObserver, SyncOutcome};
pub use crate::validated_types::{PostgresUrl, SqliteUrl, WebSocketUrl};
