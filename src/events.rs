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

use crate::driver::EventDriver;
use crate::error::IndexerError;
use crate::protocol::{Point, Transaction};
use crate::storage::ChainStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Block-scoped facts handed to filters and handlers.
#[derive(Clone, Debug)]
pub struct Context {
    pub slot: u64,
    pub block_hash: String,
    pub block_height: u64,
    pub time: u64,
    pub in_sync: bool,
}

/// A typed event extracted from a transaction. The type tag keys handler
/// dispatch.
pub trait IndexEvent: Send + Sync + Clone + 'static {
    fn event_type(&self) -> &'static str;
}

/// Recognizes records of interest in a transaction and emits typed events.
/// Filters for one transaction run concurrently.
#[async_trait]
pub trait TxFilter<E: IndexEvent>: Send + Sync {
    fn name(&self) -> &'static str {
        "filter"
    }

    async fn filter(&self, tx: &Transaction, ctx: &Context) -> Result<Vec<E>, IndexerError>;
}

/// Reacts to one event, staging writes through the per-transaction driver.
/// Handlers registered for the same event type run in registration order.
#[async_trait]
pub trait EventHandler<E: IndexEvent>: Send + Sync {
    fn name(&self) -> &'static str {
        "handler"
    }

    async fn handle(
        &self,
        event: &E,
        driver: &EventDriver,
        ctx: &Context,
    ) -> Result<(), IndexerError>;
}

/// Why a rollback callback fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackAction {
    /// First callback since start: bootstrap re-anchoring, no divergence.
    Begin,
    /// Rewind after the chain diverged.
    Rollback,
    /// Synthetic rollback replayed on stop to reconcile downstream state
    /// with what was actually committed.
    End,
}

#[async_trait]
pub trait RollbackHandler: Send + Sync {
    fn name(&self) -> &'static str {
        "rollback"
    }

    async fn rollback(&self, action: RollbackAction, point: &Point) -> Result<(), IndexerError>;
}

/// Runs once, sequentially, at the top of every `start`.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, store: &Arc<dyn ChainStore>) -> Result<(), IndexerError>;
}

/// Fires once per run when the indexer first catches up with the node tip.
#[async_trait]
pub trait InSyncHook: Send + Sync {
    async fn once_in_sync(&self) -> Result<(), IndexerError>;
}

/// Dispatch table from event type to its ordered handler list. Validated at
/// registration: handlers only attach to declared types, and every declared
/// type has a (possibly empty) list.
pub struct EventDispatch<E: IndexEvent> {
    table: HashMap<&'static str, Vec<Arc<dyn EventHandler<E>>>>,
}

impl<E: IndexEvent> EventDispatch<E> {
    pub fn new(event_types: &[&'static str]) -> Self {
        let table = event_types.iter().map(|ty| (*ty, Vec::new())).collect();
        Self { table }
    }

    pub fn register(
        &mut self,
        event_type: &'static str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<(), IndexerError> {
        match self.table.get_mut(event_type) {
            Some(handlers) => {
                handlers.push(handler);
                Ok(())
            }
            None => Err(IndexerError::UnknownEventType {
                event_type: event_type.into(),
            }),
        }
    }

    pub fn handlers_for(
        &self,
        event_type: &str,
    ) -> Result<&[Arc<dyn EventHandler<E>>], IndexerError> {
        self.table
            .get(event_type)
            .map(Vec::as_slice)
            .ok_or_else(|| IndexerError::UnknownEventType {
                event_type: event_type.into(),
            })
    }

    pub fn declared_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.keys().copied()
    }
}
