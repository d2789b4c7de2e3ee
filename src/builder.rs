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

use crate::bus::{ChannelBus, MemoryBus, ViewRefresher};
use crate::config::ChainIndexerConfig;
use crate::error::IndexerError;
use crate::events::{
    EventDispatch, EventHandler, InSyncHook, IndexEvent, Initializer, RollbackHandler, TxFilter,
};
use crate::indexer::ChainIndexer;
use crate::storage::init::init_store;
use crate::storage::ChainStore;
use crate::validated_types::{PostgresUrl, SqliteUrl};
use std::sync::Arc;

/// Convenient builder for creating a [`ChainIndexer`].
pub struct ChainIndexerBuilder<E: IndexEvent> {
    config: ChainIndexerConfig,
    database_url: Option<String>,
    store: Option<Arc<dyn ChainStore>>,
    bus: Option<Arc<dyn ChannelBus>>,
    refresher: Option<Arc<dyn ViewRefresher>>,
    refresh_concurrently: bool,
    event_types: Vec<&'static str>,
    filters: Vec<Arc<dyn TxFilter<E>>>,
    handlers: Vec<(&'static str, Arc<dyn EventHandler<E>>)>,
    rollback_handlers: Vec<Arc<dyn RollbackHandler>>,
    initializers: Vec<Arc<dyn Initializer>>,
    in_sync_hooks: Vec<Arc<dyn InSyncHook>>,
}

impl<E: IndexEvent> Default for ChainIndexerBuilder<E> {
    fn default() -> Self {
        Self::new(ChainIndexerConfig::default())
    }
}

impl<E: IndexEvent> ChainIndexerBuilder<E> {
    /// Create a new builder with the given configuration.
    pub fn new(config: ChainIndexerConfig) -> Self {
        Self {
            config,
            database_url: None,
            store: None,
            bus: None,
            refresher: None,
            refresh_concurrently: false,
            event_types: Vec::new(),
            filters: Vec::new(),
            handlers: Vec::new(),
            rollback_handlers: Vec::new(),
            initializers: Vec::new(),
            in_sync_hooks: Vec::new(),
        }
    }

    /// Use a PostgreSQL store.
    pub fn with_postgres(mut self, url: PostgresUrl) -> Self {
        self.database_url = Some(url.as_str().to_string());
        self
    }

    /// Use a SQLite store.
    pub fn with_sqlite(mut self, url: SqliteUrl) -> Self {
        self.database_url = Some(url.to_string());
        self
    }

    /// Use an already constructed store. Takes precedence over a database URL.
    pub fn with_store(mut self, store: Arc<dyn ChainStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish notifications through this bus instead of an in-process one.
    pub fn with_bus(mut self, bus: Arc<dyn ChannelBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Refresh materialized views through this refresher.
    pub fn with_view_refresher(
        mut self,
        refresher: Arc<dyn ViewRefresher>,
        concurrently: bool,
    ) -> Self {
        self.refresher = Some(refresher);
        self.refresh_concurrently = concurrently;
        self
    }

    /// Declare the event types this indexer emits. Handlers may only attach
    /// to declared types.
    pub fn declare_events(mut self, event_types: &[&'static str]) -> Self {
        self.event_types.extend_from_slice(event_types);
        self
    }

    /// Add a transaction filter.
    pub fn add_filter(mut self, filter: Arc<dyn TxFilter<E>>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a handler for one declared event type. Registration order is the
    /// dispatch order within that type.
    pub fn add_handler(
        mut self,
        event_type: &'static str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Self {
        self.handlers.push((event_type, handler));
        self
    }

    /// Add a rollback handler.
    pub fn add_rollback_handler(mut self, handler: Arc<dyn RollbackHandler>) -> Self {
        self.rollback_handlers.push(handler);
        self
    }

    /// Add an initializer to run at the top of every start.
    pub fn add_initializer(mut self, initializer: Arc<dyn Initializer>) -> Self {
        self.initializers.push(initializer);
        self
    }

    /// Add a hook that fires once per run when the tip is first reached.
    pub fn add_in_sync_hook(mut self, hook: Arc<dyn InSyncHook>) -> Self {
        self.in_sync_hooks.push(hook);
        self
    }

    /// Build the indexer.
    pub async fn build(self) -> Result<ChainIndexer<E>, IndexerError> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => init_store(self.database_url).await?,
        };
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(MemoryBus::new()) as Arc<dyn ChannelBus>);

        let mut dispatch = EventDispatch::new(&self.event_types);
        for (event_type, handler) in self.handlers {
            dispatch.register(event_type, handler)?;
        }

        Ok(ChainIndexer::new(
            self.config,
            store,
            bus,
            self.refresher,
            self.refresh_concurrently,
            self.filters,
            dispatch,
            self.rollback_handlers,
            self.initializers,
            self.in_sync_hooks,
        ))
    }
}
