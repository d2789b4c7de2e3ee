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
use crate::protocol::Point;
use std::time::Duration;

/// Configuration for the [`ChainIndexer`](crate::indexer::ChainIndexer).
#[derive(Clone, Debug)]
pub struct ChainIndexerConfig {
    /// Candidate starting points when the store holds no checkpoint.
    pub begin: Vec<Point>,
    /// Optional end of range; reaching it schedules the end signal.
    pub end_slot: Option<u64>,
    /// Ignore stored checkpoints and force `begin`.
    pub reset: bool,
    /// Upper bound on blocks between two forced checkpoint stores.
    pub checkpoint_every: u64,
    /// Progress-reporting resolution while caught up.
    pub report_every: Duration,
    /// Pipelined request-next calls kept unacknowledged.
    pub in_flight_window: usize,
    /// How many recent checkpoint blocks to offer as resume points.
    pub checkpoint_history: u32,
    /// Maintenance (GC + signal flush) cadence while catching up.
    pub maintenance_interval: Duration,
    /// Poll interval while waiting for the node to reach the start slot.
    pub node_ready_backoff: Duration,
    /// Grace period between reaching `end_slot` and the end signal.
    pub end_delay: Duration,
    /// Quiet window for debounced notifications and view refreshes.
    pub debounce_window: Duration,
}

impl Default for ChainIndexerConfig {
    fn default() -> Self {
        Self {
            begin: vec![Point::Origin],
            end_slot: None,
            reset: false,
            checkpoint_every: 1_000,
            report_every: Duration::from_secs(60),
            in_flight_window: 100,
            checkpoint_history: 12,
            maintenance_interval: Duration::from_secs(30),
            node_ready_backoff: Duration::from_secs(5),
            end_delay: Duration::from_secs(10),
            debounce_window: Duration::from_millis(500),
        }
    }
}

impl ChainIndexerConfig {
    pub fn builder() -> ChainIndexerConfigBuilder {
        ChainIndexerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.begin.is_empty() {
            return Err(IndexerError::invalid_config("begin", "cannot be empty"));
        }
        if self.checkpoint_every == 0 {
            return Err(IndexerError::invalid_config(
                "checkpoint_every",
                "must be at least 1",
            ));
        }
        if self.in_flight_window == 0 {
            return Err(IndexerError::invalid_config(
                "in_flight_window",
                "must be at least 1",
            ));
        }
        if self.checkpoint_history == 0 {
            return Err(IndexerError::invalid_config(
                "checkpoint_history",
                "must be at least 1",
            ));
        }
        if let Some(end) = self.end_slot {
            let begin_floor = self
                .begin
                .iter()
                .filter_map(Point::slot)
                .min()
                .unwrap_or(0);
            if end < begin_floor {
                return Err(IndexerError::invalid_config(
                    "end_slot",
                    "must not precede the earliest begin point",
                ));
            }
        }
        Ok(())
    }
}

/// Builder pattern for [`ChainIndexerConfig`].
pub struct ChainIndexerConfigBuilder {
    config: ChainIndexerConfig,
}

impl Default for ChainIndexerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainIndexerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ChainIndexerConfig::default(),
        }
    }

    /// Start from the given points when no checkpoint exists.
    pub fn begin(mut self, points: Vec<Point>) -> Self {
        self.config.begin = points;
        self
    }

    /// Stop indexing once this slot is reached.
    pub fn end_at_slot(mut self, slot: u64) -> Self {
        self.config.end_slot = Some(slot);
        self
    }

    /// Discard stored checkpoints and start from `begin`.
    pub fn reset(mut self) -> Self {
        self.config.reset = true;
        self
    }

    pub fn checkpoint_every(mut self, blocks: u64) -> Self {
        self.config.checkpoint_every = blocks;
        self
    }

    pub fn report_every(mut self, window: Duration) -> Self {
        self.config.report_every = window;
        self
    }

    pub fn in_flight_window(mut self, window: usize) -> Self {
        self.config.in_flight_window = window;
        self
    }

    pub fn checkpoint_history(mut self, blocks: u32) -> Self {
        self.config.checkpoint_history = blocks;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval = interval;
        self
    }

    pub fn node_ready_backoff(mut self, backoff: Duration) -> Self {
        self.config.node_ready_backoff = backoff;
        self
    }

    pub fn end_delay(mut self, delay: Duration) -> Self {
        self.config.end_delay = delay;
        self
    }

    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.config.debounce_window = window;
        self
    }

    pub fn build(self) -> Result<ChainIndexerConfig, IndexerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for a [`PollingIndexer`](crate::polling::PollingIndexer).
#[derive(Clone, Debug)]
pub struct PollingConfig {
    pub name: String,
    /// Notification channels that trigger a poll cycle.
    pub channels: Vec<String>,
    /// Base interval for timer-driven cycles; the armed delay is jittered.
    pub interval: Option<Duration>,
    /// In-flight task ceiling before fetch backs off. `None` disables the
    /// in-flight registry and processes each batch to completion.
    pub tasks: Option<usize>,
    /// Concurrently executing `handle` calls.
    pub workers: usize,
}

impl PollingConfig {
    pub fn builder(name: impl Into<String>) -> PollingConfigBuilder {
        PollingConfigBuilder::new(name)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.name.trim().is_empty() {
            return Err(IndexerError::invalid_config("name", "cannot be empty"));
        }
        if self.channels.is_empty() && self.interval.is_none() {
            return Err(IndexerError::invalid_config(
                "channels",
                "at least one trigger is required (channels or interval)",
            ));
        }
        if self.workers == 0 {
            return Err(IndexerError::invalid_config(
                "workers",
                "must be at least 1",
            ));
        }
        if self.tasks == Some(0) {
            return Err(IndexerError::invalid_config("tasks", "must be at least 1"));
        }
        Ok(())
    }
}

/// Builder pattern for [`PollingConfig`].
pub struct PollingConfigBuilder {
    config: PollingConfig,
}

impl PollingConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: PollingConfig {
                name: name.into(),
                channels: Vec::new(),
                interval: None,
                tasks: None,
                workers: 1,
            },
        }
    }

    /// Wake on notifications published to this channel.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.config.channels.push(channel.into());
        self
    }

    /// Also poll on a jittered timer with this base interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = Some(interval);
        self
    }

    /// Bound the in-flight task count; fetch backs off at the ceiling.
    pub fn tasks(mut self, ceiling: usize) -> Self {
        self.config.tasks = Some(ceiling);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn build(self) -> Result<PollingConfig, IndexerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
