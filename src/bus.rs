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
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Publish/subscribe primitive keyed by channel name. Wakes polling indexers
/// and fans in chain-derived triggers.
#[async_trait]
pub trait ChannelBus: Send + Sync {
    async fn publish(&self, channel: &str) -> Result<(), IndexerError>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<()>;
}

/// Accepts a view name and refreshes the backing materialized view, either
/// blocking or concurrently.
#[async_trait]
pub trait ViewRefresher: Send + Sync {
    async fn refresh(&self, view: &str, concurrently: bool) -> Result<(), IndexerError>;
}

/// In-process bus over tokio broadcast channels, one per name, created
/// lazily. Publishing without a listener is a no-op.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<()> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl ChannelBus for MemoryBus {
    async fn publish(&self, channel: &str) -> Result<(), IndexerError> {
        let _ = self.sender(channel).send(());
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<()> {
        self.sender(channel).subscribe()
    }
}
