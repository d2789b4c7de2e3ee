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

use crate::bus::{ChannelBus, ViewRefresher};
use crate::error::IndexerError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

type Action = Arc<dyn Fn() -> BoxFuture<'static, Result<(), IndexerError>> + Send + Sync>;

/// Coalesces a burst of triggers into a single trailing execution after a
/// quiet window.
pub struct Debounce {
    window: Duration,
    action: Action,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Debounce {
    pub fn new<F>(window: Duration, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), IndexerError>> + Send + Sync + 'static,
    {
        Self {
            window,
            action: Arc::new(action),
            timer: Mutex::new(None),
        }
    }

    /// Re-arm the trailing timer. The action runs once, `window` after the
    /// last trigger. Failures are logged, not escalated.
    pub fn trigger(&self) {
        let action = Arc::clone(&self.action);
        let window = self.window;
        let mut timer = self.timer.lock().unwrap();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        *timer = Some(tokio::spawn(async move {
            sleep(window).await;
            if let Err(e) = action().await {
                warn!(target: "chainmirror", error = %e, "debounced action failed");
            }
        }));
    }

    /// Cancel any pending trailing execution and run now.
    pub async fn trigger_now(&self) -> Result<(), IndexerError> {
        self.cancel();
        (self.action)().await
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Debounce {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-channel debounced publishing over a [`ChannelBus`].
pub struct DebouncedNotifier {
    bus: Arc<dyn ChannelBus>,
    window: Duration,
    entries: Mutex<HashMap<String, Arc<Debounce>>>,
}

impl DebouncedNotifier {
    pub fn new(bus: Arc<dyn ChannelBus>, window: Duration) -> Self {
        Self {
            bus,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, channel: &str) -> Arc<Debounce> {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(entries.entry(channel.to_string()).or_insert_with(|| {
            let bus = Arc::clone(&self.bus);
            let name = channel.to_string();
            Arc::new(Debounce::new(self.window, move || {
                let bus = Arc::clone(&bus);
                let name = name.clone();
                Box::pin(async move { bus.publish(&name).await })
            }))
        }))
    }

    pub fn notify(&self, channel: &str) {
        self.entry(channel).trigger();
    }

    pub async fn notify_now(&self, channel: &str) -> Result<(), IndexerError> {
        self.entry(channel).trigger_now().await
    }

    pub fn cancel_all(&self) {
        for entry in self.entries.lock().unwrap().values() {
            entry.cancel();
        }
    }
}

/// Per-view debounced refresh over a [`ViewRefresher`].
pub struct DebouncedViewRefresher {
    refresher: Arc<dyn ViewRefresher>,
    window: Duration,
    concurrently: bool,
    entries: Mutex<HashMap<String, Arc<Debounce>>>,
}

impl DebouncedViewRefresher {
    pub fn new(refresher: Arc<dyn ViewRefresher>, window: Duration, concurrently: bool) -> Self {
        Self {
            refresher,
            window,
            concurrently,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, view: &str) -> Arc<Debounce> {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(entries.entry(view.to_string()).or_insert_with(|| {
            let refresher = Arc::clone(&self.refresher);
            let name = view.to_string();
            let concurrently = self.concurrently;
            Arc::new(Debounce::new(self.window, move || {
                let refresher = Arc::clone(&refresher);
                let name = name.clone();
                Box::pin(async move { refresher.refresh(&name, concurrently).await })
            }))
        }))
    }

    pub fn refresh(&self, view: &str) {
        self.entry(view).trigger();
    }

    pub async fn refresh_now(&self, view: &str) -> Result<(), IndexerError> {
        self.entry(view).trigger_now().await
    }

    pub fn cancel_all(&self) {
        for entry in self.entries.lock().unwrap().values() {
            entry.cancel();
        }
    }
}
