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

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// A uniformly jittered delay in `[interval / 2, interval]`, so periodic
/// catch-up work across independently configured indexers stays staggered.
pub fn jittered_delay(interval: Duration) -> Duration {
    let half = interval / 2;
    let extra = rand::rng().random_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(extra)
}

/// Fixed-interval wait used when polling a condition, e.g. waiting for the
/// node tip to reach the intended start slot.
#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub async fn wait(&self) {
        sleep(self.delay).await;
    }
}
