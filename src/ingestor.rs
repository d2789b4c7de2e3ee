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

use crate::protocol::{Point, RawBlock};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Clone, Debug)]
struct SeenBlock {
    slot: u64,
    hash: String,
    height: u64,
    time: u64,
}

/// Tracks ingestion progress and decides which blocks must be stored
/// unconditionally.
///
/// Storing every block is too expensive, but the gap between durable
/// checkpoints must stay bounded; this separates "must persist for resume
/// correctness" from "worth a progress line for the operator".
pub struct BlockIngestor {
    checkpoint_every: u64,
    report_every: Duration,
    blocks_since_store: u64,
    blocks_since_flush: u64,
    force_next: bool,
    in_sync: bool,
    last_flush: Instant,
    last_seen: Option<SeenBlock>,
    last_done: Option<Point>,
}

impl BlockIngestor {
    pub fn new(checkpoint_every: u64, report_every: Duration) -> Self {
        Self {
            checkpoint_every,
            report_every,
            blocks_since_store: 0,
            blocks_since_flush: 0,
            force_next: true,
            in_sync: false,
            last_flush: Instant::now(),
            last_seen: None,
            last_done: None,
        }
    }

    /// Whether this block must be durably recorded regardless of business
    /// relevance. A progress line may be emitted as a side effect without
    /// forcing a store. `time` is the block's absolute time as computed by the
    /// slot-time interpreter.
    pub fn roll_forward(&mut self, block: &RawBlock, time: u64) -> bool {
        self.blocks_since_store += 1;
        self.blocks_since_flush += 1;
        self.last_seen = Some(SeenBlock {
            slot: block.slot,
            hash: block.hash.clone(),
            height: block.height,
            time,
        });

        if self.force_next {
            self.force_next = false;
            self.blocks_since_store = 0;
            return true;
        }
        if self.blocks_since_store >= self.checkpoint_every {
            self.blocks_since_store = 0;
            return true;
        }
        if self.in_sync && self.last_flush.elapsed() >= self.report_every {
            self.flush();
            self.last_flush = Instant::now();
        }
        false
    }

    /// Record the last fully processed block. A relevant block while caught up
    /// resets the reporting window so a restart does not re-report stale time.
    pub fn roll_forward_done(&mut self, block: &RawBlock, relevant: bool) {
        self.last_done = Some(block.point());
        if self.in_sync && relevant {
            self.last_flush = Instant::now();
        }
    }

    pub fn roll_backward(&mut self, point: &Point) {
        self.last_done = None;
        self.flush();
        self.last_flush = Instant::now();
        self.force_next = true;
        self.blocks_since_store = 0;
        info!(target: "chainmirror", ?point, "rolled backward");
    }

    /// Emit one progress line and reset the report counter. No-op when no
    /// block has been seen since the last flush.
    pub fn flush(&mut self) {
        if self.blocks_since_flush == 0 {
            return;
        }
        if let Some(seen) = &self.last_seen {
            info!(
                target: "chainmirror",
                slot = seen.slot,
                hash = %seen.hash,
                height = seen.height,
                time = seen.time,
                blocks = self.blocks_since_flush,
                "ingestion progress"
            );
        }
        self.blocks_since_flush = 0;
    }

    pub fn set_in_sync(&mut self, in_sync: bool) {
        self.in_sync = in_sync;
        if in_sync {
            self.flush();
        }
    }

    pub fn last_done(&self) -> Option<&Point> {
        self.last_done.as_ref()
    }
}
