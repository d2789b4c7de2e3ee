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
use crate::protocol::EraSummary;

/// Converts slots to absolute time given the era rules fetched from the node.
///
/// The interpreter is a snapshot: it is only valid up to
/// [`stale_slot`](SlotTimeInterpreter::stale_slot). Callers rebuild it from a
/// fresh [`era_summaries`](crate::protocol::NodeClient::era_summaries) query
/// once they see a slot past that boundary.
#[derive(Clone, Debug)]
pub struct SlotTimeInterpreter {
    system_start: u64,
    eras: Vec<EraSummary>,
    ledger_tip_slot: u64,
}

impl SlotTimeInterpreter {
    /// Build from a system start (unix seconds), era summaries ordered by
    /// `start_slot`, and the ledger tip observed at fetch time.
    pub fn new(system_start: u64, eras: Vec<EraSummary>, ledger_tip_slot: u64) -> Self {
        Self {
            system_start,
            eras,
            ledger_tip_slot,
        }
    }

    /// Absolute time of a slot, unix seconds.
    ///
    /// Fails with [`IndexerError::NotInAnyEra`] when the slot precedes the
    /// earliest era. Valid chain data never does; the check guards against a
    /// confused node.
    pub fn slot_to_time(&self, slot: u64) -> Result<u64, IndexerError> {
        let era = self
            .eras
            .iter()
            .rev()
            .find(|era| era.start_slot <= slot)
            .ok_or(IndexerError::NotInAnyEra { slot })?;
        Ok(self.system_start + era.start_time + (slot - era.start_slot) * era.slot_length)
    }

    /// The slot at which this interpreter must be rebuilt: conversions past it
    /// may span an era transition the snapshot does not know about.
    pub fn stale_slot(&self) -> u64 {
        let safe_zone = self.eras.last().map(|era| era.safe_zone).unwrap_or(0);
        self.ledger_tip_slot + safe_zone
    }

    pub fn is_stale_for(&self, slot: u64) -> bool {
        slot > self.stale_slot()
    }

    /// Tip slot the snapshot was taken at.
    pub fn ledger_tip_slot(&self) -> u64 {
        self.ledger_tip_slot
    }
}
