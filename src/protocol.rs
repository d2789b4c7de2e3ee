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
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A position on the chain, as used for intersection negotiation and rollbacks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WirePoint", into = "WirePoint")]
pub enum Point {
    Origin,
    Tip,
    Specific { slot: u64, hash: String },
}

impl Point {
    pub fn slot(&self) -> Option<u64> {
        match self {
            Point::Specific { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WirePoint {
    At { slot: u64, hash: String },
    Tag(String),
}

impl TryFrom<WirePoint> for Point {
    type Error = String;

    fn try_from(wire: WirePoint) -> Result<Self, Self::Error> {
        match wire {
            WirePoint::At { slot, hash } => Ok(Point::Specific { slot, hash }),
            WirePoint::Tag(tag) => match tag.as_str() {
                "origin" => Ok(Point::Origin),
                "tip" => Ok(Point::Tip),
                other => Err(format!("unknown point tag `{other}`")),
            },
        }
    }
}

impl From<Point> for WirePoint {
    fn from(point: Point) -> Self {
        match point {
            Point::Origin => WirePoint::Tag("origin".into()),
            Point::Tip => WirePoint::Tag("tip".into()),
            Point::Specific { slot, hash } => WirePoint::At { slot, hash },
        }
    }
}

/// The node's view of the end of the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tip {
    pub slot: u64,
    pub hash: String,
    pub height: u64,
}

/// One era of the slot-to-time rules: slots in `[start_slot, ..)` last
/// `slot_length` seconds each, starting `start_time` seconds after system start.
/// `safe_zone` is how many slots past the ledger tip the rules stay reliable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraSummary {
    pub start_slot: u64,
    pub start_time: u64,
    pub slot_length: u64,
    pub safe_zone: u64,
}

/// Reference to a transaction output consumed as an input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub tx_id: String,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    pub script_type: String,
    pub script: String,
}

/// A produced output, positional within its transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub value: String,
    pub datum: Option<String>,
    pub datum_hash: Option<String>,
    pub script_hash: Option<String>,
    pub script: Option<ScriptRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub inputs: Vec<OutputRef>,
    pub outputs: Vec<TxOutput>,
}

/// A block as delivered by the chain-sync protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub slot: u64,
    pub hash: String,
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

impl RawBlock {
    /// Whether this block is the node's reported tip (slot and hash agree).
    pub fn is_tip(&self, tip: &Tip) -> bool {
        self.slot == tip.slot && self.hash == tip.hash
    }

    pub fn point(&self) -> Point {
        Point::Specific {
            slot: self.slot,
            hash: self.hash.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ForwardBody {
    block: RawBlock,
    tip: Tip,
}

#[derive(Deserialize)]
struct BackwardBody {
    point: Point,
    tip: Tip,
}

/// A decoded "request next" reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextResponse {
    RollForward { block: RawBlock, tip: Tip },
    RollBackward { point: Point, tip: Tip },
}

impl NextResponse {
    /// Decode a raw wire reply. The `direction` tag selects the variant;
    /// anything else is an [`IndexerError::UnknownResult`].
    pub fn decode(value: &Value) -> Result<Self, IndexerError> {
        let tag = value
            .get("direction")
            .and_then(Value::as_str)
            .ok_or_else(|| IndexerError::UnknownResult {
                tag: "<missing direction>".into(),
            })?;
        match tag {
            "forward" => {
                let body: ForwardBody = serde_json::from_value(value.clone())?;
                Ok(NextResponse::RollForward {
                    block: body.block,
                    tip: body.tip,
                })
            }
            "backward" => {
                let body: BackwardBody = serde_json::from_value(value.clone())?;
                Ok(NextResponse::RollBackward {
                    point: body.point,
                    tip: body.tip,
                })
            }
            other => Err(IndexerError::UnknownResult { tag: other.into() }),
        }
    }

    /// Encode back to the wire shape. Test fakes and relays use this.
    pub fn encode(&self) -> Result<Value, IndexerError> {
        let value = match self {
            NextResponse::RollForward { block, tip } => serde_json::json!({
                "direction": "forward",
                "block": serde_json::to_value(block)?,
                "tip": serde_json::to_value(tip)?,
            }),
            NextResponse::RollBackward { point, tip } => serde_json::json!({
                "direction": "backward",
                "point": serde_json::to_value(point)?,
                "tip": serde_json::to_value(tip)?,
            }),
        };
        Ok(value)
    }
}

/// Connection to the upstream node. Implementations own the transport; the
/// engine only assumes ordered replies and support for pipelined requests.
#[async_trait]
pub trait NodeClient: Send {
    /// Negotiate the intersection for the given candidate points.
    async fn find_intersection(&mut self, points: &[Point]) -> Result<(Point, Tip), IndexerError>;

    /// Queue one pipelined "request next" call. Fire-and-forget; replies
    /// surface through [`next_message`](NodeClient::next_message) in order.
    fn request_next(&mut self);

    /// Next raw reply, in wire order. `None` once the connection is done.
    async fn next_message(&mut self) -> Result<Option<Value>, IndexerError>;

    async fn era_summaries(&mut self) -> Result<Vec<EraSummary>, IndexerError>;

    /// Absolute time of slot zero, unix seconds.
    async fn system_start(&mut self) -> Result<u64, IndexerError>;

    async fn tip(&mut self) -> Result<Tip, IndexerError>;

    fn is_open(&self) -> bool;

    /// Shared connections are left open on shutdown.
    fn is_shared(&self) -> bool {
        false
    }

    async fn close(&mut self) -> Result<(), IndexerError>;
}
