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
use crate::protocol::{NextResponse, NodeClient, Point, Tip};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// How the serial apply loop ended. Shutdown is branched on explicitly; it is
/// never an error path.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Natural end of stream or graceful drain.
    Completed,
    /// Immediate shutdown discarded buffered messages.
    Killed,
    /// A protocol, decode, or observer failure.
    Errored(IndexerError),
}

/// Receives chain-sync events in wire order. The connection is lent back so
/// observers can run follow-up queries (era summaries, tip) mid-stream.
#[async_trait]
pub trait SyncObserver: Send + Sync {
    async fn roll_forward(
        &self,
        client: &mut dyn NodeClient,
        block: crate::protocol::RawBlock,
        tip: Tip,
    ) -> Result<(), IndexerError>;

    async fn roll_backward(
        &self,
        client: &mut dyn NodeClient,
        point: Point,
        tip: Tip,
    ) -> Result<(), IndexerError>;
}

type ErrorSink = Arc<dyn Fn(&IndexerError) + Send + Sync>;

/// Drives the chain-sync protocol with a bounded in-flight request window and
/// a strictly-serial apply loop.
///
/// One task owns the connection and applies responses one at a time, in wire
/// order; concurrent application could apply a rollback before a still-in-
/// flight roll-forward and corrupt checkpoint state, so the serialization is
/// structural, not assumed.
pub struct ChainSyncClient {
    halt: Arc<Notify>,
    immediate: Arc<AtomicBool>,
    task: JoinHandle<SyncOutcome>,
}

impl ChainSyncClient {
    /// Negotiate the intersection and start the apply loop. Fails with
    /// [`IndexerError::WebSocketClosed`] if the connection is not open at
    /// intersection time.
    pub async fn start(
        mut client: Box<dyn NodeClient>,
        points: Vec<Point>,
        in_flight_window: usize,
        observer: Arc<dyn SyncObserver>,
        on_error: ErrorSink,
    ) -> Result<(Self, Point, Tip), IndexerError> {
        if !client.is_open() {
            return Err(IndexerError::WebSocketClosed);
        }
        let (intersection, tip) = client.find_intersection(&points).await?;

        for _ in 0..in_flight_window {
            client.request_next();
        }

        let halt = Arc::new(Notify::new());
        let immediate = Arc::new(AtomicBool::new(false));
        let loop_halt = Arc::clone(&halt);
        let loop_immediate = Arc::clone(&immediate);

        let task = tokio::spawn(async move {
            let outcome = Self::run(
                client.as_mut(),
                observer.as_ref(),
                &loop_halt,
                &loop_immediate,
                &on_error,
            )
            .await;
            if !client.is_shared() {
                if let Err(e) = client.close().await {
                    warn!(target: "chainmirror", error = %e, "closing node connection failed");
                }
            }
            outcome
        });

        Ok((
            Self {
                halt,
                immediate,
                task,
            },
            intersection,
            tip,
        ))
    }

    async fn run(
        client: &mut dyn NodeClient,
        observer: &dyn SyncObserver,
        halt: &Notify,
        immediate: &AtomicBool,
        on_error: &ErrorSink,
    ) -> SyncOutcome {
        loop {
            tokio::select! {
                biased;
                _ = halt.notified() => {
                    if immediate.load(Ordering::SeqCst) {
                        return SyncOutcome::Killed;
                    }
                    // Graceful drain: apply whatever the transport already
                    // buffered, then stop without waiting for the network.
                    loop {
                        match client.next_message().now_or_never() {
                            Some(Ok(Some(raw))) => {
                                if let Err(e) = Self::apply(client, observer, &raw).await {
                                    on_error(&e);
                                    return SyncOutcome::Errored(e);
                                }
                            }
                            _ => return SyncOutcome::Completed,
                        }
                    }
                }
                msg = client.next_message() => {
                    match msg {
                        Err(e) => {
                            on_error(&e);
                            return SyncOutcome::Errored(e);
                        }
                        Ok(None) => return SyncOutcome::Completed,
                        Ok(Some(raw)) => {
                            if let Err(e) = Self::apply(client, observer, &raw).await {
                                on_error(&e);
                                return SyncOutcome::Errored(e);
                            }
                            // Keep the pipelined window full: one replacement
                            // request per fully applied response.
                            client.request_next();
                        }
                    }
                }
            }
        }
    }

    async fn apply(
        client: &mut dyn NodeClient,
        observer: &dyn SyncObserver,
        raw: &serde_json::Value,
    ) -> Result<(), IndexerError> {
        match NextResponse::decode(raw)? {
            NextResponse::RollForward { block, tip } => {
                observer.roll_forward(client, block, tip).await
            }
            NextResponse::RollBackward { point, tip } => {
                observer.roll_backward(client, point, tip).await
            }
        }
    }

    /// Stop the apply loop. Immediate discards buffered messages; graceful
    /// lets them drain. In-flight dispatch always finishes.
    pub async fn shutdown(self, immediate: bool) -> SyncOutcome {
        self.immediate.store(immediate, Ordering::SeqCst);
        self.halt.notify_one();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => SyncOutcome::Errored(IndexerError::SyncTerminated {
                message: e.to_string(),
            }),
        }
    }
}
