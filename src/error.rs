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

use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(Box<sqlx::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Connection closed while finding intersection")]
    WebSocketClosed,

    #[error("Unknown chain-sync result tag `{tag}`")]
    UnknownResult { tag: String },

    #[error("Slot {slot} precedes the earliest known era")]
    NotInAnyEra { slot: u64 },

    #[error("Slot {slot} is beyond the interpreter safety margin ({stale_slot}) even after reload")]
    StaleInterpreter { slot: u64, stale_slot: u64 },

    #[error("No intersection found for the requested points")]
    IntersectionNotFound,

    #[error("Handler {handler} failed at slot {slot}: {source}")]
    HandlerFailed {
        handler: String,
        slot: u64,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("Invalid config for `{field}`: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("Cannot {operation} while {status}")]
    InvalidState { operation: String, status: String },

    #[error("Storage {operation} failed using {backend}: {source}")]
    StorageError {
        operation: String,
        backend: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("Event type `{event_type}` was not declared on this indexer")]
    UnknownEventType { event_type: String },

    #[error("Task {id} is already running")]
    TaskAlreadyRunning { id: String },

    #[error("Write queue closed before the job completed")]
    WriteQueueClosed,

    #[error("Sync queue terminated: {message}")]
    SyncTerminated { message: String },
}

impl IndexerError {
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state(operation: impl Into<String>, status: impl Into<String>) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            status: status.into(),
        }
    }

    pub fn storage(
        operation: impl Into<String>,
        backend: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::StorageError {
            operation: operation.into(),
            backend: backend.into(),
            source: Box::new(source),
        }
    }

    pub fn handler(
        handler: impl Into<String>,
        slot: u64,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::HandlerFailed {
            handler: handler.into(),
            slot,
            source: Box::new(source),
        }
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(Box::new(err))
    }
}
