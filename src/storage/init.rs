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
use crate::storage::memory::MemoryStore;
#[cfg(feature = "postgres")]
use crate::storage::postgres::PostgresStore;
#[cfg(feature = "sqlite")]
use crate::storage::sqlite::SqliteStore;
use crate::storage::ChainStore;
use std::sync::Arc;

/// Pick a store backend from a database URL. No URL selects the in-memory
/// mirror.
pub async fn init_store(
    database_url: Option<String>,
) -> Result<Arc<dyn ChainStore>, IndexerError> {
    if let Some(url) = database_url {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            #[cfg(feature = "postgres")]
            {
                let store = PostgresStore::new(&url).await?;
                return Ok(Arc::new(store));
            }
            #[cfg(not(feature = "postgres"))]
            {
                return Err(IndexerError::invalid_config(
                    "database_url",
                    "postgres feature disabled",
                ));
            }
        } else if url.starts_with("sqlite://") {
            #[cfg(feature = "sqlite")]
            {
                let path = url.trim_start_matches("sqlite://");
                let store = SqliteStore::new(path).await?;
                return Ok(Arc::new(store));
            }
            #[cfg(not(feature = "sqlite"))]
            {
                return Err(IndexerError::invalid_config(
                    "database_url",
                    "sqlite feature disabled",
                ));
            }
        } else {
            return Err(IndexerError::invalid_config(
                "database_url",
                "Unsupported database URL",
            ));
        }
    }

    Ok(Arc::new(MemoryStore::new()))
}
