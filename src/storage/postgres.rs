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

use crate::bus::ViewRefresher;
use crate::error::IndexerError;
use crate::protocol::OutputRef;
use crate::storage::{BlockRow, ChainStore, NewOutput, OutputRow, ScriptRow};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self, IndexerError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| IndexerError::storage("connect", "postgres", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ChainStore for PostgresStore {
    async fn init_schema(&self) -> Result<(), IndexerError> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS block (
                slot BIGINT PRIMARY KEY,
                hash TEXT NOT NULL,
                height BIGINT NOT NULL,
                time BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS output (
                id BIGSERIAL PRIMARY KEY,
                tag TEXT,
                tx_id TEXT NOT NULL,
                tx_ix BIGINT NOT NULL,
                address TEXT NOT NULL,
                value TEXT NOT NULL,
                datum TEXT,
                datum_hash TEXT,
                script_hash TEXT,
                created_slot BIGINT NOT NULL REFERENCES block(slot) ON DELETE CASCADE,
                spent_slot BIGINT REFERENCES block(slot) ON DELETE SET NULL,
                UNIQUE (tx_id, tx_ix)
            )",
            "CREATE INDEX IF NOT EXISTS output_created_slot_ix ON output (created_slot)",
            "CREATE INDEX IF NOT EXISTS output_spent_slot_ix ON output (spent_slot)",
            "CREATE TABLE IF NOT EXISTS script (
                script_hash TEXT PRIMARY KEY,
                script_type TEXT NOT NULL,
                script TEXT NOT NULL
            )",
        ];
        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| IndexerError::storage("init_schema", "postgres", e))?;
        }
        Ok(())
    }

    async fn insert_block(&self, block: &BlockRow) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO block (slot, hash, height, time) VALUES ($1, $2, $3, $4)
             ON CONFLICT (slot) DO NOTHING",
        )
        .bind(block.slot as i64)
        .bind(&block.hash)
        .bind(block.height as i64)
        .bind(block.time as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockRow>, IndexerError> {
        let rows = sqlx::query(
            "SELECT slot, hash, height, time FROM block ORDER BY slot DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| BlockRow {
                slot: row.get::<i64, _>("slot") as u64,
                hash: row.get("hash"),
                height: row.get::<i64, _>("height") as u64,
                time: row.get::<i64, _>("time") as u64,
            })
            .collect())
    }

    async fn delete_blocks_after(&self, slot: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM block WHERE slot > $1")
            .bind(slot as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn wipe(&self) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM block").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<Vec<i64>, IndexerError> {
        let mut ids = Vec::with_capacity(outputs.len());
        for output in outputs {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO output (tag, tx_id, tx_ix, address, value, datum, datum_hash,
                                     script_hash, created_slot)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (tx_id, tx_ix) DO UPDATE SET tag = EXCLUDED.tag
                 RETURNING id",
            )
            .bind(&output.tag)
            .bind(&output.tx_id)
            .bind(output.tx_ix as i64)
            .bind(&output.address)
            .bind(&output.value)
            .bind(&output.datum)
            .bind(&output.datum_hash)
            .bind(&output.script_hash)
            .bind(output.created_slot as i64)
            .fetch_one(&self.pool)
            .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn unspent_matches(&self, refs: &[OutputRef]) -> Result<u64, IndexerError> {
        let mut count = 0u64;
        for output_ref in refs {
            let matched: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM output
                 WHERE tx_id = $1 AND tx_ix = $2 AND spent_slot IS NULL",
            )
            .bind(&output_ref.tx_id)
            .bind(output_ref.index as i64)
            .fetch_one(&self.pool)
            .await?;
            count += matched as u64;
        }
        Ok(count)
    }

    async fn mark_spent(&self, refs: &[OutputRef], slot: u64) -> Result<u64, IndexerError> {
        let mut affected = 0u64;
        for output_ref in refs {
            let result = sqlx::query(
                "UPDATE output SET spent_slot = $1
                 WHERE tx_id = $2 AND tx_ix = $3 AND spent_slot IS NULL",
            )
            .bind(slot as i64)
            .bind(&output_ref.tx_id)
            .bind(output_ref.index as i64)
            .execute(&self.pool)
            .await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    async fn insert_scripts(&self, scripts: &[ScriptRow]) -> Result<(), IndexerError> {
        for script in scripts {
            sqlx::query(
                "INSERT INTO script (script_hash, script_type, script) VALUES ($1, $2, $3)
                 ON CONFLICT (script_hash) DO NOTHING",
            )
            .bind(&script.script_hash)
            .bind(&script.script_type)
            .bind(&script.script)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn gc_unreferenced_blocks(&self) -> Result<u64, IndexerError> {
        let result = sqlx::query(
            "DELETE FROM block
             WHERE slot < (SELECT MAX(slot) FROM block)
               AND NOT EXISTS (
                 SELECT 1 FROM output
                 WHERE output.created_slot = block.slot OR output.spent_slot = block.slot
               )",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn block_count(&self) -> Result<u64, IndexerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM block")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn output_count(&self) -> Result<u64, IndexerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM output")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn outputs(&self) -> Result<Vec<OutputRow>, IndexerError> {
        let rows = sqlx::query(
            "SELECT id, tag, tx_id, tx_ix, address, value, datum, datum_hash, script_hash,
                    created_slot, spent_slot
             FROM output ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| OutputRow {
                id: row.get("id"),
                tag: row.get("tag"),
                tx_id: row.get("tx_id"),
                tx_ix: row.get::<i64, _>("tx_ix") as u32,
                address: row.get("address"),
                value: row.get("value"),
                datum: row.get("datum"),
                datum_hash: row.get("datum_hash"),
                script_hash: row.get("script_hash"),
                created_slot: row.get::<i64, _>("created_slot") as u64,
                spent_slot: row.get::<Option<i64>, _>("spent_slot").map(|s| s as u64),
            })
            .collect())
    }

    async fn script_count(&self) -> Result<u64, IndexerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM script")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl ViewRefresher for PostgresStore {
    async fn refresh(&self, view: &str, concurrently: bool) -> Result<(), IndexerError> {
        let stmt = if concurrently {
            format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}")
        } else {
            format!("REFRESH MATERIALIZED VIEW {view}")
        };
        sqlx::query(&stmt).execute(&self.pool).await?;
        Ok(())
    }
}
