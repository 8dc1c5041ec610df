//! MapRecordService: persistence for published map layers (`user_maps`).

use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, Transaction, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;

use crate::{
    errors::{MapError, MapResult},
    models::map_record::{MapMetadata, MapRecord, StorageReference},
};

pub const DEFAULT_LIST_LIMIT: i64 = 100;
pub const MAX_LIST_LIMIT: i64 = 1000;

const RECORD_COLUMNS: &str =
    "id, name, description, file_type, file_path, layer_name, created_by, is_public, created_at";

#[derive(Clone)]
pub struct MapRecordService {
    pub db: Arc<SqlitePool>,
}

impl MapRecordService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        owner_id: i64,
        metadata: &MapMetadata,
        storage: &StorageReference,
    ) -> MapResult<MapRecord> {
        let record = sqlx::query_as::<_, MapRecord>(&format!(
            r#"
            INSERT INTO user_maps
                (name, description, file_type, file_path, layer_name, created_by, is_public, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(metadata.name.trim())
        .bind(metadata.description.as_deref())
        .bind(metadata.file_type)
        .bind(&storage.file_path)
        .bind(&storage.layer_name)
        .bind(owner_id)
        .bind(metadata.is_public)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        debug!(id = record.id, layer = %record.layer_name, "inserted map record");
        Ok(record)
    }

    /// Records ordered by id. With an owner, only that owner's records and
    /// public ones are returned.
    pub async fn list(
        &self,
        owner_id: Option<i64>,
        skip: Option<i64>,
        limit: Option<i64>,
    ) -> MapResult<Vec<MapRecord>> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let skip = skip.unwrap_or(0).max(0);

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {RECORD_COLUMNS} FROM user_maps"));
        if let Some(owner) = owner_id {
            builder.push(" WHERE created_by = ");
            builder.push_bind(owner);
            builder.push(" OR is_public = 1");
        }
        builder.push(" ORDER BY id ASC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(skip);

        let rows: Vec<MapRecord> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    pub async fn get(&self, id: i64) -> MapResult<MapRecord> {
        sqlx::query_as::<_, MapRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM user_maps WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| MapError::NotFound(format!("map `{}` not found", id)))
    }

    /// Delete a row inside a new transaction and hand the transaction back.
    ///
    /// The row only disappears once the caller commits; dropping or rolling
    /// back the transaction keeps it.
    pub async fn begin_delete(&self, id: i64) -> MapResult<Transaction<'static, Sqlite>> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("DELETE FROM user_maps WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(MapError::NotFound(format!("map `{}` not found", id)));
        }
        Ok(tx)
    }
}
