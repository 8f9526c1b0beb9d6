//! Query-side relational index of image records.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use imgcat_core::{CanonicalImageRecord, KeyValue};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed column {column}: {source}")]
    Column {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("no indexed row for {namespace}/{id}")]
    MissingRow { namespace: String, id: String },
}

#[async_trait]
pub trait ImageIndex: Send + Sync {
    async fn insert(&self, record: &CanonicalImageRecord) -> Result<(), IndexError>;

    async fn update(
        &self,
        namespace: &str,
        id: &str,
        record: &CanonicalImageRecord,
    ) -> Result<(), IndexError>;

    async fn delete(&self, namespace: &str, id: &str) -> Result<(), IndexError>;

    /// Records in `namespace` whose name contains every fragment.
    async fn search(
        &self,
        namespace: &str,
        name_fragments: &[String],
    ) -> Result<Vec<CanonicalImageRecord>, IndexError>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS image (
    namespace TEXT NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    connection_name TEXT NOT NULL DEFAULT '',
    csp_image_id TEXT NOT NULL DEFAULT '',
    csp_image_name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    creation_date TEXT NOT NULL DEFAULT '',
    guest_os TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    key_value_list TEXT NOT NULL DEFAULT '[]',
    associated_object_list TEXT NOT NULL DEFAULT '[]',
    is_auto_generated INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (namespace, id)
)
"#;

const SELECT_COLUMNS: &str = "SELECT namespace, id, name, connection_name, csp_image_id, \
     csp_image_name, description, creation_date, guest_os, status, key_value_list, \
     associated_object_list, is_auto_generated FROM image";

/// SQLite-backed index. A single pooled connection keeps writes serialized.
#[derive(Debug, Clone)]
pub struct SqliteImageIndex {
    pool: Pool<Sqlite>,
}

impl SqliteImageIndex {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| IndexError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database; the connection is pinned so the data outlives idle periods.
    pub async fn in_memory() -> Result<Self, IndexError> {
        let opts = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: Pool<Sqlite>) -> Result<Self, IndexError> {
        let index = Self { pool };
        index.ensure_schema().await?;
        Ok(index)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), IndexError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

struct EncodedLists {
    key_value_list: String,
    associated_object_list: String,
}

fn encode_lists(record: &CanonicalImageRecord) -> Result<EncodedLists, IndexError> {
    Ok(EncodedLists {
        key_value_list: serde_json::to_string(&record.key_value_list).map_err(|source| {
            IndexError::Column {
                column: "key_value_list",
                source,
            }
        })?,
        associated_object_list: serde_json::to_string(&record.associated_object_list).map_err(
            |source| IndexError::Column {
                column: "associated_object_list",
                source,
            },
        )?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<CanonicalImageRecord, IndexError> {
    let key_value_list: String = row.try_get("key_value_list")?;
    let associated_object_list: String = row.try_get("associated_object_list")?;
    Ok(CanonicalImageRecord {
        namespace: row.try_get("namespace")?,
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        connection_name: row.try_get("connection_name")?,
        csp_image_id: row.try_get("csp_image_id")?,
        csp_image_name: row.try_get("csp_image_name")?,
        description: row.try_get("description")?,
        creation_date: row.try_get("creation_date")?,
        guest_os: row.try_get("guest_os")?,
        status: row.try_get("status")?,
        key_value_list: serde_json::from_str::<Vec<KeyValue>>(&key_value_list).map_err(
            |source| IndexError::Column {
                column: "key_value_list",
                source,
            },
        )?,
        associated_object_list: serde_json::from_str(&associated_object_list).map_err(
            |source| IndexError::Column {
                column: "associated_object_list",
                source,
            },
        )?,
        is_auto_generated: row.try_get("is_auto_generated")?,
    })
}

/// `LIKE` pattern matching `fragment` literally anywhere in the column.
pub fn contains_pattern(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 2);
    out.push('%');
    for ch in fragment.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

#[async_trait]
impl ImageIndex for SqliteImageIndex {
    async fn insert(&self, record: &CanonicalImageRecord) -> Result<(), IndexError> {
        let lists = encode_lists(record)?;
        sqlx::query(
            "INSERT INTO image (namespace, id, name, connection_name, csp_image_id, csp_image_name, \
             description, creation_date, guest_os, status, key_value_list, associated_object_list, \
             is_auto_generated) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.namespace)
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.connection_name)
        .bind(&record.csp_image_id)
        .bind(&record.csp_image_name)
        .bind(&record.description)
        .bind(&record.creation_date)
        .bind(&record.guest_os)
        .bind(&record.status)
        .bind(lists.key_value_list)
        .bind(lists.associated_object_list)
        .bind(record.is_auto_generated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        namespace: &str,
        id: &str,
        record: &CanonicalImageRecord,
    ) -> Result<(), IndexError> {
        let lists = encode_lists(record)?;
        let result = sqlx::query(
            "UPDATE image SET name = ?, connection_name = ?, csp_image_id = ?, csp_image_name = ?, \
             description = ?, creation_date = ?, guest_os = ?, status = ?, key_value_list = ?, \
             associated_object_list = ?, is_auto_generated = ? WHERE namespace = ? AND id = ?",
        )
        .bind(&record.name)
        .bind(&record.connection_name)
        .bind(&record.csp_image_id)
        .bind(&record.csp_image_name)
        .bind(&record.description)
        .bind(&record.creation_date)
        .bind(&record.guest_os)
        .bind(&record.status)
        .bind(lists.key_value_list)
        .bind(lists.associated_object_list)
        .bind(record.is_auto_generated)
        .bind(namespace)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(IndexError::MissingRow {
                namespace: namespace.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM image WHERE namespace = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        name_fragments: &[String],
    ) -> Result<Vec<CanonicalImageRecord>, IndexError> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        query.push(" WHERE namespace = ").push_bind(namespace);
        for fragment in name_fragments {
            query
                .push(" AND name LIKE ")
                .push_bind(contains_pattern(fragment))
                .push(" ESCAPE '\\'");
        }
        query.push(" ORDER BY id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }
}
