//! ClickHouse-backed file registry and IOC index

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};

use crate::config::ClickHouseConfig;
use crate::models::{FileRecord, IocRecord, IocType, ScanStatus};
use crate::storage::Dependency;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const BATCH_INSERT_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle over the columnar store. Clone-cheap; safe to share across tasks.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct FileRow {
    file_id: String,
    file_path: String,
    file_size: u64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    last_modified: DateTime<Utc>,
    scan_status: String,
    ioc_count: u32,
    blob_key: String,
    error_message: String,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    processed_at: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct IocRow {
    ioc_value: String,
    ioc_type: u8,
    source_file_id: String,
    malware_family: String,
    confidence: u8,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    first_seen: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    last_seen: DateTime<Utc>,
    hit_count: u32,
    tags: Vec<String>,
}

#[derive(Debug, Row, Deserialize)]
struct LabelCountRow {
    label: String,
    count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct TagCountRow {
    tag: u8,
    count: u64,
}

impl ClickHouseStore {
    /// Connect and verify the server is reachable.
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<Self> {
        let url = format!("http://{}:{}", cfg.host, cfg.port);
        let client = Client::default()
            .with_url(&url)
            .with_database(&cfg.database)
            .with_user(&cfg.user)
            .with_password(&cfg.password);

        let store = Self { client };
        store
            .ping()
            .await
            .context("failed to ping ClickHouse")?;

        tracing::info!(host = %cfg.host, port = cfg.port, database = %cfg.database, "connected to ClickHouse");
        Ok(store)
    }

    pub async fn ping(&self) -> Result<()> {
        tokio::time::timeout(
            PING_TIMEOUT,
            self.client.query("SELECT 1").fetch_one::<u8>(),
        )
        .await
        .context("ClickHouse ping timed out")?
        .context("ClickHouse ping failed")?;
        Ok(())
    }

    // ==================== File Registry ====================

    /// Fetch the latest registry row for a file, projecting replacement
    /// duplicates down to the greatest `updated_at`.
    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let row = self
            .client
            .query(
                "SELECT ?fields FROM file_registry \
                 WHERE file_id = ? ORDER BY updated_at DESC LIMIT 1",
            )
            .bind(file_id)
            .fetch_optional::<FileRow>()
            .await
            .context("failed to fetch file record")?;

        row.map(file_record_from_row).transpose()
    }

    /// Point read backing idempotent change detection. `None` means the file
    /// has never been registered.
    pub async fn last_modified_of(&self, file_id: &str) -> Result<Option<DateTime<Utc>>> {
        let ts = self
            .client
            .query(
                "SELECT toUnixTimestamp(last_modified) FROM file_registry \
                 WHERE file_id = ? ORDER BY updated_at DESC LIMIT 1",
            )
            .bind(file_id)
            .fetch_optional::<u32>()
            .await
            .context("failed to fetch last_modified")?;

        Ok(ts.and_then(|secs| DateTime::from_timestamp(secs as i64, 0)))
    }

    /// Write a registry row stamped with the current wall clock; later writes
    /// shadow earlier ones by `updated_at`.
    pub async fn upsert_file(&self, record: &FileRecord) -> Result<()> {
        let row = FileRow {
            file_id: record.file_id.clone(),
            file_path: record.file_path.clone(),
            file_size: record.file_size,
            last_modified: record.last_modified,
            scan_status: record.scan_status.as_str().to_string(),
            ioc_count: record.ioc_count,
            blob_key: record.blob_key.clone(),
            error_message: record.error_message.clone(),
            processed_at: record.processed_at,
            updated_at: Utc::now(),
        };

        let mut insert = self
            .client
            .insert("file_registry")
            .context("failed to open registry insert")?;
        insert
            .write(&row)
            .await
            .context("failed to write registry row")?;
        insert
            .end()
            .await
            .context("failed to commit registry row")?;
        Ok(())
    }

    /// File counts per scan status.
    pub async fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let rows = self
            .client
            .query("SELECT scan_status AS label, count() AS count FROM file_registry GROUP BY scan_status")
            .fetch_all::<LabelCountRow>()
            .await
            .context("failed to query file stats")?;

        Ok(rows.into_iter().map(|r| (r.label, r.count)).collect())
    }

    // ==================== IOC Index ====================

    /// Insert a batch of IOC records. Atomic at the batch boundary: a failure
    /// rejects the whole batch.
    pub async fn batch_insert_iocs(&self, records: &[IocRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let write_all = async {
            let mut insert = self
                .client
                .insert("ioc_store")
                .context("failed to open IOC insert")?;
            for record in records {
                let row = IocRow {
                    ioc_value: record.value.clone(),
                    ioc_type: record.ioc_type.tag(),
                    source_file_id: record.source_file_id.clone(),
                    malware_family: record.malware_family.clone(),
                    confidence: record.confidence,
                    first_seen: record.first_seen,
                    last_seen: record.last_seen,
                    hit_count: record.hit_count,
                    tags: record.tags.clone(),
                };
                insert
                    .write(&row)
                    .await
                    .context("failed to append IOC row to batch")?;
            }
            insert.end().await.context("failed to send IOC batch")
        };

        tokio::time::timeout(BATCH_INSERT_TIMEOUT, write_all)
            .await
            .context("IOC batch insert timed out")??;

        tracing::debug!(count = records.len(), "batch inserted IOCs");
        Ok(())
    }

    /// Fetch every row matching any of the given values, newest first.
    /// Values are not unique across rows; callers collapse multiplicity.
    pub async fn lookup_iocs(&self, values: &[String]) -> Result<Vec<IocRecord>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .client
            .query(
                "SELECT ?fields FROM ioc_store \
                 WHERE ioc_value IN ? ORDER BY last_seen DESC",
            )
            .bind(values)
            .fetch_all::<IocRow>()
            .await
            .context("failed to query IOCs")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match IocType::from_tag(row.ioc_type) {
                Some(ioc_type) => records.push(IocRecord {
                    value: row.ioc_value,
                    ioc_type,
                    source_file_id: row.source_file_id,
                    malware_family: row.malware_family,
                    confidence: row.confidence,
                    first_seen: row.first_seen,
                    last_seen: row.last_seen,
                    hit_count: row.hit_count,
                    tags: row.tags,
                }),
                None => {
                    tracing::warn!(tag = row.ioc_type, value = %row.ioc_value, "skipping row with unknown IOC type tag");
                }
            }
        }
        Ok(records)
    }

    /// IOC counts per type.
    pub async fn type_counts(&self) -> Result<BTreeMap<String, u64>> {
        let rows = self
            .client
            .query("SELECT ioc_type AS tag, count() AS count FROM ioc_store GROUP BY ioc_type")
            .fetch_all::<TagCountRow>()
            .await
            .context("failed to query IOC stats")?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                IocType::from_tag(r.tag).map(|ty| (ty.as_str().to_string(), r.count))
            })
            .collect())
    }
}

fn file_record_from_row(row: FileRow) -> Result<FileRecord> {
    let scan_status = ScanStatus::parse(&row.scan_status)
        .with_context(|| format!("unknown scan status in registry: {}", row.scan_status))?;
    Ok(FileRecord {
        file_id: row.file_id,
        file_path: row.file_path,
        file_size: row.file_size,
        last_modified: row.last_modified,
        scan_status,
        ioc_count: row.ioc_count,
        blob_key: row.blob_key,
        error_message: row.error_message,
        processed_at: row.processed_at,
        updated_at: row.updated_at,
    })
}

#[async_trait]
impl Dependency for ClickHouseStore {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn ping(&self) -> Result<()> {
        ClickHouseStore::ping(self).await
    }
}
