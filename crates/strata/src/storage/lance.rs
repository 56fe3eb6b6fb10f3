use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::DistanceType;
use lancedb::Table;
use lancedb::index::Index;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryRecord, Metadata, RecordUpdate, SupersededBy, TOMBSTONE};
use crate::storage::{Neighbor, StateCounts, VectorIndex, check_dimension};

/// Column LanceDB appends to vector query results
const DISTANCE_COLUMN: &str = "_distance";

/// IVF-PQ requires at least this many rows for training
const MIN_ROWS_FOR_VECTOR_INDEX: usize = 256;

/// Candidates re-ranked by exact distance per requested neighbor once a
/// quantized index exists
const REFINE_FACTOR: u32 = 10;

/// LanceDB-backed vector index holding one memories table.
pub struct LanceIndex {
    table: Table,
    dimension: usize,
}

impl LanceIndex {
    /// Connect to the dataset at `path`, creating `table_name` if it does not
    /// exist yet. An existing table must have been created with the same
    /// embedding dimension.
    pub async fn open(path: &Path, table_name: &str, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| StrataError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to list tables: {e}")))?;

        let table = if names.iter().any(|name| name == table_name) {
            let table = connection
                .open_table(table_name)
                .execute()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to open memories table: {e}")))?;
            Self::verify_dimension(&table, dimension).await?;
            tracing::info!(table = table_name, dimension, "Opened memories table");
            table
        } else {
            let schema = Self::schema(dimension);
            let batch = RecordBatch::new_empty(schema.clone());
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

            let table = connection
                .create_table(table_name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| {
                    StrataError::Storage(format!("Failed to create memories table: {e}"))
                })?;
            tracing::info!(table = table_name, dimension, "Created memories table");
            table
        };

        Ok(Self { table, dimension })
    }

    pub(crate) fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
            Field::new("metadata", DataType::Utf8, false),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new(
                "updated_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("superseded_by", DataType::Utf8, true),
        ]))
    }

    async fn verify_dimension(table: &Table, dimension: usize) -> Result<()> {
        let schema = table
            .schema()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to read table schema: {e}")))?;

        let field = schema
            .field_with_name("embedding")
            .map_err(|e| StrataError::Storage(format!("Table has no embedding column: {e}")))?;

        match field.data_type() {
            DataType::FixedSizeList(_, size) if *size as usize == dimension => Ok(()),
            DataType::FixedSizeList(_, size) => Err(StrataError::Storage(format!(
                "Table stores {size}-dimension embeddings but {dimension} were configured"
            ))),
            other => Err(StrataError::Storage(format!(
                "Unexpected embedding column type: {other}"
            ))),
        }
    }

    /// Whether an index already covers the embedding column.
    pub async fn has_vector_index(&self) -> Result<bool> {
        let indices = self
            .table
            .list_indices()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to list indices: {e}")))?;

        Ok(indices
            .iter()
            .any(|index| index.columns.iter().any(|c| c == "embedding")))
    }

    async fn count_where(&self, filter: &str) -> Result<usize> {
        self.table
            .count_rows(Some(filter.to_string()))
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to count memories: {e}")))
    }

    /// Fail if any of `ids` is already stored.
    async fn reject_existing(&self, ids: &[Uuid]) -> Result<()> {
        let quoted: Vec<String> = ids.iter().map(|id| format!("'{id}'")).collect();
        let existing = self
            .count_where(&format!("id IN ({})", quoted.join(", ")))
            .await?;
        if existing > 0 {
            return Err(StrataError::Storage(format!(
                "{existing} of {} memories already exist",
                ids.len()
            )));
        }
        Ok(())
    }

    /// Convert records to an Arrow RecordBatch
    fn records_to_batch(records: &[MemoryRecord], dimension: usize) -> Result<RecordBatch> {
        let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();

        let embeddings: Vec<Option<Vec<Option<f32>>>> = records
            .iter()
            .map(|r| Some(r.embedding.iter().map(|&v| Some(v)).collect()))
            .collect();

        let metadata: Vec<String> = records
            .iter()
            .map(|r| serde_json::to_string(&r.metadata))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| StrataError::Serialization(format!("Failed to encode metadata: {e}")))?;
        let metadata_refs: Vec<&str> = metadata.iter().map(String::as_str).collect();

        let created_at: Vec<i64> = records
            .iter()
            .map(|r| r.created_at.timestamp_micros())
            .collect();

        let updated_at: Vec<i64> = records
            .iter()
            .map(|r| r.updated_at.timestamp_micros())
            .collect();

        let superseded_by: Vec<Option<String>> = records
            .iter()
            .map(|r| r.superseded_by.map(|p| p.to_column()))
            .collect();
        let superseded_refs: Vec<Option<&str>> =
            superseded_by.iter().map(|s| s.as_deref()).collect();

        RecordBatch::try_new(
            Self::schema(dimension),
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(StringArray::from(contents)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, dimension as i32)),
                Arc::new(StringArray::from(metadata_refs)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(updated_at).with_timezone("UTC")),
                Arc::new(StringArray::from(superseded_refs)),
            ],
        )
        .map_err(|e| StrataError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    /// Convert an Arrow RecordBatch row back to a record
    fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<MemoryRecord> {
        let id_array = column::<StringArray>(batch, "id")?;
        let content_array = column::<StringArray>(batch, "content")?;
        let embedding_array = column::<FixedSizeListArray>(batch, "embedding")?;
        let metadata_array = column::<StringArray>(batch, "metadata")?;
        let created_at_array = column::<TimestampMicrosecondArray>(batch, "created_at")?;
        let updated_at_array = column::<TimestampMicrosecondArray>(batch, "updated_at")?;
        let superseded_array = column::<StringArray>(batch, "superseded_by")?;

        let id = Uuid::parse_str(id_array.value(row))
            .map_err(|e| StrataError::Storage(format!("Failed to parse UUID: {e}")))?;

        let content = content_array.value(row).to_string();

        let embedding_list = embedding_array.value(row);
        let embedding_values = embedding_list
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| StrataError::Storage("Failed to get embedding values".to_string()))?;
        let embedding: Vec<f32> = embedding_values.values().to_vec();

        let metadata: Metadata = serde_json::from_str(metadata_array.value(row))
            .map_err(|e| StrataError::Serialization(format!("Failed to decode metadata: {e}")))?;

        let created_at = timestamp(created_at_array.value(row), "created_at")?;
        let updated_at = timestamp(updated_at_array.value(row), "updated_at")?;

        let superseded_by = if superseded_array.is_null(row) {
            None
        } else {
            SupersededBy::from_column(Some(superseded_array.value(row)))?
        };

        Ok(MemoryRecord {
            id,
            content,
            embedding,
            metadata,
            created_at,
            updated_at,
            superseded_by,
        })
    }

    async fn add(&self, records: &[MemoryRecord]) -> Result<()> {
        let mut ids = Vec::with_capacity(records.len());
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            check_dimension(self.dimension, &record.embedding)?;
            if !seen.insert(record.id) {
                return Err(StrataError::Storage(format!(
                    "Memory {} appears twice in one batch",
                    record.id
                )));
            }
            ids.push(record.id);
        }
        self.reject_existing(&ids).await?;

        let batch = Self::records_to_batch(records, self.dimension)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], Self::schema(self.dimension));

        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to insert memories: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LanceIndex {
    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        self.add(std::slice::from_ref(record)).await
    }

    /// Written as a single append, so the batch lands together or not at all.
    async fn insert_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.add(records).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let stream = self
            .table
            .query()
            .only_if(format!("id = '{id}'"))
            .limit(1)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to query memory: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to collect query results: {e}")))?;

        match batches.iter().find(|b| b.num_rows() > 0) {
            Some(batch) => Ok(Some(Self::batch_to_record(batch, 0)?)),
            None => Ok(None),
        }
    }

    async fn update_fields(&self, id: Uuid, update: &RecordUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(self.get_by_id(id).await?.is_some());
        }

        let mut builder = self.table.update().only_if(format!("id = '{id}'"));

        if let Some(pointer) = update.superseded_by {
            let value = match pointer {
                Some(pointer) => format!("'{}'", pointer.to_column()),
                None => "NULL".to_string(),
            };
            builder = builder.column("superseded_by", value);
        }

        if let Some(updated_at) = update.updated_at {
            builder = builder.column("updated_at", format!("{}", updated_at.timestamp_micros()));
        }

        let result = builder
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to update memory: {e}")))?;

        Ok(result.rows_updated > 0)
    }

    async fn nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        check_dimension(self.dimension, vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let stream = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(|e| StrataError::Storage(format!("Failed to create vector query: {e}")))?
            .distance_type(DistanceType::Cosine)
            .refine_factor(REFINE_FACTOR)
            .select(Select::columns(&["id"]))
            .limit(k)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to execute search: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to collect search results: {e}")))?;

        let mut neighbors = Vec::new();
        for batch in &batches {
            let ids = column::<StringArray>(batch, "id")?;
            let distances = column::<Float32Array>(batch, DISTANCE_COLUMN)?;
            for row in 0..batch.num_rows() {
                let id = Uuid::parse_str(ids.value(row))
                    .map_err(|e| StrataError::Storage(format!("Failed to parse UUID: {e}")))?;
                neighbors.push(Neighbor {
                    id,
                    distance: distances.value(row),
                });
            }
        }

        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to count memories: {e}")))
    }

    async fn state_counts(&self) -> Result<StateCounts> {
        let total = self.count().await?;
        let live = self.count_where("superseded_by IS NULL").await?;
        let deleted = self
            .count_where(&format!("superseded_by = '{TOMBSTONE}'"))
            .await?;

        Ok(StateCounts {
            live,
            superseded: total.saturating_sub(live + deleted),
            deleted,
        })
    }

    /// Build an IVF-PQ index on the embedding column the first time the
    /// table is large enough to train one.
    async fn ensure_vector_index(&self) -> Result<bool> {
        let row_count = self.count().await?;
        if row_count < MIN_ROWS_FOR_VECTOR_INDEX {
            tracing::debug!(row_count, "Too few rows for a vector index");
            return Ok(false);
        }
        if self.has_vector_index().await? {
            return Ok(false);
        }

        let num_partitions = ((row_count as f64).sqrt() as u32).clamp(1, 256);
        let num_sub_vectors = [16u32, 8, 4, 2, 1]
            .into_iter()
            .find(|n| self.dimension % *n as usize == 0)
            .unwrap_or(1);

        let ivf_pq = IvfPqIndexBuilder::default()
            .distance_type(DistanceType::Cosine)
            .num_partitions(num_partitions)
            .num_sub_vectors(num_sub_vectors);

        self.table
            .create_index(&["embedding"], Index::IvfPq(ivf_pq))
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to create vector index: {e}")))?;

        tracing::info!(row_count, num_partitions, "Built IVF-PQ vector index");
        Ok(true)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| StrataError::Storage(format!("Failed to get {name} column")))
}

fn timestamp(micros: i64, name: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| StrataError::Storage(format!("Failed to parse {name} timestamp")))
}
