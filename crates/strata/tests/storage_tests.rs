//! Integration tests for the storage layer
//!
//! Exercises LanceIndex against a real on-disk dataset and checks that
//! InMemoryIndex honours the same contract.

use serde_json::json;
use strata::memory::{MemoryRecord, Metadata, RecordUpdate, SupersededBy};
use strata::storage::{InMemoryIndex, LanceIndex, VectorIndex};
use tempfile::tempdir;
use uuid::Uuid;

const DIM: usize = 4;

/// Test fixture: a live record with the given embedding
fn create_record(content: &str, embedding: Vec<f32>) -> MemoryRecord {
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!("test"));
    MemoryRecord::new(content.to_string(), embedding, metadata)
}

/// Test fixture: a LanceIndex in a temporary directory
async fn create_test_index() -> (LanceIndex, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let index = LanceIndex::open(dir.path(), "memories", DIM).await.unwrap();
    (index, dir)
}

/// Timestamps are stored at microsecond precision
fn assert_same_record(actual: &MemoryRecord, expected: &MemoryRecord) {
    assert_eq!(actual.id, expected.id);
    assert_eq!(actual.content, expected.content);
    assert_eq!(actual.embedding, expected.embedding);
    assert_eq!(actual.metadata, expected.metadata);
    assert_eq!(actual.superseded_by, expected.superseded_by);
    assert_eq!(
        actual.created_at.timestamp_micros(),
        expected.created_at.timestamp_micros()
    );
}

mod lance_tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let (index, _dir) = create_test_index().await;
        let record = create_record("Roundtrip content", vec![0.1, 0.2, 0.3, 0.4]);

        index.insert(&record).await.unwrap();

        let fetched = index.get_by_id(record.id).await.unwrap().unwrap();
        assert_same_record(&fetched, &record);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_none() {
        let (index, _dir) = create_test_index().await;
        assert!(index.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_supersession_states_persist() {
        let (index, _dir) = create_test_index().await;

        let live = create_record("live", vec![1.0, 0.0, 0.0, 0.0]);
        let mut replaced = create_record("replaced", vec![0.0, 1.0, 0.0, 0.0]);
        replaced.superseded_by = Some(SupersededBy::Record(live.id));
        let mut deleted = create_record("deleted", vec![0.0, 0.0, 1.0, 0.0]);
        deleted.superseded_by = Some(SupersededBy::Tombstone);

        index
            .insert_batch(&[live.clone(), replaced.clone(), deleted.clone()])
            .await
            .unwrap();

        for record in [&live, &replaced, &deleted] {
            let fetched = index.get_by_id(record.id).await.unwrap().unwrap();
            assert_same_record(&fetched, record);
        }
    }

    #[tokio::test]
    async fn test_update_fields_changes_only_pointer_and_timestamp() {
        let (index, _dir) = create_test_index().await;
        let record = create_record("to delete", vec![0.5, 0.5, 0.0, 0.0]);
        index.insert(&record).await.unwrap();

        let update = RecordUpdate::supersede_with(SupersededBy::Tombstone);
        assert!(index.update_fields(record.id, &update).await.unwrap());

        let fetched = index.get_by_id(record.id).await.unwrap().unwrap();
        assert!(fetched.is_deleted());
        assert_eq!(fetched.content, record.content);
        assert_eq!(fetched.metadata, record.metadata);
        assert_eq!(
            fetched.updated_at.timestamp_micros(),
            update.updated_at.unwrap().timestamp_micros()
        );
        assert_eq!(
            fetched.created_at.timestamp_micros(),
            record.created_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_update_fields_can_point_at_replacement_and_clear() {
        let (index, _dir) = create_test_index().await;
        let old = create_record("old", vec![1.0, 0.0, 0.0, 0.0]);
        let new = create_record("new", vec![0.0, 1.0, 0.0, 0.0]);
        index.insert_batch(&[old.clone(), new.clone()]).await.unwrap();

        index
            .update_fields(old.id, &RecordUpdate::supersede_with(SupersededBy::Record(new.id)))
            .await
            .unwrap();
        let fetched = index.get_by_id(old.id).await.unwrap().unwrap();
        assert_eq!(fetched.superseded_by, Some(SupersededBy::Record(new.id)));

        let clear = RecordUpdate {
            superseded_by: Some(None),
            updated_at: None,
        };
        assert!(index.update_fields(old.id, &clear).await.unwrap());
        assert!(index.get_by_id(old.id).await.unwrap().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_false() {
        let (index, _dir) = create_test_index().await;
        let update = RecordUpdate::supersede_with(SupersededBy::Tombstone);
        assert!(!index.update_fields(Uuid::new_v4(), &update).await.unwrap());
    }

    #[tokio::test]
    async fn test_nearest_neighbors_ordered_by_distance() {
        let (index, _dir) = create_test_index().await;
        let exact = create_record("exact", vec![1.0, 0.0, 0.0, 0.0]);
        let close = create_record("close", vec![1.0, 0.2, 0.0, 0.0]);
        let far = create_record("far", vec![0.0, 0.0, 0.0, 1.0]);
        index
            .insert_batch(&[far.clone(), close.clone(), exact.clone()])
            .await
            .unwrap();

        let neighbors = index
            .nearest_neighbors(&[1.0, 0.0, 0.0, 0.0], 2)
            .await
            .unwrap();

        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].id, exact.id);
        assert_eq!(neighbors[1].id, close.id);
        assert!(neighbors[0].distance <= neighbors[1].distance);
    }

    #[tokio::test]
    async fn test_nearest_neighbors_includes_superseded_records() {
        let (index, _dir) = create_test_index().await;
        let mut deleted = create_record("deleted", vec![1.0, 0.0, 0.0, 0.0]);
        deleted.superseded_by = Some(SupersededBy::Tombstone);
        index.insert(&deleted).await.unwrap();

        let neighbors = index
            .nearest_neighbors(&[1.0, 0.0, 0.0, 0.0], 5)
            .await
            .unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, deleted.id);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let (index, _dir) = create_test_index().await;
        let record = create_record("too short", vec![1.0, 0.0]);

        assert!(index.insert(&record).await.is_err());
        assert!(index.nearest_neighbors(&[1.0], 3).await.is_err());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let record = create_record("persistent", vec![0.3, 0.3, 0.3, 0.3]);

        {
            let index = LanceIndex::open(dir.path(), "memories", DIM).await.unwrap();
            index.insert(&record).await.unwrap();
        }

        let reopened = LanceIndex::open(dir.path(), "memories", DIM).await.unwrap();
        let fetched = reopened.get_by_id(record.id).await.unwrap().unwrap();
        assert_same_record(&fetched, &record);
    }

    #[tokio::test]
    async fn test_reopen_with_other_dimension_fails() {
        let dir = tempdir().unwrap();
        LanceIndex::open(dir.path(), "memories", DIM).await.unwrap();

        assert!(LanceIndex::open(dir.path(), "memories", DIM * 2).await.is_err());
    }

    #[tokio::test]
    async fn test_vector_index_skipped_for_small_tables() {
        let (index, _dir) = create_test_index().await;
        index
            .insert(&create_record("lonely", vec![0.1, 0.2, 0.3, 0.4]))
            .await
            .unwrap();

        assert!(!index.ensure_vector_index().await.unwrap());
    }

    #[tokio::test]
    async fn test_vector_index_built_once_and_keeps_exact_match_first() {
        let (index, _dir) = create_test_index().await;
        let records: Vec<MemoryRecord> = (0..300)
            .map(|i| {
                let x = i as f32;
                create_record(
                    &format!("memory {i}"),
                    vec![x.sin(), x.cos(), (2.0 * x).sin(), (3.0 * x).cos()],
                )
            })
            .collect();
        index.insert_batch(&records).await.unwrap();

        assert!(index.ensure_vector_index().await.unwrap());
        assert!(index.has_vector_index().await.unwrap());
        assert!(!index.ensure_vector_index().await.unwrap());

        for target in [&records[0], &records[137], &records[299]] {
            let neighbors = index.nearest_neighbors(&target.embedding, 5).await.unwrap();
            assert_eq!(neighbors[0].id, target.id);
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let (index, _dir) = create_test_index().await;
        let record = create_record("once", vec![0.1, 0.2, 0.3, 0.4]);

        index.insert(&record).await.unwrap();
        assert!(index.insert(&record).await.is_err());

        // One fresh record alongside an existing one: nothing is written
        let fresh = create_record("fresh", vec![0.4, 0.3, 0.2, 0.1]);
        assert!(index.insert_batch(&[fresh.clone(), record.clone()]).await.is_err());
        assert!(index.get_by_id(fresh.id).await.unwrap().is_none());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_id_within_batch_is_rejected() {
        let (index, _dir) = create_test_index().await;
        let record = create_record("twice", vec![0.1, 0.2, 0.3, 0.4]);

        assert!(index.insert_batch(&[record.clone(), record]).await.is_err());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_counts() {
        let (index, _dir) = create_test_index().await;
        let live = create_record("live", vec![1.0, 0.0, 0.0, 0.0]);
        let replaced = create_record("replaced", vec![0.0, 1.0, 0.0, 0.0]);
        let deleted = create_record("deleted", vec![0.0, 0.0, 1.0, 0.0]);
        index
            .insert_batch(&[live.clone(), replaced.clone(), deleted.clone()])
            .await
            .unwrap();
        index
            .update_fields(
                replaced.id,
                &RecordUpdate::supersede_with(SupersededBy::Record(live.id)),
            )
            .await
            .unwrap();
        index
            .update_fields(deleted.id, &RecordUpdate::supersede_with(SupersededBy::Tombstone))
            .await
            .unwrap();

        let counts = index.state_counts().await.unwrap();
        assert_eq!((counts.live, counts.superseded, counts.deleted), (1, 1, 1));
        assert_eq!(counts.total(), 3);
    }
}

mod in_memory_tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let index = InMemoryIndex::new(DIM);
        let record = create_record("once", vec![0.1, 0.2, 0.3, 0.4]);

        index.insert(&record).await.unwrap();
        assert!(index.insert(&record).await.is_err());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_matches_lance_ordering() {
        let (lance, _dir) = create_test_index().await;
        let memory = InMemoryIndex::new(DIM);
        let records = vec![
            create_record("a", vec![1.0, 0.0, 0.0, 0.0]),
            create_record("b", vec![0.7, 0.7, 0.0, 0.0]),
            create_record("c", vec![0.0, 0.0, 1.0, 0.0]),
        ];
        lance.insert_batch(&records).await.unwrap();
        memory.insert_batch(&records).await.unwrap();

        let query = [0.9, 0.1, 0.0, 0.0];
        let from_lance: Vec<Uuid> = lance
            .nearest_neighbors(&query, 3)
            .await
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        let from_memory: Vec<Uuid> = memory
            .nearest_neighbors(&query, 3)
            .await
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();

        assert_eq!(from_lance, from_memory);
    }
}
