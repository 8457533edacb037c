//! End-to-end tests for the index engine: dense recall, sparse ranking,
//! filtered search, WAL recovery, and ID recycling.

use serde_json::json;

use quantadb_core::{
    FusionMethod, IndexOptions, IntId, Metric, QuantLevel, SparseVector, VectorIndex, VectorRecord,
};

fn l2_int8_options(dim: usize) -> IndexOptions {
    let mut options = IndexOptions::new(dim);
    options.metric = Metric::L2;
    options.quant_level = QuantLevel::Int8;
    options
}

fn sparse(pairs: &[(u32, f32)]) -> SparseVector {
    SparseVector::new(
        pairs.iter().map(|&(t, _)| t).collect(),
        pairs.iter().map(|&(_, v)| v).collect(),
    )
    .unwrap()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn dense_ann_recall() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    index
        .add_batch(
            &[
                VectorRecord::new("a").with_dense(vec![1.0, 0.0, 0.0, 0.0]),
                VectorRecord::new("b").with_dense(vec![0.0, 1.0, 0.0, 0.0]),
                VectorRecord::new("c").with_dense(vec![0.0, 0.0, 1.0, 0.0]),
            ],
            false,
        )
        .unwrap();

    let hits = index
        .search_dense(&[1.0, 0.0, 0.0, 0.0], 2, None, None)
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].external_id, "a");
    // "b" and "c" are tied for second; either is acceptable.
    assert!(hits[1].external_id == "b" || hits[1].external_id == "c");
}

#[test]
fn sparse_bmw_ranking() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    index
        .add_batch(
            &[
                VectorRecord::new("d1").with_sparse(sparse(&[(10, 1.0), (20, 0.5)])),
                VectorRecord::new("d2").with_sparse(sparse(&[(10, 0.2), (30, 2.0)])),
                VectorRecord::new("d3").with_sparse(sparse(&[(20, 1.5), (30, 0.1)])),
            ],
            false,
        )
        .unwrap();

    let hits = index
        .search_sparse(&sparse(&[(10, 1.0), (30, 1.0)]), 2)
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].external_id, "d2");
    assert!((hits[0].score - 2.2).abs() < 0.02, "score {}", hits[0].score);
    assert_eq!(hits[1].external_id, "d1");
    assert!((hits[1].score - 1.0).abs() < 0.02, "score {}", hits[1].score);
}

#[test]
fn filter_and_conjunction() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    index
        .add_batch(
            &[
                VectorRecord::new("1")
                    .with_dense(vec![1.0, 0.0, 0.0, 0.0])
                    .with_filter(json!({"color": "red", "price": 10})),
                VectorRecord::new("2")
                    .with_dense(vec![0.0, 1.0, 0.0, 0.0])
                    .with_filter(json!({"color": "red", "price": 30})),
                VectorRecord::new("3")
                    .with_dense(vec![0.0, 0.0, 1.0, 0.0])
                    .with_filter(json!({"color": "blue", "price": 20})),
            ],
            false,
        )
        .unwrap();

    let matched = index
        .filter()
        .ids_matching(&json!([
            {"color": {"$eq": "red"}},
            {"price": {"$range": [15, 40]}}
        ]))
        .unwrap();
    assert_eq!(matched, vec![2 as IntId]);

    // The same filter through dense search returns only doc 2.
    let hits = index
        .search_dense(
            &[0.5, 0.5, 0.0, 0.0],
            3,
            None,
            Some(&json!([
                {"color": {"$eq": "red"}},
                {"price": {"$range": [15, 40]}}
            ])),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].external_id, "2");

    // An empty filter array matches nothing.
    let hits = index
        .search_dense(&[0.5, 0.5, 0.0, 0.0], 3, None, Some(&json!([])))
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn wal_recovery_after_truncation() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();
        let records: Vec<VectorRecord> = (0..100)
            .map(|i| VectorRecord::new(format!("doc-{i}")).with_dense(vec![i as f32, 0.0, 0.0, 0.0]))
            .collect();
        index.add_batch(&records, false).unwrap();
        assert_eq!(index.len().unwrap(), 100);
    }

    // Crash-simulate: chop 3 bytes off the WAL tail.
    let wal_path = dir.path().join("ids").join("wal.bin");
    let raw = std::fs::read(&wal_path).unwrap();
    assert!(!raw.is_empty());
    std::fs::write(&wal_path, &raw[..raw.len() - 3]).unwrap();

    // Startup must succeed, apply intact records, and clear the WAL.
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();
    assert_eq!(index.len().unwrap(), 100);
    assert!(!index.mapper().wal().has_entries());
    assert!(index.contains("doc-42").unwrap());
}

#[test]
fn id_recycling() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    let ids = index
        .add_batch(
            &[
                VectorRecord::new("x").with_dense(vec![1.0, 0.0, 0.0, 0.0]),
                VectorRecord::new("y").with_dense(vec![0.0, 1.0, 0.0, 0.0]),
            ],
            false,
        )
        .unwrap();
    assert_eq!(ids, vec![1, 2]);

    let deleted = index.delete(&strings(&["x"])).unwrap();
    assert_eq!(deleted, vec![1]);

    // Reuse pops the recycled ID; the mapper reports it as not new to the
    // graph so the slot is re-linked instead of freshly inserted.
    let assigned = index
        .mapper()
        .create_ids_batch(&strings(&["z"]), true)
        .unwrap();
    assert_eq!(assigned, vec![(1, false)]);
}

#[test]
fn delete_then_reinsert_same_external_id() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    index
        .add(
            VectorRecord::new("p").with_dense(vec![1.0, 0.0, 0.0, 0.0]),
            false,
        )
        .unwrap();
    index.delete(&strings(&["p"])).unwrap();
    assert!(!index.contains("p").unwrap());

    let id = index
        .add(
            VectorRecord::new("p").with_dense(vec![0.0, 0.0, 0.0, 1.0]),
            true,
        )
        .unwrap();
    assert_eq!(id, 1, "recycled internal id");

    let hits = index
        .search_dense(&[0.0, 0.0, 0.0, 1.0], 1, None, None)
        .unwrap();
    assert_eq!(hits[0].external_id, "p");
    assert_eq!(hits[0].id, 1);
}

#[test]
fn update_replaces_dense_and_sparse() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    index
        .add(
            VectorRecord::new("doc")
                .with_dense(vec![1.0, 0.0, 0.0, 0.0])
                .with_sparse(sparse(&[(7, 1.0)]))
                .with_filter(json!({"tag": "old"})),
            false,
        )
        .unwrap();
    index
        .add(
            VectorRecord::new("doc")
                .with_dense(vec![0.0, 1.0, 0.0, 0.0])
                .with_sparse(sparse(&[(8, 2.0)]))
                .with_filter(json!({"tag": "new"})),
            false,
        )
        .unwrap();
    assert_eq!(index.len().unwrap(), 1);

    let hits = index
        .search_dense(&[0.0, 1.0, 0.0, 0.0], 1, None, None)
        .unwrap();
    assert_eq!(hits[0].external_id, "doc");

    assert!(index.search_sparse(&sparse(&[(7, 1.0)]), 5).unwrap().is_empty());
    let hits = index.search_sparse(&sparse(&[(8, 1.0)]), 5).unwrap();
    assert_eq!(hits[0].external_id, "doc");

    let matched = index
        .filter()
        .ids_matching(&json!([{"tag": {"$eq": "old"}}]))
        .unwrap();
    assert!(matched.is_empty(), "stale filter entry must be gone");
    let matched = index
        .filter()
        .ids_matching(&json!([{"tag": {"$eq": "new"}}]))
        .unwrap();
    assert_eq!(matched.len(), 1);
}

#[test]
fn hybrid_fusion_combines_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = IndexOptions::new(2);
    options.metric = Metric::Cosine;
    options.quant_level = QuantLevel::F32;
    let index = VectorIndex::open(dir.path(), options).unwrap();

    index
        .add_batch(
            &[
                VectorRecord::new("dense-only").with_dense(vec![1.0, 0.0]),
                VectorRecord::new("sparse-only")
                    .with_dense(vec![0.0, 1.0])
                    .with_sparse(sparse(&[(5, 2.0)])),
                VectorRecord::new("both")
                    .with_dense(vec![0.9, 0.1])
                    .with_sparse(sparse(&[(5, 3.0)])),
            ],
            false,
        )
        .unwrap();

    let hits = index
        .search_hybrid(
            Some(&[1.0, 0.0]),
            Some(&sparse(&[(5, 1.0)])),
            3,
            0.5,
            FusionMethod::Rrf,
            None,
        )
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(
        hits[0].external_id, "both",
        "document in both rank lists should fuse highest"
    );

    let linear = index
        .search_hybrid(
            Some(&[1.0, 0.0]),
            Some(&sparse(&[(5, 1.0)])),
            3,
            1.0,
            FusionMethod::Linear,
            None,
        )
        .unwrap();
    assert_eq!(linear[0].external_id, "dense-only", "alpha=1 is dense-only");
}

#[test]
fn meta_payload_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();

    index
        .add(
            VectorRecord::new("m")
                .with_dense(vec![1.0, 0.0, 0.0, 0.0])
                .with_meta(b"payload-bytes".to_vec()),
            false,
        )
        .unwrap();
    assert_eq!(
        index.get_meta("m").unwrap().as_deref(),
        Some(b"payload-bytes".as_slice())
    );
    assert!(index.get_meta("missing").unwrap().is_none());

    index.delete(&strings(&["m"])).unwrap();
    assert!(index.get_meta("m").unwrap().is_none());
}

#[test]
fn graph_snapshot_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();
        index
            .add_batch(
                &[
                    VectorRecord::new("a").with_dense(vec![1.0, 0.0, 0.0, 0.0]),
                    VectorRecord::new("b").with_dense(vec![0.0, 1.0, 0.0, 0.0]),
                ],
                false,
            )
            .unwrap();
        index.snapshot().unwrap();
    }

    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();
    let hits = index
        .search_dense(&[1.0, 0.0, 0.0, 0.0], 1, None, None)
        .unwrap();
    assert_eq!(hits[0].external_id, "a");
}

#[test]
fn dimension_mismatch_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), l2_int8_options(4)).unwrap();
    let err = index
        .add(VectorRecord::new("bad").with_dense(vec![1.0, 2.0]), false)
        .unwrap_err();
    assert!(matches!(
        err,
        quantadb_core::Error::InvalidArgument(_)
    ));
}

#[test]
fn capacity_exhaustion_reclaims_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = l2_int8_options(4);
    options.max_elements = 3;
    let index = VectorIndex::open(dir.path(), options).unwrap();

    for i in 0..2 {
        index
            .add(
                VectorRecord::new(format!("v{i}")).with_dense(vec![i as f32, 0.0, 0.0, 0.0]),
                false,
            )
            .unwrap();
    }
    // IDs start at 1, so the third insert lands on slot 3 == max_elements.
    let err = index
        .add(
            VectorRecord::new("overflow").with_dense(vec![9.0, 0.0, 0.0, 0.0]),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, quantadb_core::Error::Capacity(_)));

    // The failed record's mapping was rolled back and its ID recycled.
    assert!(!index.contains("overflow").unwrap());
    assert_eq!(index.mapper().deleted_ids().unwrap(), vec![3]);
}
