use super::*;
use crate::projection::{generate_orthonormal, project};
use crate::store::{NewChunk, NewService, TEXT_SCHEMA, VectorDb, insert_text};
use crate::vectors::content_hash;
use rusqlite::params;

fn hit(chunk_id: i64, score: f32) -> SearchHit {
    SearchHit {
        chunk_id,
        hash: vec![0; 32],
        score,
        source_type: "event".into(),
        source_id: chunk_id,
        pair_id: None,
        parent_id: None,
        offset: Some(0),
        size: 1,
        text: None,
    }
}

#[test]
fn test_topk_keeps_k_highest_sorted() {
    let mut top = TopK::new(3);
    for (id, score) in [(1, 0.2), (2, 0.9), (3, 0.5), (4, 0.95), (5, 0.1), (6, 0.6)] {
        top.insert(hit(id, score));
    }
    let out = top.into_vec();
    let ids: Vec<i64> = out.iter().map(|h| h.chunk_id).collect();
    assert_eq!(ids, vec![4, 2, 6]);
    assert!(out.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn test_topk_shorter_stream_returns_all() {
    let mut top = TopK::new(10);
    top.insert(hit(1, 0.3));
    top.insert(hit(2, 0.7));
    let out = top.into_vec();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].chunk_id, 2);
}

#[test]
fn test_topk_ties_keep_arrival_order() {
    let mut top = TopK::new(4);
    for id in [10, 11, 12] {
        top.insert(hit(id, 0.5));
    }
    top.insert(hit(13, 0.8));
    let ids: Vec<i64> = top.into_vec().iter().map(|h| h.chunk_id).collect();
    assert_eq!(ids, vec![13, 10, 11, 12]);
}

#[test]
fn test_topk_k_of_one() {
    let mut top = TopK::new(1);
    top.insert(hit(1, 0.4));
    top.insert(hit(2, 0.6));
    top.insert(hit(3, 0.5));
    let out = top.into_vec();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].chunk_id, 2);
}

// ── Executor tests against a real database ──────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    db: VectorDb,
    service_id: i64,
    basis: Vec<Vec<f32>>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = VectorDb::open(dir.path().join("embeddings.db")).unwrap();
        db.init_schema().unwrap();
        db.attach(TEXT_SCHEMA, dir.path().join("text.db")).unwrap();
        db.init_text_schema(TEXT_SCHEMA).unwrap();
        let service = db
            .register_service(&NewService {
                name: Some("test"),
                format: "mock",
                model: "m",
                dimensions: 8,
                max_tokens: 100,
                base_url: None,
            })
            .unwrap();
        let basis = generate_orthonormal(8).unwrap();
        db.store_projection_vectors(service.id, &basis).unwrap();
        Self {
            _dir: dir,
            db,
            service_id: service.id,
            basis,
        }
    }

    fn store(&self, source_type: &str, source_id: i64, text: &str, vector: &[f32]) -> i64 {
        let hash = content_hash(text);
        self.db
            .store_embedding(&hash, vector, 2, self.service_id)
            .unwrap();
        let proj = project(vector, &self.basis).unwrap();
        self.db.store_projection(&hash, &proj).unwrap();
        let id = self
            .db
            .create_chunk(&NewChunk {
                hash: &hash,
                source_type,
                source_id,
                pair_id: None,
                parent_id: None,
                offset: Some(0),
                size: text.chars().count() as i64,
            })
            .unwrap();
        {
            let conn = self.db.conn().unwrap();
            insert_text(&conn, TEXT_SCHEMA, &hash, text).unwrap();
        }
        id
    }

    fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<SearchHit>> {
        let proj = project(query, &self.basis).unwrap();
        execute(
            &self.db,
            &SearchScan {
                query_vector: query,
                query_projection: Some(&proj),
                service_id: self.service_id,
                text_schema: Some(TEXT_SCHEMA),
                params,
            },
        )
    }
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0_f32; 8];
    v[i] = 1.0;
    v
}

#[test]
fn test_execute_ranks_by_cosine() {
    let h = Harness::new();
    let near = {
        // ~0.99 cosine against axis 0
        let mut v = vec![0.0_f32; 8];
        v[0] = 0.9;
        v[1] = 0.1;
        v
    };
    h.store("event", 1, "exact match text", &axis(0));
    h.store("event", 2, "orthogonal text", &axis(1));
    h.store("event", 3, "near match text", &near);

    let params = SearchParams {
        min_score: 0.5,
        ..SearchParams::default()
    };
    let hits = h.search(&axis(0), &params).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].source_id, 1);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert_eq!(hits[1].source_id, 3);
}

#[test]
fn test_execute_metadata_filters() {
    let h = Harness::new();
    h.store("event", 1, "an event document", &axis(0));
    h.store("idea", 2, "an idea document", &axis(0));

    let params = SearchParams {
        min_score: 0.0,
        source_type: Some("event".into()),
        ..SearchParams::default()
    };
    let hits = h.search(&axis(0), &params).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_type, "event");
}

#[test]
fn test_execute_like_and_include_text() {
    let h = Harness::new();
    h.store("event", 1, "the quick brown fox", &axis(0));
    h.store("event", 2, "a slow green turtle", &axis(0));

    let params = SearchParams {
        min_score: 0.0,
        like: vec!["%brown%".into()],
        include_text: true,
        ..SearchParams::default()
    };
    let hits = h.search(&axis(0), &params).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text.as_deref(), Some("the quick brown fox"));
}

#[test]
fn test_execute_fts_match() {
    let h = Harness::new();
    h.store("event", 1, "rust memory safety guarantees", &axis(0));
    h.store("event", 2, "gardening in early spring", &axis(0));

    let params = SearchParams {
        min_score: 0.0,
        match_query: Some("memory".into()),
        ..SearchParams::default()
    };
    let hits = h.search(&axis(0), &params).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, 1);
}

#[test]
fn test_execute_sql_where_fragment() {
    let h = Harness::new();
    h.store("event", 1, "first document", &axis(0));
    h.store("event", 7, "seventh document", &axis(0));

    let params = SearchParams {
        min_score: 0.0,
        sql_where: Some("c.source_id > 5".into()),
        ..SearchParams::default()
    };
    let hits = h.search(&axis(0), &params).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, 7);
}

#[test]
fn test_execute_projection_filter_screens_far_candidates() {
    let h = Harness::new();
    h.store("event", 1, "self", &axis(0));
    h.store("event", 2, "far away", &axis(1));

    // Tight threshold: only the identical vector survives the pre-filter,
    // and its self-distance of zero always passes.
    let params = SearchParams {
        min_score: -1.0,
        projection_threshold: 0.1,
        ..SearchParams::default()
    };
    let hits = h.search(&axis(0), &params).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, 1);

    // Disabling the filter brings the orthogonal candidate back
    let params = SearchParams {
        min_score: -1.0,
        projection_threshold: 0.1,
        use_projection_filter: false,
        ..SearchParams::default()
    };
    assert_eq!(h.search(&axis(0), &params).unwrap().len(), 2);
}

#[test]
fn test_execute_bumps_match_count_for_returned_only() {
    let h = Harness::new();
    let winner = h.store("event", 1, "returned row", &axis(0));
    let loser = h.store("event", 2, "filtered row", &axis(1));

    let params = SearchParams {
        min_score: 0.5,
        ..SearchParams::default()
    };
    h.search(&axis(0), &params).unwrap();
    h.search(&axis(0), &params).unwrap();

    let conn = h.db.conn().unwrap();
    let count_for = |id: i64| -> i64 {
        conn.query_row(
            "SELECT match_count FROM chunks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert_eq!(count_for(winner), 2);
    assert_eq!(count_for(loser), 0);
}

#[test]
fn test_execute_validates_inputs() {
    let h = Harness::new();
    h.store("event", 1, "content", &axis(0));

    let zero_limit = SearchParams {
        limit: 0,
        ..SearchParams::default()
    };
    assert!(h.search(&axis(0), &zero_limit).is_err());

    let bad_score = SearchParams {
        min_score: 1.5,
        ..SearchParams::default()
    };
    assert!(h.search(&axis(0), &bad_score).is_err());
}

#[test]
fn test_execute_text_filters_require_schema() {
    let h = Harness::new();
    let proj = project(&axis(0), &h.basis).unwrap();
    let query = axis(0);
    let params = SearchParams {
        like: vec!["%x%".into()],
        ..SearchParams::default()
    };
    let err = execute(
        &h.db,
        &SearchScan {
            query_vector: &query,
            query_projection: Some(&proj),
            service_id: h.service_id,
            text_schema: None,
            params: &params,
        },
    )
    .unwrap_err();
    assert!(matches!(err, MemodexError::Validation(_)));
}

#[test]
fn test_execute_dimension_mismatch_is_error() {
    let h = Harness::new();
    h.store("event", 1, "eight dims", &axis(0));

    let short_query = vec![1.0_f32; 4];
    let proj = project(&axis(0), &h.basis).unwrap();
    let params = SearchParams {
        min_score: 0.0,
        use_projection_filter: false,
        ..SearchParams::default()
    };
    let err = execute(
        &h.db,
        &SearchScan {
            query_vector: &short_query,
            query_projection: Some(&proj),
            service_id: h.service_id,
            text_schema: Some(TEXT_SCHEMA),
            params: &params,
        },
    )
    .unwrap_err();
    assert!(matches!(err, MemodexError::Validation(_)));
}
