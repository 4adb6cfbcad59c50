use async_trait::async_trait;
use memodex::{
    EmbeddingBatch, EmbeddingProvider, MemodexError, Result, SearchParams, Service, ServiceConfig,
};
use std::path::Path;
use std::sync::Arc;

fn mock_config(dir: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::new(dir);
    config.format = Some("mock".into());
    config.model = Some("test-model".into());
    config.dimensions = Some(8);
    config.max_tokens = Some(100);
    config.chunking_max_tokens = 100;
    config
}

fn relaxed(limit: usize) -> SearchParams {
    SearchParams {
        limit,
        min_score: 0.0,
        ..SearchParams::default()
    }
}

#[tokio::test]
async fn basic_index_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::bind(mock_config(dir.path())).unwrap();

    service
        .index("event", 1, "The quick brown fox", None, None)
        .await
        .unwrap();

    let stats = service.stats().unwrap();
    assert_eq!(stats.embeddings, 1);
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.sources, 1);

    let hits = service.search("fox", &relaxed(5)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_type, "event");
    assert_eq!(hits[0].source_id, 1);
}

#[tokio::test]
async fn identical_content_is_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::bind(mock_config(dir.path())).unwrap();

    service.index("event", 1, "Shared text", None, None).await.unwrap();
    service.index("event", 2, "Shared text", None, None).await.unwrap();

    let stats = service.stats().unwrap();
    assert_eq!(stats.embeddings, 1);
    assert_eq!(stats.chunks, 2);
    assert_eq!(stats.sources, 2);
}

#[tokio::test]
async fn source_type_filter_restricts_results() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::bind(mock_config(dir.path())).unwrap();

    service.index("event", 1, "Event document", None, None).await.unwrap();
    service.index("idea", 2, "Idea document", None, None).await.unwrap();

    let params = SearchParams {
        source_type: Some("event".into()),
        ..relaxed(10)
    };
    let hits = service.search("document", &params).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_type, "event");
    assert_eq!(hits[0].source_id, 1);
}

#[tokio::test]
async fn services_are_isolated_vector_spaces() {
    let dir = tempfile::tempdir().unwrap();

    let s1 = Service::bind(mock_config(dir.path())).unwrap();
    let mut other = mock_config(dir.path());
    other.model = Some("second-model".into());
    let s2 = Service::bind(other).unwrap();

    s1.index("event", 1, "First space document", None, None).await.unwrap();
    s2.index("event", 2, "Second space document", None, None).await.unwrap();

    let hits = s1.search("document", &relaxed(10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, 1);

    let hits = s2.search("document", &relaxed(10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, 2);
}

#[derive(Debug)]
struct AlwaysFailingProvider;

#[async_trait]
impl EmbeddingProvider for AlwaysFailingProvider {
    async fn embed_text(&self, _text: &str) -> Result<(Vec<f32>, u32)> {
        Err(MemodexError::Provider {
            message: "connection refused".into(),
            retryable: true,
        })
    }

    async fn embed_texts(&self, _texts: &[String]) -> Result<EmbeddingBatch> {
        Err(MemodexError::Provider {
            message: "connection refused".into(),
            retryable: true,
        })
    }

    fn format(&self) -> &str {
        "mock"
    }
}

#[tokio::test]
async fn failing_provider_exhausts_retries_and_goes_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let service =
        Service::bind_with_provider(mock_config(dir.path()), Arc::new(AlwaysFailingProvider))
            .unwrap();

    service.enqueue("a", 1, "x", None, None).unwrap();
    let summary = service.process_queue().await.unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 1);

    let failures = service.list_queue_failures(10).unwrap();
    assert_eq!(failures.len(), 1);
    let item = &failures[0];
    assert!(item.status >= 1);
    assert_eq!(item.attempts, 3);
    assert!(item.error_message.as_deref().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn delete_collects_orphaned_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::bind(mock_config(dir.path())).unwrap();

    service.index("a", 1, "unique", None, None).await.unwrap();
    assert_eq!(service.stats().unwrap().embeddings, 1);

    let deleted = service.delete(1, None).unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(service.stats().unwrap().embeddings, 0);
    assert_eq!(service.stats().unwrap().chunks, 0);
}

#[tokio::test]
async fn tight_projection_threshold_keeps_exact_match() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::bind(mock_config(dir.path())).unwrap();

    service
        .index("event", 1, "a very specific phrase", None, None)
        .await
        .unwrap();

    // Query text identical to the stored chunk: projection self-distance is
    // zero, so even an extremely tight threshold admits it.
    let params = SearchParams {
        projection_threshold: 1e-9,
        ..relaxed(5)
    };
    let hits = service
        .search("a very specific phrase", &params)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn like_and_match_filters_over_stored_text() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::bind(mock_config(dir.path())).unwrap();

    service
        .index("note", 1, "grocery list with apples and bread", None, None)
        .await
        .unwrap();
    service
        .index("note", 2, "meeting notes about the quarterly roadmap", None, None)
        .await
        .unwrap();

    let params = SearchParams {
        like: vec!["%apples%".into()],
        include_text: true,
        ..relaxed(10)
    };
    let hits = service.search("list", &params).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].text.as_deref().unwrap().contains("apples"));

    let params = SearchParams {
        match_query: Some("roadmap".into()),
        ..relaxed(10)
    };
    let hits = service.search("notes", &params).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_id, 2);
}

#[tokio::test]
async fn text_filters_require_text_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = mock_config(dir.path());
    config.store_text = false;
    let service = Service::bind(config).unwrap();

    service.index("note", 1, "no text kept", None, None).await.unwrap();

    let params = SearchParams {
        like: vec!["%kept%".into()],
        ..relaxed(10)
    };
    let err = service.search("kept", &params).await.unwrap_err();
    assert!(matches!(err, MemodexError::Validation(_)));
}

#[tokio::test]
async fn sql_where_joins_an_attached_database() {
    let dir = tempfile::tempdir().unwrap();

    // Application-side database with a predicate worth filtering on
    let app_db_path = dir.path().join("app.db");
    {
        let conn = rusqlite::Connection::open(&app_db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, flagged INTEGER NOT NULL);
             INSERT INTO items (id, flagged) VALUES (1, 0), (2, 1), (3, 1);",
        )
        .unwrap();
    }

    let mut config = mock_config(dir.path());
    config.attach.insert("app".into(), app_db_path);
    let service = Service::bind(config).unwrap();

    for id in 1..=3 {
        service
            .index("item", id, &format!("item body number {id}"), None, None)
            .await
            .unwrap();
    }

    let params = SearchParams {
        sql_where: Some(
            "c.source_id IN (SELECT id FROM app.items WHERE flagged = 1)".into(),
        ),
        ..relaxed(10)
    };
    let hits = service.search("item body", &params).await.unwrap();
    let mut ids: Vec<i64> = hits.iter().map(|h| h.source_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![2, 3]);
}

#[tokio::test]
async fn reenqueue_after_terminal_failure_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let failing =
        Service::bind_with_provider(mock_config(dir.path()), Arc::new(AlwaysFailingProvider))
            .unwrap();
    failing.enqueue("event", 1, "flaky document", None, None).unwrap();
    failing.process_queue().await.unwrap();
    assert_eq!(failing.queue_stats().unwrap().failed, 1);
    failing.close().await.unwrap();

    // Same data directory, working provider this time
    let service = Service::bind(mock_config(dir.path())).unwrap();
    service
        .index("event", 1, "flaky document", None, None)
        .await
        .unwrap();
    let stats = service.queue_stats().unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(service.stats().unwrap().sources, 1);
}

#[tokio::test]
async fn multi_paragraph_document_chunks_with_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = mock_config(dir.path());
    config.max_tokens = Some(2000);
    config.chunking_max_tokens = 50;
    let service = Service::bind(config).unwrap();

    let body = format!(
        "{}\n\n{}\n\n{}",
        "alpha section content repeated for bulk. ".repeat(8),
        "beta section content repeated for bulk. ".repeat(8),
        "gamma section content repeated for bulk. ".repeat(8),
    );
    service.index("doc", 1, &body, None, None).await.unwrap();

    let stats = service.stats().unwrap();
    assert!(stats.chunks >= 3, "expected multiple chunks, got {stats:?}");

    let params = SearchParams {
        include_text: true,
        ..relaxed(50)
    };
    let mut hits = service.search("alpha section", &params).await.unwrap();
    hits.sort_by_key(|h| h.offset);
    assert_eq!(hits[0].offset, Some(0));
    // Offsets are cumulative character positions in emission order
    for pair in hits.windows(2) {
        assert_eq!(
            pair[0].offset.unwrap() + pair[0].size,
            pair[1].offset.unwrap()
        );
    }
}
