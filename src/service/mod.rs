//! The `Service` facade: one bound embedding service over one data
//! directory, exposing indexing, search, deletion, and queue control.
use crate::chunker::{self, ChunkerConfig};
use crate::config::ServiceConfig;
use crate::errors::{MemodexError, Result};
use crate::projection::{self, PROJECTION_K};
use crate::providers::{self, EmbeddingProvider, ProviderSpec};
use crate::queue::{self, QueueItem, QueueStats};
use crate::search::{self, SearchHit, SearchParams, SearchScan};
use crate::store::{
    self, EmbeddingService, NewChunk, NewService, ServiceStats, TEXT_SCHEMA, VectorDb,
};
use crate::vectors::content_hash;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one synchronous queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Items that reached success in this pass.
    pub succeeded: usize,
    /// Items that went terminally failed in this pass.
    pub failed: usize,
}

#[derive(Debug)]
struct ServiceInner {
    db: VectorDb,
    provider: Arc<dyn EmbeddingProvider>,
    record: EmbeddingService,
    basis: Vec<Vec<f32>>,
    chunker: ChunkerConfig,
    text_schema: Option<String>,
    batch_size: usize,
    max_retries: u32,
}

/// An open semantic-search instance. Cheap operations are synchronous;
/// anything that calls the embedding provider is async. Background queue
/// tasks are tracked and drained by [`Service::close`].
#[derive(Debug)]
pub struct Service {
    inner: Arc<ServiceInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Open the data directory, bind (or register) the embedding service,
    /// and construct the provider named by the service's format.
    pub fn bind(config: ServiceConfig) -> Result<Self> {
        Self::bind_impl(config, None, None)
    }

    /// Like [`Service::bind`], but with a caller-supplied provider instead
    /// of one built from the format registry.
    pub fn bind_with_provider(
        config: ServiceConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        Self::bind_impl(config, Some(provider), None)
    }

    /// Bind over a connection the caller already holds. The caller retains
    /// ownership: [`Service::close`] drains background work but leaves the
    /// connection open on their side. Text storage and extra schemas are
    /// still attached (skipped if their aliases are already present).
    pub fn bind_with_connection(
        config: ServiceConfig,
        conn: Arc<std::sync::Mutex<rusqlite::Connection>>,
    ) -> Result<Self> {
        Self::bind_impl(config, None, Some(conn))
    }

    fn bind_impl(
        config: ServiceConfig,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        external: Option<Arc<std::sync::Mutex<rusqlite::Connection>>>,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(MemodexError::Config("batch_size must be at least 1".into()));
        }
        if config.chunking_max_tokens == 0 {
            return Err(MemodexError::Config(
                "chunking_max_tokens must be at least 1".into(),
            ));
        }

        let db = match external {
            Some(conn) => VectorDb::from_connection(conn),
            None => VectorDb::open(config.data_dir.join("embeddings.db"))?,
        };
        db.init_schema()?;

        let text_schema = if config.store_text {
            db.attach(TEXT_SCHEMA, config.data_dir.join("text.db"))?;
            db.init_text_schema(TEXT_SCHEMA)?;
            Some(TEXT_SCHEMA.to_string())
        } else {
            None
        };

        for (alias, path) in &config.attach {
            if alias == TEXT_SCHEMA {
                return Err(MemodexError::Config(format!(
                    "schema alias '{TEXT_SCHEMA}' is reserved for text storage"
                )));
            }
            db.attach(alias, path)?;
        }

        let record = resolve_service(&db, &config)?;
        if config.chunking_max_tokens > record.max_tokens {
            return Err(MemodexError::Config(format!(
                "chunking_max_tokens {} exceeds service max_tokens {}",
                config.chunking_max_tokens, record.max_tokens
            )));
        }

        let provider = match provider {
            Some(p) => p,
            None => providers::create_provider(
                &record.format,
                &ProviderSpec {
                    api_key: config.api_key.clone(),
                    base_url: record.base_url.clone().or_else(|| config.base_url.clone()),
                    model: record.model.clone(),
                    dimensions: record.dimensions,
                },
            )?,
        };

        let basis = match db.get_projection_vectors(record.id)? {
            Some(basis) => basis,
            None => {
                let generated = projection::generate_orthonormal(record.dimensions)?;
                db.store_projection_vectors(record.id, &generated)?;
                // Write-once semantics: re-read in case a concurrent binder won
                db.get_projection_vectors(record.id)?.unwrap_or(generated)
            }
        };

        info!(
            "bound embedding service '{}' ({} dims, format {})",
            record.name, record.dimensions, record.format
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                db,
                provider,
                record,
                basis,
                chunker: ChunkerConfig {
                    max_tokens: config.chunking_max_tokens,
                    ..ChunkerConfig::default()
                },
                text_schema,
                batch_size: config.batch_size,
                max_retries: config.max_retries,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The bound embedding service record.
    pub fn service(&self) -> &EmbeddingService {
        &self.inner.record
    }

    // ── Ingestion ────────────────────────────────────────────────

    /// Queue a document and process it immediately. Fails with the final
    /// error once retries are exhausted.
    pub async fn index(
        &self,
        source_type: &str,
        source_id: i64,
        text: &str,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
    ) -> Result<()> {
        self.enqueue(source_type, source_id, text, pair_id, parent_id)?;
        self.inner.process_item(source_type, source_id).await
    }

    /// Queue a document for later processing. Re-enqueueing an existing
    /// (source_type, source_id) replaces its text and resets its state.
    pub fn enqueue(
        &self,
        source_type: &str,
        source_id: i64,
        text: &str,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
    ) -> Result<()> {
        let packed = queue::pack_meta(text, pair_id, parent_id);
        let conn = self.inner.db.conn()?;
        queue::enqueue(&conn, source_type, source_id, &packed)
    }

    /// Drain the pending queue synchronously, oldest first. Returns once a
    /// pending select comes back empty.
    pub async fn process_queue(&self) -> Result<ProcessSummary> {
        self.inner.process_queue().await
    }

    /// Process one queued document, retrying inside this call until success
    /// or `max_retries` attempts, then surfacing the final error.
    pub async fn process_queue_item(&self, source_type: &str, source_id: i64) -> Result<()> {
        self.inner.process_item(source_type, source_id).await
    }

    /// Start queue processing in the background and return immediately. The
    /// task runs to natural completion; there is no completion signal or
    /// error surface, so use [`Service::process_queue`] when either matters.
    pub fn process_queue_background(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            match inner.process_queue().await {
                Ok(summary) => debug!(
                    "background queue pass finished: {} succeeded, {} failed",
                    summary.succeeded, summary.failed
                ),
                Err(e) => warn!("background queue pass aborted: {e}"),
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Drop everything indexed under `source_type` for this service and
    /// queue it again, reading text back from text storage or from `lookup`.
    /// Processing the re-queued items is a separate step.
    pub fn reindex(
        &self,
        source_type: &str,
        lookup: Option<&dyn Fn(i64) -> Option<String>>,
    ) -> Result<usize> {
        let inner = &self.inner;
        if inner.text_schema.is_none() && lookup.is_none() {
            return Err(MemodexError::Validation(
                "reindex without text storage requires a lookup function".into(),
            ));
        }

        let mut conn = inner.db.conn()?;
        let tx = conn.transaction()?;

        let tuples = store::list_source_tuples(&tx, inner.record.id, source_type)?;
        let mut jobs = Vec::with_capacity(tuples.len());
        for (source_id, pair_id, parent_id) in tuples {
            let stored = match &inner.text_schema {
                Some(schema) => {
                    store::source_text(&tx, schema, inner.record.id, source_type, source_id)?
                }
                None => None,
            };
            let text = stored.or_else(|| lookup.and_then(|f| f(source_id)));
            match text {
                Some(text) => jobs.push((source_id, pair_id, parent_id, text)),
                None => warn!("reindex: no text available for {source_type}/{source_id}, skipping"),
            }
        }

        store::delete_source_type_chunks(&tx, inner.record.id, source_type)?;
        let enqueued = jobs.len();
        for (source_id, pair_id, parent_id, text) in jobs {
            let packed = queue::pack_meta(&text, pair_id, parent_id);
            queue::enqueue(&tx, source_type, source_id, &packed)?;
        }
        tx.commit()?;
        debug!("reindex queued {enqueued} sources under '{source_type}'");
        Ok(enqueued)
    }

    // ── Query ────────────────────────────────────────────────────

    /// Embed the query and return the top-k chunks by cosine similarity,
    /// subject to the filters in `params`.
    pub async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchHit>> {
        let inner = &self.inner;
        let (query_vector, _) = inner.provider.embed_text(query).await?;
        if query_vector.len() != inner.record.dimensions {
            return Err(MemodexError::Validation(format!(
                "query embedding has {} dimensions, service expects {}",
                query_vector.len(),
                inner.record.dimensions
            )));
        }
        let query_projection = projection::project(&query_vector, &inner.basis)?;
        search::execute(
            &inner.db,
            &SearchScan {
                query_vector: &query_vector,
                query_projection: Some(&query_projection),
                service_id: inner.record.id,
                text_schema: inner.text_schema.as_deref(),
                params,
            },
        )
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Delete every chunk of a source (optionally narrowed by source_type)
    /// under this service, garbage-collecting orphaned embeddings and
    /// projections in the same transaction. Returns chunks deleted.
    pub fn delete(&self, source_id: i64, source_type: Option<&str>) -> Result<usize> {
        let mut conn = self.inner.db.conn()?;
        let tx = conn.transaction()?;
        let deleted = store::delete_source_chunks(&tx, self.inner.record.id, source_type, source_id)?;
        tx.commit()?;
        debug!("deleted {deleted} chunks for source {source_id}");
        Ok(deleted)
    }

    /// Counts scoped to the bound service.
    pub fn stats(&self) -> Result<ServiceStats> {
        self.inner.db.stats(self.inner.record.id)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.inner.db.queue_stats()
    }

    pub fn list_queue_failures(&self, limit: usize) -> Result<Vec<QueueItem>> {
        self.inner.db.list_queue_failures(limit)
    }

    pub fn clear_pending_queue(&self) -> Result<usize> {
        self.inner.db.clear_pending_queue()
    }

    pub fn clear_failed_queue(&self) -> Result<usize> {
        self.inner.db.clear_failed_queue()
    }

    /// Record that the caller surfaced these chunks to a reader.
    pub fn mark_as_read(&self, chunk_ids: &[i64]) -> Result<()> {
        self.inner.db.increment_read_count(chunk_ids)
    }

    /// Fetch stored chunk text by content hash. Requires text storage.
    pub fn get_text(&self, hash: &[u8]) -> Result<Option<String>> {
        match &self.inner.text_schema {
            Some(schema) => self.inner.db.get_text(schema, hash),
            None => Err(MemodexError::Validation(
                "text storage is not enabled for this service".into(),
            )),
        }
    }

    // ── Service CRUD ─────────────────────────────────────────────

    pub fn services(&self) -> Result<Vec<EmbeddingService>> {
        self.inner.db.list_services()
    }

    pub fn register_service(&self, new: &NewService<'_>) -> Result<EmbeddingService> {
        self.inner.db.register_service(new)
    }

    /// Delete a registered service. Refuses the bound service, and refuses
    /// a service that still owns data unless `force` is set.
    pub fn delete_service(&self, name: &str, force: bool) -> Result<()> {
        if name == self.inner.record.name {
            return Err(MemodexError::Validation(
                "cannot delete the service this instance is bound to".into(),
            ));
        }
        self.inner.db.delete_service(name, force)
    }

    /// Wait for background queue tasks to finish and release this handle's
    /// reference to the connection. A connection supplied by the caller (or
    /// shared with clones) stays open on their side.
    pub async fn close(self) -> Result<()> {
        let handles = self
            .tasks
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background queue task did not shut down cleanly: {e}");
            }
        }
        Ok(())
    }
}

impl ServiceInner {
    async fn process_queue(&self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        loop {
            let batch = {
                let conn = self.db.conn()?;
                queue::pending_batch(&conn, self.batch_size)?
            };
            if batch.is_empty() {
                break;
            }
            for item in batch {
                let attempts = item.attempts + 1;
                match self.embed_and_store(&item).await {
                    Ok(()) => {
                        let conn = self.db.conn()?;
                        queue::mark_success(&conn, item.id, attempts)?;
                        summary.succeeded += 1;
                    }
                    Err(e) => {
                        let terminal = attempts >= self.max_retries;
                        {
                            let conn = self.db.conn()?;
                            queue::record_failure(&conn, item.id, attempts, &e.to_string(), terminal)?;
                        }
                        if terminal {
                            warn!(
                                "queue item {}/{} terminally failed after {attempts} attempts: {e}",
                                item.source_type, item.source_id
                            );
                            summary.failed += 1;
                        } else {
                            debug!(
                                "queue item {}/{} failed (attempt {attempts}), will retry: {e}",
                                item.source_type, item.source_id
                            );
                        }
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn process_item(&self, source_type: &str, source_id: i64) -> Result<()> {
        let item = {
            let conn = self.db.conn()?;
            queue::get_item(&conn, source_type, source_id)?
        }
        .ok_or_else(|| {
            MemodexError::Validation(format!("no queue item for {source_type}/{source_id}"))
        })?;
        if item.status == queue::STATUS_SUCCESS {
            return Ok(());
        }
        if item.status > 0 {
            return Err(MemodexError::Validation(format!(
                "queue item {source_type}/{source_id} already failed terminally: {}",
                item.error_message.as_deref().unwrap_or("unknown error")
            )));
        }

        let mut attempts = item.attempts;
        loop {
            attempts += 1;
            match self.embed_and_store(&item).await {
                Ok(()) => {
                    let conn = self.db.conn()?;
                    queue::mark_success(&conn, item.id, attempts)?;
                    return Ok(());
                }
                Err(e) => {
                    let terminal = attempts >= self.max_retries;
                    {
                        let conn = self.db.conn()?;
                        queue::record_failure(&conn, item.id, attempts, &e.to_string(), terminal)?;
                    }
                    if terminal {
                        return Err(e);
                    }
                    debug!(
                        "retrying {source_type}/{source_id} after attempt {attempts}: {e}"
                    );
                }
            }
        }
    }

    /// Chunk, embed, project, and store one document. The provider call
    /// completes before the write transaction opens, so the database lock is
    /// never held across network I/O. The transaction replaces any chunks
    /// previously stored for this source.
    async fn embed_and_store(&self, item: &QueueItem) -> Result<()> {
        let (pair_id, parent_id, payload) = queue::unpack_meta(&item.text);
        let chunks = chunker::chunk_text(payload, &self.chunker);

        let batch = self.provider.embed_texts(&chunks).await?;
        if batch.vectors.len() != chunks.len() {
            return Err(MemodexError::Provider {
                message: format!(
                    "provider returned {} vectors for {} chunks",
                    batch.vectors.len(),
                    chunks.len()
                ),
                retryable: false,
            });
        }
        for vector in &batch.vectors {
            if vector.len() != self.record.dimensions {
                return Err(MemodexError::Provider {
                    message: format!(
                        "provider returned {}-dimensional vector, service expects {}",
                        vector.len(),
                        self.record.dimensions
                    ),
                    retryable: false,
                });
            }
        }
        let projections = batch
            .vectors
            .iter()
            .map(|v| projection::project(v, &self.basis))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        store::delete_source_chunks(&tx, self.record.id, Some(&item.source_type), item.source_id)?;

        let mut offset = 0_i64;
        for (i, chunk) in chunks.iter().enumerate() {
            let hash = content_hash(chunk);
            let token_count = batch.token_counts.get(i).copied().unwrap_or(0);
            store::insert_embedding(&tx, &hash, &batch.vectors[i], token_count, self.record.id)?;
            store::insert_projection(&tx, &hash, &projections[i])?;
            let size = chunk.chars().count() as i64;
            store::insert_chunk(
                &tx,
                &NewChunk {
                    hash: &hash,
                    source_type: &item.source_type,
                    source_id: item.source_id,
                    pair_id,
                    parent_id,
                    offset: Some(offset),
                    size,
                },
            )?;
            if let Some(schema) = &self.text_schema {
                store::insert_text(&tx, schema, &hash, chunk)?;
            }
            offset += size;
        }
        tx.commit()?;

        debug!(
            "stored {} chunks for {}/{}",
            chunks.len(),
            item.source_type,
            item.source_id
        );
        Ok(())
    }
}

/// Resolve the embedding service record this instance binds: an existing
/// one by name, or an inline registration by format + model.
fn resolve_service(db: &VectorDb, config: &ServiceConfig) -> Result<EmbeddingService> {
    if let Some(name) = &config.service {
        return db.get_service(name)?.ok_or_else(|| {
            MemodexError::Config(format!("unknown embedding service '{name}'"))
        });
    }

    let format = config.format.as_deref().ok_or_else(|| {
        MemodexError::Config("either 'service' or 'format' must be configured".into())
    })?;
    let model = config.model.as_deref().ok_or_else(|| {
        MemodexError::Config("binding by format requires 'model'".into())
    })?;

    let synthesized = format!("{format}/{model}");
    if let Some(existing) = db.get_service(&synthesized)? {
        return Ok(existing);
    }

    let dimensions = config.dimensions.ok_or_else(|| {
        MemodexError::Config(format!(
            "first registration of '{synthesized}' requires 'dimensions'"
        ))
    })?;
    let max_tokens = config.max_tokens.ok_or_else(|| {
        MemodexError::Config(format!(
            "first registration of '{synthesized}' requires 'max_tokens'"
        ))
    })?;
    if dimensions < PROJECTION_K {
        return Err(MemodexError::Validation(format!(
            "service dimensions must be at least {PROJECTION_K}, got {dimensions}"
        )));
    }

    db.register_service(&NewService {
        name: None,
        format,
        model,
        dimensions,
        max_tokens,
        base_url: config.base_url.as_deref(),
    })
}
