//! SQLite storage layer: schema, attached text database, and the CRUD
//! primitives everything else composes.
//!
//! The content hash is identity. A chunk of text has one SHA-256 hash; the
//! embedding, the projection, and (optionally) the stored text are all keyed
//! by it, while any number of chunk rows may reference it for provenance.
use crate::errors::{MemodexError, Result};
use crate::projection::PROJECTION_K;
use crate::vectors::{HASH_LEN, deserialize_vector, serialize_vector};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Schema alias the text database is attached under.
pub const TEXT_SCHEMA: &str = "text_store";

/// A registered embedding service: a named vector space. Embeddings are
/// comparable only within one service.
#[derive(Debug, Clone)]
pub struct EmbeddingService {
    pub id: i64,
    pub name: String,
    pub format: String,
    pub base_url: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub max_tokens: usize,
    pub created_at: i64,
}

/// Parameters for registering a service. Without a name, one is synthesized
/// as `"{format}/{model}"`.
#[derive(Debug, Clone)]
pub struct NewService<'a> {
    pub name: Option<&'a str>,
    pub format: &'a str,
    pub model: &'a str,
    pub dimensions: usize,
    pub max_tokens: usize,
    pub base_url: Option<&'a str>,
}

/// Parameters for one chunk row. (source_type, source_id, offset) is unique.
#[derive(Debug, Clone)]
pub struct NewChunk<'a> {
    pub hash: &'a [u8],
    pub source_type: &'a str,
    pub source_id: i64,
    pub pair_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub offset: Option<i64>,
    pub size: i64,
}

/// Row counts scoped to one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    pub embeddings: u64,
    pub chunks: u64,
    pub sources: u64,
}

/// Handle to the embeddings database (plus any attached schemas). Cheap to
/// clone; all clones share one connection behind a mutex.
#[derive(Debug, Clone)]
pub struct VectorDb {
    conn: Arc<Mutex<Connection>>,
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl VectorDb {
    /// Open (or create) a database file and apply connection pragmas.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemodexError::Storage(format!(
                    "failed to create database parent directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(db_path).map_err(|e| {
            MemodexError::Storage(format!("failed to open database at {}: {e}", db_path.display()))
        })?;
        Self::apply_pragmas(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database. Attached schemas must also be in-memory.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Wrap an existing connection. The caller keeps ownership: dropping
    /// this handle does not close a connection the caller still holds.
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemodexError::Storage(format!("DB lock poisoned: {e}")))
    }

    /// Attach another database file under a schema alias. A no-op when the
    /// alias is already attached (shared connections get re-bound).
    pub fn attach(&self, alias: &str, path: impl AsRef<Path>) -> Result<()> {
        validate_alias(alias)?;
        let conn = self.conn()?;
        let already: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_database_list WHERE name = ?1",
            params![alias],
            |row| row.get(0),
        )?;
        if already > 0 {
            return Ok(());
        }
        let path = path.as_ref().to_string_lossy().to_string();
        conn.execute(&format!("ATTACH DATABASE ?1 AS {alias}"), params![path])?;
        debug!("attached {path} as {alias}");
        Ok(())
    }

    /// Create all tables and indexes in the main database. Idempotent.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS services (
                 id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL UNIQUE,
                 format TEXT NOT NULL,
                 base_url TEXT,
                 model TEXT NOT NULL,
                 dimensions INTEGER NOT NULL,
                 max_tokens INTEGER NOT NULL,
                 created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS embeddings (
                 hash BLOB PRIMARY KEY,
                 embedding BLOB NOT NULL,
                 token_count INTEGER NOT NULL DEFAULT 0,
                 service_id INTEGER NOT NULL REFERENCES services(id),
                 created_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_embeddings_service
                 ON embeddings(service_id);

             CREATE TABLE IF NOT EXISTS chunks (
                 id INTEGER PRIMARY KEY,
                 hash BLOB NOT NULL REFERENCES embeddings(hash),
                 source_type TEXT NOT NULL,
                 source_id INTEGER NOT NULL,
                 pair_id INTEGER,
                 parent_id INTEGER,
                 \"offset\" INTEGER,
                 size INTEGER NOT NULL,
                 match_count INTEGER NOT NULL DEFAULT 0,
                 read_count INTEGER NOT NULL DEFAULT 0,
                 created_at INTEGER NOT NULL,
                 UNIQUE (source_type, source_id, \"offset\")
             );
             CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(hash);
             CREATE INDEX IF NOT EXISTS idx_chunks_source
                 ON chunks(source_type, source_id);
             CREATE INDEX IF NOT EXISTS idx_chunks_pair ON chunks(pair_id);
             CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(parent_id);

             CREATE TABLE IF NOT EXISTS projection_vectors (
                 service_id INTEGER PRIMARY KEY REFERENCES services(id),
                 vec_0 BLOB NOT NULL, vec_1 BLOB NOT NULL,
                 vec_2 BLOB NOT NULL, vec_3 BLOB NOT NULL,
                 vec_4 BLOB NOT NULL, vec_5 BLOB NOT NULL,
                 vec_6 BLOB NOT NULL, vec_7 BLOB NOT NULL,
                 created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS projections (
                 hash BLOB PRIMARY KEY REFERENCES embeddings(hash),
                 proj_0 REAL NOT NULL, proj_1 REAL NOT NULL,
                 proj_2 REAL NOT NULL, proj_3 REAL NOT NULL,
                 proj_4 REAL NOT NULL, proj_5 REAL NOT NULL,
                 proj_6 REAL NOT NULL, proj_7 REAL NOT NULL
             );

             CREATE TABLE IF NOT EXISTS embed_queue (
                 id INTEGER PRIMARY KEY,
                 source_type TEXT NOT NULL,
                 source_id INTEGER NOT NULL,
                 text TEXT NOT NULL,
                 status INTEGER NOT NULL DEFAULT -1,
                 error_message TEXT,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 created_at INTEGER NOT NULL,
                 processed_at INTEGER,
                 UNIQUE (source_type, source_id)
             );
             CREATE INDEX IF NOT EXISTS idx_queue_pending
                 ON embed_queue(created_at) WHERE status = -1;
             CREATE INDEX IF NOT EXISTS idx_queue_failed
                 ON embed_queue(status) WHERE status > 0;",
        )?;
        Ok(())
    }

    /// Create the text tables and FTS index in an attached schema. Idempotent.
    pub fn init_text_schema(&self, schema: &str) -> Result<()> {
        validate_alias(schema)?;
        let conn = self.conn()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {schema}.texts (
                 hash BLOB PRIMARY KEY,
                 content TEXT NOT NULL
             );
             CREATE VIRTUAL TABLE IF NOT EXISTS {schema}.texts_fts
                 USING fts5(content, hash UNINDEXED);"
        ))?;
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────────

    /// Register a service, or return the existing record when the name is
    /// already taken. A service's vector space never changes after this.
    pub fn register_service(&self, new: &NewService<'_>) -> Result<EmbeddingService> {
        let name = match new.name {
            Some(n) => n.to_string(),
            None => format!("{}/{}", new.format, new.model),
        };
        let conn = self.conn()?;
        if let Some(existing) = lookup_service(&conn, &name)? {
            return Ok(existing);
        }
        conn.execute(
            "INSERT INTO services (name, format, base_url, model, dimensions, max_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                new.format,
                new.base_url,
                new.model,
                new.dimensions as i64,
                new.max_tokens as i64,
                now_ms(),
            ],
        )?;
        lookup_service(&conn, &name)?.ok_or_else(|| {
            MemodexError::Storage(format!("service '{name}' vanished after insert"))
        })
    }

    pub fn get_service(&self, name: &str) -> Result<Option<EmbeddingService>> {
        let conn = self.conn()?;
        lookup_service(&conn, name)
    }

    pub fn list_services(&self) -> Result<Vec<EmbeddingService>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, format, base_url, model, dimensions, max_tokens, created_at
             FROM services ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], service_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a service and, with `force`, everything in its vector space.
    /// Without `force` a service that still owns data is refused.
    pub fn delete_service(&self, name: &str, force: bool) -> Result<()> {
        let mut conn = self.conn()?;
        let service = lookup_service(&conn, name)?.ok_or_else(|| {
            MemodexError::Validation(format!("unknown embedding service '{name}'"))
        })?;

        let stats = stats_for(&conn, service.id)?;
        if !force && (stats.embeddings > 0 || stats.chunks > 0) {
            return Err(MemodexError::ServiceNotEmpty {
                service: service.name,
                embeddings: stats.embeddings,
                chunks: stats.chunks,
            });
        }

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chunks WHERE hash IN
                 (SELECT hash FROM embeddings WHERE service_id = ?1)",
            params![service.id],
        )?;
        tx.execute(
            "DELETE FROM projections WHERE hash IN
                 (SELECT hash FROM embeddings WHERE service_id = ?1)",
            params![service.id],
        )?;
        tx.execute("DELETE FROM embeddings WHERE service_id = ?1", params![service.id])?;
        tx.execute(
            "DELETE FROM projection_vectors WHERE service_id = ?1",
            params![service.id],
        )?;
        tx.execute("DELETE FROM services WHERE id = ?1", params![service.id])?;
        tx.commit()?;
        debug!("deleted service {} ({})", service.name, service.id);
        Ok(())
    }

    pub fn stats(&self, service_id: i64) -> Result<ServiceStats> {
        let conn = self.conn()?;
        stats_for(&conn, service_id)
    }

    // ── Projection vectors ───────────────────────────────────────

    /// Load the projection basis for a service, if one was generated.
    pub fn get_projection_vectors(&self, service_id: i64) -> Result<Option<Vec<Vec<f32>>>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT vec_0, vec_1, vec_2, vec_3, vec_4, vec_5, vec_6, vec_7
             FROM projection_vectors WHERE service_id = ?1",
            params![service_id],
            |row| {
                let mut basis = Vec::with_capacity(PROJECTION_K);
                for i in 0..PROJECTION_K {
                    basis.push(deserialize_vector(&row.get::<_, Vec<u8>>(i)?));
                }
                Ok(basis)
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Persist a projection basis. Write-once: an existing row wins.
    pub fn store_projection_vectors(&self, service_id: i64, basis: &[Vec<f32>]) -> Result<()> {
        if basis.len() != PROJECTION_K {
            return Err(MemodexError::Validation(format!(
                "projection basis has {} vectors, expected {PROJECTION_K}",
                basis.len()
            )));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO projection_vectors
                 (service_id, vec_0, vec_1, vec_2, vec_3, vec_4, vec_5, vec_6, vec_7, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                service_id,
                serialize_vector(&basis[0]),
                serialize_vector(&basis[1]),
                serialize_vector(&basis[2]),
                serialize_vector(&basis[3]),
                serialize_vector(&basis[4]),
                serialize_vector(&basis[5]),
                serialize_vector(&basis[6]),
                serialize_vector(&basis[7]),
                now_ms(),
            ],
        )?;
        Ok(())
    }

    // ── Row primitives (non-transactional wrappers) ──────────────

    /// Store an embedding keyed by content hash. Idempotent for a repeat
    /// write under the same service; a different service is rejected.
    pub fn store_embedding(
        &self,
        hash: &[u8],
        vector: &[f32],
        token_count: u32,
        service_id: i64,
    ) -> Result<bool> {
        let conn = self.conn()?;
        insert_embedding(&conn, hash, vector, token_count, service_id)
    }

    pub fn store_projection(&self, hash: &[u8], proj: &[f64; PROJECTION_K]) -> Result<()> {
        let conn = self.conn()?;
        insert_projection(&conn, hash, proj)
    }

    pub fn create_chunk(&self, chunk: &NewChunk<'_>) -> Result<i64> {
        let conn = self.conn()?;
        insert_chunk(&conn, chunk)
    }

    pub fn get_text(&self, schema: &str, hash: &[u8]) -> Result<Option<String>> {
        validate_alias(schema)?;
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT content FROM {schema}.texts WHERE hash = ?1"),
            params![hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    // ── Usage counters ───────────────────────────────────────────

    pub fn increment_match_count(&self, chunk_ids: &[i64]) -> Result<()> {
        self.bump_counter("match_count", chunk_ids)
    }

    pub fn increment_read_count(&self, chunk_ids: &[i64]) -> Result<()> {
        self.bump_counter("read_count", chunk_ids)
    }

    fn bump_counter(&self, column: &str, chunk_ids: &[i64]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let conn = self.conn()?;
        conn.execute(
            &format!("UPDATE chunks SET {column} = {column} + 1 WHERE id IN ({placeholders})"),
            params_from_iter(chunk_ids.iter()),
        )?;
        Ok(())
    }
}

/// Attached-schema aliases come from configuration, not user input, but they
/// are interpolated into SQL and so are held to identifier charset rules.
fn validate_alias(alias: &str) -> Result<()> {
    let mut chars = alias.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MemodexError::Validation(format!(
            "invalid schema alias '{alias}'"
        )));
    }
    if alias.eq_ignore_ascii_case("main") || alias.eq_ignore_ascii_case("temp") {
        return Err(MemodexError::Validation(format!(
            "schema alias '{alias}' is reserved"
        )));
    }
    Ok(())
}

fn service_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingService> {
    Ok(EmbeddingService {
        id: row.get(0)?,
        name: row.get(1)?,
        format: row.get(2)?,
        base_url: row.get(3)?,
        model: row.get(4)?,
        dimensions: row.get::<_, i64>(5)? as usize,
        max_tokens: row.get::<_, i64>(6)? as usize,
        created_at: row.get(7)?,
    })
}

pub(crate) fn lookup_service(conn: &Connection, name: &str) -> Result<Option<EmbeddingService>> {
    conn.query_row(
        "SELECT id, name, format, base_url, model, dimensions, max_tokens, created_at
         FROM services WHERE name = ?1",
        params![name],
        service_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn stats_for(conn: &Connection, service_id: i64) -> Result<ServiceStats> {
    let embeddings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE service_id = ?1",
        params![service_id],
        |row| row.get(0),
    )?;
    let chunks: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chunks c JOIN embeddings e ON c.hash = e.hash
         WHERE e.service_id = ?1",
        params![service_id],
        |row| row.get(0),
    )?;
    let sources: i64 = conn.query_row(
        "SELECT COUNT(*) FROM (
             SELECT DISTINCT c.source_type, c.source_id
             FROM chunks c JOIN embeddings e ON c.hash = e.hash
             WHERE e.service_id = ?1
         )",
        params![service_id],
        |row| row.get(0),
    )?;
    Ok(ServiceStats {
        embeddings: embeddings as u64,
        chunks: chunks as u64,
        sources: sources as u64,
    })
}

// ── Transaction-composable primitives ────────────────────────────
//
// These take a plain `&Connection` so ingestion can run them inside one
// document transaction; `rusqlite::Transaction` derefs to `Connection`.

pub(crate) fn insert_embedding(
    conn: &Connection,
    hash: &[u8],
    vector: &[f32],
    token_count: u32,
    service_id: i64,
) -> Result<bool> {
    if hash.len() != HASH_LEN {
        return Err(MemodexError::Validation(format!(
            "content hash must be {HASH_LEN} bytes, got {}",
            hash.len()
        )));
    }
    let existing: Option<i64> = conn
        .query_row(
            "SELECT service_id FROM embeddings WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(owner) if owner == service_id => Ok(false),
        Some(owner) => Err(MemodexError::Validation(format!(
            "content {} is already embedded under service {owner}, refusing write from service {service_id}",
            hex::encode(hash)
        ))),
        None => {
            conn.execute(
                "INSERT INTO embeddings (hash, embedding, token_count, service_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    hash,
                    serialize_vector(vector),
                    i64::from(token_count),
                    service_id,
                    now_ms(),
                ],
            )?;
            Ok(true)
        }
    }
}

pub(crate) fn insert_projection(
    conn: &Connection,
    hash: &[u8],
    proj: &[f64; PROJECTION_K],
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO projections
             (hash, proj_0, proj_1, proj_2, proj_3, proj_4, proj_5, proj_6, proj_7)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            hash, proj[0], proj[1], proj[2], proj[3], proj[4], proj[5], proj[6], proj[7]
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_chunk(conn: &Connection, chunk: &NewChunk<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO chunks
             (hash, source_type, source_id, pair_id, parent_id, \"offset\", size, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            chunk.hash,
            chunk.source_type,
            chunk.source_id,
            chunk.pair_id,
            chunk.parent_id,
            chunk.offset,
            chunk.size,
            now_ms(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert chunk text and its FTS row, guarded by presence checks so a
/// re-ingested hash does not duplicate either.
pub(crate) fn insert_text(
    conn: &Connection,
    schema: &str,
    hash: &[u8],
    content: &str,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {schema}.texts (hash, content)
             SELECT ?1, ?2
             WHERE NOT EXISTS (SELECT 1 FROM {schema}.texts WHERE hash = ?1)"
        ),
        params![hash, content],
    )?;
    conn.execute(
        &format!(
            "INSERT INTO {schema}.texts_fts (hash, content)
             SELECT ?1, ?2
             WHERE NOT EXISTS (SELECT 1 FROM {schema}.texts_fts WHERE hash = ?1)"
        ),
        params![hash, content],
    )?;
    Ok(())
}

/// Delete the chunks selected by source_id and optional source_type under
/// one service, then garbage-collect projections and embeddings for any
/// hash left without a referencing chunk. Returns the chunk count deleted.
pub(crate) fn delete_source_chunks(
    conn: &Connection,
    service_id: i64,
    source_type: Option<&str>,
    source_id: i64,
) -> Result<usize> {
    let mut where_sql = String::from(
        "c.source_id = ?1 AND c.hash IN (SELECT hash FROM embeddings WHERE service_id = ?2)",
    );
    let mut bind: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(source_id), Box::new(service_id)];
    if let Some(st) = source_type {
        where_sql.push_str(" AND c.source_type = ?3");
        bind.push(Box::new(st.to_string()));
    }
    let bind_refs: Vec<&dyn rusqlite::types::ToSql> = bind.iter().map(AsRef::as_ref).collect();

    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT c.hash FROM chunks c WHERE {where_sql}"
    ))?;
    let touched: Vec<Vec<u8>> = stmt
        .query_map(bind_refs.as_slice(), |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let deleted = conn.execute(
        &format!("DELETE FROM chunks AS c WHERE {where_sql}"),
        bind_refs.as_slice(),
    )?;
    gc_orphan_hashes(conn, &touched)?;
    Ok(deleted)
}

/// Same cleanup for every chunk of a source_type (used by reindex).
pub(crate) fn delete_source_type_chunks(
    conn: &Connection,
    service_id: i64,
    source_type: &str,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.hash FROM chunks c
         WHERE c.source_type = ?1
           AND c.hash IN (SELECT hash FROM embeddings WHERE service_id = ?2)",
    )?;
    let touched: Vec<Vec<u8>> = stmt
        .query_map(params![source_type, service_id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    let deleted = conn.execute(
        "DELETE FROM chunks AS c
         WHERE c.source_type = ?1
           AND c.hash IN (SELECT hash FROM embeddings WHERE service_id = ?2)",
        params![source_type, service_id],
    )?;
    gc_orphan_hashes(conn, &touched)?;
    Ok(deleted)
}

/// For every hash whose chunk reference count dropped to zero, delete the
/// projection row and then the embedding row.
fn gc_orphan_hashes(conn: &Connection, hashes: &[Vec<u8>]) -> Result<()> {
    for hash in hashes {
        let referenced: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )?;
        if referenced == 0 {
            conn.execute("DELETE FROM projections WHERE hash = ?1", params![hash])?;
            conn.execute("DELETE FROM embeddings WHERE hash = ?1", params![hash])?;
            debug!("garbage-collected orphan embedding {}", hex::encode(hash));
        }
    }
    Ok(())
}

/// Distinct (source_id, pair_id, parent_id) tuples indexed under a
/// source_type for one service.
pub(crate) fn list_source_tuples(
    conn: &Connection,
    service_id: i64,
    source_type: &str,
) -> Result<Vec<(i64, Option<i64>, Option<i64>)>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.source_id, c.pair_id, c.parent_id
         FROM chunks c JOIN embeddings e ON c.hash = e.hash
         WHERE e.service_id = ?1 AND c.source_type = ?2
         ORDER BY c.source_id",
    )?;
    let rows = stmt
        .query_map(params![service_id, source_type], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Reassemble a source's text from stored chunk content, in offset order.
pub(crate) fn source_text(
    conn: &Connection,
    schema: &str,
    service_id: i64,
    source_type: &str,
    source_id: i64,
) -> Result<Option<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT t.content
         FROM chunks c
         JOIN embeddings e ON c.hash = e.hash
         JOIN {schema}.texts t ON t.hash = c.hash
         WHERE e.service_id = ?1 AND c.source_type = ?2 AND c.source_id = ?3
         ORDER BY c.\"offset\" ASC"
    ))?;
    let parts: Vec<String> = stmt
        .query_map(params![service_id, source_type, source_id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("\n\n")))
    }
}
