//! Top-k cosine search as a single streaming SQL scan.
//!
//! One query joins chunks, embeddings, and (as requested) projections, stored
//! text, and the FTS index; rows stream through cosine scoring into a bounded
//! top-k, and the winners get their match counters bumped afterwards.
use crate::errors::{MemodexError, Result};
use crate::projection::{DEFAULT_PROJECTION_THRESHOLD, PROJECTION_K};
use crate::store::VectorDb;
use crate::vectors::{cosine_similarity, deserialize_vector};
use tracing::{debug, warn};

/// Caller-facing search knobs. Metadata filters AND together; `like`
/// patterns AND together; `sql_where` is a raw, trusted predicate that may
/// reference the chunk alias `c` and any attached schema.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Maximum results to return (k).
    pub limit: usize,
    /// Results scoring below this cosine similarity are dropped.
    pub min_score: f32,
    pub source_type: Option<String>,
    pub source_id: Option<i64>,
    pub pair_id: Option<i64>,
    pub parent_id: Option<i64>,
    /// SQL LIKE patterns over stored chunk text.
    pub like: Vec<String>,
    /// Full-text query over stored chunk text.
    pub match_query: Option<String>,
    /// Raw predicate appended verbatim (parenthesized). Trusted input: never
    /// interpolate untrusted user data through it.
    pub sql_where: Option<String>,
    /// Return the stored chunk text with each hit.
    pub include_text: bool,
    /// Screen candidates whose projection lies farther than this squared
    /// distance from the query projection.
    pub projection_threshold: f64,
    /// Disable to scan every chunk regardless of projection distance.
    pub use_projection_filter: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.7,
            source_type: None,
            source_id: None,
            pair_id: None,
            parent_id: None,
            like: Vec::new(),
            match_query: None,
            sql_where: None,
            include_text: false,
            projection_threshold: DEFAULT_PROJECTION_THRESHOLD,
            use_projection_filter: true,
        }
    }
}

/// One search result, best first.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub hash: Vec<u8>,
    pub score: f32,
    pub source_type: String,
    pub source_id: i64,
    pub pair_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub offset: Option<i64>,
    pub size: i64,
    /// Stored chunk text, when requested and text storage is enabled.
    pub text: Option<String>,
}

/// Everything the executor needs beyond the caller's params.
pub(crate) struct SearchScan<'a> {
    pub query_vector: &'a [f32],
    pub query_projection: Option<&'a [f64; PROJECTION_K]>,
    pub service_id: i64,
    pub text_schema: Option<&'a str>,
    pub params: &'a SearchParams,
}

/// Size-bounded result list, kept sorted by score descending. Insertion is a
/// binary search for the first strictly-lower score, so equal scores keep
/// their arrival order.
pub(crate) struct TopK {
    k: usize,
    hits: Vec<SearchHit>,
}

impl TopK {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            hits: Vec::with_capacity(k.min(64) + 1),
        }
    }

    pub(crate) fn insert(&mut self, hit: SearchHit) {
        let at = self.hits.partition_point(|h| h.score >= hit.score);
        self.hits.insert(at, hit);
        if self.hits.len() > self.k {
            self.hits.truncate(self.k);
        }
    }

    pub(crate) fn into_vec(self) -> Vec<SearchHit> {
        self.hits
    }
}

pub(crate) fn execute(db: &VectorDb, scan: &SearchScan<'_>) -> Result<Vec<SearchHit>> {
    let params = scan.params;
    if params.limit == 0 {
        return Err(MemodexError::Validation("search limit must be at least 1".into()));
    }
    if !(-1.0..=1.0).contains(&params.min_score) {
        return Err(MemodexError::Validation(format!(
            "min_score must lie in [-1, 1], got {}",
            params.min_score
        )));
    }
    let wants_text = params.include_text || !params.like.is_empty();
    let wants_fts = params.match_query.is_some();
    if (wants_text || wants_fts) && scan.text_schema.is_none() {
        return Err(MemodexError::Validation(
            "text filters and include_text require text storage".into(),
        ));
    }

    let (sql, bind) = build_query(scan);
    let bind_refs: Vec<&dyn rusqlite::types::ToSql> = bind.iter().map(AsRef::as_ref).collect();

    let mut top = TopK::new(params.limit);
    let mut scanned = 0_usize;
    {
        let conn = db.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(bind_refs.as_slice())?;
        while let Some(row) = rows.next()? {
            scanned += 1;
            let blob: Vec<u8> = row.get(8)?;
            let stored = deserialize_vector(&blob);
            let score = cosine_similarity(scan.query_vector, &stored)?;
            if score < params.min_score {
                continue;
            }
            top.insert(SearchHit {
                chunk_id: row.get(0)?,
                hash: row.get(1)?,
                score,
                source_type: row.get(2)?,
                source_id: row.get(3)?,
                pair_id: row.get(4)?,
                parent_id: row.get(5)?,
                offset: row.get(6)?,
                size: row.get(7)?,
                text: if params.include_text { row.get(9)? } else { None },
            });
        }
    }

    let hits = top.into_vec();
    debug!("scanned {scanned} candidates, returning {}", hits.len());

    // Best-effort: a failed counter bump is logged, not surfaced, and never
    // invalidates the results already collected.
    let returned: Vec<i64> = hits.iter().map(|h| h.chunk_id).collect();
    if let Err(e) = db.increment_match_count(&returned) {
        warn!("failed to increment match counts: {e}");
    }

    Ok(hits)
}

fn build_query(scan: &SearchScan<'_>) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let params = scan.params;
    let wants_text = params.include_text || !params.like.is_empty();
    let projection = if params.use_projection_filter {
        scan.query_projection
    } else {
        None
    };

    let mut sql = String::from(
        "SELECT c.id, c.hash, c.source_type, c.source_id, c.pair_id, c.parent_id, \
         c.\"offset\", c.size, e.embedding",
    );
    if params.include_text {
        sql.push_str(", t.content");
    }
    sql.push_str(" FROM chunks c JOIN embeddings e ON c.hash = e.hash");
    if projection.is_some() {
        sql.push_str(" JOIN projections p ON c.hash = p.hash");
    }
    if let Some(schema) = scan.text_schema {
        if wants_text {
            sql.push_str(&format!(" JOIN {schema}.texts t ON t.hash = c.hash"));
        }
        if params.match_query.is_some() {
            sql.push_str(&format!(" JOIN {schema}.texts_fts fts ON fts.hash = c.hash"));
        }
    }

    let mut bind: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    sql.push_str(" WHERE e.service_id = ?");
    bind.push(Box::new(scan.service_id));

    if let Some(ref st) = params.source_type {
        sql.push_str(" AND c.source_type = ?");
        bind.push(Box::new(st.clone()));
    }
    if let Some(id) = params.source_id {
        sql.push_str(" AND c.source_id = ?");
        bind.push(Box::new(id));
    }
    if let Some(id) = params.pair_id {
        sql.push_str(" AND c.pair_id = ?");
        bind.push(Box::new(id));
    }
    if let Some(id) = params.parent_id {
        sql.push_str(" AND c.parent_id = ?");
        bind.push(Box::new(id));
    }
    if let Some(ref raw) = params.sql_where {
        sql.push_str(" AND (");
        sql.push_str(raw);
        sql.push(')');
    }
    for pattern in &params.like {
        sql.push_str(" AND t.content LIKE ?");
        bind.push(Box::new(pattern.clone()));
    }
    if let Some(ref query) = params.match_query {
        sql.push_str(" AND fts MATCH ?");
        bind.push(Box::new(query.clone()));
    }
    if let Some(proj) = projection {
        sql.push_str(" AND (");
        for i in 0..PROJECTION_K {
            if i > 0 {
                sql.push_str(" + ");
            }
            sql.push_str(&format!("(p.proj_{i} - ?) * (p.proj_{i} - ?)"));
            bind.push(Box::new(proj[i]));
            bind.push(Box::new(proj[i]));
        }
        sql.push_str(") <= ?");
        bind.push(Box::new(params.projection_threshold));
    }

    (sql, bind)
}

#[cfg(test)]
mod tests;
