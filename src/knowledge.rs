//! Local passage index backing the knowledge lookup tool.
//!
//! Passages are stored with their embeddings in SQLite; queries rank the
//! collection by cosine similarity and pick a diverse top set with
//! maximal marginal relevance.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use scraper::{Html, Node, Selector};
use sqlx::{Pool, Row, Sqlite};
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::models::Embedder;

pub const CHUNK_SIZE: usize = 800;
pub const CHUNK_OVERLAP: usize = 50;
pub const DEFAULT_TOP_K: usize = 4;
const FETCH_K: usize = 20;
const MMR_LAMBDA: f32 = 0.5;
const EMBED_BATCH: usize = 32;
const MAX_PAGE_BYTES: usize = 4 * 1024 * 1024;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub source: String,
    pub content: String,
}

pub struct KnowledgeBase {
    pool: Pool<Sqlite>,
    embedder: Arc<dyn Embedder>,
    collection: String,
    http: reqwest::Client,
    span: Span,
}

impl KnowledgeBase {
    pub fn new(pool: Pool<Sqlite>, embedder: Arc<dyn Embedder>, collection: impl Into<String>, span: Span) -> Self {
        Self { pool, embedder, collection: collection.into(), http: reqwest::Client::new(), span }
    }

    /// Fetches a web page, splits its text and indexes the chunks. Returns the chunk count.
    pub async fn ingest_url(&self, raw_url: &str) -> anyhow::Result<usize> {
        let parsed = url::Url::parse(raw_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("unsupported scheme: {}", parsed.scheme());
        }
        let text = fetch_and_extract(&self.http, parsed.as_str(), MAX_PAGE_BYTES)
            .instrument(self.span.clone())
            .await?;
        self.ingest_text(raw_url, &text).await
    }

    pub async fn ingest_text(&self, source: &str, text: &str) -> anyhow::Result<usize> {
        let chunks = split_text(text, CHUNK_SIZE, CHUNK_OVERLAP);
        if chunks.is_empty() {
            anyhow::bail!("no text to index from {}", source);
        }
        let mut embeddings = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH) {
            embeddings.extend(self.embedder.embed(batch).await?);
        }
        if embeddings.len() != chunks.len() {
            anyhow::bail!("embedder returned {} vectors for {} chunks", embeddings.len(), chunks.len());
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (content, embedding) in chunks.iter().zip(&embeddings) {
            sqlx::query("INSERT INTO passages (id, collection, source, content, embedding, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)")
                .bind(Uuid::new_v4().to_string())
                .bind(&self.collection)
                .bind(source)
                .bind(content)
                .bind(serde_json::to_string(embedding)?)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        let _enter = self.span.enter();
        tracing::info!(source, chunks = chunks.len(), collection = %self.collection, "knowledge ingested");
        Ok(chunks.len())
    }

    /// Most relevant passages for `query`, diversified with MMR.
    pub async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Passage>> {
        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))?;

        let rows = sqlx::query("SELECT source, content, embedding FROM passages WHERE collection = ?1")
            .bind(&self.collection)
            .fetch_all(&self.pool)
            .await?;
        let mut scored = Vec::with_capacity(rows.len());
        for r in rows {
            let raw: String = r.get("embedding");
            let embedding: Vec<f32> = serde_json::from_str(&raw)?;
            let score = cosine(&query_vec, &embedding);
            scored.push((score, Passage { source: r.get("source"), content: r.get("content") }, embedding));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(FETCH_K);

        let candidates: Vec<Vec<f32>> = scored.iter().map(|(_, _, e)| e.clone()).collect();
        let picked = mmr_select(&query_vec, &candidates, k, MMR_LAMBDA);
        Ok(picked.into_iter().map(|i| scored[i].1.clone()).collect())
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT count(*) AS c FROM passages WHERE collection = ?1")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c"))
    }
}

/// Downloads `url` and returns its readable text. HTML is reduced to the text
/// of `<body>` without scripts or styles; other content types pass through.
pub async fn fetch_and_extract(http: &reqwest::Client, url: &str, max_bytes: usize) -> anyhow::Result<String> {
    let mut resp = http.get(url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("fetch {} failed: {}", url, resp.status());
    }
    let is_html = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("html"))
        .unwrap_or(true);
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = max_bytes - bytes.len();
        if chunk.len() >= room {
            bytes.extend_from_slice(&chunk[..room]);
            tracing::debug!(url, max_bytes, "page truncated at size cap");
            break;
        }
        bytes.extend_from_slice(&chunk);
    }
    let body = String::from_utf8_lossy(&bytes).to_string();
    if is_html { html_to_text(&body) } else { Ok(body) }
}

fn html_to_text(html: &str) -> anyhow::Result<String> {
    let doc = Html::parse_document(html);
    let body = Selector::parse("body").map_err(|e| anyhow::anyhow!("selector: {}", e))?;
    let root = doc.select(&body).next().unwrap_or_else(|| doc.root_element());
    let mut lines: Vec<String> = Vec::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else { continue };
        let skipped = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| matches!(e.name(), "script" | "style" | "noscript")))
            .unwrap_or(false);
        if skipped {
            continue;
        }
        let t = text.trim();
        if !t.is_empty() {
            lines.push(t.to_string());
        }
    }
    Ok(lines.join("\n"))
}

/// Recursive character splitter: tries paragraph, line, word, then character
/// boundaries, merging pieces into chunks of at most `chunk_size` characters
/// with roughly `overlap` characters carried between neighbours.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    split_recursive(text, &SEPARATORS, chunk_size.max(1), overlap)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_recursive(text: &str, separators: &[&str], chunk_size: usize, overlap: usize) -> Vec<String> {
    let idx = separators
        .iter()
        .position(|s| s.is_empty() || text.contains(s))
        .unwrap_or(separators.len().saturating_sub(1));
    let sep = separators.get(idx).copied().unwrap_or("");
    let rest = separators.get(idx + 1..).unwrap_or(&[]);

    let pieces: Vec<&str> = if sep.is_empty() {
        text.char_indices().map(|(i, c)| &text[i..i + c.len_utf8()]).collect()
    } else {
        text.split(sep).filter(|p| !p.trim().is_empty()).collect()
    };

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();
    for piece in pieces {
        if char_len(piece) < chunk_size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge_pieces(&fitting, sep, chunk_size, overlap));
            fitting.clear();
        }
        if rest.is_empty() {
            out.push(piece.to_string());
        } else {
            out.extend(split_recursive(piece, rest, chunk_size, overlap));
        }
    }
    if !fitting.is_empty() {
        out.extend(merge_pieces(&fitting, sep, chunk_size, overlap));
    }
    out
}

fn merge_pieces(pieces: &[&str], sep: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut docs = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);
        let joiner = if current.is_empty() { 0 } else { sep_len };
        if total + len + joiner > chunk_size && !current.is_empty() {
            push_doc(&mut docs, &current, sep);
            // keep a tail of the previous chunk as overlap
            while total > overlap || (total > 0 && total + len + if current.is_empty() { 0 } else { sep_len } > chunk_size) {
                let Some(first) = current.pop_front() else { break };
                total -= char_len(first) + if current.is_empty() { 0 } else { sep_len };
            }
        }
        current.push_back(piece);
        total += len + if current.len() > 1 { sep_len } else { 0 };
    }
    push_doc(&mut docs, &current, sep);
    docs
}

fn push_doc(docs: &mut Vec<String>, current: &VecDeque<&str>, sep: &str) {
    let joined = current.iter().copied().collect::<Vec<_>>().join(sep);
    let doc = joined.trim();
    if !doc.is_empty() {
        docs.push(doc.to_string());
    }
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

/// Maximal marginal relevance: greedily picks up to `k` candidate indices
/// trading relevance to `query` (weight `lambda`) against similarity to
/// already-picked candidates.
pub fn mmr_select(query: &[f32], candidates: &[Vec<f32>], k: usize, lambda: f32) -> Vec<usize> {
    if k == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let relevance: Vec<f32> = candidates.iter().map(|c| cosine(query, c)).collect();
    let first = relevance
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut picked = vec![first];
    while picked.len() < k.min(candidates.len()) {
        let mut best: Option<(usize, f32)> = None;
        for (i, rel) in relevance.iter().enumerate() {
            if picked.contains(&i) {
                continue;
            }
            let redundancy = picked
                .iter()
                .map(|&p| cosine(&candidates[i], &candidates[p]))
                .fold(f32::MIN, f32::max);
            let score = lambda * rel - (1.0 - lambda) * redundancy;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        match best {
            Some((i, _)) => picked.push(i),
            None => break,
        }
    }
    picked
}
