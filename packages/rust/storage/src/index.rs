//! Nearest-neighbour index over content embeddings.
//!
//! Every metric is expressed as a distance where smaller means closer:
//! L2 is the Euclidean distance, inner product is `1 - dot` and cosine is
//! `1 - cos`.

use async_trait::async_trait;
use autonews_shared::{DistanceMetric, Result};
use libsql::{Connection, params};
use tracing::debug;

use crate::cache::now_secs;
use crate::{check_writable, storage_err};

/// One query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbour {
    pub distance: f32,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Insert or replace the vector stored under `id`.
    async fn upsert(&self, id: &str, vector: &[f32], metadata: serde_json::Value) -> Result<()>;

    /// The `k` nearest stored vectors, closest first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbour>>;

    fn metric(&self) -> DistanceMetric;
}

/// Distance between two vectors under `metric`.
///
/// Mismatched or empty vectors are maximally distant.
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return f32::INFINITY;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        DistanceMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::InnerProduct => 1.0 - dot,
        DistanceMetric::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                return 1.0;
            }
            1.0 - dot / (norm_a * norm_b)
        }
    }
}

/// Sort candidates by distance and keep the first `k`.
pub(crate) fn nearest(
    metric: DistanceMetric,
    query: &[f32],
    candidates: impl IntoIterator<Item = (Vec<f32>, serde_json::Value)>,
    k: usize,
) -> Vec<Neighbour> {
    let mut hits: Vec<Neighbour> = candidates
        .into_iter()
        .filter(|(vector, _)| vector.len() == query.len())
        .map(|(vector, metadata)| Neighbour {
            distance: distance(metric, query, &vector),
            metadata,
        })
        .collect();
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    hits.truncate(k);
    hits
}

// ---------------------------------------------------------------------------
// libSQL implementation
// ---------------------------------------------------------------------------

/// Brute-force index over the `index_vectors` table.
pub struct LibsqlIndex {
    conn: Connection,
    metric: DistanceMetric,
    readonly: bool,
}

impl LibsqlIndex {
    pub(crate) fn new(conn: Connection, metric: DistanceMetric, readonly: bool) -> Self {
        Self {
            conn,
            metric,
            readonly,
        }
    }
}

fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl SimilarityIndex for LibsqlIndex {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: serde_json::Value) -> Result<()> {
        check_writable(self.readonly)?;
        let dims = i64::try_from(vector.len()).map_err(storage_err)?;
        self.conn
            .execute(
                "INSERT INTO index_vectors (id, dims, vector, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   dims = excluded.dims,
                   vector = excluded.vector,
                   metadata = excluded.metadata,
                   updated_at = excluded.updated_at",
                params![id, dims, encode(vector), metadata.to_string(), now_secs()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbour>> {
        if k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }
        let dims = i64::try_from(vector.len()).map_err(storage_err)?;
        let mut rows = self
            .conn
            .query(
                "SELECT vector, metadata FROM index_vectors WHERE dims = ?1",
                params![dims],
            )
            .await
            .map_err(storage_err)?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let bytes: Vec<u8> = row.get(0).map_err(storage_err)?;
            let raw: String = row.get(1).map_err(storage_err)?;
            let metadata = serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
            candidates.push((decode(&bytes), metadata));
        }

        debug!(candidates = candidates.len(), k, "similarity query");
        Ok(nearest(self.metric, vector, candidates, k))
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }
}
