//! In-memory exact nearest-neighbor index over face embeddings.
//!
//! The index is a derived cache of an [`EmbeddingStore`]: it can always be
//! regenerated from durable state, so every internal failure degrades to
//! "no match" or "rebuild from the store" instead of surfacing an error.
//!
//! # Snapshot
//!
//! A snapshot is an ordered list of idents plus a row-major matrix of
//! L2-normalized vectors at the same positions. Scores are inner products,
//! i.e. cosine similarities in `[-1.0, 1.0]`.
//!
//! # Concurrency
//!
//! Every public operation holds one exclusive async mutex for its full
//! duration, reads included. Rebuilds assemble a complete new snapshot
//! before swapping it in, so a search observes the snapshot from before or
//! after a mutation and never a partial one. Operations that build lazily
//! or fall back to a rebuild do so through private functions that take the
//! already-held state instead of re-locking.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use attendance_core::models::Match;
use attendance_core::store::EmbeddingStore;
use attendance_core::vector::{blob_to_vec, dot, is_finite, l2_normalize};

/// What a mutating index operation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMutation {
    /// Nothing needed to change.
    Unchanged,
    /// The vector was appended to the existing snapshot.
    Appended,
    /// The snapshot was rebuilt from the store.
    Rebuilt,
    /// A rebuild was needed but the store could not be read. The previous
    /// snapshot stays in place and is marked stale.
    Failed(String),
}

/// Outcome of an incremental append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppendOutcome {
    Appended,
    Rebuild(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    NotInitialized,
    Active,
}

/// Read-only summary of the current snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub status: IndexStatus,
    pub total_embeddings: usize,
    pub dimension: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

struct Snapshot {
    idents: Vec<String>,
    /// `idents.len() * dimension` normalized components.
    matrix: Vec<f32>,
    dimension: usize,
}

impl Snapshot {
    /// Decode and normalize stored rows. Returns `None` when no row is usable.
    fn from_rows(rows: Vec<(String, Vec<u8>)>) -> Option<Self> {
        let mut snapshot: Option<Snapshot> = None;

        for (ident, blob) in rows {
            let Some(vec) = blob_to_vec(&blob) else {
                warn!(%ident, bytes = blob.len(), "skipping unreadable embedding");
                continue;
            };
            if !is_finite(&vec) {
                warn!(%ident, "skipping embedding with non-finite components");
                continue;
            }
            let normalized = l2_normalize(&vec);

            match snapshot.as_mut() {
                None => {
                    snapshot = Some(Snapshot {
                        idents: vec![ident],
                        dimension: normalized.len(),
                        matrix: normalized,
                    });
                }
                Some(s) => {
                    if s.try_append(ident.clone(), normalized) != AppendOutcome::Appended {
                        warn!(%ident, dimension = s.dimension, "skipping inconsistent embedding");
                    }
                }
            }
        }

        snapshot
    }

    fn len(&self) -> usize {
        self.idents.len()
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.matrix[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Append one normalized vector. Leaves the snapshot untouched unless
    /// the append fully succeeds.
    fn try_append(&mut self, ident: String, normalized: Vec<f32>) -> AppendOutcome {
        if normalized.is_empty() {
            return AppendOutcome::Rebuild("empty embedding");
        }
        if normalized.len() != self.dimension {
            return AppendOutcome::Rebuild("dimension mismatch");
        }
        if self.idents.iter().any(|existing| *existing == ident) {
            return AppendOutcome::Rebuild("ident already indexed");
        }
        self.matrix.extend_from_slice(&normalized);
        self.idents.push(ident);
        AppendOutcome::Appended
    }

    /// Top-`k` rows by inner product with an already normalized query.
    fn search(&self, query: &[f32], top_k: usize) -> Vec<Match> {
        if query.len() != self.dimension {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = (0..self.len())
            .map(|i| (i, dot(query, self.row(i))))
            .filter(|(_, score)| score.is_finite())
            .collect();

        let k = top_k.min(scored.len());
        if k == 0 {
            return Vec::new();
        }

        let by_score_desc =
            |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_score_desc);
            scored.truncate(k);
        }
        scored.sort_by(by_score_desc);

        scored
            .into_iter()
            .map(|(i, score)| Match {
                ident: self.idents[i].clone(),
                score: score.clamp(-1.0, 1.0),
            })
            .collect()
    }
}

#[derive(Default)]
struct IndexState {
    snapshot: Option<Snapshot>,
    last_built: Option<DateTime<Utc>>,
}

/// Exact cosine-similarity index backed by an [`EmbeddingStore`].
///
/// Construct one per process and share it behind an `Arc`.
pub struct VectorIndex {
    store: Arc<dyn EmbeddingStore>,
    state: Mutex<IndexState>,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn EmbeddingStore>) -> Self {
        Self {
            store,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Load every stored embedding and replace the snapshot.
    ///
    /// A no-op when a snapshot exists and `force` is false. With no stored
    /// embeddings the index becomes empty, which is not an error. Store
    /// failures are returned and leave the previous snapshot in place.
    pub async fn build(&self, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        self.build_locked(&mut state, force).await.map(|_| ())
    }

    /// Nearest neighbors of `query`, best first.
    ///
    /// Builds the snapshot first if none exists. Returns at most
    /// `min(top_k, len)` matches and never fails: an empty index, a
    /// dimension mismatch, or an unreadable store all yield an empty list.
    pub async fn search(&self, query: &[f32], top_k: usize) -> Vec<Match> {
        let mut state = self.state.lock().await;

        if state.snapshot.is_none() {
            if let Err(e) = self.build_locked(&mut state, false).await {
                warn!(error = %e, "lazy index build failed; returning no matches");
                return Vec::new();
            }
        }

        let Some(snapshot) = state.snapshot.as_ref() else {
            return Vec::new();
        };
        if !is_finite(query) {
            return Vec::new();
        }

        let query = l2_normalize(query);
        if query.len() != snapshot.dimension {
            warn!(
                query_dimension = query.len(),
                index_dimension = snapshot.dimension,
                "query dimension does not match index"
            );
        }
        snapshot.search(&query, top_k)
    }

    /// Append one embedding without reloading the store.
    ///
    /// Without a snapshot this is a full build. If the append cannot keep the
    /// snapshot consistent it falls back to a forced rebuild.
    pub async fn add_embedding(&self, ident: &str, embedding: &[f32]) -> IndexMutation {
        let mut state = self.state.lock().await;

        if state.snapshot.is_none() {
            return self.rebuild_locked(&mut state, false).await;
        }

        let outcome = match state.snapshot.as_mut() {
            Some(snapshot) if is_finite(embedding) => {
                snapshot.try_append(ident.to_string(), l2_normalize(embedding))
            }
            _ => AppendOutcome::Rebuild("non-finite embedding"),
        };

        match outcome {
            AppendOutcome::Appended => {
                state.last_built = Some(Utc::now());
                debug!(%ident, "appended embedding to index");
                IndexMutation::Appended
            }
            AppendOutcome::Rebuild(reason) => {
                info!(%ident, reason, "incremental append rejected; rebuilding index");
                self.rebuild_locked(&mut state, true).await
            }
        }
    }

    /// Replace one ident's embedding. Always a forced rebuild from the store,
    /// which must already hold `embedding`.
    pub async fn update_embedding(&self, ident: &str, embedding: &[f32]) -> IndexMutation {
        let mut state = self.state.lock().await;
        debug!(%ident, dimension = embedding.len(), "rebuilding index for updated embedding");
        self.rebuild_locked(&mut state, true).await
    }

    /// Drop one ident. Always a forced rebuild from the store.
    pub async fn remove_embedding(&self, ident: &str) -> IndexMutation {
        let mut state = self.state.lock().await;
        debug!(%ident, "rebuilding index after removal");
        self.rebuild_locked(&mut state, true).await
    }

    /// Force a rebuild when the snapshot is older than `max_age_minutes`, or
    /// when there is no snapshot or build timestamp yet.
    pub async fn rebuild_if_stale(&self, max_age_minutes: u64) -> IndexMutation {
        let mut state = self.state.lock().await;

        let stale = match (&state.snapshot, state.last_built) {
            (Some(_), Some(built)) => i64::try_from(max_age_minutes)
                .ok()
                .and_then(chrono::Duration::try_minutes)
                // A budget too large for chrono never expires.
                .is_some_and(|max_age| Utc::now() - built > max_age),
            _ => true,
        };

        if stale {
            self.rebuild_locked(&mut state, true).await
        } else {
            IndexMutation::Unchanged
        }
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.state.lock().await;
        match &state.snapshot {
            None => IndexStats {
                status: IndexStatus::NotInitialized,
                total_embeddings: 0,
                dimension: 0,
                last_updated: None,
            },
            Some(snapshot) => IndexStats {
                status: IndexStatus::Active,
                total_embeddings: snapshot.len(),
                dimension: snapshot.dimension,
                last_updated: state.last_built,
            },
        }
    }

    /// Idents currently in the snapshot, in row order.
    pub async fn idents(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .snapshot
            .as_ref()
            .map(|s| s.idents.clone())
            .unwrap_or_default()
    }

    /// Rebuild and report the outcome, marking the snapshot stale on failure.
    async fn rebuild_locked(&self, state: &mut IndexState, force: bool) -> IndexMutation {
        match self.build_locked(state, force).await {
            Ok(true) => IndexMutation::Rebuilt,
            Ok(false) => IndexMutation::Unchanged,
            Err(e) => {
                warn!(error = %e, "index rebuild failed; keeping previous snapshot");
                state.last_built = None;
                IndexMutation::Failed(e.to_string())
            }
        }
    }

    /// Returns whether a build happened.
    async fn build_locked(&self, state: &mut IndexState, force: bool) -> Result<bool> {
        if state.snapshot.is_some() && !force {
            return Ok(false);
        }

        let rows = self.store.list_embeddings().await?;
        let row_count = rows.len();

        *state = match Snapshot::from_rows(rows) {
            Some(snapshot) => {
                info!(
                    embeddings = snapshot.len(),
                    skipped = row_count - snapshot.len(),
                    dimension = snapshot.dimension,
                    "built similarity index"
                );
                IndexState {
                    snapshot: Some(snapshot),
                    last_built: Some(Utc::now()),
                }
            }
            None => {
                info!(rows = row_count, "no usable embeddings; index is empty");
                IndexState::default()
            }
        };

        Ok(true)
    }
}
