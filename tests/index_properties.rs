//! Behavioral tests for the similarity index over an in-memory store.
//!
//! The index is driven the way the services drive it: write the store
//! first, then mutate the index, and check that the index always holds the
//! same identities as the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use attendance_core::models::Person;
use attendance_core::store::memory::InMemoryStore;
use attendance_core::store::{EmbeddingStore, Store};
use attendance_core::vector::vec_to_blob;
use attendance_harness::index::{IndexMutation, IndexStatus, VectorIndex};

fn person(ident: &str, embedding: Option<&[f32]>) -> Person {
    Person {
        ident: ident.to_string(),
        face_embedding: embedding.map(vec_to_blob),
        time_zone: "Asia/Taipei".to_string(),
        created_at: "2026-03-02T08:00:00+08:00".to_string(),
        updated_at: "2026-03-02T08:00:00+08:00".to_string(),
    }
}

fn setup() -> (Arc<InMemoryStore>, VectorIndex) {
    let store = Arc::new(InMemoryStore::new());
    let index = VectorIndex::new(store.clone() as Arc<dyn EmbeddingStore>);
    (store, index)
}

async fn stored_idents(store: &InMemoryStore) -> BTreeSet<String> {
    store
        .list_embeddings()
        .await
        .unwrap()
        .into_iter()
        .map(|(ident, _)| ident)
        .collect()
}

async fn indexed_idents(index: &VectorIndex) -> BTreeSet<String> {
    index.idents().await.into_iter().collect()
}

async fn create(store: &InMemoryStore, index: &VectorIndex, ident: &str, v: &[f32]) {
    store.insert_person(&person(ident, Some(v))).await.unwrap();
    let outcome = index.add_embedding(ident, v).await;
    assert!(!matches!(outcome, IndexMutation::Failed(_)), "{:?}", outcome);
}

async fn reenroll(store: &InMemoryStore, index: &VectorIndex, ident: &str, v: &[f32]) {
    store.write_embedding(ident, &vec_to_blob(v)).await.unwrap();
    let outcome = index.update_embedding(ident, v).await;
    assert!(!matches!(outcome, IndexMutation::Failed(_)), "{:?}", outcome);
}

async fn remove(store: &InMemoryStore, index: &VectorIndex, ident: &str) {
    assert!(store.delete_person(ident).await.unwrap());
    let outcome = index.remove_embedding(ident).await;
    assert!(!matches!(outcome, IndexMutation::Failed(_)), "{:?}", outcome);
}

#[tokio::test]
async fn enrolled_identity_matches_itself_and_outranks_orthogonal() {
    let (store, index) = setup();
    let e1 = [0.6_f32, 0.8, 0.0];
    let e2 = [0.0_f32, 0.0, 2.5];

    create(&store, &index, "A", &e1).await;
    let hits = index.search(&e1, 1).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ident, "A");
    assert!((hits[0].score - 1.0).abs() < 1e-5);

    create(&store, &index, "B", &e2).await;
    let hits = index.search(&e1, 2).await;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].ident, "A");
    assert_eq!(hits[1].ident, "B");
    assert!(hits[1].score.abs() < 1e-5);
}

#[tokio::test]
async fn index_tracks_store_through_mutations() {
    let (store, index) = setup();
    index.build(true).await.unwrap();

    let steps: Vec<(&str, &str, [f32; 3])> = vec![
        ("create", "alice", [1.0, 0.0, 0.0]),
        ("create", "bob", [0.0, 1.0, 0.0]),
        ("create", "carol", [0.0, 0.0, 1.0]),
        ("reenroll", "bob", [0.5, 0.5, 0.0]),
        ("remove", "alice", [0.0; 3]),
        ("create", "dave", [1.0, 1.0, 1.0]),
        ("reenroll", "dave", [-1.0, 0.0, 0.0]),
        ("remove", "carol", [0.0; 3]),
        ("create", "alice", [0.2, 0.1, 0.9]),
    ];

    for (op, ident, v) in steps {
        match op {
            "create" => create(&store, &index, ident, &v).await,
            "reenroll" => reenroll(&store, &index, ident, &v).await,
            "remove" => remove(&store, &index, ident).await,
            _ => unreachable!(),
        }
        assert_eq!(
            indexed_idents(&index).await,
            stored_idents(&store).await,
            "index diverged after {} {}",
            op,
            ident
        );
    }

    let hits = index.search(&[-1.0, 0.0, 0.0], 1).await;
    assert_eq!(hits[0].ident, "dave");
}

#[tokio::test]
async fn people_without_embeddings_never_enter_the_index() {
    let (store, index) = setup();
    store.insert_person(&person("plain", None)).await.unwrap();
    create(&store, &index, "faced", &[1.0, 0.0]).await;

    index.build(true).await.unwrap();
    assert_eq!(index.idents().await, vec!["faced"]);
}

#[tokio::test]
async fn search_results_are_bounded_and_ordered() {
    let (store, index) = setup();
    let vectors: [[f32; 2]; 6] = [
        [1.0, 0.0],
        [0.9, 0.1],
        [0.5, 0.5],
        [0.0, 1.0],
        [-0.5, 0.5],
        [-1.0, 0.0],
    ];
    for (i, v) in vectors.iter().enumerate() {
        create(&store, &index, &format!("p{}", i), v).await;
    }

    for top_k in [1, 3, 6, 20] {
        let hits = index.search(&[1.0, 0.05], top_k).await;
        assert_eq!(hits.len(), top_k.min(vectors.len()));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|m| (-1.0 - 1e-5..=1.0 + 1e-5).contains(&m.score)));
    }
    assert_eq!(index.search(&[1.0, 0.05], 1).await[0].ident, "p0");
}

#[tokio::test]
async fn empty_index_returns_no_matches() {
    let (_store, index) = setup();
    assert!(index.search(&[1.0, 0.0], 5).await.is_empty());

    let stats = index.stats().await;
    assert_eq!(stats.status, IndexStatus::NotInitialized);
    assert_eq!(stats.total_embeddings, 0);
}

#[tokio::test]
async fn removing_last_identity_empties_the_index() {
    let (store, index) = setup();
    create(&store, &index, "only", &[0.0, 1.0]).await;
    remove(&store, &index, "only").await;

    assert!(index.idents().await.is_empty());
    assert!(index.search(&[0.0, 1.0], 3).await.is_empty());
}

#[tokio::test]
async fn stale_rebuild_picks_up_out_of_band_writes() {
    let (store, index) = setup();
    create(&store, &index, "a", &[1.0, 0.0]).await;

    // Written straight to the store, bypassing the index.
    store
        .insert_person(&person("b", Some(&[0.0, 1.0][..])))
        .await
        .unwrap();
    assert_eq!(index.rebuild_if_stale(60).await, IndexMutation::Unchanged);
    assert_eq!(index.idents().await, vec!["a"]);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(index.rebuild_if_stale(0).await, IndexMutation::Rebuilt);
    assert_eq!(
        indexed_idents(&index).await,
        stored_idents(&store).await
    );
}
