use hybriddb_core::ann::{self, Ann};
use hybriddb_core::config::{Backend, IndexConfig};
use hybriddb_core::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

fn config(backend: Backend) -> IndexConfig {
    let mut config = IndexConfig::new(backend);
    config.hnsw.efsearch = Some(200);
    config
}

#[test]
fn self_similarity_on_both_backends() {
    init_tracing();
    let vectors = random_vectors(200, 16, 11);
    for backend in [Backend::Hnsw, Backend::Annoy] {
        let mut index = ann::create(config(backend));
        index.index(&vectors).unwrap();
        assert_eq!(index.count(), 200);

        let results = index.search(&vectors, 1).unwrap();
        for (label, hits) in results.iter().enumerate() {
            assert_eq!(hits[0].0, label as u32, "{} backend", backend);
            assert!((hits[0].1 - 1.0).abs() < 1e-4);
        }
    }
}

#[test]
fn results_are_ranked_by_descending_score() {
    let vectors = random_vectors(150, 8, 5);
    let queries = random_vectors(5, 8, 6);
    for backend in [Backend::Hnsw, Backend::Annoy] {
        let mut index = ann::create(config(backend));
        index.index(&vectors).unwrap();
        for hits in index.search(&queries, 10).unwrap() {
            assert!(hits.len() <= 10);
            for pair in hits.windows(2) {
                assert!(pair[0].1 > pair[1].1 || (pair[0].1 == pair[1].1 && pair[0].0 < pair[1].0));
            }
        }
    }
}

#[test]
fn save_load_roundtrip_preserves_search() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(120, 12, 21);
    let queries = random_vectors(8, 12, 22);

    for backend in [Backend::Hnsw, Backend::Annoy] {
        let path = dir.path().join(format!("{}.idx", backend));
        let mut index = ann::create(config(backend));
        index.index(&vectors).unwrap();
        if index.capabilities().delete {
            index.delete(&[3, 7, 50]).unwrap();
        }
        index.save(&path).unwrap();

        let loaded = ann::load(config(backend), &path).unwrap();
        assert_eq!(loaded.count(), index.count());
        assert_eq!(loaded.offset(), index.offset());
        assert_eq!(loaded.config().dimensions, Some(12));
        assert_eq!(
            loaded.search(&queries, 5).unwrap(),
            index.search(&queries, 5).unwrap()
        );
    }
}

#[test]
fn save_is_repeatable_after_append_and_delete() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hnsw");
    let mut index = ann::create(config(Backend::Hnsw));
    index.index(&random_vectors(30, 4, 1)).unwrap();
    index.save(&path).unwrap();

    index.append(&random_vectors(10, 4, 2)).unwrap();
    index.delete(&[0, 35]).unwrap();
    index.save(&path).unwrap();
    index.save(&path).unwrap();

    let loaded = ann::load(config(Backend::Hnsw), &path).unwrap();
    assert_eq!(loaded.count(), 38);
    assert_eq!(loaded.offset(), 40);
}

#[test]
fn incremental_delete_is_idempotent_and_hidden() {
    let vectors = random_vectors(100, 8, 3);
    let mut index = ann::create(config(Backend::Hnsw));
    index.index(&vectors).unwrap();

    assert_eq!(index.delete(&[10, 20, 10]).unwrap(), 2);
    assert_eq!(index.count(), 98);
    assert_eq!(index.delete(&[10, 1000]).unwrap(), 0);
    assert_eq!(index.count(), 98);

    let results = index.search(&[vectors[10].clone(), vectors[20].clone()], 20).unwrap();
    for hits in results {
        assert!(hits.iter().all(|&(label, _)| label != 10 && label != 20));
    }
}

#[test]
fn append_continues_label_sequence() {
    let first = random_vectors(100, 8, 8);
    let second = random_vectors(50, 8, 9);
    let mut index = ann::create(config(Backend::Hnsw));
    index.index(&first).unwrap();
    index.append(&second).unwrap();
    assert_eq!(index.offset(), 150);
    assert_eq!(index.count(), 150);

    let results = index.search(&second, 1).unwrap();
    for (i, hits) in results.iter().enumerate() {
        assert_eq!(hits[0].0, 100 + i as u32);
    }
    let results = index.search(&first[..10], 1).unwrap();
    for (i, hits) in results.iter().enumerate() {
        assert_eq!(hits[0].0, i as u32);
    }
}

#[test]
fn append_after_delete_stays_searchable() {
    let mut index = ann::create(config(Backend::Hnsw));
    let first = random_vectors(40, 6, 30);
    index.index(&first).unwrap();
    index.delete(&(0..30).collect::<Vec<u32>>()).unwrap();

    let second = random_vectors(10, 6, 31);
    index.append(&second).unwrap();
    let results = index.search(&second, 1).unwrap();
    for (i, hits) in results.iter().enumerate() {
        assert_eq!(hits[0].0, 40 + i as u32);
    }
}

#[test]
fn static_backend_rejects_growth_and_delete() {
    let mut index = ann::create(config(Backend::Annoy));
    index.index(&random_vectors(20, 4, 4)).unwrap();
    assert!(matches!(
        index.append(&random_vectors(1, 4, 5)),
        Err(Error::UnsupportedOperation { .. })
    ));
    assert!(matches!(
        index.delete(&[1]),
        Err(Error::UnsupportedOperation { .. })
    ));

    // Growth means rebuilding with the full set
    index.index(&random_vectors(25, 4, 4)).unwrap();
    assert_eq!(index.count(), 25);
    assert_eq!(index.offset(), 25);
}

#[test]
fn load_rejects_mismatched_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idx");
    let mut index = ann::create(config(Backend::Hnsw));
    index.index(&random_vectors(10, 4, 1)).unwrap();
    index.save(&path).unwrap();

    let mut wrong = config(Backend::Hnsw);
    wrong.dimensions = Some(8);
    assert!(matches!(
        ann::load(wrong, &path),
        Err(Error::ConfigMismatch { field: "dimensions", .. })
    ));

    // A blob written by the other backend is unreadable, not misinterpreted
    assert!(matches!(
        ann::load(config(Backend::Annoy), &path),
        Err(Error::CorruptIndex(_))
    ));
}

#[test]
fn load_rejects_corrupt_blob() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idx");
    let mut index = ann::create(config(Backend::Annoy));
    index.index(&random_vectors(10, 4, 1)).unwrap();
    index.save(&path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        ann::load(config(Backend::Annoy), &path),
        Err(Error::CorruptIndex(_))
    ));
}
