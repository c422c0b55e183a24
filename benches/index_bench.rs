use criterion::{criterion_group, criterion_main, Criterion};
use pagevault::btree::PrefixBTree;
use pagevault::{StorageConfig, StorageEngine};
use tempfile::TempDir;

fn btree_insert_benchmark(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(StorageConfig {
        data_dir: dir.path().to_path_buf(),
        page_size: 65536,
        cache_pages: 512,
        ..StorageConfig::default()
    })
    .unwrap();
    let tree = PrefixBTree::create(engine, "bench", false).unwrap();

    let mut i = 0u64;
    c.bench_function("btree_put", |b| {
        b.iter(|| {
            tree.put(Some(&format!("key:{i:012}")), &i.to_be_bytes())
                .unwrap();
            i += 1;
        })
    });

    c.bench_function("btree_get", |b| {
        b.iter(|| tree.get(Some("key:000000000100")).unwrap())
    });
}

criterion_group!(benches, btree_insert_benchmark);
criterion_main!(benches);
