//! Performance benchmarks for catalog parsing and merging
//! Target: a full catalog merge well under one frame on device

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use modsync_core::compat::CompatTable;
use modsync_core::model::{CatalogEntry, ModuleMetadata};
use modsync_core::props::{read_properties, PropMode};
use modsync_core::repo::{merge_entry, ModuleMap, PREMIUM_REPO_ID};

const MODULE_PROP: &str = r#"id=zygisk_demo
name=Zygisk Demo Module
version=v2.4.1 (release)
versionCode=2410
author=Demo Author
description=A realistic module descriptor with every commonly used field set
minApi=26
maxApi=34
minMagisk=24000
needRamdisk=false
changeBoot=false
support=https://example.com/support
donate=https://example.com/donate
config=com.example.demo
updateJson=https://example.com/update.json
"#;

fn benchmark_read_properties(c: &mut Criterion) {
    let compat = CompatTable::new();

    c.bench_function("read_properties_remote", |b| {
        b.iter(|| {
            let mut meta = ModuleMetadata::new("zygisk_demo");
            let result = read_properties(
                &mut meta,
                black_box(MODULE_PROP),
                "bench",
                PropMode::Remote,
                &compat,
            );
            black_box((result, meta))
        })
    });

    c.bench_function("read_properties_local", |b| {
        b.iter(|| {
            let mut meta = ModuleMetadata::new("zygisk_demo");
            let result = read_properties(
                &mut meta,
                black_box(MODULE_PROP),
                "bench",
                PropMode::Local,
                &compat,
            );
            black_box((result, meta))
        })
    });
}

fn catalog(repo_id: &str, count: usize, version_code: i64) -> Vec<CatalogEntry> {
    (0..count)
        .map(|i| {
            let mut entry = CatalogEntry::new(repo_id, format!("module_{i}"));
            entry.meta.version_code = version_code + (i % 7) as i64;
            entry
        })
        .collect()
}

fn benchmark_merge(c: &mut Criterion) {
    let alt = catalog("magisk_alt_repo", 1000, 10);
    let custom = catalog("repo_bench", 1000, 12);
    let premium = catalog(PREMIUM_REPO_ID, 500, 1);

    c.bench_function("merge_2500_entries", |b| {
        b.iter(|| {
            let mut map = ModuleMap::new();
            for entry in alt.iter().chain(&custom).chain(&premium) {
                merge_entry(&mut map, entry.clone(), true);
            }
            black_box(map)
        })
    });
}

criterion_group!(benches, benchmark_read_properties, benchmark_merge);
criterion_main!(benches);
