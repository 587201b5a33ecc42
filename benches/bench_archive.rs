/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use heapsnap::demo::{self, DemoGraph, DUMP_HEAP_BASE};
use heapsnap::dump::{dump_archive, HeapDump};
use heapsnap::gc::runtime_heap::RuntimeHeapConfig;
use heapsnap::prelude::*;
use std::path::Path;

const NODES: usize = 20_000;
const HEAP_SIZE: usize = 64 * 1024 * 1024;

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

fn encoding() -> OopEncoding {
    OopEncoding::Compressed(NarrowOopEncoding::heap_based(
        DUMP_HEAP_BASE,
        3,
        heapsnap_os::page_size() as u64,
    ))
}

fn dump(graph: &DemoGraph, path: &Path) {
    let config = DumpConfig::default();
    let metadata = DemoGraph::metadata(config.core_region_alignment as u64);
    dump_archive(
        path,
        &config,
        Some(HeapDump {
            heap: &graph.heap,
            selection: &graph.selection,
            relocator: &graph.relocator,
        }),
        metadata,
    )
    .unwrap();
}

fn map_or_load(path: &Path, can_map: bool, workers: usize) -> LoadedHeap {
    let (klasses, _) = demo::demo_klasses(4);
    let config = RuntimeHeapConfig {
        heap_size: HEAP_SIZE,
        oop_shift: Some(3),
        can_map,
        ..RuntimeHeapConfig::default()
    };
    let mut heap = RuntimeHeap::new(klasses, &config).unwrap();
    let options = LoadOptions::default().with_workers(workers);
    let mut info = FileMapInfo::open(path, ArchiveKind::Static, &options.vm_ident, options.verify).unwrap();
    ArchiveHeapLoader::new(options)
        .map_or_load(&mut info, &mut heap)
        .unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.jsa");
    let graph = DemoGraph::build(encoding(), DUMP_HEAP_BASE, HEAP_SIZE, NODES).unwrap();

    c.bench_function("dump", |b| b.iter(|| dump(black_box(&graph), &path)));
    dump(&graph, &path);
    c.bench_function("map", |b| b.iter(|| black_box(map_or_load(&path, true, 1))));
    c.bench_function("load", |b| b.iter(|| black_box(map_or_load(&path, false, 1))));
    c.bench_function("load-4-threads", |b| {
        b.iter(|| black_box(map_or_load(&path, false, 4)))
    });
}
