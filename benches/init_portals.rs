//! Measure discovering the portals of every chunk of a map
//!

use bevy_rts_nav_plugin::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// Create the navigation state before benchmarking
fn prepare(map_length: u32, map_depth: u32) -> (MapDimensions, NavChunks) {
	let map = MapDimensions::new(map_length, map_depth);
	let chunks = NavChunks::new(&map);
	(map, chunks)
}

fn init_portals(map: &MapDimensions, chunks: &NavChunks) {
	let mut portals = ChunkPortals::new(map);
	portals.rebuild_layer(map, chunks, NavLayer::Ground1x1);
}

pub fn criterion_benchmark(c: &mut Criterion) {
	let mut group = c.benchmark_group("data_initialisation");
	group.significance_level(0.05).sample_size(100);
	let (map, chunks) = prepare(512, 512);
	group.bench_function("init_portals", |b| {
		b.iter(|| init_portals(black_box(&map), black_box(&chunks)))
	});
	group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
