//! Measure building the integration field of a single chunk, open terrain
//! and a walled maze variant
//!

use bevy_rts_nav_plugin::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// Create the navigation state before benchmarking
fn prepare_open(map_length: u32, map_depth: u32) -> (MapDimensions, NavChunks) {
	let map = MapDimensions::new(map_length, map_depth);
	let chunks = NavChunks::new(&map);
	(map, chunks)
}

/// Like [prepare_open] but with walls snaking through the chunk
fn prepare_maze(map_length: u32, map_depth: u32) -> (MapDimensions, NavChunks) {
	let map = MapDimensions::new(map_length, map_depth);
	let mut chunks = NavChunks::new(&map);
	for wall in (4..FIELD_RESOLUTION - 4).step_by(8) {
		let gap = if (wall / 8) % 2 == 0 { 0 } else { FIELD_RESOLUTION - 4 };
		for row in 0..FIELD_RESOLUTION {
			if row >= gap && row < gap + 4 {
				continue;
			}
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, ChunkID::new(0, 0))
				.set_cost(FieldCell::new(wall, row), COST_IMPASSABLE);
		}
	}
	chunks.repaint_islands(&map, NavLayer::Ground1x1);
	(map, chunks)
}

fn calc_integration(map: &MapDimensions, chunks: &NavChunks) {
	let builder = FieldBuilder::new(map, chunks, NavLayer::Ground1x1);
	let goal = FieldCell::new(FIELD_RESOLUTION / 2, FIELD_RESOLUTION / 2);
	let _ = builder.chunk_integration(ChunkID::new(0, 0), &[(goal, 0.0)]);
}

pub fn criterion_benchmark(c: &mut Criterion) {
	let mut group = c.benchmark_group("algorithm_use");
	group.significance_level(0.05).sample_size(100);
	let (map, chunks) = prepare_open(128, 128);
	group.bench_function("calc_integration_open", |b| {
		b.iter(|| calc_integration(black_box(&map), black_box(&chunks)))
	});
	let (map, chunks) = prepare_maze(128, 128);
	group.bench_function("calc_integration_maze", |b| {
		b.iter(|| calc_integration(black_box(&map), black_box(&chunks)))
	});
	group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
