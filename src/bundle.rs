//! Defines a bundle which can be spawned as/inserted into an entity holding
//! the whole navigation and movement core of one map
//!

use crate::prelude::*;
use bevy::prelude::*;

/// All components of the movement core: the navigation grid, portals, field
/// cache, formations, per-agent movement tables and the command queue
#[derive(Bundle)]
pub struct NavigationBundle {
	/// Size of the world
	map_dimensions: MapDimensions,
	/// Per-layer cost/blocker/island chunks
	nav_chunks: NavChunks,
	/// Portals of every chunk linked into the routing graph
	chunk_portals: ChunkPortals,
	/// Cache of computed flow and line-of-sight fields
	field_cache: FieldCache,
	/// Live formations and their cell assignments
	formations: Formations,
	/// Per-agent movement records and flocks
	move_states: MoveStates,
	/// Deferred mutating operations applied at tick boundaries
	command_queue: CommandQueue,
}

impl NavigationBundle {
	/// Create a new instance of [NavigationBundle] based on map dimensions
	pub fn new(map_length: u32, map_depth: u32) -> Self {
		let map_dimensions = MapDimensions::new(map_length, map_depth);
		let nav_chunks = NavChunks::new(&map_dimensions);
		let mut chunk_portals = ChunkPortals::new(&map_dimensions);
		for layer in NavLayer::all() {
			chunk_portals.rebuild_layer(&map_dimensions, &nav_chunks, layer);
		}
		NavigationBundle {
			map_dimensions,
			nav_chunks,
			chunk_portals,
			field_cache: FieldCache::default(),
			formations: Formations::default(),
			move_states: MoveStates::default(),
			command_queue: CommandQueue::default(),
		}
	}
	/// Create a new instance of [NavigationBundle] with the base terrain
	/// costs applied before portals are derived. `costs` pairs a tile with
	/// its cost value
	pub fn with_costs(map_length: u32, map_depth: u32, costs: &[(TileDesc, u8)]) -> Self {
		let map_dimensions = MapDimensions::new(map_length, map_depth);
		let mut nav_chunks = NavChunks::new(&map_dimensions);
		for (td, value) in costs.iter() {
			nav_chunks.set_base_cost(&map_dimensions, *td, *value);
		}
		for layer in NavLayer::all() {
			nav_chunks.repaint_islands(&map_dimensions, layer);
		}
		let mut chunk_portals = ChunkPortals::new(&map_dimensions);
		for layer in NavLayer::all() {
			chunk_portals.rebuild_layer(&map_dimensions, &nav_chunks, layer);
		}
		NavigationBundle {
			map_dimensions,
			nav_chunks,
			chunk_portals,
			field_cache: FieldCache::default(),
			formations: Formations::default(),
			move_states: MoveStates::default(),
			command_queue: CommandQueue::default(),
		}
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn valid_map_dimensions() {
		let _map_dimensions = MapDimensions::new(128, 128);
	}
	#[test]
	#[should_panic]
	fn invalid_map_dimensions() {
		MapDimensions::new(99, 3);
	}
	#[test]
	fn new_bundle() {
		let _ = NavigationBundle::new(128, 128);
	}
	#[test]
	fn bundle_with_costs_splits_portals() {
		let wall: Vec<(TileDesc, u8)> = (20..=40)
			.map(|row| {
				(
					TileDesc::new(ChunkID::new(0, 0), FieldCell::new(63, row)),
					COST_IMPASSABLE,
				)
			})
			.collect();
		let bundle = NavigationBundle::with_costs(128, 128, &wall);
		let east: Vec<&Portal> = bundle
			.chunk_portals
			.get(NavLayer::Ground1x1, ChunkID::new(0, 0))
			.iter()
			.filter(|portal| portal.get_side() == Ordinal::East)
			.collect();
		assert_eq!(2, east.len());
	}
}
