//! A Portal indicates a pathable gateway from one chunk to another. Each side
//! of a chunk can have multiple portals if the shared edge is 'split' by
//! impassable cost values. Portals are discovered by walking each shared edge
//! for maximal runs of tiles that are passable on both sides and emitting one
//! portal per run.
//!
//! A portal never stores an owning reference to its twin in the neighbouring
//! chunk. Instead it records the `(chunk, index)` of the peer and peers are
//! resolved through the chunk portal table on access.
//!

use std::collections::BTreeMap;

use crate::prelude::*;
use bevy::prelude::*;

/// Address of a portal within [ChunkPortals], the arena+index handle used in
/// place of reciprocal pointers
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Reflect)]
pub struct PortalRef {
	/// Chunk owning the portal
	pub chunk: ChunkID,
	/// Index into the owning chunks portal list
	pub index: usize,
}

/// A pathable window along one side of a chunk
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug)]
pub struct Portal {
	/// Side of the owning chunk the window lies along
	side: Ordinal,
	/// Inclusive endpoint cells of the window within the owning chunk
	endpoints: (FieldCell, FieldCell),
	/// The twin portal in the adjacent chunk
	peer: PortalRef,
	/// Currently usable `(own local island, neighbour local island)`
	/// transitions across the window
	transitions: Vec<(u16, u16)>,
}

impl Portal {
	/// Side of the owning chunk the window lies along
	pub fn get_side(&self) -> Ordinal {
		self.side
	}
	/// Inclusive endpoint cells of the window
	pub fn get_endpoints(&self) -> (FieldCell, FieldCell) {
		self.endpoints
	}
	/// The twin portal in the adjacent chunk
	pub fn get_peer(&self) -> PortalRef {
		self.peer
	}
	/// Currently usable island transitions
	pub fn get_transitions(&self) -> &[(u16, u16)] {
		&self.transitions
	}
	/// Whether the `(from, to)` local island transition is usable
	pub fn transition_usable(&self, from_iid: u16, to_iid: u16) -> bool {
		self.transitions.iter().any(|t| *t == (from_iid, to_iid))
	}
	/// The local islands present on the owning side of the window
	pub fn own_islands(&self) -> Vec<u16> {
		let mut out: Vec<u16> = self.transitions.iter().map(|t| t.0).collect();
		out.sort_unstable();
		out.dedup();
		out
	}
	/// Every cell of the window within the owning chunk
	pub fn window_cells(&self) -> Vec<FieldCell> {
		let (a, b) = self.endpoints;
		let mut out = Vec::new();
		for column in a.get_column()..=b.get_column() {
			for row in a.get_row()..=b.get_row() {
				out.push(FieldCell::new(column, row));
			}
		}
		out
	}
	/// Centre cell of the window
	pub fn midpoint_cell(&self) -> FieldCell {
		let (a, b) = self.endpoints;
		FieldCell::new(
			(a.get_column() + b.get_column()) / 2,
			(a.get_row() + b.get_row()) / 2,
		)
	}
	/// World-space centre of the window
	pub fn center(&self, map: &MapDimensions, chunk: ChunkID) -> Vec2 {
		map.tile_center(TileDesc::new(chunk, self.midpoint_cell()))
	}
}

/// The portals of every chunk on every [NavLayer], linked into an N-way graph
/// by [PortalRef] peers
#[derive(Component, Default)]
pub struct ChunkPortals {
	/// Portal lists indexed by layer then keyed by chunk
	layers: Vec<BTreeMap<ChunkID, Vec<Portal>>>,
}

impl ChunkPortals {
	/// Create an empty portal table covering every chunk of the map
	pub fn new(map: &MapDimensions) -> Self {
		let mut layers = Vec::with_capacity(NAV_LAYER_COUNT);
		for _ in 0..NAV_LAYER_COUNT {
			let mut table = BTreeMap::new();
			for row in 0..map.chunk_rows() {
				for column in 0..map.chunk_columns() {
					table.insert(ChunkID::new(column, row), Vec::new());
				}
			}
			layers.push(table);
		}
		ChunkPortals { layers }
	}
	/// Get the portal list of a chunk
	pub fn get(&self, layer: NavLayer, chunk: ChunkID) -> &Vec<Portal> {
		self.layers[layer.index()]
			.get(&chunk)
			.expect("Portal table covers every chunk")
	}
	/// Resolve a [PortalRef] to the portal it addresses
	pub fn resolve(&self, layer: NavLayer, portal: PortalRef) -> &Portal {
		&self.get(layer, portal.chunk)[portal.index]
	}
	/// Rebuild the portals of a layer from the chunk cost data and refresh
	/// the island transition tables. Should run after an island repaint
	pub fn rebuild_layer(&mut self, map: &MapDimensions, chunks: &NavChunks, layer: NavLayer) {
		let table = &mut self.layers[layer.index()];
		for list in table.values_mut() {
			list.clear();
		}
		// walk each shared edge once, the eastern and southern edges of every
		// chunk, emitting the twin portals into both chunks as we go
		for row in 0..map.chunk_rows() {
			for column in 0..map.chunk_columns() {
				let chunk_id = ChunkID::new(column, row);
				if column + 1 < map.chunk_columns() {
					let east_id = ChunkID::new(column + 1, row);
					let runs = edge_runs(map, chunks, layer, chunk_id, east_id, Ordinal::East);
					for (start, end) in runs {
						link_pair(
							table,
							chunk_id,
							east_id,
							Ordinal::East,
							(
								FieldCell::new(FIELD_RESOLUTION - 1, start),
								FieldCell::new(FIELD_RESOLUTION - 1, end),
							),
							(FieldCell::new(0, start), FieldCell::new(0, end)),
						);
					}
				}
				if row + 1 < map.chunk_rows() {
					let south_id = ChunkID::new(column, row + 1);
					let runs = edge_runs(map, chunks, layer, chunk_id, south_id, Ordinal::South);
					for (start, end) in runs {
						link_pair(
							table,
							chunk_id,
							south_id,
							Ordinal::South,
							(
								FieldCell::new(start, FIELD_RESOLUTION - 1),
								FieldCell::new(end, FIELD_RESOLUTION - 1),
							),
							(FieldCell::new(start, 0), FieldCell::new(end, 0)),
						);
					}
				}
			}
		}
		self.refresh_transitions(map, chunks, layer);
	}
	/// Recompute the usable `(own island, neighbour island)` pairs of every
	/// portal on the layer from the current island labels
	pub fn refresh_transitions(&mut self, map: &MapDimensions, chunks: &NavChunks, layer: NavLayer) {
		let table = &mut self.layers[layer.index()];
		for (chunk_id, portals) in table.iter_mut() {
			let own_chunk = chunks.get_chunk(map, layer, *chunk_id);
			for portal in portals.iter_mut() {
				portal.transitions.clear();
				let (dc, dr) = portal.side.delta();
				let neighb_chunk = chunks.get_chunk(map, layer, portal.peer.chunk);
				for cell in portal.window_cells() {
					if !own_chunk.tile_passable(cell) {
						continue;
					}
					let mut across = TileDesc::new(*chunk_id, cell);
					if !map.relative_tile_desc(&mut across, dc, dr) {
						continue;
					}
					if !neighb_chunk.tile_passable(across.cell) {
						continue;
					}
					let pair = (
						own_chunk.get_local_island(cell),
						neighb_chunk.get_local_island(across.cell),
					);
					if !portal.transitions.contains(&pair) {
						portal.transitions.push(pair);
					}
				}
			}
		}
	}
}

/// Maximal runs along a shared chunk edge where the tiles on both sides are
/// statically passable. Returned as inclusive `(start, end)` offsets along
/// the edge
fn edge_runs(
	map: &MapDimensions,
	chunks: &NavChunks,
	layer: NavLayer,
	chunk_id: ChunkID,
	neighbour_id: ChunkID,
	side: Ordinal,
) -> Vec<(usize, usize)> {
	let own = chunks.get_chunk(map, layer, chunk_id);
	let neighbour = chunks.get_chunk(map, layer, neighbour_id);
	let mut runs = Vec::new();
	let mut run_start: Option<usize> = None;
	for offset in 0..FIELD_RESOLUTION {
		let (own_cell, neighb_cell) = match side {
			Ordinal::East => (
				FieldCell::new(FIELD_RESOLUTION - 1, offset),
				FieldCell::new(0, offset),
			),
			Ordinal::South => (
				FieldCell::new(offset, FIELD_RESOLUTION - 1),
				FieldCell::new(offset, 0),
			),
			_ => panic!("Edges are walked from their eastern/southern owner"),
		};
		let open = own.get_cost(own_cell) != COST_IMPASSABLE
			&& neighbour.get_cost(neighb_cell) != COST_IMPASSABLE;
		match (open, run_start) {
			(true, None) => run_start = Some(offset),
			(false, Some(start)) => {
				runs.push((start, offset - 1));
				run_start = None;
			}
			_ => {}
		}
	}
	if let Some(start) = run_start {
		runs.push((start, FIELD_RESOLUTION - 1));
	}
	runs
}

/// Emit a twin pair of portals into the table linking each to the other
fn link_pair(
	table: &mut BTreeMap<ChunkID, Vec<Portal>>,
	own_id: ChunkID,
	neighbour_id: ChunkID,
	side: Ordinal,
	own_window: (FieldCell, FieldCell),
	neighbour_window: (FieldCell, FieldCell),
) {
	let own_index = table.get(&own_id).map_or(0, |v| v.len());
	let neighbour_index = table.get(&neighbour_id).map_or(0, |v| v.len());
	table.get_mut(&own_id).expect("chunk known").push(Portal {
		side,
		endpoints: own_window,
		peer: PortalRef {
			chunk: neighbour_id,
			index: neighbour_index,
		},
		transitions: Vec::new(),
	});
	table
		.get_mut(&neighbour_id)
		.expect("chunk known")
		.push(Portal {
			side: side.inverse(),
			endpoints: neighbour_window,
			peer: PortalRef {
				chunk: own_id,
				index: own_index,
			},
			transitions: Vec::new(),
		});
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn setup() -> (MapDimensions, NavChunks) {
		let map = MapDimensions::new(128, 128);
		let chunks = NavChunks::new(&map);
		(map, chunks)
	}
	#[test]
	fn open_edge_single_portal() {
		let (map, chunks) = setup();
		let mut portals = ChunkPortals::new(&map);
		portals.rebuild_layer(&map, &chunks, NavLayer::Ground1x1);
		// an interior chunk of a fully open 2x2 chunk map has 2 portals
		// (boundary sides have no neighbour)
		let list = portals.get(NavLayer::Ground1x1, ChunkID::new(0, 0));
		assert_eq!(2, list.len());
		// the whole edge forms one window
		let east = list.iter().find(|p| p.get_side() == Ordinal::East).unwrap();
		assert_eq!(
			(
				FieldCell::new(FIELD_RESOLUTION - 1, 0),
				FieldCell::new(FIELD_RESOLUTION - 1, FIELD_RESOLUTION - 1)
			),
			east.get_endpoints()
		);
	}
	#[test]
	fn peer_links_are_reciprocal() {
		let (map, chunks) = setup();
		let mut portals = ChunkPortals::new(&map);
		portals.rebuild_layer(&map, &chunks, NavLayer::Ground1x1);
		for row in 0..map.chunk_rows() {
			for column in 0..map.chunk_columns() {
				let chunk_id = ChunkID::new(column, row);
				for (index, portal) in portals.get(NavLayer::Ground1x1, chunk_id).iter().enumerate() {
					let peer = portals.resolve(NavLayer::Ground1x1, portal.get_peer());
					assert_eq!(
						PortalRef { chunk: chunk_id, index },
						peer.get_peer()
					);
					assert_eq!(portal.get_side().inverse(), peer.get_side());
				}
			}
		}
	}
	#[test]
	fn blocked_edge_splits_portal() {
		let (map, mut chunks) = setup();
		// close the middle of the eastern edge of chunk (0, 0)
		for row in 20..=40 {
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, ChunkID::new(0, 0))
				.set_cost(FieldCell::new(FIELD_RESOLUTION - 1, row), COST_IMPASSABLE);
		}
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let mut portals = ChunkPortals::new(&map);
		portals.rebuild_layer(&map, &chunks, NavLayer::Ground1x1);
		let list = portals.get(NavLayer::Ground1x1, ChunkID::new(0, 0));
		let east: Vec<&Portal> = list.iter().filter(|p| p.get_side() == Ordinal::East).collect();
		assert_eq!(2, east.len());
		assert_eq!(
			(
				FieldCell::new(FIELD_RESOLUTION - 1, 0),
				FieldCell::new(FIELD_RESOLUTION - 1, 19)
			),
			east[0].get_endpoints()
		);
	}
	#[test]
	fn transitions_follow_local_islands() {
		let (map, mut chunks) = setup();
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let mut portals = ChunkPortals::new(&map);
		portals.rebuild_layer(&map, &chunks, NavLayer::Ground1x1);
		let list = portals.get(NavLayer::Ground1x1, ChunkID::new(0, 0));
		let east = list.iter().find(|p| p.get_side() == Ordinal::East).unwrap();
		// an open map has exactly one island either side
		assert_eq!(1, east.get_transitions().len());
		assert!(east.transition_usable(east.get_transitions()[0].0, east.get_transitions()[0].1));
	}
}
