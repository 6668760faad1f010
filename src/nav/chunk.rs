//! Per-layer navigation chunks. Each chunk holds the static terrain cost of
//! its tiles, a reference count of dynamic blockers (stationary units,
//! buildings), per-faction occupancy counts and the island labels used to
//! answer reachability queries in constant time.
//!
//! A tile is passable when its base cost is not [COST_IMPASSABLE] and no
//! dynamic blocker holds it. Tiles occupied exclusively by enemy factions are
//! treated as passable only by field builds whose goal is reaching an enemy.
//!

use std::collections::BTreeSet;

use crate::prelude::*;
use bevy::prelude::*;

/// Static cost and dynamic occupancy state of one chunk on one [NavLayer].
/// All arrays are indexed `[column][row]`
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone)]
pub struct NavChunk {
	/// Static terrain cost, `1..=254` traversable, 255 impassable
	cost_base: Vec<u8>,
	/// Reference count of dynamic blockers per tile
	blockers: Vec<u16>,
	/// Per-faction occupancy counts per tile
	factions: Vec<[u8; MAX_FACTIONS]>,
	/// Global connected-component label per tile
	islands: Vec<u16>,
	/// Connected-component label within just this chunk
	local_islands: Vec<u16>,
}

impl Default for NavChunk {
	fn default() -> Self {
		let nelems = FIELD_RESOLUTION * FIELD_RESOLUTION;
		NavChunk {
			cost_base: vec![COST_DEFAULT; nelems],
			blockers: vec![0; nelems],
			factions: vec![[0; MAX_FACTIONS]; nelems],
			islands: vec![ISLAND_NONE; nelems],
			local_islands: vec![ISLAND_NONE; nelems],
		}
	}
}

/// Flat index of a cell within the chunk arrays
#[inline]
fn idx(cell: FieldCell) -> usize {
	cell.get_column() * FIELD_RESOLUTION + cell.get_row()
}

impl NavChunk {
	/// Retrieve the base cost of a tile
	pub fn get_cost(&self, cell: FieldCell) -> u8 {
		self.cost_base[idx(cell)]
	}
	/// Set the base cost of a tile
	pub fn set_cost(&mut self, cell: FieldCell, value: u8) {
		self.cost_base[idx(cell)] = value;
	}
	/// Current blocker reference count of a tile
	pub fn get_blockers(&self, cell: FieldCell) -> u16 {
		self.blockers[idx(cell)]
	}
	/// Global island label of a tile
	pub fn get_island(&self, cell: FieldCell) -> u16 {
		self.islands[idx(cell)]
	}
	/// Local island label of a tile
	pub fn get_local_island(&self, cell: FieldCell) -> u16 {
		self.local_islands[idx(cell)]
	}
	/// Bitmask of factions with at least one occupier on the tile
	pub fn occupying_factions(&self, cell: FieldCell) -> u16 {
		let mut mask = 0u16;
		for (faction, count) in self.factions[idx(cell)].iter().enumerate() {
			if *count > 0 {
				mask |= 1 << faction;
			}
		}
		mask
	}
	/// Register a dynamic blocker on the tile for the given faction
	pub fn add_blocker(&mut self, cell: FieldCell, faction_id: usize) {
		self.blockers[idx(cell)] = self.blockers[idx(cell)].saturating_add(1);
		if faction_id < MAX_FACTIONS {
			let counts = &mut self.factions[idx(cell)];
			counts[faction_id] = counts[faction_id].saturating_add(1);
		}
	}
	/// Release a dynamic blocker on the tile for the given faction
	pub fn remove_blocker(&mut self, cell: FieldCell, faction_id: usize) {
		self.blockers[idx(cell)] = self.blockers[idx(cell)].saturating_sub(1);
		if faction_id < MAX_FACTIONS {
			let counts = &mut self.factions[idx(cell)];
			counts[faction_id] = counts[faction_id].saturating_sub(1);
		}
	}
	/// A tile is passable when the terrain admits it and no blocker holds it
	pub fn tile_passable(&self, cell: FieldCell) -> bool {
		self.cost_base[idx(cell)] != COST_IMPASSABLE && self.blockers[idx(cell)] == 0
	}
	/// Like [NavChunk::tile_passable] but tiles held exclusively by factions
	/// within the `enemies` mask count as passable, used by builds whose goal
	/// is to reach an enemy
	pub fn tile_passable_no_enemies(&self, cell: FieldCell, enemies: u16) -> bool {
		if self.cost_base[idx(cell)] == COST_IMPASSABLE {
			return false;
		}
		if self.blockers[idx(cell)] == 0 {
			return true;
		}
		let occupying = self.occupying_factions(cell);
		occupying != 0 && (occupying & !enemies) == 0
	}
	/// Repaint the local island labels of this chunk. Labels are assigned
	/// from 0 in discovery order, blocked tiles get [ISLAND_NONE]
	pub fn repaint_local_islands(&mut self) {
		for value in self.local_islands.iter_mut() {
			*value = ISLAND_NONE;
		}
		let mut next_label = 0u16;
		for column in 0..FIELD_RESOLUTION {
			for row in 0..FIELD_RESOLUTION {
				let seed = FieldCell::new(column, row);
				if !self.tile_passable(seed) || self.local_islands[idx(seed)] != ISLAND_NONE {
					continue;
				}
				let mut stack = vec![seed];
				self.local_islands[idx(seed)] = next_label;
				while let Some(cell) = stack.pop() {
					for neighbour in cell.orthogonal_neighbours() {
						if self.tile_passable(neighbour)
							&& self.local_islands[idx(neighbour)] == ISLAND_NONE
						{
							self.local_islands[idx(neighbour)] = next_label;
							stack.push(neighbour);
						}
					}
				}
				next_label += 1;
			}
		}
	}
	/// Write a global island label, used by the map-wide repaint
	pub(crate) fn set_island(&mut self, cell: FieldCell, label: u16) {
		self.islands[idx(cell)] = label;
	}
}

/// All navigation chunks of the map across every [NavLayer] plus the dirty
/// bookkeeping that drives lazy island repaints and field cache invalidation
#[derive(Component)]
pub struct NavChunks {
	/// Chunk tables indexed `[layer][chunk row-major index]`
	layers: Vec<Vec<NavChunk>>,
	/// Chunks whose passability changed since the last repaint/invalidation
	dirty: Vec<BTreeSet<ChunkID>>,
	/// Set when a layers local islands (and thus portal reachability) are stale
	local_islands_dirty: Vec<bool>,
}

impl NavChunks {
	/// Create the chunk tables for a map, one [NavChunk] per chunk per layer
	pub fn new(map: &MapDimensions) -> Self {
		let count = (map.chunk_columns() * map.chunk_rows()) as usize;
		let mut layers = Vec::with_capacity(NAV_LAYER_COUNT);
		for _ in 0..NAV_LAYER_COUNT {
			layers.push(vec![NavChunk::default(); count]);
		}
		let mut chunks = NavChunks {
			layers,
			dirty: vec![BTreeSet::new(); NAV_LAYER_COUNT],
			local_islands_dirty: vec![false; NAV_LAYER_COUNT],
		};
		for layer in NavLayer::all() {
			chunks.repaint_islands(map, layer);
		}
		chunks
	}
	/// Get a reference to a chunk
	pub fn get_chunk(&self, map: &MapDimensions, layer: NavLayer, chunk: ChunkID) -> &NavChunk {
		&self.layers[layer.index()][map.chunk_index(chunk)]
	}
	/// Get a mutable reference to a chunk
	pub fn get_chunk_mut(
		&mut self,
		map: &MapDimensions,
		layer: NavLayer,
		chunk: ChunkID,
	) -> &mut NavChunk {
		&mut self.layers[layer.index()][map.chunk_index(chunk)]
	}
	/// Whether the tile is passable on the layer
	pub fn tile_passable(&self, map: &MapDimensions, layer: NavLayer, td: TileDesc) -> bool {
		self.get_chunk(map, layer, td.chunk).tile_passable(td.cell)
	}
	/// Whether the tile is passable treating enemy held tiles as open
	pub fn tile_passable_no_enemies(
		&self,
		map: &MapDimensions,
		layer: NavLayer,
		td: TileDesc,
		enemies: u16,
	) -> bool {
		self.get_chunk(map, layer, td.chunk)
			.tile_passable_no_enemies(td.cell, enemies)
	}
	/// Update the base cost of a tile on every layer, dilating the impassable
	/// marking outward on the larger-footprint layers
	pub fn set_base_cost(&mut self, map: &MapDimensions, td: TileDesc, value: u8) {
		for layer in NavLayer::all() {
			let covered = vec![td];
			let mut all = covered.clone();
			let mut frontier = covered;
			for _ in 0..layer.dilation_passes() {
				frontier = map.tile_contour(&frontier);
				all.extend(frontier.iter().copied());
			}
			for target in if value == COST_IMPASSABLE { all } else { vec![td] } {
				self.get_chunk_mut(map, layer, target.chunk)
					.set_cost(target.cell, value);
				self.mark_dirty(layer, target.chunk);
			}
		}
	}
	/// Register blockers over the disk covered by a stationary agent. The
	/// footprint is dilated by contour passes on the larger ground layers so
	/// gaps too narrow for wide units close up
	pub fn block_disk(
		&mut self,
		map: &MapDimensions,
		pos: Vec2,
		radius: f32,
		faction_id: usize,
	) {
		self.for_disk_tiles(map, pos, radius, |chunks, layer, td| {
			chunks
				.get_chunk_mut(map, layer, td.chunk)
				.add_blocker(td.cell, faction_id);
			chunks.mark_dirty(layer, td.chunk);
		});
	}
	/// Release blockers previously registered with [NavChunks::block_disk].
	/// Must be called with the same position and radius
	pub fn unblock_disk(
		&mut self,
		map: &MapDimensions,
		pos: Vec2,
		radius: f32,
		faction_id: usize,
	) {
		self.for_disk_tiles(map, pos, radius, |chunks, layer, td| {
			chunks
				.get_chunk_mut(map, layer, td.chunk)
				.remove_blocker(td.cell, faction_id);
			chunks.mark_dirty(layer, td.chunk);
		});
	}
	/// Visit the per-layer dilated tile sets of a disk footprint
	fn for_disk_tiles(
		&mut self,
		map: &MapDimensions,
		pos: Vec2,
		radius: f32,
		mut apply: impl FnMut(&mut Self, NavLayer, TileDesc),
	) {
		let covered = map.tiles_under_circle(pos, radius);
		if covered.is_empty() {
			return;
		}
		for layer in NavLayer::all() {
			let mut all = covered.clone();
			let mut frontier = covered.clone();
			for _ in 0..layer.dilation_passes() {
				frontier = map.tile_contour(&frontier);
				all.extend(frontier.iter().copied());
			}
			for td in all {
				apply(self, layer, td);
			}
		}
	}
	/// Record that a chunks passability changed
	pub fn mark_dirty(&mut self, layer: NavLayer, chunk: ChunkID) {
		self.dirty[layer.index()].insert(chunk);
		self.local_islands_dirty[layer.index()] = true;
	}
	/// Whether any chunk of the layer is awaiting an island repaint
	pub fn islands_dirty(&self, layer: NavLayer) -> bool {
		self.local_islands_dirty[layer.index()]
	}
	/// Take the dirty chunk set of a layer, leaving it empty. The caller is
	/// expected to invalidate cached fields referencing the returned chunks
	pub fn take_dirty(&mut self, layer: NavLayer) -> BTreeSet<ChunkID> {
		std::mem::take(&mut self.dirty[layer.index()])
	}
	/// Repaint local island labels of every dirty chunk and then relabel the
	/// global islands of the layer. Clears the dirty flag
	pub fn repaint_islands(&mut self, map: &MapDimensions, layer: NavLayer) {
		for chunk in self.layers[layer.index()].iter_mut() {
			chunk.repaint_local_islands();
		}
		// map-wide flood across chunk borders for the global labels
		let columns = map.get_length();
		let rows = map.get_depth();
		let nelems = (columns * rows) as usize;
		let mut labels = vec![ISLAND_NONE; nelems];
		let at = |gc: u32, gr: u32| (gr * columns + gc) as usize;
		let mut next_label = 0u16;
		for gr in 0..rows {
			for gc in 0..columns {
				let seed = TileDesc::from_global(gc, gr);
				if labels[at(gc, gr)] != ISLAND_NONE || !self.tile_passable(map, layer, seed) {
					continue;
				}
				let mut stack = vec![(gc, gr)];
				labels[at(gc, gr)] = next_label;
				while let Some((column, row)) = stack.pop() {
					let deltas: [(i64, i64); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];
					for (dc, dr) in deltas {
						let nc = column as i64 + dc;
						let nr = row as i64 + dr;
						if nc < 0 || nc >= columns as i64 || nr < 0 || nr >= rows as i64 {
							continue;
						}
						let (nc, nr) = (nc as u32, nr as u32);
						let td = TileDesc::from_global(nc, nr);
						if labels[at(nc, nr)] == ISLAND_NONE && self.tile_passable(map, layer, td) {
							labels[at(nc, nr)] = next_label;
							stack.push((nc, nr));
						}
					}
				}
				next_label += 1;
			}
		}
		for gr in 0..rows {
			for gc in 0..columns {
				let td = TileDesc::from_global(gc, gr);
				let index = map.chunk_index(td.chunk);
				self.layers[layer.index()][index].set_island(td.cell, labels[at(gc, gr)]);
			}
		}
		self.local_islands_dirty[layer.index()] = false;
	}
	/// Local island label of the passable tile closest to `target` within its
	/// chunk, walking outward ring by ring. Returns [ISLAND_NONE] when the
	/// whole chunk is blocked
	pub fn closest_pathable_local_island(
		&self,
		map: &MapDimensions,
		layer: NavLayer,
		target: TileDesc,
	) -> u16 {
		let chunk = self.get_chunk(map, layer, target.chunk);
		if chunk.tile_passable(target.cell) {
			return chunk.get_local_island(target.cell);
		}
		let (tc, tr) = (target.cell.get_column() as i32, target.cell.get_row() as i32);
		for ring in 1..FIELD_RESOLUTION as i32 {
			let mut best: Option<(i32, u16)> = None;
			for dc in -ring..=ring {
				for dr in -ring..=ring {
					if dc.abs().max(dr.abs()) != ring {
						continue;
					}
					let (column, row) = (tc + dc, tr + dr);
					if column < 0
						|| column >= FIELD_RESOLUTION as i32
						|| row < 0 || row >= FIELD_RESOLUTION as i32
					{
						continue;
					}
					let cell = FieldCell::new(column as usize, row as usize);
					if !chunk.tile_passable(cell) {
						continue;
					}
					let dist = dc.abs() + dr.abs();
					if best.map_or(true, |(d, _)| dist < d) {
						best = Some((dist, chunk.get_local_island(cell)));
					}
				}
			}
			if let Some((_, island)) = best {
				return island;
			}
		}
		ISLAND_NONE
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn map() -> MapDimensions {
		MapDimensions::new(128, 128)
	}
	#[test]
	fn passable_by_default() {
		let map = map();
		let chunks = NavChunks::new(&map);
		let td = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(5, 5));
		assert!(chunks.tile_passable(&map, NavLayer::Ground1x1, td));
	}
	#[test]
	fn blocker_refcount() {
		let map = map();
		let mut chunks = NavChunks::new(&map);
		let pos = Vec2::new(-60.5, -60.5);
		chunks.block_disk(&map, pos, 0.4, 2);
		chunks.block_disk(&map, pos, 0.4, 2);
		let td = map.get_tile_desc_from_xz(pos).unwrap();
		assert!(!chunks.tile_passable(&map, NavLayer::Ground1x1, td));
		chunks.unblock_disk(&map, pos, 0.4, 2);
		assert!(!chunks.tile_passable(&map, NavLayer::Ground1x1, td));
		chunks.unblock_disk(&map, pos, 0.4, 2);
		assert!(chunks.tile_passable(&map, NavLayer::Ground1x1, td));
	}
	#[test]
	fn enemy_only_tile() {
		let map = map();
		let mut chunks = NavChunks::new(&map);
		let pos = Vec2::new(-60.5, -60.5);
		chunks.block_disk(&map, pos, 0.4, 3);
		let td = map.get_tile_desc_from_xz(pos).unwrap();
		// faction 3 is an enemy under this mask so the tile opens up
		assert!(chunks.tile_passable_no_enemies(&map, NavLayer::Ground1x1, td, 1 << 3));
		// faction 3 is an ally under this mask so it stays closed
		assert!(!chunks.tile_passable_no_enemies(&map, NavLayer::Ground1x1, td, 1 << 5));
	}
	#[test]
	fn blocker_dilation_on_wide_layer() {
		let map = map();
		let mut chunks = NavChunks::new(&map);
		let pos = Vec2::new(-60.5, -60.5);
		chunks.block_disk(&map, pos, 0.4, 0);
		let centre = map.get_tile_desc_from_xz(pos).unwrap();
		let mut side = centre;
		map.relative_tile_desc(&mut side, 1, 0);
		// narrow layer keeps the neighbour open, the 3x3 layer closes it
		assert!(chunks.tile_passable(&map, NavLayer::Ground1x1, side));
		assert!(!chunks.tile_passable(&map, NavLayer::Ground3x3, side));
	}
	#[test]
	fn islands_split_by_wall() {
		let map = map();
		let mut chunks = NavChunks::new(&map);
		// wall across the full map width at global row 40
		for gc in 0..map.get_length() {
			let td = TileDesc::from_global(gc, 40);
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, td.chunk)
				.set_cost(td.cell, COST_IMPASSABLE);
			chunks.mark_dirty(NavLayer::Ground1x1, td.chunk);
		}
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let above = TileDesc::from_global(10, 10);
		let below = TileDesc::from_global(10, 100);
		let ia = chunks.get_chunk(&map, NavLayer::Ground1x1, above.chunk).get_island(above.cell);
		let ib = chunks.get_chunk(&map, NavLayer::Ground1x1, below.chunk).get_island(below.cell);
		assert_ne!(ISLAND_NONE, ia);
		assert_ne!(ISLAND_NONE, ib);
		assert_ne!(ia, ib);
	}
	#[test]
	fn local_islands_are_chunk_scoped() {
		let map = map();
		let mut chunks = NavChunks::new(&map);
		// wall across one chunk only
		for row in 0..FIELD_RESOLUTION {
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, ChunkID::new(0, 0))
				.set_cost(FieldCell::new(32, row), COST_IMPASSABLE);
		}
		chunks.mark_dirty(NavLayer::Ground1x1, ChunkID::new(0, 0));
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let chunk = chunks.get_chunk(&map, NavLayer::Ground1x1, ChunkID::new(0, 0));
		let west = chunk.get_local_island(FieldCell::new(5, 5));
		let east = chunk.get_local_island(FieldCell::new(50, 5));
		assert_ne!(west, east);
		// globally both sides connect around through the neighbour chunk
		let gw = chunk.get_island(FieldCell::new(5, 5));
		let ge = chunk.get_island(FieldCell::new(50, 5));
		assert_eq!(gw, ge);
	}
	#[test]
	fn closest_pathable_island_next_to_wall() {
		let map = map();
		let mut chunks = NavChunks::new(&map);
		let chunk_id = ChunkID::new(1, 1);
		for row in 0..FIELD_RESOLUTION {
			for column in 20..=24 {
				chunks
					.get_chunk_mut(&map, NavLayer::Ground1x1, chunk_id)
					.set_cost(FieldCell::new(column, row), COST_IMPASSABLE);
			}
		}
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let on_wall = TileDesc::new(chunk_id, FieldCell::new(22, 30));
		let island = chunks.closest_pathable_local_island(&map, NavLayer::Ground1x1, on_wall);
		assert_ne!(ISLAND_NONE, island);
	}
}
