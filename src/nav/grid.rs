//! Addressable 2D tile space partitioned into fixed-size chunks. Chunks are
//! positioned from the top-left corner of the map, i.e (-x, -z) direction,
//! and the tiles of a chunk are indexed from the top-left corner of the
//! chunk. One tile covers a `1.0 x 1.0` square of world space on the `XZ`
//! plane and the map is centred on the world origin.
//!

use crate::prelude::*;
use bevy::prelude::*;

/// Unique ID of a chunk
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Reflect)]
pub struct ChunkID((u32, u32));

impl ChunkID {
	/// Create a new instance of [ChunkID]
	pub fn new(column: u32, row: u32) -> Self {
		ChunkID((column, row))
	}
	/// Get the chunk `(column, row)` tuple
	pub fn get(&self) -> (u32, u32) {
		self.0
	}
	/// Get the chunk column
	pub fn get_column(&self) -> u32 {
		self.0 .0
	}
	/// Get the chunk row
	pub fn get_row(&self) -> u32 {
		self.0 .1
	}
}

/// ID of a tile within a chunk
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Reflect)]
pub struct FieldCell((usize, usize));

impl FieldCell {
	/// Create a new instance of [FieldCell]
	pub fn new(column: usize, row: usize) -> Self {
		FieldCell((column, row))
	}
	/// Get the cell `(column, row)` tuple
	pub fn get_column_row(&self) -> (usize, usize) {
		self.0
	}
	/// Get the cell column
	pub fn get_column(&self) -> usize {
		self.0 .0
	}
	/// Get the cell row
	pub fn get_row(&self) -> usize {
		self.0 .1
	}
	/// Based on the cells position find its orthogonal neighbours bounded by
	/// [FIELD_RESOLUTION] limits (up to 4), in the strict `N, E, S, W` order
	pub fn orthogonal_neighbours(&self) -> Vec<FieldCell> {
		let (column, row) = self.0;
		let mut neighbours = Vec::with_capacity(4);
		if row > 0 {
			neighbours.push(FieldCell::new(column, row - 1));
		}
		if column < FIELD_RESOLUTION - 1 {
			neighbours.push(FieldCell::new(column + 1, row));
		}
		if row < FIELD_RESOLUTION - 1 {
			neighbours.push(FieldCell::new(column, row + 1));
		}
		if column > 0 {
			neighbours.push(FieldCell::new(column - 1, row));
		}
		neighbours
	}
	/// Whether the cell sits on the boundary row/column named by the [Ordinal]
	pub fn is_on_boundary(&self, ordinal: Ordinal) -> bool {
		match ordinal {
			Ordinal::North => self.get_row() == 0,
			Ordinal::East => self.get_column() == FIELD_RESOLUTION - 1,
			Ordinal::South => self.get_row() == FIELD_RESOLUTION - 1,
			Ordinal::West => self.get_column() == 0,
			_ => false,
		}
	}
}

/// The descriptor of a single tile across the whole map, a chunk plus the
/// cell within it
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Reflect)]
pub struct TileDesc {
	/// Chunk containing the tile
	pub chunk: ChunkID,
	/// Cell within the chunk
	pub cell: FieldCell,
}

impl TileDesc {
	/// Create a new instance of [TileDesc]
	pub fn new(chunk: ChunkID, cell: FieldCell) -> Self {
		TileDesc { chunk, cell }
	}
	/// Global `(column, row)` of the tile across all chunks
	pub fn global(&self) -> (u32, u32) {
		(
			self.chunk.get_column() * FIELD_RESOLUTION as u32 + self.cell.get_column() as u32,
			self.chunk.get_row() * FIELD_RESOLUTION as u32 + self.cell.get_row() as u32,
		)
	}
	/// Build a descriptor from a global `(column, row)`
	pub fn from_global(column: u32, row: u32) -> Self {
		TileDesc {
			chunk: ChunkID::new(
				column / FIELD_RESOLUTION as u32,
				row / FIELD_RESOLUTION as u32,
			),
			cell: FieldCell::new(
				(column % FIELD_RESOLUTION as u32) as usize,
				(row % FIELD_RESOLUTION as u32) as usize,
			),
		}
	}
}

/// An axis aligned box of world space on the `XZ` plane
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoxXZ {
	pub min: Vec2,
	pub max: Vec2,
}

impl BoxXZ {
	/// Centre of the box
	pub fn center(&self) -> Vec2 {
		(self.min + self.max) * 0.5
	}
	/// Whether the point lies within the box
	pub fn contains(&self, point: Vec2) -> bool {
		point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
	}
}

/// The length `x` and depth `z` of the map
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Component, Default, Clone, Copy)]
pub struct MapDimensions {
	/// Dimensions of the world in tile units
	size: (u32, u32),
}

impl MapDimensions {
	/// Create a new instance of [MapDimensions]. The world is `length` units
	/// along `x` and `depth` units along `z` with a `unit` of space being one
	/// tile. Both must be exact multiples of [FIELD_RESOLUTION]
	pub fn new(length: u32, depth: u32) -> Self {
		let length_rem = length % FIELD_RESOLUTION as u32;
		let depth_rem = depth % FIELD_RESOLUTION as u32;
		if length_rem > 0 || depth_rem > 0 {
			panic!(
				"Map dimensions `({}, {})` cannot support chunks, dimensions must be exact factors of {}",
				length, depth, FIELD_RESOLUTION
			);
		}
		MapDimensions { size: (length, depth) }
	}
	pub fn get_length(&self) -> u32 {
		self.size.0
	}
	pub fn get_depth(&self) -> u32 {
		self.size.1
	}
	/// Number of chunk columns
	pub fn chunk_columns(&self) -> u32 {
		self.size.0 / FIELD_RESOLUTION as u32
	}
	/// Number of chunk rows
	pub fn chunk_rows(&self) -> u32 {
		self.size.1 / FIELD_RESOLUTION as u32
	}
	/// Index of a chunk within a flat row-major chunk table
	pub fn chunk_index(&self, chunk: ChunkID) -> usize {
		(chunk.get_row() * self.chunk_columns() + chunk.get_column()) as usize
	}
	/// Whether the chunk id addresses a chunk on this map
	pub fn chunk_in_bounds(&self, chunk: ChunkID) -> bool {
		chunk.get_column() < self.chunk_columns() && chunk.get_row() < self.chunk_rows()
	}
	/// From a position in `x, z` space calculate the chunk that the point
	/// resides in. Returns [None] when outside the map
	pub fn get_chunk_id_from_xz(&self, position: Vec2) -> Option<ChunkID> {
		if position.x < -((self.get_length() / 2) as f32)
			|| position.x > (self.get_length() / 2) as f32
			|| position.y < -((self.get_depth() / 2) as f32)
			|| position.y > (self.get_depth() / 2) as f32
		{
			return None;
		}
		let x_chunk_count = self.chunk_columns();
		let z_chunk_count = self.chunk_rows();
		// the map is centred at the origin while the chunk grid has its own
		// origin in the top left corner at world (-length/2, -depth/2), so we
		// shift each coordinate by half the map dimension before dividing by
		// the chunk size to obtain the (column, row) indices
		let x_origin = position.x + (self.get_length() / 2) as f32;
		let z_origin = (self.get_depth() / 2) as f32 + position.y;
		let mut column = (x_origin / FIELD_RESOLUTION as f32).floor() as u32;
		let mut row = (z_origin / FIELD_RESOLUTION as f32).floor() as u32;
		// safety for x-z being at the exact limits of map size
		if column >= x_chunk_count {
			column = x_chunk_count - 1;
		}
		if row >= z_chunk_count {
			row = z_chunk_count - 1;
		}
		Some(ChunkID::new(column, row))
	}
	/// Calculate the `x, z` coordinates at the top-left corner of a chunk
	pub fn get_chunk_corner_xz(&self, chunk: ChunkID) -> Vec2 {
		let x_origin = -(self.get_length() as f32) / 2.0;
		let x = x_origin + chunk.get_column() as f32 * FIELD_RESOLUTION as f32;
		let z_origin = -(self.get_depth() as f32) / 2.0;
		let z = z_origin + chunk.get_row() as f32 * FIELD_RESOLUTION as f32;
		Vec2::new(x, z)
	}
	/// From a point in `x, z` space calculate the descriptor of the tile
	/// containing it. Returns [None] when outside the map
	pub fn get_tile_desc_from_xz(&self, position: Vec2) -> Option<TileDesc> {
		if let Some(chunk) = self.get_chunk_id_from_xz(position) {
			let corner = self.get_chunk_corner_xz(chunk);
			let column = ((position.x - corner.x).floor() as usize).min(FIELD_RESOLUTION - 1);
			let row = ((position.y - corner.y).floor() as usize).min(FIELD_RESOLUTION - 1);
			return Some(TileDesc::new(chunk, FieldCell::new(column, row)));
		}
		None
	}
	/// World-space box covered by a tile
	pub fn tile_bounds(&self, td: TileDesc) -> BoxXZ {
		let corner = self.get_chunk_corner_xz(td.chunk);
		let min = Vec2::new(
			corner.x + td.cell.get_column() as f32,
			corner.y + td.cell.get_row() as f32,
		);
		BoxXZ {
			min,
			max: min + Vec2::ONE,
		}
	}
	/// World-space centre of a tile
	pub fn tile_center(&self, td: TileDesc) -> Vec2 {
		self.tile_bounds(td).center()
	}
	/// Shift the descriptor by `(dc, dr)` tile units clamping to the map
	/// bounds. Returns whether the whole shift was absorbed without clipping
	pub fn relative_tile_desc(&self, td: &mut TileDesc, dc: i32, dr: i32) -> bool {
		let (gc, gr) = td.global();
		let max_c = self.get_length() as i64 - 1;
		let max_r = self.get_depth() as i64 - 1;
		let want_c = gc as i64 + dc as i64;
		let want_r = gr as i64 + dr as i64;
		let new_c = want_c.clamp(0, max_c);
		let new_r = want_r.clamp(0, max_r);
		*td = TileDesc::from_global(new_c as u32, new_r as u32);
		want_c == new_c && want_r == new_r
	}
	/// Signed `(dc, dr)` delta in tile units from `a` to `b`, crossing chunk
	/// boundaries as needed
	pub fn tile_distance(&self, a: TileDesc, b: TileDesc) -> (i32, i32) {
		let (ac, ar) = a.global();
		let (bc, br) = b.global();
		(bc as i32 - ac as i32, br as i32 - ar as i32)
	}
	/// Enumerate the descriptors of every tile whose bounds intersect the
	/// given circle
	pub fn tiles_under_circle(&self, center: Vec2, radius: f32) -> Vec<TileDesc> {
		let mut out = Vec::new();
		let min = center - Vec2::splat(radius);
		let max = center + Vec2::splat(radius);
		self.for_tiles_in_rect(min, max, |td, bounds| {
			// closest point on the tile box to the circle centre, tangent
			// tiles are excluded so a disk centred on a tile covers exactly
			// that tile
			let closest = center.clamp(bounds.min, bounds.max);
			if closest.distance_squared(center) < radius * radius {
				out.push(td);
			}
		});
		out
	}
	/// Enumerate the descriptors of every tile whose bounds intersect the
	/// given axis aligned box
	pub fn tiles_under_aabb(&self, min: Vec2, max: Vec2) -> Vec<TileDesc> {
		let mut out = Vec::new();
		self.for_tiles_in_rect(min, max, |td, _| out.push(td));
		out
	}
	/// Walk every tile of the rectangle handing the descriptor and its world
	/// bounds to the visitor
	fn for_tiles_in_rect(&self, min: Vec2, max: Vec2, mut visit: impl FnMut(TileDesc, BoxXZ)) {
		let half_l = (self.get_length() / 2) as f32;
		let half_d = (self.get_depth() / 2) as f32;
		let clamped_min = Vec2::new(min.x.max(-half_l), min.y.max(-half_d));
		let clamped_max = Vec2::new(max.x.min(half_l - 1.0 / 1024.0), max.y.min(half_d - 1.0 / 1024.0));
		if clamped_min.x > clamped_max.x || clamped_min.y > clamped_max.y {
			return;
		}
		let gc0 = (clamped_min.x + half_l).floor() as u32;
		let gr0 = (clamped_min.y + half_d).floor() as u32;
		let gc1 = (clamped_max.x + half_l).floor() as u32;
		let gr1 = (clamped_max.y + half_d).floor() as u32;
		for gr in gr0..=gr1 {
			for gc in gc0..=gc1 {
				let td = TileDesc::from_global(gc, gr);
				visit(td, self.tile_bounds(td));
			}
		}
	}
	/// The one-tile contour of a covered set: every tile orthogonally or
	/// diagonally adjacent to the set but not part of it. Used to dilate unit
	/// footprints per navigation layer
	pub fn tile_contour(&self, covered: &[TileDesc]) -> Vec<TileDesc> {
		let set: std::collections::BTreeSet<TileDesc> = covered.iter().copied().collect();
		let mut out = Vec::new();
		let mut seen = std::collections::BTreeSet::new();
		for td in covered.iter() {
			for dr in -1..=1i32 {
				for dc in -1..=1i32 {
					if dr == 0 && dc == 0 {
						continue;
					}
					let mut neighb = *td;
					if !self.relative_tile_desc(&mut neighb, dc, dr) {
						continue;
					}
					if !set.contains(&neighb) && seen.insert(neighb) {
						out.push(neighb);
					}
				}
			}
		}
		out
	}
	/// A chunk has up to four neighbours. Retrieve the IDs of neighbouring
	/// chunks and the [Ordinal] direction each is found in
	pub fn get_ordinal_and_ids_of_neighbouring_chunks(
		&self,
		chunk: &ChunkID,
	) -> Vec<(Ordinal, ChunkID)> {
		let mut neighbours = Vec::new();
		let column_limit = self.chunk_columns() - 1;
		let row_limit = self.chunk_rows() - 1;
		if chunk.get_row() > 0 {
			neighbours.push((Ordinal::North, ChunkID::new(chunk.get_column(), chunk.get_row() - 1)));
		}
		if chunk.get_column() < column_limit {
			neighbours.push((Ordinal::East, ChunkID::new(chunk.get_column() + 1, chunk.get_row())));
		}
		if chunk.get_row() < row_limit {
			neighbours.push((Ordinal::South, ChunkID::new(chunk.get_column(), chunk.get_row() + 1)));
		}
		if chunk.get_column() > 0 {
			neighbours.push((Ordinal::West, ChunkID::new(chunk.get_column() - 1, chunk.get_row())));
		}
		neighbours
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn chunk_id_from_corners() {
		let map = MapDimensions::new(256, 256);
		assert_eq!(Some(ChunkID::new(0, 0)), map.get_chunk_id_from_xz(Vec2::new(-100.0, -100.0)));
		assert_eq!(Some(ChunkID::new(3, 0)), map.get_chunk_id_from_xz(Vec2::new(100.0, -100.0)));
		assert_eq!(Some(ChunkID::new(3, 3)), map.get_chunk_id_from_xz(Vec2::new(100.0, 100.0)));
		assert_eq!(Some(ChunkID::new(0, 3)), map.get_chunk_id_from_xz(Vec2::new(-100.0, 100.0)));
	}
	#[test]
	fn chunk_id_outside_map() {
		let map = MapDimensions::new(256, 256);
		assert!(map.get_chunk_id_from_xz(Vec2::new(-1500.0, 0.0)).is_none());
	}
	#[test]
	fn tile_desc_from_origin() {
		let map = MapDimensions::new(128, 128);
		let td = map.get_tile_desc_from_xz(Vec2::new(0.5, 0.5)).unwrap();
		assert_eq!(ChunkID::new(1, 1), td.chunk);
		assert_eq!(FieldCell::new(0, 0), td.cell);
	}
	#[test]
	fn tile_bounds_roundtrip() {
		let map = MapDimensions::new(128, 128);
		let td = map.get_tile_desc_from_xz(Vec2::new(-30.25, 17.75)).unwrap();
		let bounds = map.tile_bounds(td);
		assert!(bounds.contains(Vec2::new(-30.25, 17.75)));
		assert_eq!(Vec2::ONE, bounds.max - bounds.min);
	}
	#[test]
	fn relative_desc_across_chunks() {
		let map = MapDimensions::new(128, 128);
		let mut td = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(63, 63));
		let absorbed = map.relative_tile_desc(&mut td, 1, 1);
		assert!(absorbed);
		assert_eq!(TileDesc::new(ChunkID::new(1, 1), FieldCell::new(0, 0)), td);
	}
	#[test]
	fn relative_desc_clamped() {
		let map = MapDimensions::new(128, 128);
		let mut td = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(2, 2));
		let absorbed = map.relative_tile_desc(&mut td, -5, 0);
		assert!(!absorbed);
		assert_eq!(TileDesc::new(ChunkID::new(0, 0), FieldCell::new(0, 2)), td);
	}
	#[test]
	fn signed_tile_distance() {
		let map = MapDimensions::new(128, 128);
		let a = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(60, 10));
		let b = TileDesc::new(ChunkID::new(1, 0), FieldCell::new(4, 6));
		let (dc, dr) = map.tile_distance(a, b);
		assert_eq!((8, -4), (dc, dr));
	}
	#[test]
	fn tiles_under_unit_circle() {
		let map = MapDimensions::new(128, 128);
		// a circle centred on a tile corner touches the four tiles around it
		let tds = map.tiles_under_circle(Vec2::new(1.0, 1.0), 0.45);
		assert_eq!(4, tds.len());
	}
	#[test]
	fn contour_of_single_tile() {
		let map = MapDimensions::new(128, 128);
		let covered = vec![TileDesc::new(ChunkID::new(1, 1), FieldCell::new(5, 5))];
		let ring = map.tile_contour(&covered);
		assert_eq!(8, ring.len());
	}
	#[test]
	fn contour_at_map_edge() {
		let map = MapDimensions::new(128, 128);
		let covered = vec![TileDesc::new(ChunkID::new(0, 0), FieldCell::new(0, 0))];
		let ring = map.tile_contour(&covered);
		assert_eq!(3, ring.len());
	}
}
