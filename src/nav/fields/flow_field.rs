//! A [FlowField] stores a direction of movement for every tile of a chunk. A
//! direction is 4 bits so cells are packed two to a byte. A steering
//! pipeline reads the direction under an agent to derive its desired
//! velocity.
//!

use crate::prelude::*;
use bevy::prelude::*;

/// Direction of movement of a flow field cell. `None` marks goals,
/// impassable cells and the tie-fallthrough case where no neighbour offers a
/// strictly better cost
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Reflect)]
pub enum FlowDir {
	#[default]
	None,
	North,
	NorthEast,
	East,
	SouthEast,
	South,
	SouthWest,
	West,
	NorthWest,
}

impl FlowDir {
	/// The 4-bit encoding of the direction
	pub fn bits(self) -> u8 {
		match self {
			FlowDir::None => 0,
			FlowDir::North => 1,
			FlowDir::NorthEast => 2,
			FlowDir::East => 3,
			FlowDir::SouthEast => 4,
			FlowDir::South => 5,
			FlowDir::SouthWest => 6,
			FlowDir::West => 7,
			FlowDir::NorthWest => 8,
		}
	}
	/// Decode a 4-bit direction, unknown encodings fold to [FlowDir::None]
	pub fn from_bits(bits: u8) -> Self {
		match bits {
			1 => FlowDir::North,
			2 => FlowDir::NorthEast,
			3 => FlowDir::East,
			4 => FlowDir::SouthEast,
			5 => FlowDir::South,
			6 => FlowDir::SouthWest,
			7 => FlowDir::West,
			8 => FlowDir::NorthWest,
			_ => FlowDir::None,
		}
	}
	/// Signed `(column, row)` tile step of the direction
	pub fn delta(self) -> (i32, i32) {
		match self {
			FlowDir::None => (0, 0),
			FlowDir::North => (0, -1),
			FlowDir::NorthEast => (1, -1),
			FlowDir::East => (1, 0),
			FlowDir::SouthEast => (1, 1),
			FlowDir::South => (0, 1),
			FlowDir::SouthWest => (-1, 1),
			FlowDir::West => (-1, 0),
			FlowDir::NorthWest => (-1, -1),
		}
	}
	/// Unit vector of the direction on the world `XZ` plane. North points
	/// towards `-z`
	pub fn unit_vector(self) -> Vec2 {
		let (dc, dr) = self.delta();
		let raw = Vec2::new(dc as f32, dr as f32);
		if raw == Vec2::ZERO {
			raw
		} else {
			raw.normalize()
		}
	}
}

/// Number of bytes backing one packed chunk-sized field
const PACKED_LEN: usize = FIELD_RESOLUTION * FIELD_RESOLUTION / 2;

/// A chunk-sized grid of [FlowDir] packed two cells per byte
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone)]
pub struct FlowField {
	packed: Vec<u8>,
}

impl Default for FlowField {
	fn default() -> Self {
		FlowField {
			packed: vec![0; PACKED_LEN],
		}
	}
}

#[inline]
fn unpack(packed: &[u8], index: usize) -> FlowDir {
	let byte = packed[index / 2];
	let nibble = if index % 2 == 0 { byte & 0x0F } else { byte >> 4 };
	FlowDir::from_bits(nibble)
}

#[inline]
fn pack(packed: &mut [u8], index: usize, dir: FlowDir) {
	let byte = &mut packed[index / 2];
	if index % 2 == 0 {
		*byte = (*byte & 0xF0) | dir.bits();
	} else {
		*byte = (*byte & 0x0F) | (dir.bits() << 4);
	}
}

impl Field<FlowDir> for FlowField {
	/// Retrieve a field cell value
	fn get_field_cell_value(&self, field_cell: FieldCell) -> FlowDir {
		unpack(&self.packed, field_cell.get_column() * FIELD_RESOLUTION + field_cell.get_row())
	}
	/// Set a field cell to a value
	fn set_field_cell_value(&mut self, value: FlowDir, field_cell: FieldCell) {
		pack(
			&mut self.packed,
			field_cell.get_column() * FIELD_RESOLUTION + field_cell.get_row(),
			value,
		);
	}
}

/// A free-size grid of [FlowDir] anchored at a base tile, able to straddle
/// chunk boundaries. Used for formation cell-arrival fields and the padded
/// enemy-seek regions
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone)]
pub struct RegionFlowField {
	/// Top-left tile of the region
	base: TileDesc,
	/// Number of tile columns covered
	cdim: usize,
	/// Number of tile rows covered
	rdim: usize,
	packed: Vec<u8>,
}

impl RegionFlowField {
	/// Create a region of `cdim x rdim` tiles anchored at `base` with every
	/// cell set to [FlowDir::None]
	pub fn new(base: TileDesc, cdim: usize, rdim: usize) -> Self {
		RegionFlowField {
			base,
			cdim,
			rdim,
			packed: vec![0; (cdim * rdim + 1) / 2],
		}
	}
	/// Top-left tile of the region
	pub fn get_base(&self) -> TileDesc {
		self.base
	}
	/// `(columns, rows)` covered by the region
	pub fn get_dimensions(&self) -> (usize, usize) {
		(self.cdim, self.rdim)
	}
	/// Retrieve the direction at a `(column, row)` offset from the base
	pub fn get_offset_value(&self, column: usize, row: usize) -> FlowDir {
		unpack(&self.packed, column * self.rdim + row)
	}
	/// Set the direction at a `(column, row)` offset from the base
	pub fn set_offset_value(&mut self, value: FlowDir, column: usize, row: usize) {
		pack(&mut self.packed, column * self.rdim + row, value);
	}
	/// Retrieve the direction under a tile descriptor. Returns [None] when
	/// the tile lies outside the region
	pub fn get_tile_value(&self, map: &MapDimensions, td: TileDesc) -> Option<FlowDir> {
		let (dc, dr) = map.tile_distance(self.base, td);
		if dc < 0 || dc >= self.cdim as i32 || dr < 0 || dr >= self.rdim as i32 {
			return None;
		}
		Some(self.get_offset_value(dc as usize, dr as usize))
	}
}
