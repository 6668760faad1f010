//! Hierarchical navigation data: the map is split into a series of `MxN`
//! chunks where each chunk holds per-layer cost, blocker, faction and island
//! arrays alongside the portals bridging it to its neighbours.
//!
//! [SupCom2- Elijah Emerson](https://www.gameaipro.com/GameAIPro/GameAIPro_Chapter23_Crowd_Pathfinding_and_Steering_Using_Flow_Field_Tiles.pdf)
//!
//! [leifnode](https://leifnode.com/2013/12/flow-field-pathfinding/)
//!

pub mod chunk;
pub mod fields;
pub mod grid;
pub mod portal;
pub mod portal_graph;

/// Defines the dimensions of all chunk-sized field arrays
pub const FIELD_RESOLUTION: usize = 64;
/// Cost value that forbids a tile from taking part in any path
pub const COST_IMPASSABLE: u8 = 255;
/// Default cost of traversing a tile
pub const COST_DEFAULT: u8 = 1;
/// Marker for a tile that belongs to no island (impassable terrain)
pub const ISLAND_NONE: u16 = u16::MAX;
/// Maximum number of factions the occupancy arrays track, mask fits a `u16`
pub const MAX_FACTIONS: usize = 16;

use bevy::prelude::*;

/// The navigation layers. Ground layers are distinguished by unit footprint
/// so that a gap wide enough for a single tile footprint can still be
/// impassable for a 3x3 one. Water and air units ignore ground blockers
/// entirely and carry their own cost arrays.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Reflect)]
pub enum NavLayer {
	#[default]
	Ground1x1,
	Ground3x3,
	Ground5x5,
	Water,
	Air,
}

/// Number of [NavLayer] variants
pub const NAV_LAYER_COUNT: usize = 5;

impl NavLayer {
	/// Index of the layer within per-layer storage
	pub fn index(self) -> usize {
		match self {
			NavLayer::Ground1x1 => 0,
			NavLayer::Ground3x3 => 1,
			NavLayer::Ground5x5 => 2,
			NavLayer::Water => 3,
			NavLayer::Air => 4,
		}
	}
	/// Inverse of [NavLayer::index], out of range values fold to the default layer
	pub fn from_index(idx: usize) -> Self {
		match idx {
			0 => NavLayer::Ground1x1,
			1 => NavLayer::Ground3x3,
			2 => NavLayer::Ground5x5,
			3 => NavLayer::Water,
			4 => NavLayer::Air,
			_ => NavLayer::Ground1x1,
		}
	}
	/// Number of one-tile contour dilation passes applied to footprints
	/// occupying this layer, a 5x5 unit closes gaps two tiles out
	pub fn dilation_passes(self) -> usize {
		match self {
			NavLayer::Ground1x1 | NavLayer::Water | NavLayer::Air => 0,
			NavLayer::Ground3x3 => 1,
			NavLayer::Ground5x5 => 2,
		}
	}
	/// The layer a ground unit of the given selection radius paths on
	pub fn for_radius(radius: f32) -> Self {
		if radius <= 1.0 {
			NavLayer::Ground1x1
		} else if radius <= 2.0 {
			NavLayer::Ground3x3
		} else {
			NavLayer::Ground5x5
		}
	}
	/// Iterate every layer
	pub fn all() -> [NavLayer; NAV_LAYER_COUNT] {
		[
			NavLayer::Ground1x1,
			NavLayer::Ground3x3,
			NavLayer::Ground5x5,
			NavLayer::Water,
			NavLayer::Air,
		]
	}
}

/// Convenience way of accessing the 4 sides of a chunk in
/// [portal::ChunkPortals] and the 8 directions of movement in
/// [fields::flow_field::FlowField]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Reflect)]
pub enum Ordinal {
	North,
	East,
	South,
	West,
	NorthEast,
	SouthEast,
	SouthWest,
	NorthWest,
}

impl Ordinal {
	/// The four cardinal sides of a chunk in the strict `N, E, S, W` order
	/// used by per-side portal storage
	pub const SIDES: [Ordinal; 4] = [
		Ordinal::North,
		Ordinal::East,
		Ordinal::South,
		Ordinal::West,
	];
	/// Returns the opposite [Ordinal] of the current
	pub fn inverse(&self) -> Ordinal {
		match self {
			Ordinal::North => Ordinal::South,
			Ordinal::East => Ordinal::West,
			Ordinal::South => Ordinal::North,
			Ordinal::West => Ordinal::East,
			Ordinal::NorthEast => Ordinal::SouthWest,
			Ordinal::SouthEast => Ordinal::NorthWest,
			Ordinal::SouthWest => Ordinal::NorthEast,
			Ordinal::NorthWest => Ordinal::SouthEast,
		}
	}
	/// Signed `(column, row)` step of moving one tile towards the ordinal
	pub fn delta(&self) -> (i32, i32) {
		match self {
			Ordinal::North => (0, -1),
			Ordinal::East => (1, 0),
			Ordinal::South => (0, 1),
			Ordinal::West => (-1, 0),
			Ordinal::NorthEast => (1, -1),
			Ordinal::SouthEast => (1, 1),
			Ordinal::SouthWest => (-1, 1),
			Ordinal::NorthWest => (-1, -1),
		}
	}
}
