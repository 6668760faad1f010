//! The kinds of fields used by the navigation algorithms plus the compact
//! 64-bit id they are cached under
//!

pub mod builder;
pub mod cache;
pub mod flow_field;
pub mod integration_field;
pub mod los_field;

use crate::prelude::*;

/// Defines required access to field arrays
pub trait Field<T> {
	/// Retrieve a field cell value
	fn get_field_cell_value(&self, field_cell: FieldCell) -> T;
	/// Set a field cell to a value
	fn set_field_cell_value(&mut self, value: T, field_cell: FieldCell);
}

/// What a field is built towards. The tag drives the construction algorithm
/// and the [FieldId] encoding
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FieldTarget {
	/// Flow towards a single tile of the destination chunk
	Tile(TileDesc),
	/// Flow towards (and across) a portal window on the way to another chunk
	Portal(PortalHop),
	/// Flow towards any portal of the chunk flagged in the bitmask
	PortalMask(u64),
	/// Flow towards the enemies of a faction in and around the chunk
	Enemies { faction_id: u8 },
	/// Flow towards a specific entity in and around the chunk
	Entity { uid: u32 },
	/// Flow from the impassable component under an agent to the nearest
	/// passable tile, the recovery field for shoved units
	NearestPathable(TileDesc),
}

impl FieldTarget {
	/// The 4-bit discriminant stored in a [FieldId]
	pub fn type_bits(&self) -> u64 {
		match self {
			FieldTarget::Tile(_) => 0,
			FieldTarget::Portal(_) => 1,
			FieldTarget::PortalMask(_) => 2,
			FieldTarget::Enemies { .. } => 3,
			FieldTarget::Entity { .. } => 4,
			FieldTarget::NearestPathable(_) => 5,
		}
	}
	/// The 40 target-specific bits stored in a [FieldId]
	fn specific_bits(&self) -> u64 {
		const MASK40: u64 = (1 << 40) - 1;
		match self {
			FieldTarget::Tile(td) | FieldTarget::NearestPathable(td) => {
				((td.cell.get_row() as u64) << 6) | td.cell.get_column() as u64
			}
			FieldTarget::Portal(hop) => {
				// (next_iid:4, port_iid:4, r0:6, c0:6, r1:6, c1:6)
				let (a, b) = hop.endpoints;
				((hop.next_iid as u64 & 0xF) << 28)
					| ((hop.port_iid as u64 & 0xF) << 24)
					| ((a.get_row() as u64) << 18)
					| ((a.get_column() as u64) << 12)
					| ((b.get_row() as u64) << 6)
					| b.get_column() as u64
			}
			FieldTarget::PortalMask(mask) => *mask & MASK40,
			FieldTarget::Enemies { faction_id } => *faction_id as u64,
			FieldTarget::Entity { uid } => *uid as u64,
		}
	}
}

/// Compact id of a cached field:
/// `[layer:4][target_type:4][target_specific:40][chunk_r:8][chunk_c:8]`
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct FieldId(u64);

impl FieldId {
	/// Pack a field id from its parts. `chunk` is the chunk the flow field
	/// covers
	pub fn new(layer: NavLayer, target: &FieldTarget, chunk: ChunkID) -> Self {
		let mut id = 0u64;
		id |= (layer.index() as u64 & 0xF) << 60;
		id |= (target.type_bits() & 0xF) << 56;
		id |= (target.specific_bits() & ((1 << 40) - 1)) << 16;
		id |= (chunk.get_row() as u64 & 0xFF) << 8;
		id |= chunk.get_column() as u64 & 0xFF;
		FieldId(id)
	}
	/// The raw packed value
	pub fn bits(&self) -> u64 {
		self.0
	}
	/// Layer the field belongs to
	pub fn layer(&self) -> NavLayer {
		NavLayer::from_index(((self.0 >> 60) & 0xF) as usize)
	}
	/// The 4-bit target type discriminant
	pub fn target_type(&self) -> u64 {
		(self.0 >> 56) & 0xF
	}
	/// The 40 target-specific bits
	pub fn target_specific(&self) -> u64 {
		(self.0 >> 16) & ((1 << 40) - 1)
	}
	/// Chunk the field covers
	pub fn chunk(&self) -> ChunkID {
		ChunkID::new((self.0 & 0xFF) as u32, ((self.0 >> 8) & 0xFF) as u32)
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn id_roundtrip_tile() {
		let td = TileDesc::new(ChunkID::new(3, 2), FieldCell::new(30, 31));
		let id = FieldId::new(NavLayer::Ground3x3, &FieldTarget::Tile(td), td.chunk);
		assert_eq!(NavLayer::Ground3x3, id.layer());
		assert_eq!(0, id.target_type());
		assert_eq!(ChunkID::new(3, 2), id.chunk());
	}
	#[test]
	fn id_distinguishes_targets() {
		let chunk = ChunkID::new(1, 1);
		let a = FieldId::new(
			NavLayer::Ground1x1,
			&FieldTarget::Tile(TileDesc::new(chunk, FieldCell::new(4, 4))),
			chunk,
		);
		let b = FieldId::new(
			NavLayer::Ground1x1,
			&FieldTarget::Tile(TileDesc::new(chunk, FieldCell::new(4, 5))),
			chunk,
		);
		let c = FieldId::new(NavLayer::Ground1x1, &FieldTarget::Enemies { faction_id: 4 }, chunk);
		assert_ne!(a, b);
		assert_ne!(a, c);
		assert_ne!(b, c);
	}
	#[test]
	fn id_distinguishes_layers() {
		let chunk = ChunkID::new(0, 0);
		let target = FieldTarget::Enemies { faction_id: 1 };
		let a = FieldId::new(NavLayer::Ground1x1, &target, chunk);
		let b = FieldId::new(NavLayer::Water, &target, chunk);
		assert_ne!(a, b);
		assert_eq!(NavLayer::Water, b.layer());
	}
	#[test]
	fn id_packs_portal_hop() {
		let chunk = ChunkID::new(2, 0);
		let hop = PortalHop {
			endpoints: (FieldCell::new(63, 10), FieldCell::new(63, 20)),
			portal: PortalRef { chunk, index: 0 },
			port_iid: 1,
			next_iid: 2,
		};
		let id = FieldId::new(NavLayer::Ground1x1, &FieldTarget::Portal(hop), chunk);
		assert_eq!(1, id.target_type());
		assert_eq!(chunk, id.chunk());
	}
}
