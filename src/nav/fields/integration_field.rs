//! The IntegrationField stores the cumulative cost of reaching the goal from
//! every tile, `f32` with unreached cells left at infinity. It is produced by
//! a dijkstra-like expansion from the goal frontier and consumed by the flow
//! field gradient descent.
//!

use crate::prelude::*;

/// Scalar cost-to-goal per cell of one chunk
#[derive(Clone)]
pub struct IntegrationField {
	costs: Vec<f32>,
}

impl Default for IntegrationField {
	fn default() -> Self {
		IntegrationField {
			costs: vec![f32::INFINITY; FIELD_RESOLUTION * FIELD_RESOLUTION],
		}
	}
}

impl Field<f32> for IntegrationField {
	/// Retrieve a field cell value
	fn get_field_cell_value(&self, field_cell: FieldCell) -> f32 {
		self.costs[field_cell.get_column() * FIELD_RESOLUTION + field_cell.get_row()]
	}
	/// Set a field cell to a value
	fn set_field_cell_value(&mut self, value: f32, field_cell: FieldCell) {
		self.costs[field_cell.get_column() * FIELD_RESOLUTION + field_cell.get_row()] = value;
	}
}

impl IntegrationField {
	/// Reset every cell to infinity
	pub fn reset(&mut self) {
		for cost in self.costs.iter_mut() {
			*cost = f32::INFINITY;
		}
	}
}

/// Scalar cost-to-goal over a free-size region of tiles anchored at a base
/// descriptor, able to straddle chunk boundaries
#[derive(Clone)]
pub struct RegionIntegrationField {
	/// Top-left tile of the region
	base: TileDesc,
	/// Number of tile columns covered
	cdim: usize,
	/// Number of tile rows covered
	rdim: usize,
	costs: Vec<f32>,
}

impl RegionIntegrationField {
	/// Create a region of `cdim x rdim` tiles anchored at `base` with every
	/// cell at infinity
	pub fn new(base: TileDesc, cdim: usize, rdim: usize) -> Self {
		RegionIntegrationField {
			base,
			cdim,
			rdim,
			costs: vec![f32::INFINITY; cdim * rdim],
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
	/// Cost at a `(column, row)` offset from the base
	pub fn get_offset_value(&self, column: usize, row: usize) -> f32 {
		self.costs[column * self.rdim + row]
	}
	/// Set the cost at a `(column, row)` offset from the base
	pub fn set_offset_value(&mut self, value: f32, column: usize, row: usize) {
		self.costs[column * self.rdim + row] = value;
	}
	/// `(column, row)` offset of a tile within the region, [None] when the
	/// tile lies outside it
	pub fn offset_of(&self, map: &MapDimensions, td: TileDesc) -> Option<(usize, usize)> {
		let (dc, dr) = map.tile_distance(self.base, td);
		if dc < 0 || dc >= self.cdim as i32 || dr < 0 || dr >= self.rdim as i32 {
			return None;
		}
		Some((dc as usize, dr as usize))
	}
	/// Cost under a tile descriptor, infinity when outside the region
	pub fn get_tile_value(&self, map: &MapDimensions, td: TileDesc) -> f32 {
		match self.offset_of(map, td) {
			Some((column, row)) => self.get_offset_value(column, row),
			None => f32::INFINITY,
		}
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn default_is_unreached() {
		let field = IntegrationField::default();
		assert!(field.get_field_cell_value(FieldCell::new(10, 10)).is_infinite());
	}
	#[test]
	fn set_get() {
		let mut field = IntegrationField::default();
		field.set_field_cell_value(3.5, FieldCell::new(1, 2));
		assert_eq!(3.5, field.get_field_cell_value(FieldCell::new(1, 2)));
		assert!(field.get_field_cell_value(FieldCell::new(2, 1)).is_infinite());
	}
	#[test]
	fn region_offsets() {
		let map = MapDimensions::new(128, 128);
		let base = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(32, 32));
		let mut region = RegionIntegrationField::new(base, 96, 96);
		region.set_offset_value(7.0, 40, 2);
		let mut td = base;
		map.relative_tile_desc(&mut td, 40, 2);
		assert_eq!(7.0, region.get_tile_value(&map, td));
	}
}
