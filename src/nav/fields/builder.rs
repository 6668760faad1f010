//! Construction of integration, flow and line-of-sight fields.
//!
//! Integration expands a dijkstra wavefront from the goal frontier using
//! 4-connected neighbours only, keeping motion quantisation clean. The flow
//! field then picks, per cell, the 8-connected neighbour with the lowest
//! integration cost. A diagonal step is forbidden unless both side
//! neighbours are finite so the flow never slides an agent through an
//! impassable corner.
//!

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::prelude::*;
use bevy::prelude::*;

/// Half a chunk of padding on every side gives the enemy/entity-seek region
/// twice the chunk dimensions
pub const SEEK_REGION_RES: usize = FIELD_RESOLUTION * 2;
/// Dimensions of a formation cell-arrival region
pub const CELL_ARRIVAL_FIELD_RES: usize = 96;

/// Frontier entry ordered by smallest cost first
struct FrontierEntry<T> {
	cost: f32,
	item: T,
}

impl<T> PartialEq for FrontierEntry<T> {
	fn eq(&self, other: &Self) -> bool {
		self.cost == other.cost
	}
}
impl<T> Eq for FrontierEntry<T> {}
impl<T> PartialOrd for FrontierEntry<T> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl<T> Ord for FrontierEntry<T> {
	fn cmp(&self, other: &Self) -> Ordering {
		// reversed so the BinaryHeap pops the cheapest entry
		other.cost.total_cmp(&self.cost)
	}
}

/// Builds fields against the navigation state of one layer. When `enemies`
/// is non-zero the build is seeking an enemy, so tiles held exclusively by
/// factions of the mask count as passable
pub struct FieldBuilder<'a> {
	pub map: &'a MapDimensions,
	pub chunks: &'a NavChunks,
	pub layer: NavLayer,
	pub enemies: u16,
}

impl<'a> FieldBuilder<'a> {
	/// Create a builder with no enemy handling
	pub fn new(map: &'a MapDimensions, chunks: &'a NavChunks, layer: NavLayer) -> Self {
		FieldBuilder {
			map,
			chunks,
			layer,
			enemies: 0,
		}
	}
	/// Create a builder whose goal is reaching an enemy of the mask
	pub fn with_enemies(
		map: &'a MapDimensions,
		chunks: &'a NavChunks,
		layer: NavLayer,
		enemies: u16,
	) -> Self {
		FieldBuilder {
			map,
			chunks,
			layer,
			enemies,
		}
	}
	/// Passability under the builds enemy rules
	fn passable(&self, td: TileDesc) -> bool {
		if self.enemies != 0 {
			self.chunks
				.tile_passable_no_enemies(self.map, self.layer, td, self.enemies)
		} else {
			self.chunks.tile_passable(self.map, self.layer, td)
		}
	}
	/// Traversal cost of a tile, [None] when it cannot take part in the build
	fn tile_cost(&self, td: TileDesc) -> Option<f32> {
		if !self.passable(td) {
			return None;
		}
		Some(self.chunks.get_chunk(self.map, self.layer, td.chunk).get_cost(td.cell) as f32)
	}

	/// Build the integration field of one chunk from a goal frontier of
	/// `(cell, cost)` seeds. Relaxation uses 4-connected neighbours only and
	/// a cell re-enters the queue only when its cost strictly decreases
	pub fn chunk_integration(
		&self,
		chunk_id: ChunkID,
		frontier: &[(FieldCell, f32)],
	) -> IntegrationField {
		let mut field = IntegrationField::default();
		let mut queue: BinaryHeap<FrontierEntry<FieldCell>> = BinaryHeap::new();
		for (cell, cost) in frontier.iter() {
			field.set_field_cell_value(*cost, *cell);
			queue.push(FrontierEntry {
				cost: *cost,
				item: *cell,
			});
		}
		while let Some(entry) = queue.pop() {
			let current = field.get_field_cell_value(entry.item);
			if entry.cost > current {
				continue;
			}
			for neighbour in entry.item.orthogonal_neighbours() {
				let td = TileDesc::new(chunk_id, neighbour);
				let Some(step_cost) = self.tile_cost(td) else {
					continue;
				};
				let total = current + step_cost;
				if total < field.get_field_cell_value(neighbour) {
					field.set_field_cell_value(total, neighbour);
					queue.push(FrontierEntry {
						cost: total,
						item: neighbour,
					});
				}
			}
		}
		field
	}

	/// Build the flow field of a chunk by descending its integration field
	pub fn flow_from_integration(&self, integration: &IntegrationField) -> FlowField {
		let mut flow = FlowField::default();
		for column in 0..FIELD_RESOLUTION {
			for row in 0..FIELD_RESOLUTION {
				let cell = FieldCell::new(column, row);
				let cost = integration.get_field_cell_value(cell);
				if cost.is_infinite() || cost == 0.0 {
					continue;
				}
				let dir = flow_dir(
					|dc, dr| {
						let (nc, nr) = (column as i32 + dc, row as i32 + dr);
						if nc < 0
							|| nc >= FIELD_RESOLUTION as i32
							|| nr < 0 || nr >= FIELD_RESOLUTION as i32
						{
							f32::INFINITY
						} else {
							integration.get_field_cell_value(FieldCell::new(nc as usize, nr as usize))
						}
					},
				);
				flow.set_field_cell_value(dir, cell);
			}
		}
		flow
	}

	/// Build the `(flow, integration)` pair for a tile target in its own
	/// chunk. `ignore_blockers` admits a goal tile held by a blocker, used
	/// when the destination is an occupied position the mover will contest
	pub fn build_tile_field(
		&self,
		target: TileDesc,
		ignore_blockers: bool,
	) -> (FlowField, IntegrationField) {
		let admissible = ignore_blockers
			&& self
				.chunks
				.get_chunk(self.map, self.layer, target.chunk)
				.get_cost(target.cell) != COST_IMPASSABLE;
		let frontier: Vec<(FieldCell, f32)> = if admissible || self.passable(target) {
			vec![(target.cell, 0.0)]
		} else {
			// the goal tile is held, seed from the passable tiles nearest it
			// so a crowded destination still pulls the rest of the flock in
			self.closest_passable_cells(target.chunk, target.cell)
				.into_iter()
				.map(|cell| (cell, 0.0))
				.collect()
		};
		let integration = self.chunk_integration(target.chunk, &frontier);
		let flow = self.flow_from_integration(&integration);
		(flow, integration)
	}

	/// The passable cells of the chunk at the smallest manhattan distance
	/// from the target cell
	pub fn closest_passable_cells(&self, chunk_id: ChunkID, target: FieldCell) -> Vec<FieldCell> {
		let mut best = usize::MAX;
		let mut out: Vec<FieldCell> = Vec::new();
		for column in 0..FIELD_RESOLUTION {
			for row in 0..FIELD_RESOLUTION {
				let cell = FieldCell::new(column, row);
				if !self.passable(TileDesc::new(chunk_id, cell)) {
					continue;
				}
				let distance = column.abs_diff(target.get_column()) + row.abs_diff(target.get_row());
				if distance < best {
					best = distance;
					out.clear();
				}
				if distance == best {
					out.push(cell);
				}
			}
		}
		out
	}

	/// Seed cells of a portal hop: window tiles that are passable, stand on
	/// the hops own-side island and border the far-side island
	pub fn portal_frontier(&self, portals: &ChunkPortals, hop: &PortalHop) -> Vec<FieldCell> {
		let portal = portals.resolve(self.layer, hop.portal);
		let chunk = self.chunks.get_chunk(self.map, self.layer, hop.portal.chunk);
		let peer_chunk_id = portal.get_peer().chunk;
		let peer_chunk = self.chunks.get_chunk(self.map, self.layer, peer_chunk_id);
		let (dc, dr) = portal.get_side().delta();
		let mut out = Vec::new();
		for cell in portal.window_cells() {
			let td = TileDesc::new(hop.portal.chunk, cell);
			if !self.passable(td) {
				continue;
			}
			if hop.port_iid != ISLAND_NONE && chunk.get_local_island(cell) != hop.port_iid {
				continue;
			}
			let mut across = td;
			if !self.map.relative_tile_desc(&mut across, dc, dr) {
				continue;
			}
			if across.chunk != peer_chunk_id {
				continue;
			}
			if hop.next_iid != ISLAND_NONE
				&& peer_chunk.get_local_island(across.cell) != hop.next_iid
			{
				continue;
			}
			out.push(cell);
		}
		out
	}

	/// Build the `(flow, integration)` pair for a portal hop out of a chunk.
	/// Window tiles are fixed up to point straight across the boundary
	pub fn build_portal_field(
		&self,
		portals: &ChunkPortals,
		hop: &PortalHop,
	) -> (FlowField, IntegrationField) {
		let frontier_cells = self.portal_frontier(portals, hop);
		let frontier: Vec<(FieldCell, f32)> =
			frontier_cells.iter().map(|cell| (*cell, 0.0)).collect();
		let integration = self.chunk_integration(hop.portal.chunk, &frontier);
		let mut flow = self.flow_from_integration(&integration);
		let portal = portals.resolve(self.layer, hop.portal);
		fixup_portal_edges(&mut flow, portal, &frontier_cells);
		(flow, integration)
	}

	/// Build the `(flow, integration)` pair flowing towards every portal of
	/// the chunk flagged in the mask
	pub fn build_portal_mask_field(
		&self,
		portals: &ChunkPortals,
		chunk_id: ChunkID,
		mask: u64,
	) -> (FlowField, IntegrationField) {
		let list = portals.get(self.layer, chunk_id);
		let mut frontier_cells = Vec::new();
		let mut flagged = Vec::new();
		for (index, portal) in list.iter().enumerate() {
			if mask & (1u64 << (index as u32 & 63)) == 0 {
				continue;
			}
			flagged.push(portal);
			for cell in portal.window_cells() {
				if self.passable(TileDesc::new(chunk_id, cell)) {
					frontier_cells.push(cell);
				}
			}
		}
		let frontier: Vec<(FieldCell, f32)> =
			frontier_cells.iter().map(|cell| (*cell, 0.0)).collect();
		let integration = self.chunk_integration(chunk_id, &frontier);
		let mut flow = self.flow_from_integration(&integration);
		for portal in flagged {
			let cells: Vec<FieldCell> = portal
				.window_cells()
				.into_iter()
				.filter(|cell| self.passable(TileDesc::new(chunk_id, *cell)))
				.collect();
			fixup_portal_edges(&mut flow, portal, &cells);
		}
		(flow, integration)
	}

	/// Build the line-of-sight field of a chunk.
	///
	/// With `prev` unset the target tile lies in this chunk and seeds the
	/// visibility wavefront. Otherwise visibility is inherited from the
	/// already-built neighbour field across the shared edge named by the
	/// ordinal. Shadow lines are cast from every LOS corner by walking a
	/// bresenham line away from the target, then the wavefront is padded by
	/// one tile of invisibility so agents on a visible tile can raycast the
	/// target without clipping impassable terrain
	pub fn build_los(
		&self,
		chunk_id: ChunkID,
		target: TileDesc,
		prev: Option<(Ordinal, &LosField)>,
	) -> LosField {
		let chunk = self.chunks.get_chunk(self.map, self.layer, chunk_id);
		let mut los = LosField::default();
		let mut queue: Vec<FieldCell> = Vec::new();
		match prev {
			None => {
				los.set_visible(target.cell, true);
				queue.push(target.cell);
			}
			Some((side, prev_field)) => {
				let (dc, dr) = side.delta();
				for offset in 0..FIELD_RESOLUTION {
					let cell = match side {
						Ordinal::North => FieldCell::new(offset, 0),
						Ordinal::East => FieldCell::new(FIELD_RESOLUTION - 1, offset),
						Ordinal::South => FieldCell::new(offset, FIELD_RESOLUTION - 1),
						Ordinal::West => FieldCell::new(0, offset),
						_ => continue,
					};
					let mut across = TileDesc::new(chunk_id, cell);
					if !self.map.relative_tile_desc(&mut across, dc, dr) {
						continue;
					}
					if prev_field.is_visible(across.cell) && chunk.get_cost(cell) == COST_DEFAULT
						&& chunk.tile_passable(cell)
					{
						los.set_visible(cell, true);
						queue.push(cell);
					}
				}
			}
		}
		let target_center = self.map.tile_center(target);
		let mut head = 0;
		while head < queue.len() {
			let cell = queue[head];
			head += 1;
			for neighbour in cell.orthogonal_neighbours() {
				if los.is_visible(neighbour) {
					continue;
				}
				let open = chunk.get_cost(neighbour) == COST_DEFAULT && chunk.tile_passable(neighbour);
				// the wavefront never crosses a shadow line
				if open && !los.is_wavefront_blocked(neighbour) {
					los.set_visible(neighbour, true);
					queue.push(neighbour);
				} else if !open && is_los_corner(chunk, neighbour) {
					let corner_center = self.map.tile_center(TileDesc::new(chunk_id, neighbour));
					cast_wavefront_blocked_line(&mut los, neighbour, target_center, corner_center);
				}
			}
		}
		pad_wavefront(&mut los);
		los
	}

	/// Build the integration field of a free-size region from a frontier of
	/// tile seeds. The region may straddle chunk boundaries
	pub fn region_integration(
		&self,
		base: TileDesc,
		cdim: usize,
		rdim: usize,
		frontier: &[TileDesc],
	) -> RegionIntegrationField {
		let mut field = RegionIntegrationField::new(base, cdim, rdim);
		let mut queue: BinaryHeap<FrontierEntry<TileDesc>> = BinaryHeap::new();
		for td in frontier.iter() {
			if field.offset_of(self.map, *td).is_some() {
				let (column, row) = field.offset_of(self.map, *td).unwrap();
				field.set_offset_value(0.0, column, row);
				queue.push(FrontierEntry {
					cost: 0.0,
					item: *td,
				});
			}
		}
		while let Some(entry) = queue.pop() {
			let Some((column, row)) = field.offset_of(self.map, entry.item) else {
				continue;
			};
			let current = field.get_offset_value(column, row);
			if entry.cost > current {
				continue;
			}
			let deltas: [(i32, i32); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];
			for (dc, dr) in deltas {
				let mut neighbour = entry.item;
				if !self.map.relative_tile_desc(&mut neighbour, dc, dr) {
					continue;
				}
				let Some((nc, nr)) = field.offset_of(self.map, neighbour) else {
					continue;
				};
				let Some(step_cost) = self.tile_cost(neighbour) else {
					continue;
				};
				let total = current + step_cost;
				if total < field.get_offset_value(nc, nr) {
					field.set_offset_value(total, nc, nr);
					queue.push(FrontierEntry {
						cost: total,
						item: neighbour,
					});
				}
			}
		}
		field
	}

	/// Build the flow field of a whole region by descending its integration
	/// costs
	pub fn region_flow(&self, integration: &RegionIntegrationField) -> RegionFlowField {
		let (cdim, rdim) = integration.get_dimensions();
		let mut flow = RegionFlowField::new(integration.get_base(), cdim, rdim);
		for column in 0..cdim {
			for row in 0..rdim {
				let cost = integration.get_offset_value(column, row);
				if cost.is_infinite() || cost == 0.0 {
					continue;
				}
				let dir = flow_dir(|dc, dr| {
					let (nc, nr) = (column as i32 + dc, row as i32 + dr);
					if nc < 0 || nc >= cdim as i32 || nr < 0 || nr >= rdim as i32 {
						f32::INFINITY
					} else {
						integration.get_offset_value(nc as usize, nr as usize)
					}
				});
				flow.set_offset_value(dir, column, row);
			}
		}
		flow
	}

	/// Extract the chunk-sized flow field at the centre of a seek region.
	/// Directions at the chunk edge still see the padded outside costs
	pub fn chunk_flow_from_region(
		&self,
		chunk_id: ChunkID,
		integration: &RegionIntegrationField,
	) -> FlowField {
		let corner = TileDesc::new(chunk_id, FieldCell::new(0, 0));
		let (coff, roff) = match integration.offset_of(self.map, corner) {
			Some(offsets) => offsets,
			None => (0, 0),
		};
		let (cdim, rdim) = integration.get_dimensions();
		let mut flow = FlowField::default();
		for column in 0..FIELD_RESOLUTION {
			for row in 0..FIELD_RESOLUTION {
				let (ic, ir) = (column + coff, row + roff);
				if ic >= cdim || ir >= rdim {
					continue;
				}
				let cost = integration.get_offset_value(ic, ir);
				if cost.is_infinite() || cost == 0.0 {
					continue;
				}
				let dir = flow_dir(|dc, dr| {
					let (nc, nr) = (ic as i32 + dc, ir as i32 + dr);
					if nc < 0 || nc >= cdim as i32 || nr < 0 || nr >= rdim as i32 {
						f32::INFINITY
					} else {
						integration.get_offset_value(nc as usize, nr as usize)
					}
				});
				flow.set_field_cell_value(dir, FieldCell::new(column, row));
			}
		}
		flow
	}

	/// Top-left base tile of the seek region of a chunk, half a chunk of
	/// padding on every side clamped to the map bounds
	pub fn seek_region_base(&self, chunk_id: ChunkID) -> TileDesc {
		let mut base = TileDesc::new(chunk_id, FieldCell::new(0, 0));
		self.map.relative_tile_desc(
			&mut base,
			-((FIELD_RESOLUTION / 2) as i32),
			-((FIELD_RESOLUTION / 2) as i32),
		);
		base
	}

	/// Build the flow field of a chunk pulled towards a set of target tiles
	/// (enemy positions or the footprint of a sought entity) spread over the
	/// padded seek region around the chunk
	pub fn build_seek_field(&self, chunk_id: ChunkID, targets: &[TileDesc]) -> FlowField {
		let base = self.seek_region_base(chunk_id);
		let integration = self.region_integration(base, SEEK_REGION_RES, SEEK_REGION_RES, targets);
		self.chunk_flow_from_region(chunk_id, &integration)
	}

	/// Build the arrival field of a formation cell: a region centred on the
	/// formation with the cells tile as the goal
	pub fn build_cell_arrival_field(
		&self,
		formation_center: TileDesc,
		cell_tile: TileDesc,
	) -> RegionFlowField {
		let mut base = formation_center;
		self.map.relative_tile_desc(
			&mut base,
			-((CELL_ARRIVAL_FIELD_RES / 2) as i32),
			-((CELL_ARRIVAL_FIELD_RES / 2) as i32),
		);
		let integration = self.region_integration(
			base,
			CELL_ARRIVAL_FIELD_RES,
			CELL_ARRIVAL_FIELD_RES,
			&[cell_tile],
		);
		self.region_flow(&integration)
	}

	/// Build the recovery field leading an agent shoved onto an impassable
	/// tile back to pathable ground. The frontier is the set of passable
	/// tiles bounding the blocked component containing the agent and the
	/// wave expands over blocked tiles only
	pub fn build_nearest_pathable_field(&self, agent: TileDesc) -> FlowField {
		let chunk = self.chunks.get_chunk(self.map, self.layer, agent.chunk);
		if chunk.tile_passable(agent.cell) {
			return FlowField::default();
		}
		// flood the blocked component under the agent collecting the
		// passable tiles that bound it
		let mut component = vec![false; FIELD_RESOLUTION * FIELD_RESOLUTION];
		let at = |cell: FieldCell| cell.get_column() * FIELD_RESOLUTION + cell.get_row();
		let mut stack = vec![agent.cell];
		component[at(agent.cell)] = true;
		let mut frontier: Vec<(FieldCell, f32)> = Vec::new();
		let mut seen_frontier = vec![false; FIELD_RESOLUTION * FIELD_RESOLUTION];
		while let Some(cell) = stack.pop() {
			for neighbour in cell.orthogonal_neighbours() {
				if chunk.tile_passable(neighbour) {
					if !seen_frontier[at(neighbour)] {
						seen_frontier[at(neighbour)] = true;
						frontier.push((neighbour, 0.0));
					}
				} else if !component[at(neighbour)] {
					component[at(neighbour)] = true;
					stack.push(neighbour);
				}
			}
		}
		// integrate over blocked tiles only so the descent walks the agent
		// out of the component by the shortest hop count
		let mut field = IntegrationField::default();
		let mut queue: BinaryHeap<FrontierEntry<FieldCell>> = BinaryHeap::new();
		for (cell, cost) in frontier.iter() {
			field.set_field_cell_value(*cost, *cell);
			queue.push(FrontierEntry {
				cost: *cost,
				item: *cell,
			});
		}
		while let Some(entry) = queue.pop() {
			let current = field.get_field_cell_value(entry.item);
			if entry.cost > current {
				continue;
			}
			for neighbour in entry.item.orthogonal_neighbours() {
				if chunk.tile_passable(neighbour) {
					continue;
				}
				let total = current + 1.0;
				if total < field.get_field_cell_value(neighbour) {
					field.set_field_cell_value(total, neighbour);
					queue.push(FrontierEntry {
						cost: total,
						item: neighbour,
					});
				}
			}
		}
		self.flow_from_integration(&field)
	}
}

/// Pick the flow direction of a cell from the integration costs of its 8
/// neighbours. `cost_at` is given signed `(dc, dr)` deltas and returns
/// infinity outside the grid. Diagonals are admitted only when both flanking
/// cardinals are finite. Ties prefer cardinals in the strict order
/// `N, S, E, W, NW, NE, SW, SE` and fall through to [FlowDir::None]
pub fn flow_dir(cost_at: impl Fn(i32, i32) -> f32) -> FlowDir {
	let north = cost_at(0, -1);
	let south = cost_at(0, 1);
	let east = cost_at(1, 0);
	let west = cost_at(-1, 0);
	let mut min_cost = north.min(south).min(east).min(west);
	let north_west = if north.is_finite() && west.is_finite() {
		cost_at(-1, -1)
	} else {
		f32::INFINITY
	};
	let north_east = if north.is_finite() && east.is_finite() {
		cost_at(1, -1)
	} else {
		f32::INFINITY
	};
	let south_west = if south.is_finite() && west.is_finite() {
		cost_at(-1, 1)
	} else {
		f32::INFINITY
	};
	let south_east = if south.is_finite() && east.is_finite() {
		cost_at(1, 1)
	} else {
		f32::INFINITY
	};
	min_cost = min_cost
		.min(north_west)
		.min(north_east)
		.min(south_west)
		.min(south_east);
	if min_cost.is_infinite() {
		return FlowDir::None;
	}
	if north == min_cost {
		FlowDir::North
	} else if south == min_cost {
		FlowDir::South
	} else if east == min_cost {
		FlowDir::East
	} else if west == min_cost {
		FlowDir::West
	} else if north_west == min_cost {
		FlowDir::NorthWest
	} else if north_east == min_cost {
		FlowDir::NorthEast
	} else if south_west == min_cost {
		FlowDir::SouthWest
	} else if south_east == min_cost {
		FlowDir::SouthEast
	} else {
		// a crafted blocker pattern can starve every candidate, treat the
		// fallthrough as no direction rather than asserting
		debug!("flow descent found no matching neighbour");
		FlowDir::None
	}
}

/// Whether the cell neighbours exactly one blocked tile along either axis,
/// making it a corner that casts a line-of-sight shadow
fn is_los_corner(chunk: &NavChunk, cell: FieldCell) -> bool {
	let blocked = |column: usize, row: usize| {
		let c = FieldCell::new(column, row);
		chunk.get_cost(c) == COST_IMPASSABLE || chunk.get_blockers(c) > 0
	};
	let (column, row) = cell.get_column_row();
	if row > 0 && row < FIELD_RESOLUTION - 1 {
		let up = blocked(column, row - 1);
		let down = blocked(column, row + 1);
		if up ^ down {
			return true;
		}
	}
	if column > 0 && column < FIELD_RESOLUTION - 1 {
		let left = blocked(column - 1, row);
		let right = blocked(column + 1, row);
		if left ^ right {
			return true;
		}
	}
	false
}

/// Walk a bresenham line of slope `(target - corner)` starting at the
/// corner, marking every traversed cell `wavefront_blocked` until the line
/// leaves the chunk
fn cast_wavefront_blocked_line(
	los: &mut LosField,
	corner: FieldCell,
	target_center: Vec2,
	corner_center: Vec2,
) {
	let slope = target_center - corner_center;
	if slope == Vec2::ZERO {
		return;
	}
	let slope = slope.normalize();
	// integer deltas with 3 digits of precision kept after the decimal
	let dx = (slope.x * 1000.0).abs() as i64;
	let dy = -((slope.y * 1000.0).abs() as i64);
	let sx: i64 = if slope.x > 0.0 { 1 } else { -1 };
	let sy: i64 = if slope.y < 0.0 { 1 } else { -1 };
	let mut err = dx + dy;
	let mut column = corner.get_column() as i64;
	let mut row = corner.get_row() as i64;
	let in_bounds = |column: i64, row: i64| {
		column >= 0 && column < FIELD_RESOLUTION as i64 && row >= 0 && row < FIELD_RESOLUTION as i64
	};
	loop {
		los.set_wavefront_blocked(FieldCell::new(column as usize, row as usize));
		let e2 = 2 * err;
		let mut stepped_column = false;
		if e2 >= dy {
			err += dy;
			column += sx;
			stepped_column = true;
		}
		if e2 <= dx {
			err += dx;
			row += sy;
			// when both axes advance in one iteration fill the elbow so the
			// line stays 4-connected and the shadow watertight
			if stepped_column && in_bounds(column, row - sy) {
				los.set_wavefront_blocked(FieldCell::new(column as usize, (row - sy) as usize));
			}
		}
		if !in_bounds(column, row) {
			break;
		}
	}
}

/// Pad the wavefront by one tile of invisibility
fn pad_wavefront(los: &mut LosField) {
	let mut blocked = Vec::new();
	for column in 0..FIELD_RESOLUTION {
		for row in 0..FIELD_RESOLUTION {
			if los.is_wavefront_blocked(FieldCell::new(column, row)) {
				blocked.push((column as i32, row as i32));
			}
		}
	}
	for (column, row) in blocked {
		for dc in -1..=1 {
			for dr in -1..=1 {
				let (nc, nr) = (column + dc, row + dr);
				if nc < 0 || nc >= FIELD_RESOLUTION as i32 || nr < 0 || nr >= FIELD_RESOLUTION as i32 {
					continue;
				}
				los.set_visible(FieldCell::new(nc as usize, nr as usize), false);
			}
		}
	}
}

/// Point the passable window tiles of a portal straight across the chunk
/// boundary so agents do not stall on the seam
fn fixup_portal_edges(flow: &mut FlowField, portal: &Portal, window: &[FieldCell]) {
	let dir = match portal.get_side() {
		Ordinal::North => FlowDir::North,
		Ordinal::East => FlowDir::East,
		Ordinal::South => FlowDir::South,
		Ordinal::West => FlowDir::West,
		_ => return,
	};
	for cell in window.iter() {
		flow.set_field_cell_value(dir, *cell);
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn open_world() -> (MapDimensions, NavChunks) {
		let map = MapDimensions::new(128, 128);
		let chunks = NavChunks::new(&map);
		(map, chunks)
	}
	#[test]
	fn integration_zero_at_goal_and_monotone() {
		let (map, chunks) = open_world();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let goal = FieldCell::new(30, 30);
		let field = builder.chunk_integration(ChunkID::new(0, 0), &[(goal, 0.0)]);
		assert_eq!(0.0, field.get_field_cell_value(goal));
		assert_eq!(1.0, field.get_field_cell_value(FieldCell::new(31, 30)));
		assert_eq!(4.0, field.get_field_cell_value(FieldCell::new(30, 34)));
		// manhattan distance on a uniform field
		assert_eq!(10.0, field.get_field_cell_value(FieldCell::new(35, 35)));
	}
	#[test]
	fn integration_flows_around_walls() {
		let (map, mut chunks) = open_world();
		let chunk_id = ChunkID::new(0, 0);
		for row in 0..20 {
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, chunk_id)
				.set_cost(FieldCell::new(10, row), COST_IMPASSABLE);
		}
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let field = builder.chunk_integration(chunk_id, &[(FieldCell::new(5, 5), 0.0)]);
		assert!(field.get_field_cell_value(FieldCell::new(10, 5)).is_infinite());
		// east of the wall the cost detours under its southern tip
		let east = field.get_field_cell_value(FieldCell::new(11, 5));
		assert!(east.is_finite());
		assert!(east > 20.0);
	}
	#[test]
	fn flow_descends_to_goal() {
		let (map, chunks) = open_world();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let goal = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(20, 20));
		let (flow, integration) = builder.build_tile_field(goal, false);
		// greedily following the flow from any finite cell terminates at the
		// goal within twice the integration cost
		let start = FieldCell::new(3, 60);
		let mut current = start;
		let bound = 2 * integration.get_field_cell_value(start) as usize;
		let mut steps = 0;
		while current != goal.cell {
			let dir = flow.get_field_cell_value(current);
			assert_ne!(FlowDir::None, dir, "stuck at {:?}", current);
			let (dc, dr) = dir.delta();
			current = FieldCell::new(
				(current.get_column() as i32 + dc) as usize,
				(current.get_row() as i32 + dr) as usize,
			);
			steps += 1;
			assert!(steps <= bound, "flow did not terminate");
		}
	}
	#[test]
	fn flow_never_cuts_blocked_corners() {
		let (map, mut chunks) = open_world();
		let chunk_id = ChunkID::new(0, 0);
		// an L of impassable tiles around the diagonal from (10, 10)
		chunks
			.get_chunk_mut(&map, NavLayer::Ground1x1, chunk_id)
			.set_cost(FieldCell::new(11, 10), COST_IMPASSABLE);
		chunks
			.get_chunk_mut(&map, NavLayer::Ground1x1, chunk_id)
			.set_cost(FieldCell::new(10, 11), COST_IMPASSABLE);
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let goal = TileDesc::new(chunk_id, FieldCell::new(12, 12));
		let (flow, _) = builder.build_tile_field(goal, false);
		// the cell kitty-corner to the goal must not step diagonally through
		// the blocked pair
		let dir = flow.get_field_cell_value(FieldCell::new(10, 10));
		assert_ne!(FlowDir::SouthEast, dir);
	}
	#[test]
	fn tie_order_prefers_cardinals() {
		// all four cardinals tie, north wins
		let dir = flow_dir(|dc, dr| if dc == 0 && dr == 0 { 1.0 } else { 0.5 });
		assert_eq!(FlowDir::North, dir);
	}
	#[test]
	fn flow_dir_fallthrough_is_none() {
		let dir = flow_dir(|_, _| f32::INFINITY);
		assert_eq!(FlowDir::None, dir);
	}
	#[test]
	fn los_open_chunk_fully_visible() {
		let (map, chunks) = open_world();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let target = TileDesc::new(ChunkID::new(0, 0), FieldCell::new(32, 32));
		let los = builder.build_los(target.chunk, target, None);
		assert_eq!(FIELD_RESOLUTION * FIELD_RESOLUTION, los.visible_count());
	}
	#[test]
	fn los_corners_cast_wavefront_lines() {
		let (map, mut chunks) = open_world();
		let chunk_id = ChunkID::new(0, 0);
		for row in 28..=36 {
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, chunk_id)
				.set_cost(FieldCell::new(40, row), COST_IMPASSABLE);
		}
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let target = TileDesc::new(chunk_id, FieldCell::new(20, 32));
		let los = builder.build_los(chunk_id, target, None);
		// the northern wall end is a corner, the line of slope
		// (target - corner) marches through the neighbouring cells
		assert!(los.is_wavefront_blocked(FieldCell::new(39, 28)));
		assert!(los.is_wavefront_blocked(FieldCell::new(38, 28)));
		// padding strips visibility from the wavefront itself
		assert!(!los.is_visible(FieldCell::new(39, 28)));
		// the target and the open ground beside it stay visible
		assert!(los.is_visible(target.cell));
		assert!(los.is_visible(FieldCell::new(21, 32)));
	}
	#[test]
	fn crowded_goal_seeds_from_nearest_free_tiles() {
		let (map, mut chunks) = open_world();
		let chunk_id = ChunkID::new(0, 0);
		// a resting crowd holds the goal and its surroundings
		let goal = TileDesc::new(chunk_id, FieldCell::new(30, 30));
		chunks.block_disk(&map, map.tile_center(goal), 2.5, 0);
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let (flow, integration) = builder.build_tile_field(goal, false);
		// a distant cell still has a finite cost and a direction that walks
		// it towards the crowd
		let distant = FieldCell::new(10, 30);
		assert!(integration.get_field_cell_value(distant).is_finite());
		assert_eq!(FlowDir::East, flow.get_field_cell_value(distant));
	}
	#[test]
	fn los_inherited_across_shared_edge() {
		let (map, chunks) = open_world();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		// target in the eastern chunk, its own field fully visible
		let target = TileDesc::new(ChunkID::new(1, 0), FieldCell::new(32, 32));
		let dest_los = builder.build_los(target.chunk, target, None);
		// the western neighbour inherits visibility across the shared edge
		let west_los = builder.build_los(
			ChunkID::new(0, 0),
			target,
			Some((Ordinal::East, &dest_los)),
		);
		assert!(west_los.is_visible(FieldCell::new(63, 32)));
		assert!(west_los.is_visible(FieldCell::new(10, 32)));
	}
	#[test]
	fn seek_field_pulls_towards_outside_enemies() {
		let (map, chunks) = open_world();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let chunk_id = ChunkID::new(0, 0);
		// enemy just over the eastern border in the neighbour chunk
		let enemy_tile = TileDesc::new(ChunkID::new(1, 0), FieldCell::new(2, 32));
		let flow = builder.build_seek_field(chunk_id, &[enemy_tile]);
		let dir = flow.get_field_cell_value(FieldCell::new(60, 32));
		assert_eq!(FlowDir::East, dir);
	}
	#[test]
	fn cell_arrival_field_reaches_across_chunks() {
		let (map, chunks) = open_world();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let center = TileDesc::new(ChunkID::new(1, 1), FieldCell::new(0, 0));
		let cell_tile = TileDesc::new(ChunkID::new(1, 1), FieldCell::new(2, 2));
		let region = builder.build_cell_arrival_field(center, cell_tile);
		// a tile west of the goal in the previous chunk flows east
		let west = TileDesc::new(ChunkID::new(0, 1), FieldCell::new(60, 2));
		assert_eq!(Some(FlowDir::East), region.get_tile_value(&map, west));
	}
	#[test]
	fn nearest_pathable_escapes_component() {
		let (map, mut chunks) = open_world();
		let chunk_id = ChunkID::new(0, 0);
		// 3x3 blocked block with the agent shoved into the middle
		for column in 10..=12 {
			for row in 10..=12 {
				chunks
					.get_chunk_mut(&map, NavLayer::Ground1x1, chunk_id)
					.set_cost(FieldCell::new(column, row), COST_IMPASSABLE);
			}
		}
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let agent = TileDesc::new(chunk_id, FieldCell::new(11, 11));
		let flow = builder.build_nearest_pathable_field(agent);
		let dir = flow.get_field_cell_value(agent.cell);
		assert_ne!(FlowDir::None, dir);
		// one step along the flow leaves the component within two hops
		let (dc, dr) = dir.delta();
		let next = FieldCell::new(
			(11 + dc) as usize,
			(11 + dr) as usize,
		);
		let second = flow.get_field_cell_value(next);
		let chunk = chunks.get_chunk(&map, NavLayer::Ground1x1, chunk_id);
		let escaped_first = chunk.tile_passable(next);
		if !escaped_first {
			let (dc2, dr2) = second.delta();
			let afterwards = FieldCell::new(
				(next.get_column() as i32 + dc2) as usize,
				(next.get_row() as i32 + dr2) as usize,
			);
			assert!(chunk.tile_passable(afterwards));
		}
	}
}
