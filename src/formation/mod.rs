//! Formation planning. Given a set of agents, a target anchor and an
//! orientation the planner lays a grid of cells onto pathable terrain near
//! the target, assigns agents to cells optimally and prepares per-cell
//! arrival fields.
//!
//! Agents of the same unit type are grouped into a subformation. The
//! subformation of the lowest type id is the parent placed at the target,
//! each further type is placed behind the previous with a buffer distance
//! between the rows.
//!

pub mod hungarian;

use std::collections::BTreeMap;

use crate::prelude::*;
use bevy::prelude::*;

/// Width of the square `occupied`/`islands` subgrids laid around the
/// formation centre, must be odd so the centre is a tile
pub const OCCUPIED_FIELD_RES: usize = 95;
/// Cells of a rank are wide: `ncols = ceil(sqrt(n / 0.25))`
const RANK_WIDTH_RATIO: f32 = 0.25;
/// Cells of a column are deep: `ncols = ceil(sqrt(n / 4.0))`
const COLUMN_WIDTH_RATIO: f32 = 4.0;
/// Clearance kept between units within a subformation
const UNIT_BUFFER_DIST: f32 = 1.0;
/// Clearance kept between the back row of a parent subformation and the
/// front row of its child
const SUBFORMATION_BUFFER_DIST: f32 = 8.0;
/// Upper bound of subformations chained behind one parent
pub const MAX_CHILDREN: usize = 16;
/// Cost matrix entries are scaled before squaring to keep sub-tile
/// differences significant
const ASSIGNMENT_COST_SCALE: f32 = 100.0;
/// Cost of assigning an agent to a dummy cell when placement came up short
const UNPLACED_COST: i64 = 1 << 40;

/// How a formation arranges its cells
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Reflect)]
pub enum FormationType {
	/// No formation, agents travel as a loose flock
	#[default]
	None,
	/// Wide and shallow
	Rank,
	/// Narrow and deep
	Column,
}

/// Lifecycle state of one formation cell
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CellState {
	/// Placement has not reached the cell (or could not place it)
	#[default]
	NotPlaced,
	/// Placed and an assigned agent stands on it
	Occupied,
	/// Placed, its assigned agent is still travelling
	NotOccupied,
	/// Placed but surplus to the agent count
	NotUsed,
}

/// One position slot of a subformation grid
#[derive(Clone, Debug, Default)]
pub struct Cell {
	pub state: CellState,
	/// Idealised position from averaging anchor offsets, real valued
	pub ideal_raw: Vec2,
	/// Idealised position snapped to its tile
	pub ideal_binned: Vec2,
	/// Final collision-free position the cell settled on
	pub pos: Vec2,
	/// Tiles allocated by the cells footprint
	pub tiles: Vec<TileDesc>,
	/// Agent assigned by the hungarian pass
	pub agent: Option<u32>,
}

/// Allocation state of one tile of the occupied subgrid
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum TileState {
	#[default]
	Free,
	Allocated,
	Visited,
	Blocked,
}

/// The square subgrid of tiles around the formation centre used during
/// placement, one per navigation layer in use
struct OccupiedField {
	center_tile: TileDesc,
	occupied: Vec<TileState>,
	islands: Vec<u16>,
}

impl OccupiedField {
	/// Snapshot the passability and island labels around the centre
	fn new(map: &MapDimensions, chunks: &NavChunks, layer: NavLayer, center: Vec2) -> Option<Self> {
		let center_tile = map.get_tile_desc_from_xz(center)?;
		let mut occupied = vec![TileState::Free; OCCUPIED_FIELD_RES * OCCUPIED_FIELD_RES];
		let mut islands = vec![ISLAND_NONE; OCCUPIED_FIELD_RES * OCCUPIED_FIELD_RES];
		let half = (OCCUPIED_FIELD_RES / 2) as i32;
		for row in 0..OCCUPIED_FIELD_RES {
			for column in 0..OCCUPIED_FIELD_RES {
				let index = row * OCCUPIED_FIELD_RES + column;
				let mut td = center_tile;
				let absorbed =
					map.relative_tile_desc(&mut td, column as i32 - half, row as i32 - half);
				if !absorbed {
					occupied[index] = TileState::Blocked;
					continue;
				}
				if !chunks.tile_passable(map, layer, td) {
					occupied[index] = TileState::Blocked;
					continue;
				}
				islands[index] = chunks.get_chunk(map, layer, td.chunk).get_island(td.cell);
			}
		}
		Some(OccupiedField {
			center_tile,
			occupied,
			islands,
		})
	}
	fn in_bounds(coord: (i32, i32)) -> bool {
		coord.0 >= 0
			&& coord.0 < OCCUPIED_FIELD_RES as i32
			&& coord.1 >= 0
			&& coord.1 < OCCUPIED_FIELD_RES as i32
	}
	fn state(&self, coord: (i32, i32)) -> TileState {
		self.occupied[coord.1 as usize * OCCUPIED_FIELD_RES + coord.0 as usize]
	}
	fn set_state(&mut self, coord: (i32, i32), state: TileState) {
		self.occupied[coord.1 as usize * OCCUPIED_FIELD_RES + coord.0 as usize] = state;
	}
	fn island(&self, coord: (i32, i32)) -> u16 {
		self.islands[coord.1 as usize * OCCUPIED_FIELD_RES + coord.0 as usize]
	}
	/// Descriptor of a local `(column, row)` coordinate
	fn tile_desc(&self, map: &MapDimensions, coord: (i32, i32)) -> Option<TileDesc> {
		let half = (OCCUPIED_FIELD_RES / 2) as i32;
		let mut td = self.center_tile;
		if map.relative_tile_desc(&mut td, coord.0 - half, coord.1 - half) {
			Some(td)
		} else {
			None
		}
	}
	/// World centre of a local coordinate
	fn tile_to_pos(&self, map: &MapDimensions, coord: (i32, i32)) -> Vec2 {
		match self.tile_desc(map, coord) {
			Some(td) => map.tile_center(td),
			None => map.tile_center(self.center_tile),
		}
	}
	/// Local coordinate of a world position, clamped into the subgrid
	fn pos_to_tile(&self, map: &MapDimensions, pos: Vec2) -> (i32, i32) {
		let half = (OCCUPIED_FIELD_RES / 2) as i32;
		let td = match map.get_tile_desc_from_xz(pos) {
			Some(td) => td,
			None => self.center_tile,
		};
		let (dc, dr) = map.tile_distance(self.center_tile, td);
		(
			(dc + half).clamp(0, OCCUPIED_FIELD_RES as i32 - 1),
			(dr + half).clamp(0, OCCUPIED_FIELD_RES as i32 - 1),
		)
	}
	/// The nearest tile to `start` that is free and on the wanted island,
	/// walking outward ring by ring
	fn nearest_free_tile(&self, start: (i32, i32), iid: u16) -> Option<(i32, i32)> {
		if Self::in_bounds(start) && self.state(start) == TileState::Free && self.island(start) == iid
		{
			return Some(start);
		}
		for ring in 1..OCCUPIED_FIELD_RES as i32 {
			for dr in -ring..=ring {
				for dc in -ring..=ring {
					if dr.abs() != ring && dc.abs() != ring {
						continue;
					}
					let coord = (start.0 + dc, start.1 + dr);
					if !Self::in_bounds(coord) {
						continue;
					}
					if self.state(coord) == TileState::Free && self.island(coord) == iid {
						return Some(coord);
					}
				}
			}
		}
		None
	}
}

/// A sub-group of agents of one unit type within a formation
pub struct Subformation {
	/// Unit type shared by the agents
	pub type_id: u32,
	/// Selection radius shared by the agents
	pub unit_radius: f32,
	/// Navigation layer of the footprint
	pub layer: NavLayer,
	pub nrows: usize,
	pub ncols: usize,
	/// Row-major grid of cells, row 0 is the front row
	pub cells: Vec<Cell>,
	/// Agents bound to the subformation
	pub ents: Vec<u32>,
}

impl Subformation {
	/// Cell at `(row, column)`
	pub fn cell(&self, row: usize, column: usize) -> &Cell {
		&self.cells[row * self.ncols + column]
	}
	fn cell_mut(&mut self, row: usize, column: usize) -> &mut Cell {
		&mut self.cells[row * self.ncols + column]
	}
	/// Average position of the back row, anchoring any child subformation
	fn back_row_average_pos(&self) -> Vec2 {
		let row = self.nrows - 1;
		let mut total = Vec2::ZERO;
		let mut count = 0;
		for column in 0..self.ncols {
			let cell = self.cell(row, column);
			if cell.state != CellState::NotPlaced {
				total += cell.pos;
				count += 1;
			}
		}
		if count == 0 {
			total
		} else {
			total / count as f32
		}
	}
	/// Average position of the occupied cells
	pub fn center(&self) -> Vec2 {
		let mut total = Vec2::ZERO;
		let mut count = 0;
		for cell in self.cells.iter() {
			if cell.state == CellState::NotOccupied || cell.state == CellState::Occupied {
				total += cell.pos;
				count += 1;
			}
		}
		if count == 0 {
			total
		} else {
			total / count as f32
		}
	}
}

/// Number of cell columns of a subformation
fn ncols(kind: FormationType, nunits: usize) -> usize {
	let ratio = match kind {
		FormationType::Rank => RANK_WIDTH_RATIO,
		FormationType::Column => COLUMN_WIDTH_RATIO,
		FormationType::None => return nunits.max(1),
	};
	(((nunits as f32 / ratio).sqrt().ceil()) as usize).clamp(1, nunits.max(1))
}

/// Number of cell rows of a subformation
fn nrows(kind: FormationType, nunits: usize) -> usize {
	(nunits as f32 / ncols(kind, nunits) as f32).ceil() as usize
}

/// Identifier of a live formation
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Reflect)]
pub struct FormationId(pub u64);

/// A unit handed to the formation planner
#[derive(Clone, Copy, Debug)]
pub struct FormationUnit {
	pub uid: u32,
	pub pos: Vec2,
	pub radius: f32,
	pub type_id: u32,
}

/// A planned formation: the subformation tree plus the per-agent cell
/// assignments and arrival fields
pub struct Formation {
	pub id: FormationId,
	pub kind: FormationType,
	pub target: Vec2,
	pub orientation: Vec2,
	/// Centre of the occupied field, shifted behind the target
	pub center: Vec2,
	/// Subformations ordered parent first
	pub subformations: Vec<Subformation>,
	/// Agent to `(subformation, row, column)` assignment
	pub assignment: BTreeMap<u32, (usize, usize, usize)>,
	/// Cell-arrival fields keyed by assigned agent
	pub arrival_fields: BTreeMap<u32, RegionFlowField>,
	/// Arrival field builds not yet performed, `(uid, cell tile)`
	pub arrival_pending: Vec<(u32, TileDesc)>,
	/// Number of agents still bound to the formation
	refcount: usize,
}

impl Formation {
	/// Whether the agent has a cell in the formation
	pub fn assigned_to_cell(&self, uid: u32) -> bool {
		self.assignment.contains_key(&uid)
	}
	/// The cell assigned to an agent
	pub fn cell_of(&self, uid: u32) -> Option<&Cell> {
		let (sub, row, column) = self.assignment.get(&uid)?;
		Some(self.subformations[*sub].cell(*row, *column))
	}
	/// Mark the agents cell occupied/unoccupied as it arrives and leaves
	pub fn set_cell_occupied(&mut self, uid: u32, occupied: bool) {
		if let Some((sub, row, column)) = self.assignment.get(&uid).copied() {
			let cell = self.subformations[sub].cell_mut(row, column);
			cell.state = if occupied {
				CellState::Occupied
			} else {
				CellState::NotOccupied
			};
		}
	}
	/// Arrival field of an agent if it has been built
	pub fn arrival_field(&self, uid: u32) -> Option<&RegionFlowField> {
		self.arrival_fields.get(&uid)
	}
	/// Build every pending arrival field synchronously. The plugin layer
	/// normally drains [Formation::arrival_pending] onto worker tasks
	/// instead
	pub fn build_arrival_fields_now(&mut self, builder: &FieldBuilder) {
		let center_tile = match builder.map.get_tile_desc_from_xz(self.center) {
			Some(td) => td,
			None => return,
		};
		for (uid, cell_tile) in std::mem::take(&mut self.arrival_pending) {
			let field = builder.build_cell_arrival_field(center_tile, cell_tile);
			self.arrival_fields.insert(uid, field);
		}
	}
}

/// All live formations plus the agent to formation binding
#[derive(Component, Default)]
pub struct Formations {
	formations: BTreeMap<FormationId, Formation>,
	membership: BTreeMap<u32, FormationId>,
	next_id: u64,
}

impl Formations {
	/// Get a formation by id
	pub fn get(&self, id: FormationId) -> Option<&Formation> {
		self.formations.get(&id)
	}
	/// Get a mutable formation by id
	pub fn get_mut(&mut self, id: FormationId) -> Option<&mut Formation> {
		self.formations.get_mut(&id)
	}
	/// The formation an agent is bound to
	pub fn formation_of(&self, uid: u32) -> Option<&Formation> {
		self.formations.get(self.membership.get(&uid)?)
	}
	/// Mutable access to the formation an agent is bound to
	pub fn formation_of_mut(&mut self, uid: u32) -> Option<&mut Formation> {
		let id = *self.membership.get(&uid)?;
		self.formations.get_mut(&id)
	}
	/// Number of live formations
	pub fn len(&self) -> usize {
		self.formations.len()
	}
	/// Ids of every live formation
	pub fn ids(&self) -> Vec<FormationId> {
		self.formations.keys().copied().collect()
	}
	/// Mark the cell assigned to an agent occupied or unoccupied
	pub fn set_cell_occupied(&mut self, uid: u32, occupied: bool) {
		if let Some(formation) = self.formation_of_mut(uid) {
			formation.set_cell_occupied(uid, occupied);
		}
	}
	/// Whether no formations are live
	pub fn is_empty(&self) -> bool {
		self.formations.is_empty()
	}
	/// Unbind an agent. The formation is destroyed when its last agent
	/// leaves
	pub fn remove_agent(&mut self, uid: u32) {
		let Some(id) = self.membership.remove(&uid) else {
			return;
		};
		let Some(formation) = self.formations.get_mut(&id) else {
			return;
		};
		formation.refcount = formation.refcount.saturating_sub(1);
		if formation.refcount == 0 {
			self.formations.remove(&id);
		}
	}
	/// Plan a formation for the units and bind them to it.
	///
	/// When `orientation` is [None] it is derived from the centroid of the
	/// units towards the target. Returns [None] when the target is off the
	/// map or no unit is placeable
	pub fn create(
		&mut self,
		map: &MapDimensions,
		chunks: &NavChunks,
		target: Vec2,
		orientation: Option<Vec2>,
		units: &[FormationUnit],
		kind: FormationType,
	) -> Option<FormationId> {
		if units.is_empty() || kind == FormationType::None {
			return None;
		}
		map.get_tile_desc_from_xz(target)?;
		// release any previous binding
		for unit in units.iter() {
			self.remove_agent(unit.uid);
		}
		let orientation = match orientation {
			Some(dir) if dir.length_squared() > f32::EPSILON => dir.normalize(),
			_ => compute_orientation(target, units),
		};
		let center = field_center(map, target, orientation);
		// partition into subformations by type id, lowest type first
		let mut by_type: BTreeMap<u32, Vec<FormationUnit>> = BTreeMap::new();
		for unit in units.iter() {
			by_type.entry(unit.type_id).or_default().push(*unit);
		}
		let mut subformations: Vec<Subformation> = Vec::new();
		for (type_id, members) in by_type.into_iter().take(MAX_CHILDREN) {
			let n = members.len();
			let radius = members
				.iter()
				.map(|unit| unit.radius)
				.fold(0.0f32, f32::max)
				.max(0.5);
			subformations.push(Subformation {
				type_id,
				unit_radius: radius,
				layer: NavLayer::for_radius(radius),
				nrows: nrows(kind, n),
				ncols: ncols(kind, n),
				cells: vec![Cell::default(); nrows(kind, n) * ncols(kind, n)],
				ents: members.iter().map(|unit| unit.uid).collect(),
			});
		}
		// per-layer occupancy snapshots shared by every subformation
		let mut fields: BTreeMap<usize, OccupiedField> = BTreeMap::new();
		for sub in subformations.iter() {
			if !fields.contains_key(&sub.layer.index()) {
				fields.insert(
					sub.layer.index(),
					OccupiedField::new(map, chunks, sub.layer, center)?,
				);
			}
		}
		// place parent at the target, each child behind its predecessor
		let mut anchor = target;
		for index in 0..subformations.len() {
			if index > 0 {
				let parent = &subformations[index - 1];
				let offset = subformation_offset(parent);
				anchor = parent.back_row_average_pos() - orientation * offset;
			}
			let layer_index = subformations[index].layer.index();
			let field = fields.get_mut(&layer_index).expect("field prepared above");
			place_subformation(map, &mut subformations[index], field, anchor, orientation);
			mark_unused_cells(&mut subformations[index], field);
		}
		// hungarian assignment of agents to cells per subformation
		let id = FormationId(self.next_id);
		self.next_id += 1;
		let mut assignment = BTreeMap::new();
		let mut arrival_pending = Vec::new();
		for (sub_index, sub) in subformations.iter_mut().enumerate() {
			let placed: Vec<(usize, usize)> = (0..sub.nrows)
				.flat_map(|row| (0..sub.ncols).map(move |column| (row, column)))
				.filter(|(row, column)| {
					sub.cells[row * sub.ncols + column].state == CellState::NotOccupied
				})
				.collect();
			let members: Vec<FormationUnit> = units
				.iter()
				.filter(|unit| sub.ents.contains(&unit.uid))
				.copied()
				.collect();
			let n = members.len().max(placed.len());
			if n == 0 {
				continue;
			}
			let mut costs = vec![vec![UNPLACED_COST; n]; n];
			for (row_index, unit) in members.iter().enumerate() {
				for (column_index, (row, column)) in placed.iter().enumerate() {
					let cell_pos = sub.cells[row * sub.ncols + column].pos;
					let len = unit.pos.distance(cell_pos) * ASSIGNMENT_COST_SCALE;
					// squared so a far agent never leapfrogs a near one
					costs[row_index][column_index] = (len as i64).saturating_mul(len as i64);
				}
			}
			let result = hungarian::solve(&costs);
			for (row_index, column_index) in result.iter().enumerate() {
				if row_index >= members.len() || *column_index >= placed.len() {
					continue;
				}
				let unit = members[row_index];
				let (row, column) = placed[*column_index];
				sub.cells[row * sub.ncols + column].agent = Some(unit.uid);
				assignment.insert(unit.uid, (sub_index, row, column));
				if let Some(cell_tile) = sub.cells[row * sub.ncols + column].tiles.first() {
					arrival_pending.push((unit.uid, *cell_tile));
				}
			}
		}
		if assignment.is_empty() {
			return None;
		}
		let refcount = units.len();
		for unit in units.iter() {
			self.membership.insert(unit.uid, id);
		}
		self.formations.insert(
			id,
			Formation {
				id,
				kind,
				target,
				orientation,
				center,
				subformations,
				assignment,
				arrival_fields: BTreeMap::new(),
				arrival_pending,
				refcount,
			},
		);
		Some(id)
	}
}

/// Orientation from the centroid of the units towards the target
fn compute_orientation(target: Vec2, units: &[FormationUnit]) -> Vec2 {
	let mut com = Vec2::ZERO;
	for unit in units.iter() {
		com += unit.pos;
	}
	com /= units.len() as f32;
	let orientation = target - com;
	if orientation.length_squared() <= f32::EPSILON {
		Vec2::new(1.0, 0.0)
	} else {
		orientation.normalize()
	}
}

/// Shift the field centre against the orientation by a third of the occupied
/// field span. Units are placed behind the target so this improves field
/// utilisation
fn field_center(map: &MapDimensions, target: Vec2, orientation: Vec2) -> Vec2 {
	let delta = orientation * (OCCUPIED_FIELD_RES as f32 / 3.0);
	let center = target - delta;
	let half_l = (map.get_length() / 2) as f32 - 1.0;
	let half_d = (map.get_depth() / 2) as f32 - 1.0;
	Vec2::new(center.x.clamp(-half_l, half_l), center.y.clamp(-half_d, half_d))
}

/// Tile-aligned spacing between adjacent cells of a subformation
fn direction_offsets(sub: &Subformation) -> Vec2 {
	let spacing = (sub.unit_radius * 2.0 + UNIT_BUFFER_DIST).ceil();
	Vec2::new(spacing, spacing)
}

/// Distance between the back row of a parent and the anchor of its child
fn subformation_offset(parent: &Subformation) -> f32 {
	let buffer = (parent.unit_radius.ceil() + 1.0) * 2.0;
	buffer + SUBFORMATION_BUFFER_DIST
}

/// Try to claim every tile under the cells footprint. All tiles must be free
/// and on the wanted island, on success they are allocated
fn try_occupy_cell(
	map: &MapDimensions,
	field: &mut OccupiedField,
	coord: (i32, i32),
	radius: f32,
	iid: u16,
) -> Option<Vec<TileDesc>> {
	let center = field.tile_to_pos(map, coord);
	let covered = map.tiles_under_circle(center, radius);
	if covered.is_empty() {
		return None;
	}
	let mut coords = Vec::with_capacity(covered.len());
	for td in covered.iter() {
		let local = field.pos_to_tile(map, map.tile_center(*td));
		if !OccupiedField::in_bounds(local) {
			return None;
		}
		if field.island(local) != iid {
			return None;
		}
		let state = field.state(local);
		if state != TileState::Free && state != TileState::Visited {
			return None;
		}
		coords.push(local);
	}
	for local in coords {
		field.set_state(local, TileState::Allocated);
	}
	Some(covered)
}

/// Place one cell: derive a target position by averaging offsets from the
/// already-placed anchors, snap it to the nearest free tile of the wanted
/// island and claim the footprint
#[allow(clippy::too_many_arguments)]
fn place_cell(
	map: &MapDimensions,
	field: &mut OccupiedField,
	sub: &mut Subformation,
	row: usize,
	column: usize,
	anchor_pos: Vec2,
	target_iid: u16,
	orientation: Vec2,
	offsets: Vec2,
) -> bool {
	let perpendicular = Vec2::new(-orientation.y, orientation.x);
	let mut pos = Vec2::ZERO;
	let mut count = 0;
	// average the projections from every placed neighbour
	let neighbours: [(i32, i32, Vec2); 4] = [
		(-1i32, 0i32, orientation * -offsets.x),   // front anchor projects back
		(1, 0, orientation * offsets.x),           // back anchor projects front
		(0, -1, perpendicular * offsets.y),        // left anchor projects right
		(0, 1, perpendicular * -offsets.y),        // right anchor projects left
	];
	for (dr, dc, offset) in neighbours {
		let (nr, nc) = (row as i32 + dr, column as i32 + dc);
		if nr < 0 || nr >= sub.nrows as i32 || nc < 0 || nc >= sub.ncols as i32 {
			continue;
		}
		let anchor = sub.cell(nr as usize, nc as usize);
		if anchor.state == CellState::NotPlaced {
			continue;
		}
		pos += anchor.pos + offset;
		count += 1;
	}
	if count > 0 {
		pos /= count as f32;
	} else {
		pos = anchor_pos;
	}
	let ideal_raw = pos;
	let start = field.pos_to_tile(map, pos);
	let ideal_binned = field.tile_to_pos(map, start);
	let mut candidate = match field.nearest_free_tile(start, target_iid) {
		Some(coord) => coord,
		None => return false,
	};
	let mut visited: Vec<(i32, i32)> = Vec::new();
	let claimed = loop {
		match try_occupy_cell(map, field, candidate, sub.unit_radius, target_iid) {
			Some(tiles) => break Some(tiles),
			None => {
				field.set_state(candidate, TileState::Visited);
				visited.push(candidate);
				match field.nearest_free_tile(candidate, target_iid) {
					Some(next) => candidate = next,
					None => break None,
				}
			}
		}
	};
	for coord in visited {
		if field.state(coord) == TileState::Visited {
			field.set_state(coord, TileState::Free);
		}
	}
	let Some(tiles) = claimed else {
		return false;
	};
	let final_pos = field.tile_to_pos(map, candidate);
	let cell = sub.cell_mut(row, column);
	cell.ideal_raw = ideal_raw;
	cell.ideal_binned = ideal_binned;
	cell.pos = final_pos;
	cell.tiles = tiles;
	cell.state = CellState::NotOccupied;
	true
}

/// Breadth-first placement starting from the centre cell of the front row,
/// expanding to front/back/left/right neighbours
fn place_subformation(
	map: &MapDimensions,
	sub: &mut Subformation,
	field: &mut OccupiedField,
	anchor: Vec2,
	orientation: Vec2,
) {
	let offsets = direction_offsets(sub);
	let anchor_coord = field.pos_to_tile(map, anchor);
	let mut target_iid = field.island(anchor_coord);
	if target_iid == ISLAND_NONE {
		// anchor on blocked ground, borrow the island of the closest free
		// tile instead, the reachable approximation of the target
		'rings: for ring in 1..OCCUPIED_FIELD_RES as i32 {
			for dr in -ring..=ring {
				for dc in -ring..=ring {
					if dr.abs() != ring && dc.abs() != ring {
						continue;
					}
					let coord = (anchor_coord.0 + dc, anchor_coord.1 + dr);
					if OccupiedField::in_bounds(coord)
						&& field.state(coord) == TileState::Free
						&& field.island(coord) != ISLAND_NONE
					{
						target_iid = field.island(coord);
						break 'rings;
					}
				}
			}
		}
	}
	if target_iid == ISLAND_NONE {
		return;
	}
	let start = (0usize, sub.ncols / 2);
	let mut frontier = std::collections::VecDeque::new();
	frontier.push_back(start);
	while let Some((row, column)) = frontier.pop_front() {
		if sub.cell(row, column).state != CellState::NotPlaced {
			continue;
		}
		if !place_cell(
			map,
			field,
			sub,
			row,
			column,
			anchor,
			target_iid,
			orientation,
			offsets,
		) {
			break;
		}
		let deltas: [(i32, i32); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];
		for (dr, dc) in deltas {
			let (nr, nc) = (row as i32 + dr, column as i32 + dc);
			if nr < 0 || nr >= sub.nrows as i32 || nc < 0 || nc >= sub.ncols as i32 {
				continue;
			}
			if sub.cell(nr as usize, nc as usize).state == CellState::NotPlaced {
				frontier.push_back((nr as usize, nc as usize));
			}
		}
	}
}

/// Mark surplus placed cells unused, alternating between the leftmost and
/// rightmost back-row cells, releasing their tiles
fn mark_unused_cells(sub: &mut Subformation, field: &mut OccupiedField) {
	let placed = sub
		.cells
		.iter()
		.filter(|cell| cell.state == CellState::NotOccupied)
		.count();
	let nents = sub.ents.len();
	if placed <= nents {
		return;
	}
	let mut surplus = placed - nents;
	let mut from_left = true;
	let back = sub.nrows - 1;
	let mut left = 0i32;
	let mut right = sub.ncols as i32 - 1;
	while surplus > 0 && left <= right {
		let column = if from_left { left } else { right };
		let cell = sub.cell_mut(back, column as usize);
		if cell.state == CellState::NotOccupied {
			cell.state = CellState::NotUsed;
			let tiles = std::mem::take(&mut cell.tiles);
			for td in tiles {
				surplus_release(field, td);
			}
			surplus -= 1;
		}
		if from_left {
			left += 1;
		} else {
			right -= 1;
		}
		from_left = !from_left;
	}
}

/// Release an allocated tile back to the free pool
fn surplus_release(field: &mut OccupiedField, td: TileDesc) {
	let half = (OCCUPIED_FIELD_RES / 2) as i32;
	let (tc, tr) = td.global();
	let (cc, cr) = field.center_tile.global();
	let coord = (
		tc as i32 - cc as i32 + half,
		tr as i32 - cr as i32 + half,
	);
	if OccupiedField::in_bounds(coord) && field.state(coord) == TileState::Allocated {
		field.set_state(coord, TileState::Free);
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn world() -> (MapDimensions, NavChunks) {
		let map = MapDimensions::new(256, 256);
		let chunks = NavChunks::new(&map);
		(map, chunks)
	}
	fn units(n: usize, around: Vec2) -> Vec<FormationUnit> {
		(0..n)
			.map(|i| FormationUnit {
				uid: i as u32 + 1,
				pos: around + Vec2::new((i % 5) as f32 * 2.0, (i / 5) as f32 * 2.0),
				radius: 0.5,
				type_id: 7,
			})
			.collect()
	}
	#[test]
	fn rank_of_25_has_10_columns_3_rows() {
		assert_eq!(10, ncols(FormationType::Rank, 25));
		assert_eq!(3, nrows(FormationType::Rank, 25));
	}
	#[test]
	fn column_of_25_is_narrow() {
		assert_eq!(3, ncols(FormationType::Column, 25));
		assert_eq!(9, nrows(FormationType::Column, 25));
	}
	#[test]
	fn single_unit_degenerate_grid() {
		assert_eq!(1, ncols(FormationType::Rank, 1));
		assert_eq!(1, nrows(FormationType::Rank, 1));
		let (map, chunks) = world();
		let mut formations = Formations::default();
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(20.0, 20.0),
				Some(Vec2::new(1.0, 0.0)),
				&units(1, Vec2::new(-40.0, -40.0)),
				FormationType::Rank,
			)
			.unwrap();
		let formation = formations.get(id).unwrap();
		assert_eq!(1, formation.subformations.len());
		assert!(formation.assigned_to_cell(1));
	}
	#[test]
	fn assignment_is_a_bijection_onto_placed_cells() {
		let (map, chunks) = world();
		let mut formations = Formations::default();
		let agents = units(25, Vec2::new(-40.0, -40.0));
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(30.0, 30.0),
				Some(Vec2::new(1.0, 0.0)),
				&agents,
				FormationType::Rank,
			)
			.unwrap();
		let formation = formations.get(id).unwrap();
		assert_eq!(25, formation.assignment.len());
		// every assigned cell is distinct
		let mut seen = std::collections::BTreeSet::new();
		for slot in formation.assignment.values() {
			assert!(seen.insert(*slot));
		}
		// and every placed cell is within the grid
		for (sub_index, row, column) in seen {
			let sub = &formation.subformations[sub_index];
			assert!(row < sub.nrows && column < sub.ncols);
			assert_eq!(CellState::NotOccupied, sub.cell(row, column).state);
		}
	}
	#[test]
	fn no_two_cells_share_a_tile() {
		let (map, chunks) = world();
		let mut formations = Formations::default();
		let agents = units(25, Vec2::new(-40.0, -40.0));
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(30.0, 30.0),
				Some(Vec2::new(1.0, 0.0)),
				&agents,
				FormationType::Rank,
			)
			.unwrap();
		let formation = formations.get(id).unwrap();
		let mut seen = std::collections::BTreeSet::new();
		for sub in formation.subformations.iter() {
			for cell in sub.cells.iter() {
				for td in cell.tiles.iter() {
					assert!(seen.insert(*td), "tile {:?} allocated twice", td);
				}
			}
		}
	}
	#[test]
	fn mixed_types_chain_subformations() {
		let (map, chunks) = world();
		let mut formations = Formations::default();
		let mut agents = units(10, Vec2::new(-40.0, -40.0));
		for (index, agent) in agents.iter_mut().enumerate() {
			if index >= 5 {
				agent.type_id = 9;
				agent.uid = 100 + index as u32;
			}
		}
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(30.0, 30.0),
				Some(Vec2::new(0.0, 1.0)),
				&agents,
				FormationType::Rank,
			)
			.unwrap();
		let formation = formations.get(id).unwrap();
		assert_eq!(2, formation.subformations.len());
		// the lowest type id parents the chain
		assert_eq!(7, formation.subformations[0].type_id);
		// the child sits behind the parent against the orientation
		let parent_center = formation.subformations[0].center();
		let child_center = formation.subformations[1].center();
		assert!(child_center.y < parent_center.y);
	}
	#[test]
	fn refcount_destroys_empty_formation() {
		let (map, chunks) = world();
		let mut formations = Formations::default();
		let agents = units(3, Vec2::new(-40.0, -40.0));
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(30.0, 30.0),
				None,
				&agents,
				FormationType::Column,
			)
			.unwrap();
		assert_eq!(1, formations.len());
		formations.remove_agent(1);
		formations.remove_agent(2);
		assert!(formations.get(id).is_some());
		formations.remove_agent(3);
		assert!(formations.get(id).is_none());
	}
	#[test]
	fn cells_avoid_impassable_terrain() {
		let (map, mut chunks) = world();
		// block a patch right at the target
		for gc in 150..=165 {
			for gr in 150..=165 {
				let td = TileDesc::from_global(gc, gr);
				chunks
					.get_chunk_mut(&map, NavLayer::Ground1x1, td.chunk)
					.set_cost(td.cell, COST_IMPASSABLE);
			}
		}
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let mut formations = Formations::default();
		// target world pos of global tile (157, 157) is (29.5, 29.5)
		let agents = units(9, Vec2::new(-40.0, -40.0));
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(29.5, 29.5),
				Some(Vec2::new(1.0, 0.0)),
				&agents,
				FormationType::Rank,
			)
			.unwrap();
		let formation = formations.get(id).unwrap();
		for sub in formation.subformations.iter() {
			for cell in sub.cells.iter() {
				for td in cell.tiles.iter() {
					assert!(chunks.tile_passable(&map, NavLayer::Ground1x1, *td));
				}
			}
		}
	}
	#[test]
	fn arrival_fields_build_for_every_assignment() {
		let (map, chunks) = world();
		let mut formations = Formations::default();
		let agents = units(4, Vec2::new(-40.0, -40.0));
		let id = formations
			.create(
				&map,
				&chunks,
				Vec2::new(30.0, 30.0),
				Some(Vec2::new(1.0, 0.0)),
				&agents,
				FormationType::Rank,
			)
			.unwrap();
		let builder = FieldBuilder::new(&map, &chunks, NavLayer::Ground1x1);
		let formation = formations.get_mut(id).unwrap();
		assert_eq!(4, formation.arrival_pending.len());
		formation.build_arrival_fields_now(&builder);
		assert!(formation.arrival_pending.is_empty());
		for unit in agents.iter() {
			assert!(formation.arrival_field(unit.uid).is_some());
		}
	}
}
