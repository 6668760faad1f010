//! The movement tick outer loop. Each tick drains the command queue,
//! refreshes islands and portals where passability changed, satisfies field
//! requests, then fans per-agent velocity and state computation out across
//! worker tasks in bounded bundles and applies the resulting patches in
//! order on the owning side.
//!

use bevy::prelude::*;
use bevy::tasks::{ComputeTaskPool, TaskPool};

use crate::movement::clearpath;
use crate::movement::steering::{self, Neighbour, SteeringContext};
use crate::prelude::*;

/// Upper bound of concurrently running per-agent work bundles
pub const MAX_MOVE_TASKS: usize = 64;
/// Distance to the assigned cell below which a formation traveller switches
/// onto its cell arrival field
pub const FORMATION_ARRIVE_RADIUS: f32 = 10.0;
/// Distance to the cell position at which the cell counts as occupied
pub const CELL_OCCUPY_RADIUS: f32 = 0.75;
/// Clearance added on top of combined radii for touch tests
const TOUCH_BUFFER: f32 = 0.5;
/// Velocities below this are considered stopped
const VEL_EPS: f32 = 1.0 / 1024.0;

/// Everything collected for one agent ahead of the fork-join
struct AgentWork {
	uid: u32,
	state: ArrivalState,
	pos: Vec2,
	velocity: Vec2,
	radius: f32,
	/// Units per tick
	speed_cap: f32,
	/// Desired velocity sampled from the appropriate field
	v_desired: Vec2,
	/// Point target of the current command, if any
	target: Option<Vec2>,
	/// Straight line to the final target is clear
	has_dest_los: bool,
	dynamic_neighbours: Vec<Neighbour>,
	static_neighbours: Vec<Neighbour>,
	/// Touching an already-arrived member of the same flock
	beside_arrived_flockmate: bool,
	cell_pos: Option<Vec2>,
	formation_dir: Option<Vec2>,
	/// Surround/enter-range target state
	target_pos: Option<Vec2>,
	target_radius: f32,
	target_range: f32,
	target_dir: Quat,
	rot: Quat,
	using_surround_field: bool,
	wait_prev: ArrivalState,
	wait_ticks_left: u32,
}

/// The outcome of one agents tick computation, applied in uid order on the
/// owning side
struct MovePatch {
	uid: u32,
	state: ArrivalState,
	velocity: Vec2,
	next_pos: Vec2,
	next_rot: Option<Quat>,
	using_surround_field: bool,
	wait_prev: ArrivalState,
	wait_ticks_left: u32,
	/// The agent settled onto its formation cell
	occupies_cell: bool,
}

/// A field the tick needs that the cache does not yet hold
enum FieldRequest {
	Tile {
		id: FieldId,
		target: TileDesc,
		ignore_blockers: bool,
		with_los: bool,
	},
	Portal {
		id: FieldId,
		hop: PortalHop,
	},
	Seek {
		id: FieldId,
		chunk: ChunkID,
		targets: Vec<TileDesc>,
		enemies: u16,
	},
	NearestPathable {
		id: FieldId,
		agent: TileDesc,
	},
}

impl FieldRequest {
	fn id(&self) -> FieldId {
		match self {
			FieldRequest::Tile { id, .. }
			| FieldRequest::Portal { id, .. }
			| FieldRequest::Seek { id, .. }
			| FieldRequest::NearestPathable { id, .. } => *id,
		}
	}
}

/// Run one full movement tick against the navigation state
#[allow(clippy::too_many_arguments)]
pub fn run_movement_tick(
	map: &MapDimensions,
	chunks: &mut NavChunks,
	portals: &mut ChunkPortals,
	cache: &mut FieldCache,
	formations: &mut Formations,
	states: &mut MoveStates,
	queue: &mut CommandQueue,
	snapshot: &GameStateSnapshot,
	config: &NavConfig,
) {
	if config.backend == VelocityBackend::Gpu {
		// the gpu path is accepted for configuration compatibility but the
		// velocity pass always runs on the cpu worker pool
		warn!("gpu velocity backend unavailable, computing on cpu");
	}
	let tick_hz = config.tick_hz();
	// commands first so freshly issued orders act this tick
	for command in queue.drain() {
		apply_command(command, map, chunks, formations, states, snapshot);
	}
	// lazily repaint islands and refresh portals where passability changed
	for layer in NavLayer::all() {
		let dirty = chunks.take_dirty(layer);
		for chunk in dirty.iter() {
			cache.invalidate(*chunk, layer);
		}
		if chunks.islands_dirty(layer) {
			chunks.repaint_islands(map, layer);
			portals.rebuild_layer(map, chunks, layer);
			cache.flush_layer(layer);
		}
	}
	states.disband_arrived_flocks();
	// surround targets that moved invalidate their pull fields, forcing a
	// fresh path on the next request
	let moved_targets: Vec<(u32, u32, Vec2)> = states
		.iter()
		.filter_map(|(uid, state)| {
			if state.state != ArrivalState::SurroundEntity {
				return None;
			}
			let target_uid = state.surround_target_uid?;
			let target = snapshot.ent(target_uid)?;
			if target.pos.distance(state.surround_target_prev) > 1.0 {
				Some((*uid, target_uid, target.pos))
			} else {
				None
			}
		})
		.collect();
	for (uid, target_uid, target_pos) in moved_targets {
		cache.invalidate_entity(target_uid);
		if let Some(state) = states.get_mut(uid) {
			state.surround_target_prev = target_pos;
		}
	}
	// outstanding formation arrival fields fan out across the pool
	build_pending_arrival_fields(map, chunks, formations);
	// satisfy field requests of every travelling agent
	let requests = collect_field_requests(map, chunks, portals, cache, states, snapshot);
	build_requested_fields(map, chunks, portals, cache, requests);
	// collect per-agent work and fork the velocity/state computation
	let work = collect_agent_work(map, chunks, cache, portals, formations, states, snapshot, tick_hz);
	let patches = compute_patches(map, chunks, &work, tick_hz);
	apply_patches(map, chunks, formations, states, patches, tick_hz);
}

/// Apply one queued command. Preconditions that do not hold (unknown uid,
/// off-map position) drop the command silently with no state change
fn apply_command(
	command: MovementCommand,
	map: &MapDimensions,
	chunks: &mut NavChunks,
	formations: &mut Formations,
	states: &mut MoveStates,
	snapshot: &GameStateSnapshot,
) {
	match command {
		MovementCommand::Add {
			uid,
			pos,
			radius,
			faction_id,
		} => {
			if map.get_tile_desc_from_xz(pos).is_none() {
				return;
			}
			if states.add(uid, pos, radius, faction_id) {
				chunks.block_disk(map, pos, radius, faction_id as usize);
			}
		}
		MovementCommand::Remove { uid } => {
			formations.remove_agent(uid);
			if let Some(state) = states.remove(uid) {
				if state.blocking {
					chunks.unblock_disk(
						map,
						state.last_stop_pos,
						state.last_stop_radius,
						state.faction_id as usize,
					);
				}
			}
		}
		MovementCommand::Stop { uid } => {
			let Some(state) = states.get(uid) else {
				return;
			};
			let (pos, radius, faction_id, blocking) = (
				state.pos(),
				state.radius,
				state.faction_id,
				state.blocking,
			);
			states.remove_from_flocks(uid);
			formations.remove_agent(uid);
			let state = states.get_mut(uid).expect("checked above");
			state.state = ArrivalState::Arrived;
			state.velocity = Vec2::ZERO;
			state.wait_prev = ArrivalState::Arrived;
			state.surround_target_uid = None;
			if !blocking {
				state.blocking = true;
				state.last_stop_pos = pos;
				state.last_stop_radius = radius;
				chunks.block_disk(map, pos, radius, faction_id as usize);
			}
		}
		MovementCommand::SetDest { uid, xz, attack } => {
			if map.get_tile_desc_from_xz(xz).is_none() {
				return;
			}
			let Some(state) = states.get(uid) else {
				return;
			};
			// re-issuing the current destination must not reset the agent
			if state.state == ArrivalState::Moving {
				if let Some(flock) = states.flock_of(uid) {
					if flock.target_xz.distance(xz) < f32::EPSILON && flock.attack == attack {
						return;
					}
				}
			}
			formations.remove_agent(uid);
			if states.make_flock(&[uid], xz, attack).is_some() {
				depart(map, chunks, states, uid, ArrivalState::Moving);
			}
		}
		MovementCommand::SetChangeDirection { uid, dir } => {
			let Some(state) = states.get_mut(uid) else {
				return;
			};
			state.state = ArrivalState::Turning;
			state.target_dir = dir;
			state.velocity = Vec2::ZERO;
			state.wait_prev = ArrivalState::Arrived;
		}
		MovementCommand::SetEnterRange { uid, target, range } => {
			let Some(target_ent) = snapshot.ent(target) else {
				return;
			};
			let target_pos = target_ent.pos;
			if states.get(uid).is_none() {
				return;
			}
			states.remove_from_flocks(uid);
			{
				let state = states.get_mut(uid).expect("checked above");
				state.surround_target_uid = Some(target);
				state.target_range = range;
				state.target_prev_pos = target_pos;
			}
			depart(map, chunks, states, uid, ArrivalState::EnterEntityRange);
		}
		MovementCommand::SetSurroundEntity { uid, target } => {
			let Some(target_ent) = snapshot.ent(target) else {
				return;
			};
			let target_pos = target_ent.pos;
			if states.get(uid).is_none() {
				return;
			}
			states.remove_from_flocks(uid);
			{
				let state = states.get_mut(uid).expect("checked above");
				state.surround_target_uid = Some(target);
				state.surround_target_prev = target_pos;
				state.using_surround_field = false;
			}
			depart(map, chunks, states, uid, ArrivalState::SurroundEntity);
		}
		MovementCommand::SetSeekEnemies { uid } => {
			if states.get(uid).is_none() {
				return;
			}
			states.remove_from_flocks(uid);
			depart(map, chunks, states, uid, ArrivalState::SeekEnemies);
		}
		MovementCommand::UpdatePos { uid, xz } => {
			if map.get_tile_desc_from_xz(xz).is_none() {
				return;
			}
			let Some(state) = states.get_mut(uid) else {
				return;
			};
			if state.blocking {
				let (old_pos, old_radius, faction) = (
					state.last_stop_pos,
					state.last_stop_radius,
					state.faction_id as usize,
				);
				state.last_stop_pos = xz;
				state.prev_pos = xz;
				state.next_pos = xz;
				chunks.unblock_disk(map, old_pos, old_radius, faction);
				let radius = states.get(uid).expect("checked above").radius;
				let faction = states.get(uid).expect("checked above").faction_id as usize;
				chunks.block_disk(map, xz, radius, faction);
				if let Some(state) = states.get_mut(uid) {
					state.last_stop_radius = state.radius;
				}
			} else {
				state.prev_pos = xz;
				state.next_pos = xz;
			}
		}
		MovementCommand::UpdateFactionId { uid, faction_id } => {
			let Some(state) = states.get_mut(uid) else {
				return;
			};
			let old = state.faction_id;
			if old == faction_id {
				return;
			}
			state.faction_id = faction_id;
			if state.blocking {
				let (pos, radius) = (state.last_stop_pos, state.last_stop_radius);
				chunks.unblock_disk(map, pos, radius, old as usize);
				chunks.block_disk(map, pos, radius, faction_id as usize);
			}
		}
		MovementCommand::UpdateSelectionRadius { uid, radius } => {
			let Some(state) = states.get_mut(uid) else {
				return;
			};
			let old = state.radius;
			if (old - radius).abs() < f32::EPSILON {
				return;
			}
			state.radius = radius;
			if state.blocking {
				let (pos, old_stop_radius, faction) = (
					state.last_stop_pos,
					state.last_stop_radius,
					state.faction_id as usize,
				);
				state.last_stop_radius = radius;
				chunks.unblock_disk(map, pos, old_stop_radius, faction);
				chunks.block_disk(map, pos, radius, faction);
			}
		}
		MovementCommand::SetMaxSpeed { uid, speed } => {
			if let Some(state) = states.get_mut(uid) {
				state.max_speed = speed.max(0.0);
			}
		}
		MovementCommand::MakeFlocks {
			ents,
			target,
			orientation,
			formation,
			attack,
		} => {
			if map.get_tile_desc_from_xz(target).is_none() {
				return;
			}
			let Some(_dest) = states.make_flock(&ents, target, attack) else {
				return;
			};
			let mut travel_state = ArrivalState::Moving;
			if formation != FormationType::None {
				let units: Vec<FormationUnit> = ents
					.iter()
					.filter_map(|uid| {
						let state = states.get(*uid)?;
						if state.max_speed <= 0.0 {
							return None;
						}
						let type_id = snapshot.ent(*uid).map_or(0, |ent| ent.type_id);
						Some(FormationUnit {
							uid: *uid,
							pos: state.pos(),
							radius: state.radius,
							type_id,
						})
					})
					.collect();
				if formations
					.create(map, chunks, target, orientation, &units, formation)
					.is_some()
				{
					travel_state = ArrivalState::MovingInFormation;
				}
			}
			for uid in ents.iter() {
				if states.get(*uid).map_or(true, |state| state.max_speed <= 0.0) {
					continue;
				}
				depart(map, chunks, states, *uid, travel_state);
			}
		}
		MovementCommand::Unblock { uid } => {
			let Some(state) = states.get_mut(uid) else {
				return;
			};
			if state.blocking {
				state.blocking = false;
				let (pos, radius, faction) = (
					state.last_stop_pos,
					state.last_stop_radius,
					state.faction_id as usize,
				);
				chunks.unblock_disk(map, pos, radius, faction);
			}
		}
		MovementCommand::BlockAt { uid, pos } => {
			let Some(state) = states.get_mut(uid) else {
				return;
			};
			if !state.blocking {
				state.blocking = true;
				state.last_stop_pos = pos;
				state.last_stop_radius = state.radius;
				let (radius, faction) = (state.radius, state.faction_id as usize);
				chunks.block_disk(map, pos, radius, faction);
			}
		}
	}
}

/// Put an agent on the road: release its blockers and reset the wait cycle
fn depart(
	map: &MapDimensions,
	chunks: &mut NavChunks,
	states: &mut MoveStates,
	uid: u32,
	state: ArrivalState,
) {
	let Some(move_state) = states.get_mut(uid) else {
		return;
	};
	move_state.state = state;
	move_state.wait_prev = ArrivalState::Arrived;
	move_state.wait_ticks_left = 0;
	if move_state.blocking {
		move_state.blocking = false;
		let (pos, radius, faction) = (
			move_state.last_stop_pos,
			move_state.last_stop_radius,
			move_state.faction_id as usize,
		);
		chunks.unblock_disk(map, pos, radius, faction);
	}
}

/// Build outstanding formation cell-arrival fields, fanned out across the
/// worker pool in bounded bundles
fn build_pending_arrival_fields(
	map: &MapDimensions,
	chunks: &NavChunks,
	formations: &mut Formations,
) {
	let mut work: Vec<(FormationId, u32, TileDesc, TileDesc, NavLayer)> = Vec::new();
	for id in formations.ids() {
		let Some(formation) = formations.get_mut(id) else {
			continue;
		};
		let Some(center_tile) = map.get_tile_desc_from_xz(formation.center) else {
			formation.arrival_pending.clear();
			continue;
		};
		let layer = formation
			.subformations
			.first()
			.map_or(NavLayer::Ground1x1, |sub| sub.layer);
		for (uid, cell_tile) in std::mem::take(&mut formation.arrival_pending) {
			work.push((id, uid, center_tile, cell_tile, layer));
		}
	}
	if work.is_empty() {
		return;
	}
	let pool = ComputeTaskPool::get_or_init(TaskPool::default);
	let bundle = work.len().div_ceil(MAX_MOVE_TASKS).max(1);
	let results = pool.scope(|scope| {
		for slice in work.chunks(bundle) {
			scope.spawn(async move {
				let mut out = Vec::with_capacity(slice.len());
				for (formation_id, uid, center_tile, cell_tile, layer) in slice.iter() {
					let builder = FieldBuilder::new(map, chunks, *layer);
					let field = builder.build_cell_arrival_field(*center_tile, *cell_tile);
					out.push((*formation_id, *uid, field));
				}
				out
			});
		}
	});
	for bundle in results {
		for (formation_id, uid, field) in bundle {
			if let Some(formation) = formations.get_mut(formation_id) {
				formation.arrival_fields.insert(uid, field);
			}
		}
	}
}

/// The field a travelling agent needs this tick, claimed in the cache and
/// queued as a request when absent
fn collect_field_requests(
	map: &MapDimensions,
	chunks: &NavChunks,
	portals: &ChunkPortals,
	cache: &mut FieldCache,
	states: &MoveStates,
	snapshot: &GameStateSnapshot,
) -> Vec<FieldRequest> {
	let mut requests: Vec<FieldRequest> = Vec::new();
	let uids: Vec<u32> = states.iter().map(|(uid, _)| *uid).collect();
	for uid in uids {
		let Some(state) = states.get(uid) else {
			continue;
		};
		if state.still() || state.state == ArrivalState::Turning {
			continue;
		}
		let layer = NavLayer::for_radius(state.radius);
		let pos = state.pos();
		let Some(agent_td) = map.get_tile_desc_from_xz(pos) else {
			continue;
		};
		// agents shoved onto blocked ground need the recovery field first
		if !chunks.tile_passable(map, layer, agent_td)
			&& chunks
				.get_chunk(map, layer, agent_td.chunk)
				.get_cost(agent_td.cell) == COST_IMPASSABLE
		{
			let target = FieldTarget::NearestPathable(agent_td);
			let id = FieldId::new(layer, &target, agent_td.chunk);
			if cache.try_begin_build(id) {
				requests.push(FieldRequest::NearestPathable { id, agent: agent_td });
			}
			continue;
		}
		match state.state {
			ArrivalState::Moving | ArrivalState::MovingInFormation => {
				if let Some(flock) = states.flock_of(uid) {
					queue_point_seek_requests(
						map, chunks, portals, cache, &mut requests, layer, pos, flock.target_xz,
						flock.attack,
					);
				}
			}
			ArrivalState::EnterEntityRange => {
				if let Some(target) = state
					.surround_target_uid
					.and_then(|target| snapshot.ent(target))
				{
					queue_point_seek_requests(
						map, chunks, portals, cache, &mut requests, layer, pos, target.pos, false,
					);
				}
			}
			ArrivalState::SurroundEntity => {
				let Some(target) = state
					.surround_target_uid
					.and_then(|target| snapshot.ent(target))
				else {
					continue;
				};
				if state.using_surround_field {
					let field_target = FieldTarget::Entity { uid: target.uid };
					let id = FieldId::new(layer, &field_target, agent_td.chunk);
					if cache.try_begin_build(id) {
						let targets = snapshot.footprint_tiles(map, layer, target);
						requests.push(FieldRequest::Seek {
							id,
							chunk: agent_td.chunk,
							targets,
							enemies: snapshot.enemies_for_faction(state.faction_id),
						});
					}
				} else {
					queue_point_seek_requests(
						map, chunks, portals, cache, &mut requests, layer, pos, target.pos, false,
					);
				}
			}
			ArrivalState::SeekEnemies => {
				let field_target = FieldTarget::Enemies {
					faction_id: state.faction_id,
				};
				let id = FieldId::new(layer, &field_target, agent_td.chunk);
				if cache.try_begin_build(id) {
					let corner = map.get_chunk_corner_xz(agent_td.chunk);
					let min = corner - Vec2::splat(FIELD_RESOLUTION as f32 / 2.0);
					let max = corner + Vec2::splat(FIELD_RESOLUTION as f32 * 1.5);
					let targets =
						snapshot.enemy_tiles(map, layer, state.faction_id, min, max);
					requests.push(FieldRequest::Seek {
						id,
						chunk: agent_td.chunk,
						targets,
						enemies: snapshot.enemies_for_faction(state.faction_id),
					});
				}
			}
			// arrival fields live on the formation, nothing to request
			ArrivalState::ArrivingToCell => {}
			_ => {}
		}
	}
	requests
}

/// Queue the flow field an agent point-seeking a destination needs for its
/// current chunk: the tile field of the destination chunk or the portal
/// field of the next hop
#[allow(clippy::too_many_arguments)]
fn queue_point_seek_requests(
	map: &MapDimensions,
	chunks: &NavChunks,
	portals: &ChunkPortals,
	cache: &mut FieldCache,
	requests: &mut Vec<FieldRequest>,
	layer: NavLayer,
	pos: Vec2,
	target: Vec2,
	ignore_blockers: bool,
) {
	let Some(agent_td) = map.get_tile_desc_from_xz(pos) else {
		return;
	};
	let Some(target_td) = map.get_tile_desc_from_xz(target) else {
		return;
	};
	// the local tile field only serves when the destination shares the
	// agents chunk and local island, a walled-off target still routes out
	// through the portals
	if same_chunk_island(map, chunks, layer, agent_td, target_td) {
		let field_target = FieldTarget::Tile(target_td);
		let id = FieldId::new(layer, &field_target, target_td.chunk);
		if cache.try_begin_build(id) {
			requests.push(FieldRequest::Tile {
				id,
				target: target_td,
				ignore_blockers,
				with_los: true,
			});
		}
		return;
	}
	let router = PortalRouter {
		map,
		chunks,
		portals,
		layer,
	};
	let Some(route) = router.find_best_path(pos, target) else {
		return;
	};
	// the hop leaving the agents chunk drives its flow this tick
	let Some(hop) = route.iter().find(|hop| hop.portal.chunk == agent_td.chunk) else {
		return;
	};
	let field_target = FieldTarget::Portal(*hop);
	let id = FieldId::new(layer, &field_target, agent_td.chunk);
	if cache.try_begin_build(id) {
		requests.push(FieldRequest::Portal { id, hop: *hop });
	}
	// also warm the destination chunk so arriving agents have los data
	let dest_target = FieldTarget::Tile(target_td);
	let dest_id = FieldId::new(layer, &dest_target, target_td.chunk);
	if cache.try_begin_build(dest_id) {
		requests.push(FieldRequest::Tile {
			id: dest_id,
			target: target_td,
			ignore_blockers,
			with_los: true,
		});
	}
}

/// Build every requested field, fanned out across the worker pool, and
/// publish the results into the cache
fn build_requested_fields(
	map: &MapDimensions,
	chunks: &NavChunks,
	portals: &ChunkPortals,
	cache: &mut FieldCache,
	requests: Vec<FieldRequest>,
) {
	if requests.is_empty() {
		return;
	}
	let pool = ComputeTaskPool::get_or_init(TaskPool::default);
	let bundle = requests.len().div_ceil(MAX_MOVE_TASKS).max(1);
	let results = pool.scope(|scope| {
		for slice in requests.chunks(bundle) {
			scope.spawn(async move {
				let mut out: Vec<(FieldId, FlowField, Option<LosField>)> = Vec::new();
				for request in slice.iter() {
					let layer = request.id().layer();
					match request {
						FieldRequest::Tile {
							id,
							target,
							ignore_blockers,
							with_los,
						} => {
							let builder = FieldBuilder::new(map, chunks, layer);
							let (flow, _) = builder.build_tile_field(*target, *ignore_blockers);
							let los = with_los
								.then(|| builder.build_los(target.chunk, *target, None));
							out.push((*id, flow, los));
						}
						FieldRequest::Portal { id, hop } => {
							let builder = FieldBuilder::new(map, chunks, layer);
							let (flow, _) = builder.build_portal_field(portals, hop);
							out.push((*id, flow, None));
						}
						FieldRequest::Seek {
							id,
							chunk,
							targets,
							enemies,
						} => {
							let builder =
								FieldBuilder::with_enemies(map, chunks, layer, *enemies);
							let flow = builder.build_seek_field(*chunk, targets);
							out.push((*id, flow, None));
						}
						FieldRequest::NearestPathable { id, agent } => {
							let builder = FieldBuilder::new(map, chunks, layer);
							let flow = builder.build_nearest_pathable_field(*agent);
							out.push((*id, flow, None));
						}
					}
				}
				out
			});
		}
	});
	for bundle in results {
		for (id, flow, los) in bundle {
			cache.finish_build(id, flow, los);
		}
	}
}

/// Sample the desired velocity of an agent from the cached field matching
/// its state. Returns zero when no direction is available
#[allow(clippy::too_many_arguments)]
fn sample_v_desired(
	map: &MapDimensions,
	chunks: &NavChunks,
	cache: &mut FieldCache,
	portals: &ChunkPortals,
	formations: &Formations,
	states: &MoveStates,
	snapshot: &GameStateSnapshot,
	uid: u32,
	speed_cap: f32,
) -> (Vec2, bool) {
	let Some(state) = states.get(uid) else {
		return (Vec2::ZERO, false);
	};
	let pos = state.pos();
	let layer = NavLayer::for_radius(state.radius);
	let Some(agent_td) = map.get_tile_desc_from_xz(pos) else {
		return (Vec2::ZERO, false);
	};
	// recovery field first when standing on impassable terrain
	let recovery_id = FieldId::new(
		layer,
		&FieldTarget::NearestPathable(agent_td),
		agent_td.chunk,
	);
	if let Some(entry) = cache.get(recovery_id) {
		let dir = entry.flow.get_field_cell_value(agent_td.cell);
		if dir != FlowDir::None {
			return (dir.unit_vector() * speed_cap, false);
		}
	}
	match state.state {
		ArrivalState::Moving | ArrivalState::MovingInFormation => {
			let Some(flock) = states.flock_of(uid) else {
				return (Vec2::ZERO, false);
			};
			point_seek_velocity(map, chunks, cache, portals, layer, pos, flock.target_xz, speed_cap)
		}
		ArrivalState::EnterEntityRange => {
			let Some(target) = state
				.surround_target_uid
				.and_then(|target| snapshot.ent(target))
			else {
				return (Vec2::ZERO, false);
			};
			point_seek_velocity(map, chunks, cache, portals, layer, pos, target.pos, speed_cap)
		}
		ArrivalState::SurroundEntity => {
			let Some(target) = state
				.surround_target_uid
				.and_then(|target| snapshot.ent(target))
			else {
				return (Vec2::ZERO, false);
			};
			if state.using_surround_field {
				let id = FieldId::new(
					layer,
					&FieldTarget::Entity { uid: target.uid },
					agent_td.chunk,
				);
				if let Some(entry) = cache.get(id) {
					let dir = entry.flow.get_field_cell_value(agent_td.cell);
					return (dir.unit_vector() * speed_cap, false);
				}
				(Vec2::ZERO, false)
			} else {
				point_seek_velocity(map, chunks, cache, portals, layer, pos, target.pos, speed_cap)
			}
		}
		ArrivalState::SeekEnemies => {
			let id = FieldId::new(
				layer,
				&FieldTarget::Enemies {
					faction_id: state.faction_id,
				},
				agent_td.chunk,
			);
			if let Some(entry) = cache.get(id) {
				let dir = entry.flow.get_field_cell_value(agent_td.cell);
				return (dir.unit_vector() * speed_cap, false);
			}
			(Vec2::ZERO, false)
		}
		ArrivalState::ArrivingToCell => {
			let Some(field) = formations
				.formation_of(uid)
				.and_then(|formation| formation.arrival_field(uid))
			else {
				return (Vec2::ZERO, false);
			};
			match field.get_tile_value(map, agent_td) {
				Some(dir) => (dir.unit_vector() * speed_cap, false),
				None => (Vec2::ZERO, false),
			}
		}
		_ => (Vec2::ZERO, false),
	}
}

/// Whether two descriptors share a chunk and a (closest pathable) local
/// island, the condition for serving a point-seek from the local tile field
fn same_chunk_island(
	map: &MapDimensions,
	chunks: &NavChunks,
	layer: NavLayer,
	a: TileDesc,
	b: TileDesc,
) -> bool {
	if a.chunk != b.chunk {
		return false;
	}
	let ia = chunks.closest_pathable_local_island(map, layer, a);
	let ib = chunks.closest_pathable_local_island(map, layer, b);
	ia != ISLAND_NONE && ia == ib
}

/// Desired velocity of a point-seek: the direct heading when line of sight
/// to the target is clear, otherwise the cached flow of the agents chunk
#[allow(clippy::too_many_arguments)]
fn point_seek_velocity(
	map: &MapDimensions,
	chunks: &NavChunks,
	cache: &mut FieldCache,
	portals: &ChunkPortals,
	layer: NavLayer,
	pos: Vec2,
	target: Vec2,
	speed_cap: f32,
) -> (Vec2, bool) {
	let Some(agent_td) = map.get_tile_desc_from_xz(pos) else {
		return (Vec2::ZERO, false);
	};
	let Some(target_td) = map.get_tile_desc_from_xz(target) else {
		return (Vec2::ZERO, false);
	};
	if same_chunk_island(map, chunks, layer, agent_td, target_td) {
		let id = FieldId::new(layer, &FieldTarget::Tile(target_td), target_td.chunk);
		if let Some(entry) = cache.get(id) {
			if let Some(los) = entry.los.as_ref() {
				if los.is_visible(agent_td.cell) {
					let heading = (target - pos).normalize_or_zero();
					return (heading * speed_cap, true);
				}
			}
			let dir = entry.flow.get_field_cell_value(agent_td.cell);
			return (dir.unit_vector() * speed_cap, false);
		}
		return (Vec2::ZERO, false);
	}
	// mid-route: any cached portal field of this chunk pointing towards the
	// route is keyed by the hop, probe the cache for one
	let list = portals.get(layer, agent_td.chunk);
	for (index, portal) in list.iter().enumerate() {
		for (port_iid, next_iid) in portal.get_transitions().iter().copied() {
			let hop = PortalHop {
				portal: PortalRef {
					chunk: agent_td.chunk,
					index,
				},
				endpoints: portal.get_endpoints(),
				port_iid,
				next_iid,
			};
			let id = FieldId::new(layer, &FieldTarget::Portal(hop), agent_td.chunk);
			if let Some(entry) = cache.get(id) {
				let dir = entry.flow.get_field_cell_value(agent_td.cell);
				if dir != FlowDir::None {
					return (dir.unit_vector() * speed_cap, false);
				}
			}
		}
	}
	(Vec2::ZERO, false)
}

/// Collect the work item of every agent that needs computing this tick
fn collect_agent_work(
	map: &MapDimensions,
	chunks: &NavChunks,
	cache: &mut FieldCache,
	portals: &ChunkPortals,
	formations: &Formations,
	states: &MoveStates,
	snapshot: &GameStateSnapshot,
	tick_hz: u32,
) -> Vec<AgentWork> {
	let mut work = Vec::new();
	let all: Vec<(u32, Vec2, Vec2, f32, bool, Option<DestId>, ArrivalState)> = states
		.iter()
		.map(|(uid, state)| {
			(
				*uid,
				state.pos(),
				state.velocity,
				state.radius,
				state.still(),
				state.dest_id,
				state.state,
			)
		})
		.collect();
	for (uid, state) in states.iter() {
		if state.state == ArrivalState::Arrived {
			continue;
		}
		let speed_cap = state.max_speed / tick_hz.max(1) as f32;
		let pos = state.pos();
		let (v_desired, has_dest_los) = sample_v_desired(
			map, chunks, cache, portals, formations, states, snapshot, *uid, speed_cap,
		);
		// neighbours within the avoidance radius, split by mobility
		let mut dynamic_neighbours = Vec::new();
		let mut static_neighbours = Vec::new();
		let mut beside_arrived_flockmate = false;
		for (other_uid, other_pos, other_vel, other_radius, other_still, other_dest, other_state) in
			all.iter()
		{
			if other_uid == uid {
				continue;
			}
			let distance = pos.distance(*other_pos);
			if distance > CLEARPATH_NEIGHBOUR_RADIUS {
				continue;
			}
			let same_flock = state.dest_id.is_some() && state.dest_id == *other_dest;
			let neighbour = Neighbour {
				uid: *other_uid,
				pos: *other_pos,
				velocity: *other_vel,
				radius: *other_radius,
				same_flock,
			};
			if *other_still {
				static_neighbours.push(neighbour);
				// generous adjacency so a crawl against the settled crowd
				// cannot shove forever without ever quite touching
				if same_flock
					&& *other_state == ArrivalState::Arrived
					&& distance <= (state.radius + other_radius) * 2.0 + TOUCH_BUFFER
				{
					beside_arrived_flockmate = true;
				}
			} else {
				dynamic_neighbours.push(neighbour);
			}
		}
		// standing external blockers (buildings and such) shove too
		for ent_uid in snapshot.ents_in_rect(
			pos - Vec2::splat(CLEARPATH_NEIGHBOUR_RADIUS),
			pos + Vec2::splat(CLEARPATH_NEIGHBOUR_RADIUS),
		) {
			let Some(ent) = snapshot.ent(ent_uid) else {
				continue;
			};
			if states.get(ent_uid).is_some() {
				continue;
			}
			if !ent.flags.contains(EntityFlags::STATIC) && !ent.flags.contains(EntityFlags::BUILDING)
			{
				continue;
			}
			static_neighbours.push(Neighbour {
				uid: ent_uid,
				pos: ent.pos,
				velocity: Vec2::ZERO,
				radius: ent.radius,
				same_flock: false,
			});
		}
		let target = states.flock_of(*uid).map(|flock| flock.target_xz);
		let (cell_pos, formation_dir) = match formations.formation_of(*uid) {
			Some(formation) => (
				formation.cell_of(*uid).map(|cell| cell.pos),
				Some(formation.orientation),
			),
			None => (None, None),
		};
		let target_ent = state
			.surround_target_uid
			.and_then(|target_uid| snapshot.ent(target_uid));
		work.push(AgentWork {
			uid: *uid,
			state: state.state,
			pos,
			velocity: state.velocity,
			radius: state.radius,
			speed_cap,
			v_desired,
			target,
			has_dest_los,
			dynamic_neighbours,
			static_neighbours,
			beside_arrived_flockmate,
			cell_pos,
			formation_dir,
			target_pos: target_ent.map(|ent| ent.pos),
			target_radius: target_ent.map_or(0.0, |ent| ent.radius),
			target_range: state.target_range,
			target_dir: state.target_dir,
			rot: state.next_rot,
			using_surround_field: state.using_surround_field,
			wait_prev: state.wait_prev,
			wait_ticks_left: state.wait_ticks_left,
		});
	}
	work
}

/// Fork the per-agent computation across the worker pool in bounded bundles
fn compute_patches(
	map: &MapDimensions,
	chunks: &NavChunks,
	work: &[AgentWork],
	tick_hz: u32,
) -> Vec<MovePatch> {
	if work.is_empty() {
		return Vec::new();
	}
	let pool = ComputeTaskPool::get_or_init(TaskPool::default);
	let bundle = work.len().div_ceil(MAX_MOVE_TASKS).max(1);
	let results = pool.scope(|scope| {
		for slice in work.chunks(bundle) {
			scope.spawn(async move {
				slice
					.iter()
					.map(|item| update_agent(map, chunks, item, tick_hz))
					.collect::<Vec<MovePatch>>()
			});
		}
	});
	let mut patches: Vec<MovePatch> = results.into_iter().flatten().collect();
	patches.sort_unstable_by_key(|patch| patch.uid);
	patches
}

/// Advance one agent: arrival tests, steering, avoidance, integration and
/// the state machine transition. Pure with respect to the navigation state
fn update_agent(
	map: &MapDimensions,
	chunks: &NavChunks,
	work: &AgentWork,
	tick_hz: u32,
) -> MovePatch {
	let mut patch = MovePatch {
		uid: work.uid,
		state: work.state,
		velocity: Vec2::ZERO,
		next_pos: work.pos,
		next_rot: None,
		using_surround_field: work.using_surround_field,
		wait_prev: work.wait_prev,
		wait_ticks_left: work.wait_ticks_left,
		occupies_cell: false,
	};
	match work.state {
		ArrivalState::Arrived => patch,
		ArrivalState::Waiting => {
			if patch.wait_ticks_left > 0 {
				patch.wait_ticks_left -= 1;
			}
			if patch.wait_ticks_left == 0 {
				patch.state = work.wait_prev;
			}
			patch
		}
		ArrivalState::Turning => {
			let max_step = MAX_TURN_RATE.to_radians();
			let angle = work.rot.angle_between(work.target_dir);
			if angle <= TURN_DONE_EPS.to_radians() {
				patch.state = ArrivalState::Arrived;
				patch.next_rot = Some(work.target_dir);
			} else {
				let fraction = (max_step / angle).min(1.0);
				patch.next_rot = Some(work.rot.slerp(work.target_dir, fraction));
			}
			patch
		}
		_ => {
			if let Some(new_state) = arrival_check(work) {
				patch.state = new_state;
				return patch;
			}
			// hysteresis of the surround band
			if work.state == ArrivalState::SurroundEntity {
				if let Some(target_pos) = work.target_pos {
					let distance = work.pos.distance(target_pos);
					if distance < SURROUND_LOW_WATER {
						patch.using_surround_field = true;
					} else if distance > SURROUND_HIGH_WATER {
						patch.using_surround_field = false;
					}
				}
			}
			let seek_point = steering_target(work);
			let layer = NavLayer::for_radius(work.radius);
			let ctx = SteeringContext {
				pos: work.pos,
				velocity: work.velocity,
				max_speed: work.speed_cap,
				target: seek_point,
				neighbours: work
					.dynamic_neighbours
					.iter()
					.chain(work.static_neighbours.iter())
					.copied()
					.collect(),
				cell_pos: work.cell_pos,
				formation_dir: work.formation_dir,
			};
			let in_formation = matches!(
				work.state,
				ArrivalState::MovingInFormation | ArrivalState::ArrivingToCell
			);
			let mut force = steering::total_steering_force(&ctx, in_formation, tick_hz);
			// blend the field-driven heading in: the desired velocity is the
			// authority on direction, steering shapes the local motion
			if work.v_desired != Vec2::ZERO && !work.has_dest_los {
				force += (work.v_desired - work.velocity) * steering::ARRIVE_SCALE;
				force = crate::movement::vec2_truncate(force, steering::force_budget(tick_hz));
			}
			force = steering::nullify_impass_components(map, chunks, layer, work.pos, force);
			let v_new = crate::movement::vec2_truncate(
				work.velocity + force / ENTITY_MASS,
				work.speed_cap,
			);
			let v_final = clearpath::compute_velocity(
				work.pos,
				work.velocity,
				work.radius,
				work.speed_cap,
				v_new,
				&work.dynamic_neighbours,
				&work.static_neighbours,
			);
			if v_final.length() < VEL_EPS && work.v_desired.length() < VEL_EPS {
				// no way forward, hold then retry once before giving up
				if work.wait_prev == work.state {
					patch.state = ArrivalState::Arrived;
				} else {
					patch.state = ArrivalState::Waiting;
					patch.wait_prev = work.state;
					patch.wait_ticks_left = WAIT_TICKS;
				}
				return patch;
			}
			// a near-stationary agent sitting on its cell settles instead of
			// trading micro pushes with its neighbours forever
			if work.state == ArrivalState::ArrivingToCell {
				if let Some(cell_pos) = work.cell_pos {
					if work.pos.distance(cell_pos) <= 2.0 * CELL_OCCUPY_RADIUS
						&& v_final.length() < 0.25 * work.speed_cap
					{
						patch.state = ArrivalState::Arrived;
						return patch;
					}
				}
			}
			patch.velocity = v_final;
			patch.next_pos = work.pos + v_final;
			patch
		}
	}
}

/// The point the steering arrive force aims for in the current state
fn steering_target(work: &AgentWork) -> Vec2 {
	match work.state {
		ArrivalState::ArrivingToCell => work.cell_pos.unwrap_or(work.pos),
		ArrivalState::SurroundEntity | ArrivalState::EnterEntityRange => {
			work.target_pos.unwrap_or(work.pos)
		}
		ArrivalState::SeekEnemies => work.pos + work.v_desired * 8.0,
		_ => work.target.unwrap_or_else(|| work.pos + work.v_desired * 8.0),
	}
}

/// Arrival transitions that fire before any force is computed, returning
/// the state to settle into
fn arrival_check(work: &AgentWork) -> Option<ArrivalState> {
	match work.state {
		ArrivalState::Moving => {
			let target = work.target?;
			let distance = work.pos.distance(target);
			if distance <= ARRIVE_THRESHOLD_SCALE * work.radius {
				return Some(ArrivalState::Arrived);
			}
			if work.beside_arrived_flockmate && distance <= CLEARPATH_NEIGHBOUR_RADIUS {
				return Some(ArrivalState::Arrived);
			}
			None
		}
		ArrivalState::MovingInFormation => {
			let cell_pos = work.cell_pos?;
			if work.pos.distance(cell_pos) <= FORMATION_ARRIVE_RADIUS {
				return Some(ArrivalState::ArrivingToCell);
			}
			None
		}
		ArrivalState::ArrivingToCell => {
			let cell_pos = work.cell_pos?;
			if work.pos.distance(cell_pos) <= CELL_OCCUPY_RADIUS {
				return Some(ArrivalState::Arrived);
			}
			None
		}
		ArrivalState::EnterEntityRange => {
			let Some(target_pos) = work.target_pos else {
				// target died mid-path
				return Some(ArrivalState::Arrived);
			};
			if work.pos.distance(target_pos) <= work.target_range {
				return Some(ArrivalState::Arrived);
			}
			None
		}
		ArrivalState::SurroundEntity => {
			let Some(target_pos) = work.target_pos else {
				return Some(ArrivalState::Arrived);
			};
			let touch = work.radius + work.target_radius + TOUCH_BUFFER;
			if work.pos.distance(target_pos) <= touch {
				return Some(ArrivalState::Arrived);
			}
			None
		}
		_ => None,
	}
}

/// Apply the computed patches in uid order on the owning side, maintaining
/// the blocker and interpolation bookkeeping
fn apply_patches(
	map: &MapDimensions,
	chunks: &mut NavChunks,
	formations: &mut Formations,
	states: &mut MoveStates,
	patches: Vec<MovePatch>,
	tick_hz: u32,
) {
	let steps = (crate::movement::BASE_TICK_HZ / tick_hz.max(1)).max(1);
	for patch in patches {
		let Some(state) = states.get_mut(patch.uid) else {
			continue;
		};
		let was_still = state.still();
		state.prev_pos = state.next_pos;
		state.prev_rot = state.next_rot;
		state.next_pos = patch.next_pos;
		state.velocity = patch.velocity;
		state.push_velocity(patch.velocity);
		state.left = steps;
		state.step = 1.0 / steps as f32;
		state.state = patch.state;
		state.wait_prev = patch.wait_prev;
		state.wait_ticks_left = patch.wait_ticks_left;
		state.using_surround_field = patch.using_surround_field;
		if let Some(rot) = patch.next_rot {
			state.next_rot = rot;
		} else if patch.velocity.length() > VEL_EPS {
			let average = state.average_velocity();
			if average.length() > VEL_EPS {
				state.next_rot = crate::movement::dir_quat_from_velocity(average);
			}
		}
		let now_still = state.still();
		if patch.state == ArrivalState::Arrived {
			state.velocity = Vec2::ZERO;
		}
		if !was_still && now_still && !state.blocking {
			// settle: register blockers at the resting position
			state.blocking = true;
			state.last_stop_pos = state.next_pos;
			state.last_stop_radius = state.radius;
			let (pos, radius, faction) = (
				state.next_pos,
				state.radius,
				state.faction_id as usize,
			);
			chunks.block_disk(map, pos, radius, faction);
		} else if was_still && !now_still && state.blocking {
			// a waiting agent resumed its journey
			state.blocking = false;
			let (pos, radius, faction) = (
				state.last_stop_pos,
				state.last_stop_radius,
				state.faction_id as usize,
			);
			chunks.unblock_disk(map, pos, radius, faction);
		}
		if patch.occupies_cell || patch.state == ArrivalState::Arrived {
			formations.set_cell_occupied(patch.uid, patch.state == ArrivalState::Arrived);
		}
	}
}
