//! Steering force composition. Forces are combined with fixed scales into a
//! total force, falling back to separation alone and then arrival alone when
//! the blend cancels itself out. The resulting force is truncated and any
//! component pointing into an impassable adjacent tile is zeroed before
//! integration.
//!

use crate::prelude::*;
use bevy::prelude::*;

/// Upper bound of a steering force at the reference tick rate
pub const MAX_FORCE: f32 = 1.0;
/// Scale of the arrive contribution
pub const ARRIVE_SCALE: f32 = 0.5;
/// Scale of the separation contribution
pub const SEPARATION_SCALE: f32 = 0.6;
/// Scale of the cohesion contribution
pub const COHESION_SCALE: f32 = 0.15;
/// Scale of the alignment contribution
pub const ALIGNMENT_SCALE: f32 = 0.15;
/// Scale of the pull towards an assigned formation cell
pub const FORMATION_COHESION_SCALE: f32 = 0.3;
/// Scale of the alignment to the formation orientation
pub const FORMATION_ALIGN_SCALE: f32 = 0.1;
/// Scale of the drag slowing an agent ahead of its cell
pub const FORMATION_DRAG_SCALE: f32 = 0.2;
/// Neighbour radius of the separation force
pub const SEPARATION_NEIGHB_RADIUS: f32 = 5.0;
/// Neighbour radius of the cohesion and alignment forces
pub const FLOCK_NEIGHB_RADIUS: f32 = 10.0;
/// Distance over which the arrive force ramps the speed down
pub const ARRIVE_SLOWING_RADIUS: f32 = 10.0;
/// Force magnitudes below this count as collapsed
const FORCE_EPS: f32 = 1.0 / 1024.0;

/// A neighbouring agent as seen by the steering and avoidance passes
#[derive(Clone, Copy, Debug)]
pub struct Neighbour {
	pub uid: u32,
	pub pos: Vec2,
	pub velocity: Vec2,
	pub radius: f32,
	/// Same flock members pull, others only push
	pub same_flock: bool,
}

/// Everything the force composition needs to know about one agent
#[derive(Clone, Debug)]
pub struct SteeringContext {
	pub pos: Vec2,
	pub velocity: Vec2,
	/// Units per tick
	pub max_speed: f32,
	/// Point the agent is heading for
	pub target: Vec2,
	pub neighbours: Vec<Neighbour>,
	/// Assigned formation cell position, when moving in formation
	pub cell_pos: Option<Vec2>,
	/// Formation orientation, when moving in formation
	pub formation_dir: Option<Vec2>,
}

/// Steer so the agent ends up at the target with zero velocity, ramping the
/// desired speed down within the slowing radius
pub fn arrive_force(ctx: &SteeringContext) -> Vec2 {
	let to_target = ctx.target - ctx.pos;
	let distance = to_target.length();
	if distance < FORCE_EPS {
		return -ctx.velocity;
	}
	let ramped = ctx.max_speed * (distance / ARRIVE_SLOWING_RADIUS).min(1.0);
	let desired = to_target / distance * ramped;
	desired - ctx.velocity
}

/// Steer away from neighbours inside the separation radius, weighted by
/// closeness
pub fn separation_force(ctx: &SteeringContext) -> Vec2 {
	let mut total = Vec2::ZERO;
	for neighbour in ctx.neighbours.iter() {
		let away = ctx.pos - neighbour.pos;
		let distance = away.length();
		let reach = SEPARATION_NEIGHB_RADIUS + neighbour.radius;
		if distance >= reach || distance < FORCE_EPS {
			continue;
		}
		total += away / distance * (1.0 - distance / reach);
	}
	if total.length_squared() < FORCE_EPS * FORCE_EPS {
		Vec2::ZERO
	} else {
		total.normalize() * ctx.max_speed - ctx.velocity
	}
}

/// Steer towards the centre of mass of same-flock neighbours
pub fn cohesion_force(ctx: &SteeringContext) -> Vec2 {
	let mut com = Vec2::ZERO;
	let mut count = 0;
	for neighbour in ctx.neighbours.iter() {
		if !neighbour.same_flock {
			continue;
		}
		if ctx.pos.distance(neighbour.pos) > FLOCK_NEIGHB_RADIUS {
			continue;
		}
		com += neighbour.pos;
		count += 1;
	}
	if count == 0 {
		return Vec2::ZERO;
	}
	com /= count as f32;
	let desired = com - ctx.pos;
	if desired.length_squared() < FORCE_EPS * FORCE_EPS {
		Vec2::ZERO
	} else {
		desired.normalize() * ctx.max_speed - ctx.velocity
	}
}

/// Steer to match the average heading of same-flock neighbours
pub fn alignment_force(ctx: &SteeringContext) -> Vec2 {
	let mut heading = Vec2::ZERO;
	let mut count = 0;
	for neighbour in ctx.neighbours.iter() {
		if !neighbour.same_flock {
			continue;
		}
		if ctx.pos.distance(neighbour.pos) > FLOCK_NEIGHB_RADIUS {
			continue;
		}
		heading += neighbour.velocity;
		count += 1;
	}
	if count == 0 || heading.length_squared() < FORCE_EPS * FORCE_EPS {
		return Vec2::ZERO;
	}
	heading / count as f32 - ctx.velocity
}

/// Pull towards the assigned formation cell
pub fn formation_cohesion_force(ctx: &SteeringContext) -> Vec2 {
	let Some(cell_pos) = ctx.cell_pos else {
		return Vec2::ZERO;
	};
	let desired = cell_pos - ctx.pos;
	if desired.length_squared() < FORCE_EPS * FORCE_EPS {
		return Vec2::ZERO;
	}
	desired.normalize() * ctx.max_speed - ctx.velocity
}

/// Align to the formation facing
pub fn formation_alignment_force(ctx: &SteeringContext) -> Vec2 {
	let Some(dir) = ctx.formation_dir else {
		return Vec2::ZERO;
	};
	if dir.length_squared() < FORCE_EPS * FORCE_EPS {
		return Vec2::ZERO;
	}
	dir.normalize() * ctx.max_speed - ctx.velocity
}

/// Drag slowing an agent that ran ahead of its cell
pub fn formation_drag_force(ctx: &SteeringContext) -> Vec2 {
	let (Some(cell_pos), Some(dir)) = (ctx.cell_pos, ctx.formation_dir) else {
		return Vec2::ZERO;
	};
	let ahead = (ctx.pos - cell_pos).dot(dir.normalize_or_zero());
	if ahead <= 0.0 {
		return Vec2::ZERO;
	}
	-ctx.velocity * (ahead / ARRIVE_SLOWING_RADIUS).min(1.0)
}

/// The scale applied to every force at a given tick rate, keeping behaviour
/// rate independent relative to the reference 20Hz simulation
pub fn force_budget(tick_hz: u32) -> f32 {
	MAX_FORCE / tick_hz.max(1) as f32 * crate::movement::BASE_TICK_HZ as f32
}

/// Compose the steering force with the prioritized fallback: the blended
/// total first, separation alone when the blend collapses, arrival alone as
/// the last resort
pub fn total_steering_force(ctx: &SteeringContext, in_formation: bool, tick_hz: u32) -> Vec2 {
	let budget = force_budget(tick_hz);
	let arrive = arrive_force(ctx);
	let separation = separation_force(ctx);
	let cohesion = cohesion_force(ctx);
	let alignment = alignment_force(ctx);
	// inside a formation the cells already enforce spacing, a full strength
	// separation would fight the convergence onto them
	let separation_scale = if in_formation {
		SEPARATION_SCALE * 0.5
	} else {
		SEPARATION_SCALE
	};
	let mut total = arrive * ARRIVE_SCALE
		+ separation * separation_scale
		+ cohesion * COHESION_SCALE
		+ alignment * ALIGNMENT_SCALE;
	if in_formation {
		total += formation_cohesion_force(ctx) * FORMATION_COHESION_SCALE
			+ formation_alignment_force(ctx) * FORMATION_ALIGN_SCALE
			+ formation_drag_force(ctx) * FORMATION_DRAG_SCALE;
	}
	if total.length() > FORCE_EPS {
		return crate::movement::vec2_truncate(total, budget);
	}
	if separation.length() > FORCE_EPS {
		return crate::movement::vec2_truncate(separation * SEPARATION_SCALE, budget);
	}
	crate::movement::vec2_truncate(arrive * ARRIVE_SCALE, budget)
}

/// Zero the force components pointing into impassable adjacent tiles so
/// steering never drifts an agent into a wall
pub fn nullify_impass_components(
	map: &MapDimensions,
	chunks: &NavChunks,
	layer: NavLayer,
	pos: Vec2,
	mut force: Vec2,
) -> Vec2 {
	let Some(td) = map.get_tile_desc_from_xz(pos) else {
		return force;
	};
	let passable = |dc: i32, dr: i32| {
		let mut neighbour = td;
		if !map.relative_tile_desc(&mut neighbour, dc, dr) {
			return false;
		}
		chunks.tile_passable(map, layer, neighbour)
	};
	if force.x > 0.0 && !passable(1, 0) {
		force.x = 0.0;
	}
	if force.x < 0.0 && !passable(-1, 0) {
		force.x = 0.0;
	}
	if force.y > 0.0 && !passable(0, 1) {
		force.y = 0.0;
	}
	if force.y < 0.0 && !passable(0, -1) {
		force.y = 0.0;
	}
	force
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn lone_agent(target: Vec2) -> SteeringContext {
		SteeringContext {
			pos: Vec2::ZERO,
			velocity: Vec2::ZERO,
			max_speed: 0.5,
			target,
			neighbours: Vec::new(),
			cell_pos: None,
			formation_dir: None,
		}
	}
	#[test]
	fn arrive_points_at_target() {
		let ctx = lone_agent(Vec2::new(100.0, 0.0));
		let force = arrive_force(&ctx);
		assert!(force.x > 0.0);
		assert!(force.y.abs() < 1e-6);
	}
	#[test]
	fn arrive_ramps_down_near_target() {
		let far = arrive_force(&lone_agent(Vec2::new(100.0, 0.0))).length();
		let near = arrive_force(&lone_agent(Vec2::new(1.0, 0.0))).length();
		assert!(near < far);
	}
	#[test]
	fn separation_pushes_apart() {
		let mut ctx = lone_agent(Vec2::new(100.0, 0.0));
		ctx.neighbours.push(Neighbour {
			uid: 2,
			pos: Vec2::new(1.0, 0.0),
			velocity: Vec2::ZERO,
			radius: 1.0,
			same_flock: true,
		});
		let force = separation_force(&ctx);
		assert!(force.x < 0.0);
	}
	#[test]
	fn total_force_bounded() {
		let mut ctx = lone_agent(Vec2::new(100.0, 100.0));
		ctx.velocity = Vec2::new(-0.5, 0.0);
		for i in 0..8 {
			ctx.neighbours.push(Neighbour {
				uid: i,
				pos: Vec2::new((i as f32 - 4.0) * 0.5, 0.4),
				velocity: Vec2::new(0.2, 0.2),
				radius: 1.0,
				same_flock: true,
			});
		}
		let force = total_steering_force(&ctx, false, 20);
		assert!(force.length() <= force_budget(20) + 1e-5);
	}
	#[test]
	fn fallback_to_separation_when_total_collapses() {
		// a neighbour dead ahead with the target: arrive pulls forward,
		// separation pushes back, the blend nearly cancels
		let mut ctx = lone_agent(Vec2::new(2.0, 0.0));
		ctx.neighbours.push(Neighbour {
			uid: 2,
			pos: Vec2::new(0.55, 0.0),
			velocity: Vec2::ZERO,
			radius: 1.0,
			same_flock: false,
		});
		let force = total_steering_force(&ctx, false, 20);
		assert!(force.length() > 0.0);
	}
	#[test]
	fn wall_component_zeroed() {
		let map = MapDimensions::new(128, 128);
		let mut chunks = NavChunks::new(&map);
		let pos = Vec2::new(10.5, 10.5);
		let td = map.get_tile_desc_from_xz(pos).unwrap();
		let mut east = td;
		map.relative_tile_desc(&mut east, 1, 0);
		chunks
			.get_chunk_mut(&map, NavLayer::Ground1x1, east.chunk)
			.set_cost(east.cell, COST_IMPASSABLE);
		let force = nullify_impass_components(
			&map,
			&chunks,
			NavLayer::Ground1x1,
			pos,
			Vec2::new(1.0, 0.3),
		);
		assert_eq!(0.0, force.x);
		assert_eq!(0.3, force.y);
	}
	#[test]
	fn formation_drag_only_when_ahead() {
		let mut ctx = lone_agent(Vec2::new(100.0, 0.0));
		ctx.velocity = Vec2::new(0.5, 0.0);
		ctx.cell_pos = Some(Vec2::new(-2.0, 0.0));
		ctx.formation_dir = Some(Vec2::new(1.0, 0.0));
		// the agent is 2 units ahead of its cell so drag opposes motion
		let drag = formation_drag_force(&ctx);
		assert!(drag.x < 0.0);
		ctx.cell_pos = Some(Vec2::new(2.0, 0.0));
		assert_eq!(Vec2::ZERO, formation_drag_force(&ctx));
	}
}
