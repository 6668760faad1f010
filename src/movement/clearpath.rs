//! ClearPath-style collision avoidance. Every neighbour imposes a velocity
//! obstacle cone on the agent, using the hybrid reciprocal formulation:
//! moving neighbours take half the avoidance responsibility, static ones
//! impose the full cone. The output is the admissible velocity closest to
//! the preferred velocity, where admissible means outside the union of all
//! cones.
//!

use bevy::prelude::*;

use crate::movement::steering::Neighbour;

/// Most neighbours considered per class, nearest first
pub const MAX_NEIGHBOURS: usize = 32;
/// Small slack subtracted from combined radii so touching disks do not
/// produce degenerate cones
const RADIUS_SLACK: f32 = 1.0 / 64.0;

/// One velocity obstacle cone in velocity space
#[derive(Clone, Copy, Debug)]
struct VoCone {
	apex: Vec2,
	/// Unit vector of the counter-clockwise cone edge
	left: Vec2,
	/// Unit vector of the clockwise cone edge
	right: Vec2,
}

impl VoCone {
	/// Whether a velocity lies strictly inside the cone
	fn contains(&self, velocity: Vec2) -> bool {
		let v = velocity - self.apex;
		// inside when v sits between the right and left edges
		cross(self.right, v) > 0.0 && cross(v, self.left) > 0.0
	}
	/// Closest point to `velocity` on either cone edge
	fn project(&self, velocity: Vec2) -> Vec2 {
		let v = velocity - self.apex;
		let on_left = self.left * v.dot(self.left).max(0.0);
		let on_right = self.right * v.dot(self.right).max(0.0);
		let candidate = if (v - on_left).length_squared() <= (v - on_right).length_squared() {
			on_left
		} else {
			on_right
		};
		self.apex + candidate
	}
	/// Intersections of this cones edges with anothers, candidate corner
	/// velocities of the admissible region
	fn edge_intersections(&self, other: &VoCone) -> Vec<Vec2> {
		let mut out = Vec::new();
		for (a_origin, a_dir) in [(self.apex, self.left), (self.apex, self.right)] {
			for (b_origin, b_dir) in [(other.apex, other.left), (other.apex, other.right)] {
				if let Some(point) = ray_intersect(a_origin, a_dir, b_origin, b_dir) {
					out.push(point);
				}
			}
		}
		out
	}
}

#[inline]
fn cross(a: Vec2, b: Vec2) -> f32 {
	a.x * b.y - a.y * b.x
}

/// Intersection point of two forward rays, [None] when parallel or behind
/// either origin
fn ray_intersect(a_origin: Vec2, a_dir: Vec2, b_origin: Vec2, b_dir: Vec2) -> Option<Vec2> {
	let denominator = cross(a_dir, b_dir);
	if denominator.abs() < 1e-6 {
		return None;
	}
	let delta = b_origin - a_origin;
	let t = cross(delta, b_dir) / denominator;
	let s = cross(delta, a_dir) / denominator;
	if t < 0.0 || s < 0.0 {
		return None;
	}
	Some(a_origin + a_dir * t)
}

/// Rotate a unit vector by the angle whose sine/cosine are given
fn rotate(v: Vec2, sin: f32, cos: f32) -> Vec2 {
	Vec2::new(v.x * cos - v.y * sin, v.x * sin + v.y * cos)
}

/// Build the hybrid reciprocal velocity obstacle imposed by one neighbour.
/// Returns [None] for neighbours too far to constrain the agent
fn hrvo_cone(
	pos: Vec2,
	velocity: Vec2,
	radius: f32,
	neighbour: &Neighbour,
	neighbour_static: bool,
) -> Option<VoCone> {
	let relative = neighbour.pos - pos;
	let distance = relative.length();
	if distance < 1e-5 {
		return None;
	}
	let combined = (radius + neighbour.radius - RADIUS_SLACK).max(RADIUS_SLACK);
	let center = relative / distance;
	let (left, right) = if distance <= combined {
		// already overlapping, the cone opens into a half plane pushing the
		// agent straight out
		let l = Vec2::new(-center.y, center.x);
		(l, -l)
	} else {
		let sin = combined / distance;
		let cos = (1.0 - sin * sin).sqrt();
		(rotate(center, sin, cos), rotate(center, -sin, cos))
	};
	let apex = if neighbour_static {
		// a static obstacle takes no share of the responsibility
		neighbour.velocity
	} else {
		let vo_apex = neighbour.velocity;
		let rvo_apex = (velocity + neighbour.velocity) * 0.5;
		// hybrid: the apex slides so the edge on the agents side passes
		// through the reciprocal apex while the other edge stays on the
		// full obstacle apex
		let relative_velocity = velocity - neighbour.velocity;
		if cross(center, relative_velocity) > 0.0 {
			ray_intersect(rvo_apex, left, vo_apex, right).unwrap_or(rvo_apex)
		} else {
			ray_intersect(vo_apex, left, rvo_apex, right).unwrap_or(rvo_apex)
		}
	};
	Some(VoCone { apex, left, right })
}

/// Pick the admissible velocity closest to `v_pref`.
///
/// `dynamic_neighbours` are other movers, `static_neighbours` are standing
/// blockers. When every candidate is blocked (the agent is caged) the
/// velocity falls back to the nearest point on the boundary of the dominant
/// cone, the one imposed by the closest neighbour
pub fn compute_velocity(
	pos: Vec2,
	velocity: Vec2,
	radius: f32,
	max_speed: f32,
	v_pref: Vec2,
	dynamic_neighbours: &[Neighbour],
	static_neighbours: &[Neighbour],
) -> Vec2 {
	let mut cones: Vec<(VoCone, f32)> = Vec::new();
	for (list, is_static) in [(dynamic_neighbours, false), (static_neighbours, true)] {
		for neighbour in list.iter().take(MAX_NEIGHBOURS) {
			if let Some(cone) = hrvo_cone(pos, velocity, radius, neighbour, is_static) {
				cones.push((cone, pos.distance(neighbour.pos)));
			}
		}
	}
	if cones.is_empty() {
		return crate::movement::vec2_truncate(v_pref, max_speed);
	}
	let admissible = |candidate: Vec2| cones.iter().all(|(cone, _)| !cone.contains(candidate));
	let v_pref = crate::movement::vec2_truncate(v_pref, max_speed);
	if admissible(v_pref) {
		return v_pref;
	}
	// candidate velocities: projections of the preferred velocity onto every
	// cone boundary plus the pairwise edge intersections
	let mut candidates: Vec<Vec2> = Vec::new();
	for (cone, _) in cones.iter() {
		candidates.push(cone.project(v_pref));
	}
	for i in 0..cones.len() {
		for j in (i + 1)..cones.len() {
			candidates.extend(cones[i].0.edge_intersections(&cones[j].0));
		}
	}
	let mut best: Option<(f32, Vec2)> = None;
	for candidate in candidates {
		let candidate = crate::movement::vec2_truncate(candidate, max_speed);
		if !admissible(candidate) {
			continue;
		}
		let cost = candidate.distance_squared(v_pref);
		if best.map_or(true, |(best_cost, _)| cost < best_cost) {
			best = Some((cost, candidate));
		}
	}
	if let Some((_, velocity)) = best {
		return velocity;
	}
	// caged: yield the boundary of the dominant cone
	let dominant = cones
		.iter()
		.min_by(|a, b| a.1.total_cmp(&b.1))
		.expect("cones is non-empty");
	crate::movement::vec2_truncate(dominant.0.project(v_pref), max_speed)
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn neighbour(pos: Vec2, velocity: Vec2) -> Neighbour {
		Neighbour {
			uid: 99,
			pos,
			velocity,
			radius: 0.5,
			same_flock: false,
		}
	}
	#[test]
	fn unobstructed_returns_preference() {
		let v = compute_velocity(
			Vec2::ZERO,
			Vec2::ZERO,
			0.5,
			1.0,
			Vec2::new(1.0, 0.0),
			&[],
			&[],
		);
		assert_eq!(Vec2::new(1.0, 0.0), v);
	}
	#[test]
	fn far_neighbour_does_not_deflect() {
		let v = compute_velocity(
			Vec2::ZERO,
			Vec2::new(1.0, 0.0),
			0.5,
			1.0,
			Vec2::new(1.0, 0.0),
			&[neighbour(Vec2::new(0.0, 50.0), Vec2::ZERO)],
			&[],
		);
		assert_eq!(Vec2::new(1.0, 0.0), v);
	}
	#[test]
	fn static_obstacle_ahead_deflects() {
		let v = compute_velocity(
			Vec2::ZERO,
			Vec2::new(1.0, 0.0),
			0.5,
			1.0,
			Vec2::new(1.0, 0.0),
			&[],
			&[neighbour(Vec2::new(2.0, 0.0), Vec2::ZERO)],
		);
		// the returned velocity dodges sideways rather than driving in
		assert!(v.y.abs() > 1e-4 || v.x < 0.9, "still driving into obstacle: {:?}", v);
		// and is admissible by construction
		assert!(v.length() <= 1.0 + 1e-5);
	}
	#[test]
	fn head_on_movers_split_responsibility() {
		let v = compute_velocity(
			Vec2::ZERO,
			Vec2::new(1.0, 0.0),
			0.5,
			1.0,
			Vec2::new(1.0, 0.0),
			&[neighbour(Vec2::new(4.0, 0.0), Vec2::new(-1.0, 0.0))],
			&[],
		);
		assert!(v.y.abs() > 1e-4, "no lateral component: {:?}", v);
	}
	#[test]
	fn caged_agent_still_yields_finite_velocity() {
		let ring: Vec<Neighbour> = (0..8)
			.map(|i| {
				let angle = i as f32 / 8.0 * std::f32::consts::TAU;
				neighbour(Vec2::new(angle.cos(), angle.sin()) * 1.2, Vec2::ZERO)
			})
			.collect();
		let v = compute_velocity(
			Vec2::ZERO,
			Vec2::ZERO,
			0.5,
			1.0,
			Vec2::new(1.0, 0.0),
			&[],
			&ring,
		);
		assert!(v.is_finite());
		assert!(v.length() <= 1.0 + 1e-5);
	}
	#[test]
	fn overlapping_neighbour_pushes_out() {
		let v = compute_velocity(
			Vec2::ZERO,
			Vec2::ZERO,
			0.5,
			1.0,
			Vec2::new(1.0, 0.0),
			&[],
			&[neighbour(Vec2::new(0.5, 0.0), Vec2::ZERO)],
		);
		// heading straight at an overlapping disk is never admissible
		assert!(v.x < 1.0);
	}
}
