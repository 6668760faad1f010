//! Per-agent movement state. The movement tick advances every agent through
//! a small state machine, composing steering forces with collision avoidance
//! to produce the next position and orientation. Between simulation ticks
//! positions are linearly interpolated for rendering.
//!

pub mod clearpath;
pub mod steering;

use std::collections::BTreeMap;

use bevy::prelude::*;

/// Length of the velocity ring buffer feeding orientation smoothing
pub const VEL_HIST_LEN: usize = 14;
/// Ticks an agent holds in [ArrivalState::Waiting] before retrying
pub const WAIT_TICKS: u32 = 60;
/// Upper bound on rotation per tick, degrees
pub const MAX_TURN_RATE: f32 = 15.0;
/// Angular distance at which a turn counts as finished, degrees
pub const TURN_DONE_EPS: f32 = 5.0;
/// Radius within which neighbours are fed to the avoidance solver
pub const CLEARPATH_NEIGHBOUR_RADIUS: f32 = 10.0;
/// Crossing below this distance to a surround target switches the agent onto
/// the per-target surround field
pub const SURROUND_LOW_WATER: f32 = 10.0;
/// Crossing above this distance switches the agent back to flow-field travel
pub const SURROUND_HIGH_WATER: f32 = 20.0;
/// Distance to the flock target under which a point-seek agent has arrived,
/// scaled by the agent radius
pub const ARRIVE_THRESHOLD_SCALE: f32 = 1.5;
/// All entities share one mass so equal forces accelerate them equally
pub const ENTITY_MASS: f32 = 1.0;
/// For the purpose of movement simulation the simulation runs its reference
/// behaviour at this rate
pub const BASE_TICK_HZ: u32 = 20;

/// Arrival state of the per-agent state machine
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Reflect)]
pub enum ArrivalState {
	/// Pure point-seek to a flock target
	Moving,
	/// Point-seek plus formation cohesion/alignment/drag
	MovingInFormation,
	/// Following the per-cell arrival field
	ArrivingToCell,
	/// Following an enemy-seek field, no flock target
	SeekEnemies,
	/// Pathing towards a surround target
	SurroundEntity,
	/// Like [ArrivalState::Moving] until within range of a moving target
	EnterEntityRange,
	/// Zero velocity, rotating towards a target quaternion
	Turning,
	/// Desired velocity collapsed mid-journey, waiting before a retry
	Waiting,
	/// Terminal for the current command, the agent blocks its tiles
	#[default]
	Arrived,
}

impl ArrivalState {
	/// Whether the state keeps the agent stationary
	pub fn is_still(&self) -> bool {
		matches!(self, ArrivalState::Arrived | ArrivalState::Waiting)
	}
}

/// Identifier of a flock, handed out per destination command
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Reflect)]
pub struct DestId(pub u32);

/// A set of agents sharing a destination
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug)]
pub struct Flock {
	pub id: DestId,
	pub ents: std::collections::BTreeSet<u32>,
	pub target_xz: Vec2,
	/// Whether the move was issued as an attack-move
	pub attack: bool,
}

/// The per-agent record driving the movement tick
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug)]
pub struct MoveState {
	pub state: ArrivalState,
	pub max_speed: f32,
	/// Velocity in units per tick
	pub velocity: Vec2,
	pub prev_pos: Vec2,
	pub next_pos: Vec2,
	pub prev_rot: Quat,
	pub next_rot: Quat,
	/// Interpolation fraction advanced per render subtick
	pub step: f32,
	/// Interpolation steps remaining until `next_pos` is reached
	pub left: u32,
	/// Whether the agent currently registers blockers
	pub blocking: bool,
	/// Position the blockers were registered at, reconstructed on load
	pub last_stop_pos: Vec2,
	/// Radius the blockers were registered with
	pub last_stop_radius: f32,
	/// Ring buffer of recent velocities for orientation smoothing
	pub vel_hist: Vec<Vec2>,
	pub vel_hist_idx: usize,
	pub surround_target_uid: Option<u32>,
	/// Surround target position at the last repath
	pub surround_target_prev: Vec2,
	/// Nearest position on the surround target observed previously
	pub surround_nearest_prev: Vec2,
	pub using_surround_field: bool,
	/// Position of the enter-range target at the previous tick
	pub target_prev_pos: Vec2,
	pub target_range: f32,
	/// Orientation goal while [ArrivalState::Turning]
	pub target_dir: Quat,
	/// State to resume after waiting
	pub wait_prev: ArrivalState,
	pub wait_ticks_left: u32,
	pub radius: f32,
	pub faction_id: u8,
	/// Flock the agent belongs to, if any
	pub dest_id: Option<DestId>,
}

impl MoveState {
	/// Initial state of a freshly added agent: standing, blocking
	pub fn new(pos: Vec2, radius: f32, faction_id: u8) -> Self {
		MoveState {
			state: ArrivalState::Arrived,
			max_speed: 0.0,
			velocity: Vec2::ZERO,
			prev_pos: pos,
			next_pos: pos,
			prev_rot: Quat::IDENTITY,
			next_rot: Quat::IDENTITY,
			step: 0.0,
			left: 0,
			blocking: true,
			last_stop_pos: pos,
			last_stop_radius: radius,
			vel_hist: vec![Vec2::ZERO; VEL_HIST_LEN],
			vel_hist_idx: 0,
			surround_target_uid: None,
			surround_target_prev: Vec2::ZERO,
			surround_nearest_prev: Vec2::ZERO,
			using_surround_field: false,
			target_prev_pos: Vec2::ZERO,
			target_range: 0.0,
			target_dir: Quat::IDENTITY,
			wait_prev: ArrivalState::Arrived,
			wait_ticks_left: 0,
			radius,
			faction_id,
			dest_id: None,
		}
	}
	/// Current position: the simulation-facing position is `next_pos`, the
	/// render-facing one interpolates from `prev_pos`
	pub fn pos(&self) -> Vec2 {
		self.next_pos
	}
	/// Render position at the current interpolation step
	pub fn interpolated_pos(&self) -> Vec2 {
		let remaining = self.left as f32 * self.step;
		self.next_pos - (self.next_pos - self.prev_pos) * remaining.clamp(0.0, 1.0)
	}
	/// Render orientation at the current interpolation step
	pub fn interpolated_rot(&self) -> Quat {
		let remaining = (self.left as f32 * self.step).clamp(0.0, 1.0);
		self.next_rot.slerp(self.prev_rot, remaining)
	}
	/// Advance one render subtick
	pub fn interpolate_tick(&mut self) {
		if self.left > 0 {
			self.left -= 1;
		}
	}
	/// Record a velocity into the ring buffer
	pub fn push_velocity(&mut self, velocity: Vec2) {
		self.vel_hist[self.vel_hist_idx] = velocity;
		self.vel_hist_idx = (self.vel_hist_idx + 1) % VEL_HIST_LEN;
	}
	/// Weighted moving average of the velocity history, recent entries
	/// weigh more so rotation lags smoothly behind motion
	pub fn average_velocity(&self) -> Vec2 {
		let mut total = Vec2::ZERO;
		let mut weight_sum = 0.0;
		for age in 0..VEL_HIST_LEN {
			let index =
				(self.vel_hist_idx + VEL_HIST_LEN - 1 - age) % VEL_HIST_LEN;
			let weight = (VEL_HIST_LEN - age) as f32;
			total += self.vel_hist[index] * weight;
			weight_sum += weight;
		}
		total / weight_sum
	}
	/// Whether the agent is stationary as far as queries are concerned
	pub fn still(&self) -> bool {
		self.state.is_still()
	}
}

/// Orientation quaternion facing along a velocity on the `XZ` plane
pub fn dir_quat_from_velocity(velocity: Vec2) -> Quat {
	if velocity.length_squared() < f32::EPSILON {
		return Quat::IDENTITY;
	}
	let yaw = velocity.x.atan2(velocity.y);
	Quat::from_rotation_y(yaw)
}

/// Truncate a vector to a maximum length
pub fn vec2_truncate(v: Vec2, max_len: f32) -> Vec2 {
	if v.length() > max_len {
		v.normalize() * max_len
	} else {
		v
	}
}

/// The movement core tables: per-agent state and the live flocks
#[derive(Component, Default)]
pub struct MoveStates {
	states: BTreeMap<u32, MoveState>,
	flocks: Vec<Flock>,
	next_dest_id: u32,
}

impl MoveStates {
	/// Get a reference to an agents state
	pub fn get(&self, uid: u32) -> Option<&MoveState> {
		self.states.get(&uid)
	}
	/// Get a mutable reference to an agents state
	pub fn get_mut(&mut self, uid: u32) -> Option<&mut MoveState> {
		self.states.get_mut(&uid)
	}
	/// Iterate every `(uid, state)` pair
	pub fn iter(&self) -> impl Iterator<Item = (&u32, &MoveState)> {
		self.states.iter()
	}
	/// Iterate every `(uid, state)` pair mutably
	pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut MoveState)> {
		self.states.iter_mut()
	}
	/// Number of registered agents
	pub fn len(&self) -> usize {
		self.states.len()
	}
	/// Whether no agents are registered
	pub fn is_empty(&self) -> bool {
		self.states.is_empty()
	}
	/// Register an agent. A duplicate uid is a caller precondition error and
	/// leaves the existing record untouched
	pub fn add(&mut self, uid: u32, pos: Vec2, radius: f32, faction_id: u8) -> bool {
		if self.states.contains_key(&uid) {
			return false;
		}
		self.states.insert(uid, MoveState::new(pos, radius, faction_id));
		true
	}
	/// Drop an agent, returning its final state for blocker cleanup
	pub fn remove(&mut self, uid: u32) -> Option<MoveState> {
		self.remove_from_flocks(uid);
		self.states.remove(&uid)
	}
	/// The live flocks
	pub fn flocks(&self) -> &[Flock] {
		&self.flocks
	}
	/// Mutable access to the live flocks
	pub fn flocks_mut(&mut self) -> &mut Vec<Flock> {
		&mut self.flocks
	}
	/// The flock an agent belongs to
	pub fn flock_of(&self, uid: u32) -> Option<&Flock> {
		let dest_id = self.states.get(&uid)?.dest_id?;
		self.flocks.iter().find(|flock| flock.id == dest_id)
	}
	/// Remove an agent from any flock it belongs to, dropping flocks that
	/// become empty
	pub fn remove_from_flocks(&mut self, uid: u32) {
		if let Some(state) = self.states.get_mut(&uid) {
			state.dest_id = None;
		}
		for flock in self.flocks.iter_mut() {
			flock.ents.remove(&uid);
		}
		self.flocks.retain(|flock| !flock.ents.is_empty());
	}
	/// Create a flock for the agents towards a shared target, merging into
	/// an existing flock with the same target when one exists. Returns the
	/// dest id the agents ended up in
	pub fn make_flock(&mut self, ents: &[u32], target_xz: Vec2, attack: bool) -> Option<DestId> {
		let movers: Vec<u32> = ents
			.iter()
			.copied()
			.filter(|uid| {
				self.states
					.get(uid)
					.map_or(false, |state| state.max_speed > 0.0)
			})
			.collect();
		if movers.is_empty() {
			return None;
		}
		for uid in movers.iter() {
			self.remove_from_flocks(*uid);
		}
		// an existing flock headed for the same spot absorbs the selection
		let merged = self
			.flocks
			.iter_mut()
			.find(|flock| flock.attack == attack && flock.target_xz.distance(target_xz) < 1.0);
		let dest_id = match merged {
			Some(flock) => {
				flock.ents.extend(movers.iter().copied());
				flock.id
			}
			None => {
				let id = DestId(self.next_dest_id);
				self.next_dest_id = self.next_dest_id.wrapping_add(1);
				self.flocks.push(Flock {
					id,
					ents: movers.iter().copied().collect(),
					target_xz,
					attack,
				});
				id
			}
		};
		for uid in movers.iter() {
			if let Some(state) = self.states.get_mut(uid) {
				state.dest_id = Some(dest_id);
			}
		}
		Some(dest_id)
	}
	/// Drop flocks whose members have all arrived
	pub fn disband_arrived_flocks(&mut self) {
		let states = &self.states;
		let mut disbanded: Vec<DestId> = Vec::new();
		self.flocks.retain(|flock| {
			let done = flock.ents.iter().all(|uid| {
				states
					.get(uid)
					.map_or(true, |state| state.state == ArrivalState::Arrived)
			});
			if done {
				disbanded.push(flock.id);
			}
			!done
		});
		for id in disbanded {
			for state in self.states.values_mut() {
				if state.dest_id == Some(id) {
					state.dest_id = None;
				}
			}
		}
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn add_is_idempotent_no_op_on_duplicate() {
		let mut states = MoveStates::default();
		assert!(states.add(7, Vec2::new(1.0, 2.0), 1.0, 0));
		states.get_mut(7).unwrap().max_speed = 5.0;
		assert!(!states.add(7, Vec2::ZERO, 2.0, 1));
		assert_eq!(5.0, states.get(7).unwrap().max_speed);
	}
	#[test]
	fn new_agent_is_arrived_and_blocking() {
		let mut states = MoveStates::default();
		states.add(1, Vec2::ZERO, 1.0, 0);
		let state = states.get(1).unwrap();
		assert_eq!(ArrivalState::Arrived, state.state);
		assert!(state.blocking);
		assert!(state.still());
	}
	#[test]
	fn flock_merges_on_same_target() {
		let mut states = MoveStates::default();
		for uid in 1..=4 {
			states.add(uid, Vec2::ZERO, 1.0, 0);
			states.get_mut(uid).unwrap().max_speed = 5.0;
		}
		let a = states.make_flock(&[1, 2], Vec2::new(50.0, 50.0), false).unwrap();
		let b = states.make_flock(&[3, 4], Vec2::new(50.0, 50.0), false).unwrap();
		assert_eq!(a, b);
		assert_eq!(1, states.flocks().len());
		assert_eq!(4, states.flocks()[0].ents.len());
	}
	#[test]
	fn flock_excludes_immobile() {
		let mut states = MoveStates::default();
		states.add(1, Vec2::ZERO, 1.0, 0);
		// max_speed stays 0, the agent cannot move
		assert!(states.make_flock(&[1], Vec2::new(5.0, 5.0), false).is_none());
	}
	#[test]
	fn disband_when_all_arrived() {
		let mut states = MoveStates::default();
		for uid in 1..=2 {
			states.add(uid, Vec2::ZERO, 1.0, 0);
			states.get_mut(uid).unwrap().max_speed = 5.0;
		}
		states.make_flock(&[1, 2], Vec2::new(50.0, 50.0), false).unwrap();
		states.get_mut(1).unwrap().state = ArrivalState::Moving;
		states.disband_arrived_flocks();
		assert_eq!(1, states.flocks().len());
		states.get_mut(1).unwrap().state = ArrivalState::Arrived;
		states.disband_arrived_flocks();
		assert!(states.flocks().is_empty());
		assert_eq!(None, states.get(1).unwrap().dest_id);
	}
	#[test]
	fn interpolation_walks_prev_to_next() {
		let mut state = MoveState::new(Vec2::ZERO, 1.0, 0);
		state.prev_pos = Vec2::ZERO;
		state.next_pos = Vec2::new(4.0, 0.0);
		state.step = 0.25;
		state.left = 4;
		assert_eq!(Vec2::ZERO, state.interpolated_pos());
		state.interpolate_tick();
		assert_eq!(Vec2::new(1.0, 0.0), state.interpolated_pos());
		state.interpolate_tick();
		state.interpolate_tick();
		state.interpolate_tick();
		assert_eq!(Vec2::new(4.0, 0.0), state.interpolated_pos());
	}
	#[test]
	fn velocity_average_weighs_recent_history() {
		let mut state = MoveState::new(Vec2::ZERO, 1.0, 0);
		for _ in 0..VEL_HIST_LEN {
			state.push_velocity(Vec2::new(0.0, 1.0));
		}
		state.push_velocity(Vec2::new(1.0, 0.0));
		let avg = state.average_velocity();
		// the single recent x-ward sample outweighs any one older sample
		assert!(avg.x > 0.0);
		assert!(avg.y > avg.x, "old heading still dominates");
	}
	#[test]
	fn dir_quat_faces_velocity() {
		let quat = dir_quat_from_velocity(Vec2::new(0.0, 1.0));
		// facing +z is the identity yaw reference
		let forward = quat * Vec3::new(0.0, 0.0, 1.0);
		assert!((forward.z - 1.0).abs() < 1e-5);
		let quat = dir_quat_from_velocity(Vec2::new(1.0, 0.0));
		let forward = quat * Vec3::new(0.0, 0.0, 1.0);
		assert!((forward.x - 1.0).abs() < 1e-5);
	}
}
