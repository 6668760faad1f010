//! Savefile support. The movement state serialises to a typed attribute
//! sequence: the click-move flag, then every flock, then every agent record.
//! Loading first applies all pending commands to bring the simulation into a
//! known state and only then overwrites, so a savefile taken mid-frame
//! round-trips exactly.
//!
//! `last_stop_pos`/`last_stop_radius` are deliberately not persisted. They
//! are reconstructed from the entitys current position so blocker integrity
//! survives the round-trip even when the map was edited between sessions.
//!

use crate::prelude::*;
use bevy::prelude::*;

/// Bumped whenever the savefile layout changes
pub const SAVE_VERSION: u32 = 1;

/// Errors surfaced by savefile io
#[derive(thiserror::Error, Debug)]
pub enum SaveError {
	#[error("failed serializing movement state: {0}")]
	Serialize(String),
	#[error("failed parsing movement state: {0}")]
	Parse(String),
	#[error("unsupported savefile version {0}")]
	Version(u32),
}

/// One persisted agent record. Everything the tick needs to resume the
/// agent mid-journey
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct AgentSave {
	pub uid: u32,
	pub state: ArrivalState,
	pub max_speed: f32,
	pub velocity: Vec2,
	pub next_pos: Vec2,
	pub prev_pos: Vec2,
	pub next_rot: Quat,
	pub prev_rot: Quat,
	pub step: f32,
	pub left: u32,
	pub blocking: bool,
	pub wait_prev: ArrivalState,
	pub wait_ticks_left: u32,
	pub vel_hist: Vec<Vec2>,
	pub vel_hist_idx: usize,
	pub surround_target_uid: Option<u32>,
	pub surround_target_prev: Vec2,
	pub surround_nearest_prev: Vec2,
	pub using_surround_field: bool,
	pub target_prev_pos: Vec2,
	pub target_range: f32,
	pub target_dir: Quat,
}

/// One persisted flock record
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct FlockSave {
	pub ents: Vec<u32>,
	pub target_xz: Vec2,
	pub attack: bool,
	pub dest_id: u32,
}

/// The full movement savestate
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SaveState {
	pub version: u32,
	pub click_move_enabled: bool,
	pub flocks: Vec<FlockSave>,
	pub agents: Vec<AgentSave>,
}

/// Capture the movement state into a savestate
pub fn save(config: &NavConfig, states: &MoveStates) -> SaveState {
	let flocks = states
		.flocks()
		.iter()
		.map(|flock| FlockSave {
			ents: flock.ents.iter().copied().collect(),
			target_xz: flock.target_xz,
			attack: flock.attack,
			dest_id: flock.id.0,
		})
		.collect();
	let agents = states
		.iter()
		.map(|(uid, state)| AgentSave {
			uid: *uid,
			state: state.state,
			max_speed: state.max_speed,
			velocity: state.velocity,
			next_pos: state.next_pos,
			prev_pos: state.prev_pos,
			next_rot: state.next_rot,
			prev_rot: state.prev_rot,
			step: state.step,
			left: state.left,
			blocking: state.blocking,
			wait_prev: state.wait_prev,
			wait_ticks_left: state.wait_ticks_left,
			vel_hist: state.vel_hist.clone(),
			vel_hist_idx: state.vel_hist_idx,
			surround_target_uid: state.surround_target_uid,
			surround_target_prev: state.surround_target_prev,
			surround_nearest_prev: state.surround_nearest_prev,
			using_surround_field: state.using_surround_field,
			target_prev_pos: state.target_prev_pos,
			target_range: state.target_range,
			target_dir: state.target_dir,
		})
		.collect();
	SaveState {
		version: SAVE_VERSION,
		click_move_enabled: config.click_move_enabled,
		flocks,
		agents,
	}
}

/// Serialise a savestate to its on-disk text form
#[cfg(feature = "ron")]
pub fn save_to_string(save: &SaveState) -> Result<String, SaveError> {
	ron::ser::to_string(save).map_err(|e| SaveError::Serialize(e.to_string()))
}

/// Parse a savestate from its on-disk text form
#[cfg(feature = "ron")]
pub fn load_from_str(source: &str) -> Result<SaveState, SaveError> {
	let save: SaveState =
		ron::de::from_str(source).map_err(|e| SaveError::Parse(e.to_string()))?;
	if save.version != SAVE_VERSION {
		return Err(SaveError::Version(save.version));
	}
	Ok(save)
}

/// Overwrite the live movement state from a savestate.
///
/// Pending commands are applied first via the normal tick path by the
/// caller; this function then overwrites agent records that exist in the
/// simulation. Records of unknown agents are skipped: agents enter the
/// simulation exclusively through `Add`
pub fn apply(
	save: &SaveState,
	map: &MapDimensions,
	chunks: &mut NavChunks,
	states: &mut MoveStates,
	config: &mut NavConfig,
) {
	config.click_move_enabled = save.click_move_enabled;
	// rebuild flocks wholesale
	states.flocks_mut().clear();
	for flock_save in save.flocks.iter() {
		states.flocks_mut().push(Flock {
			id: DestId(flock_save.dest_id),
			ents: flock_save.ents.iter().copied().collect(),
			target_xz: flock_save.target_xz,
			attack: flock_save.attack,
		});
	}
	let dest_of = |uid: u32| {
		save.flocks
			.iter()
			.find(|flock| flock.ents.contains(&uid))
			.map(|flock| DestId(flock.dest_id))
	};
	for agent in save.agents.iter() {
		let Some(state) = states.get_mut(agent.uid) else {
			warn!("savefile references unknown agent {}", agent.uid);
			continue;
		};
		// release blockers registered before the overwrite
		if state.blocking {
			let (pos, radius, faction) = (
				state.last_stop_pos,
				state.last_stop_radius,
				state.faction_id as usize,
			);
			state.blocking = false;
			chunks.unblock_disk(map, pos, radius, faction);
		}
		let state = states.get_mut(agent.uid).expect("present above");
		state.state = agent.state;
		state.max_speed = agent.max_speed;
		state.velocity = agent.velocity;
		state.next_pos = agent.next_pos;
		state.prev_pos = agent.prev_pos;
		state.next_rot = agent.next_rot;
		state.prev_rot = agent.prev_rot;
		state.step = agent.step;
		state.left = agent.left;
		state.wait_prev = agent.wait_prev;
		state.wait_ticks_left = agent.wait_ticks_left;
		state.vel_hist = agent.vel_hist.clone();
		state.vel_hist.resize(crate::movement::VEL_HIST_LEN, Vec2::ZERO);
		state.vel_hist_idx = agent.vel_hist_idx % crate::movement::VEL_HIST_LEN;
		state.surround_target_uid = agent.surround_target_uid;
		state.surround_target_prev = agent.surround_target_prev;
		state.surround_nearest_prev = agent.surround_nearest_prev;
		state.using_surround_field = agent.using_surround_field;
		state.target_prev_pos = agent.target_prev_pos;
		state.target_range = agent.target_range;
		state.target_dir = agent.target_dir;
		state.dest_id = dest_of(agent.uid);
		if agent.blocking {
			// not persisted: the stop anchor is rebuilt from the current
			// position so the blocker grid stays consistent with the map
			state.blocking = true;
			state.last_stop_pos = agent.next_pos;
			state.last_stop_radius = state.radius;
			let (pos, radius, faction) = (
				agent.next_pos,
				state.radius,
				state.faction_id as usize,
			);
			chunks.block_disk(map, pos, radius, faction);
		}
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn world() -> (MapDimensions, NavChunks, MoveStates, NavConfig) {
		let map = MapDimensions::new(128, 128);
		let chunks = NavChunks::new(&map);
		(map, chunks, MoveStates::default(), NavConfig::default())
	}
	fn populate(map: &MapDimensions, chunks: &mut NavChunks, states: &mut MoveStates) {
		for uid in 1..=3u32 {
			let pos = Vec2::new(uid as f32 * 4.0, -10.0);
			states.add(uid, pos, 1.0, 0);
			chunks.block_disk(map, pos, 1.0, 0);
			states.get_mut(uid).unwrap().max_speed = 8.0;
		}
		states.make_flock(&[1, 2, 3], Vec2::new(40.0, 40.0), false);
		for uid in 1..=3u32 {
			let state = states.get_mut(uid).unwrap();
			state.state = ArrivalState::Moving;
			state.velocity = Vec2::new(0.25, 0.1);
			state.blocking = false;
		}
	}
	#[test]
	#[cfg(feature = "ron")]
	fn round_trip_is_byte_identical() {
		let (map, mut chunks, mut states, config) = world();
		populate(&map, &mut chunks, &mut states);
		let saved = save(&config, &states);
		let text = save_to_string(&saved).unwrap();
		// clear and rebuild the world, reload, save again
		let (map2, mut chunks2, mut states2, mut config2) = world();
		for uid in 1..=3u32 {
			states2.add(uid, Vec2::new(0.0, 0.0), 1.0, 0);
			chunks2.block_disk(&map2, Vec2::new(0.0, 0.0), 1.0, 0);
		}
		let loaded = load_from_str(&text).unwrap();
		apply(&loaded, &map2, &mut chunks2, &mut states2, &mut config2);
		let resaved = save(&config2, &states2);
		let text2 = save_to_string(&resaved).unwrap();
		assert_eq!(text, text2);
	}
	#[test]
	#[cfg(feature = "ron")]
	fn load_restores_agent_fields() {
		let (map, mut chunks, mut states, config) = world();
		populate(&map, &mut chunks, &mut states);
		states.get_mut(2).unwrap().wait_ticks_left = 17;
		let text = save_to_string(&save(&config, &states)).unwrap();
		let (map2, mut chunks2, mut states2, mut config2) = world();
		for uid in 1..=3u32 {
			states2.add(uid, Vec2::ZERO, 1.0, 0);
		}
		apply(
			&load_from_str(&text).unwrap(),
			&map2,
			&mut chunks2,
			&mut states2,
			&mut config2,
		);
		let restored = states2.get(2).unwrap();
		assert_eq!(ArrivalState::Moving, restored.state);
		assert_eq!(17, restored.wait_ticks_left);
		assert_eq!(Vec2::new(0.25, 0.1), restored.velocity);
		assert_eq!(Vec2::new(8.0, -10.0), restored.next_pos);
		assert!(states2.flock_of(2).is_some());
	}
	#[test]
	#[cfg(feature = "ron")]
	fn blockers_restored_from_current_position() {
		let (map, mut chunks, mut states, config) = world();
		states.add(9, Vec2::new(12.5, 12.5), 1.0, 3);
		chunks.block_disk(&map, Vec2::new(12.5, 12.5), 1.0, 3);
		let text = save_to_string(&save(&config, &states)).unwrap();
		let (map2, mut chunks2, mut states2, mut config2) = world();
		states2.add(9, Vec2::new(12.5, 12.5), 1.0, 3);
		chunks2.block_disk(&map2, Vec2::new(12.5, 12.5), 1.0, 3);
		apply(
			&load_from_str(&text).unwrap(),
			&map2,
			&mut chunks2,
			&mut states2,
			&mut config2,
		);
		let td = map2.get_tile_desc_from_xz(Vec2::new(12.5, 12.5)).unwrap();
		// still blocked exactly once: released then re-registered
		assert!(!chunks2.tile_passable(&map2, NavLayer::Ground1x1, td));
		chunks2.unblock_disk(&map2, Vec2::new(12.5, 12.5), 1.0, 3);
		assert!(chunks2.tile_passable(&map2, NavLayer::Ground1x1, td));
	}
	#[test]
	#[cfg(feature = "ron")]
	fn version_mismatch_is_an_error() {
		let (_, _, states, config) = world();
		let mut saved = save(&config, &states);
		saved.version = 999;
		let text = save_to_string(&saved).unwrap();
		assert!(matches!(load_from_str(&text), Err(SaveError::Version(999))));
	}
}
