//! Defines the Bevy [Plugin] wiring the navigation and movement core into an
//! app: the command queue events, the gamestate snapshot resource, the fixed
//! rate movement tick and the interpolation subticks between ticks.
//!

use bevy::prelude::*;

pub mod commands;
pub mod savefile;
pub mod snapshot;
pub mod tick;

use crate::prelude::*;

/// Which backend computes per-agent velocities
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum VelocityBackend {
	#[default]
	Cpu,
	/// Accepted for configuration compatibility, the velocity pass warns and
	/// computes on the cpu pool
	Gpu,
}

/// Simulation rate of the movement tick
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TickRate {
	#[default]
	Hz20,
	Hz10,
	Hz5,
	Hz1,
}

impl TickRate {
	/// Ticks per second
	pub fn hz(self) -> u32 {
		match self {
			TickRate::Hz20 => 20,
			TickRate::Hz10 => 10,
			TickRate::Hz5 => 5,
			TickRate::Hz1 => 1,
		}
	}
}

/// Movement core configuration. Changes take effect at the next tick
/// boundary
#[derive(Resource, Clone, Copy, Debug)]
pub struct NavConfig {
	pub tick_rate: TickRate,
	pub backend: VelocityBackend,
	/// Right-click issues move orders
	pub click_move_enabled: bool,
	/// Clicking an enemy issues an attack-move
	pub attack_on_click: bool,
	/// The ui is waiting for a target click
	pub target_mode: bool,
}

impl Default for NavConfig {
	fn default() -> Self {
		NavConfig {
			tick_rate: TickRate::Hz20,
			backend: VelocityBackend::Cpu,
			click_move_enabled: true,
			attack_on_click: false,
			target_mode: false,
		}
	}
}

impl NavConfig {
	/// Ticks per second of the simulation
	pub fn tick_hz(&self) -> u32 {
		self.tick_rate.hz()
	}
	/// Whether the ui is waiting for a target click
	pub fn in_target_mode(&self) -> bool {
		self.target_mode
	}
}

/// System sets of the movement core, the tick set runs in [FixedUpdate] and
/// the interpolation set in [Update]
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum NavSet {
	/// Command collection and the simulation tick
	Tick,
	/// Render-facing position interpolation
	Interpolate,
}

pub struct RtsNavPlugin;

impl Plugin for RtsNavPlugin {
	fn build(&self, app: &mut App) {
		let config = NavConfig::default();
		app.add_event::<commands::EventMovementCommand>()
			.insert_resource(config)
			.init_resource::<GameStateSnapshot>()
			.insert_resource(Time::<Fixed>::from_hz(config.tick_hz() as f64))
			.add_systems(
				FixedUpdate,
				(
					apply_tick_rate,
					commands::collect_command_events,
					movement_tick_system,
				)
					.chain()
					.in_set(NavSet::Tick),
			)
			.add_systems(
				Update,
				interpolation_subtick.in_set(NavSet::Interpolate),
			);
	}
}

/// Pick up tick rate changes at the tick boundary
fn apply_tick_rate(config: Res<NavConfig>, mut fixed: ResMut<Time<Fixed>>) {
	if config.is_changed() {
		let hz = config.tick_hz() as f64;
		fixed.set_timestep_hz(hz);
	}
}

/// Run the full movement tick against every navigation bundle
pub fn movement_tick_system(
	config: Res<NavConfig>,
	snapshot: Res<GameStateSnapshot>,
	mut nav_q: Query<(
		&MapDimensions,
		&mut NavChunks,
		&mut ChunkPortals,
		&mut FieldCache,
		&mut Formations,
		&mut MoveStates,
		&mut CommandQueue,
	)>,
) {
	for (map, mut chunks, mut portals, mut cache, mut formations, mut states, mut queue) in
		&mut nav_q
	{
		tick::run_movement_tick(
			map,
			&mut chunks,
			&mut portals,
			&mut cache,
			&mut formations,
			&mut states,
			&mut queue,
			&snapshot,
			&config,
		);
	}
}

/// Advance the render-facing interpolation of every agent. A frame that ran
/// the fixed tick resets the interpolation window instead, so subticks and
/// full ticks never both move an agent in one frame
pub fn interpolation_subtick(
	fixed: Res<Time<Fixed>>,
	mut nav_q: Query<&mut MoveStates>,
) {
	if fixed.is_changed() {
		return;
	}
	for mut states in &mut nav_q {
		for (_, state) in states.iter_mut() {
			state.interpolate_tick();
		}
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn tick_rates() {
		assert_eq!(20, TickRate::Hz20.hz());
		assert_eq!(10, TickRate::Hz10.hz());
		assert_eq!(5, TickRate::Hz5.hz());
		assert_eq!(1, TickRate::Hz1.hz());
	}
	#[test]
	fn default_config() {
		let config = NavConfig::default();
		assert_eq!(VelocityBackend::Cpu, config.backend);
		assert_eq!(20, config.tick_hz());
		assert!(config.click_move_enabled);
		assert!(!config.in_target_mode());
	}
}
