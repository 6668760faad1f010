//! The deferred command queue. Mutating operations are enqueued by callers
//! and applied at tick boundaries so the simulation state only ever changes
//! on the owning side. Commands may also be snooped most-recent-first when a
//! query needs to observe changes that have not been applied yet.
//!

use std::collections::VecDeque;

use crate::prelude::*;
use bevy::prelude::*;

/// A mutating operation deferred to the next tick boundary
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug)]
pub enum MovementCommand {
	Add {
		uid: u32,
		pos: Vec2,
		radius: f32,
		faction_id: u8,
	},
	Remove {
		uid: u32,
	},
	Stop {
		uid: u32,
	},
	SetDest {
		uid: u32,
		xz: Vec2,
		attack: bool,
	},
	SetChangeDirection {
		uid: u32,
		dir: Quat,
	},
	SetEnterRange {
		uid: u32,
		target: u32,
		range: f32,
	},
	SetSurroundEntity {
		uid: u32,
		target: u32,
	},
	SetSeekEnemies {
		uid: u32,
	},
	UpdatePos {
		uid: u32,
		xz: Vec2,
	},
	UpdateFactionId {
		uid: u32,
		faction_id: u8,
	},
	UpdateSelectionRadius {
		uid: u32,
		radius: f32,
	},
	SetMaxSpeed {
		uid: u32,
		speed: f32,
	},
	MakeFlocks {
		ents: Vec<u32>,
		target: Vec2,
		orientation: Option<Vec2>,
		formation: FormationType,
		attack: bool,
	},
	Unblock {
		uid: u32,
	},
	BlockAt {
		uid: u32,
		pos: Vec2,
	},
}

/// Event wrapper so app code can emit commands through the normal bevy
/// channels, collected into the [CommandQueue] ahead of the tick
#[derive(Event)]
pub struct EventMovementCommand(pub MovementCommand);

/// FIFO of pending commands with most-recent-first snooping
#[derive(Component, Default)]
pub struct CommandQueue {
	queue: VecDeque<MovementCommand>,
}

impl CommandQueue {
	/// Append a command
	pub fn push(&mut self, command: MovementCommand) {
		self.queue.push_back(command);
	}
	/// Number of pending commands
	pub fn len(&self) -> usize {
		self.queue.len()
	}
	/// Whether no commands are pending
	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}
	/// Take every pending command in arrival order
	pub fn drain(&mut self) -> Vec<MovementCommand> {
		self.queue.drain(..).collect()
	}
	/// Walk pending commands most-recent-first, used by queries that must
	/// observe changes scripts issued within the current frame
	pub fn snoop(&self) -> impl Iterator<Item = &MovementCommand> {
		self.queue.iter().rev()
	}
	/// Max speed an agent will have once the queue applies, if a pending
	/// command sets one
	pub fn snoop_max_speed(&self, uid: u32) -> Option<f32> {
		self.snoop().find_map(|command| match command {
			MovementCommand::SetMaxSpeed { uid: u, speed } if *u == uid => Some(*speed),
			_ => None,
		})
	}
	/// Destination an agent will have once the queue applies, if a pending
	/// command sets one
	pub fn snoop_dest(&self, uid: u32) -> Option<(Vec2, bool)> {
		self.snoop().find_map(|command| match command {
			MovementCommand::SetDest { uid: u, xz, attack } if *u == uid => Some((*xz, *attack)),
			MovementCommand::MakeFlocks {
				ents,
				target,
				attack,
				..
			} if ents.contains(&uid) => Some((*target, *attack)),
			_ => None,
		})
	}
	/// Surround target an agent will have once the queue applies
	pub fn snoop_surround_target(&self, uid: u32) -> Option<u32> {
		self.snoop().find_map(|command| match command {
			MovementCommand::SetSurroundEntity { uid: u, target } if *u == uid => Some(*target),
			_ => None,
		})
	}
}

/// Whether the agent is stationary, snapshot-consistent for scripts
pub fn query_still(states: &MoveStates, uid: u32) -> Option<bool> {
	states.get(uid).map(|state| state.still())
}

/// Destination and attack flag of the agent, observing pending commands
/// ahead of the applied state
pub fn query_dest(queue: &CommandQueue, states: &MoveStates, uid: u32) -> Option<(Vec2, bool)> {
	if let Some(pending) = queue.snoop_dest(uid) {
		return Some(pending);
	}
	states
		.flock_of(uid)
		.map(|flock| (flock.target_xz, flock.attack))
}

/// The entity the agent is surrounding, observing pending commands
pub fn query_surrounding(queue: &CommandQueue, states: &MoveStates, uid: u32) -> Option<u32> {
	if let Some(pending) = queue.snoop_surround_target(uid) {
		return Some(pending);
	}
	let state = states.get(uid)?;
	if state.state == ArrivalState::SurroundEntity {
		state.surround_target_uid
	} else {
		None
	}
}

/// Max speed of the agent, observing pending commands
pub fn query_max_speed(queue: &CommandQueue, states: &MoveStates, uid: u32) -> Option<f32> {
	if let Some(pending) = queue.snoop_max_speed(uid) {
		return Some(pending);
	}
	states.get(uid).map(|state| state.max_speed)
}

/// Collect command events into the queue. Runs ahead of the tick so event
/// ordering and queue ordering agree
pub fn collect_command_events(
	mut events: EventReader<EventMovementCommand>,
	mut queue_q: Query<&mut CommandQueue>,
) {
	for event in events.read() {
		for mut queue in queue_q.iter_mut() {
			queue.push(event.0.clone());
		}
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	#[test]
	fn drain_preserves_fifo_order() {
		let mut queue = CommandQueue::default();
		queue.push(MovementCommand::Stop { uid: 1 });
		queue.push(MovementCommand::Stop { uid: 2 });
		queue.push(MovementCommand::Stop { uid: 3 });
		let drained = queue.drain();
		let uids: Vec<u32> = drained
			.iter()
			.map(|command| match command {
				MovementCommand::Stop { uid } => *uid,
				_ => panic!("unexpected command"),
			})
			.collect();
		assert_eq!(vec![1, 2, 3], uids);
		assert!(queue.is_empty());
	}
	#[test]
	fn snoop_sees_most_recent_first() {
		let mut queue = CommandQueue::default();
		queue.push(MovementCommand::SetMaxSpeed { uid: 1, speed: 5.0 });
		queue.push(MovementCommand::SetMaxSpeed { uid: 1, speed: 9.0 });
		assert_eq!(Some(9.0), queue.snoop_max_speed(1));
		assert_eq!(None, queue.snoop_max_speed(2));
	}
	#[test]
	fn queries_observe_pending_commands() {
		let mut queue = CommandQueue::default();
		let mut states = MoveStates::default();
		states.add(1, Vec2::ZERO, 1.0, 0);
		states.get_mut(1).unwrap().max_speed = 4.0;
		assert_eq!(Some(4.0), query_max_speed(&queue, &states, 1));
		queue.push(MovementCommand::SetMaxSpeed { uid: 1, speed: 7.0 });
		// the pending change is visible before the tick applies it
		assert_eq!(Some(7.0), query_max_speed(&queue, &states, 1));
		assert_eq!(Some(true), query_still(&states, 1));
		assert_eq!(None, query_dest(&queue, &states, 1));
		queue.push(MovementCommand::SetSurroundEntity { uid: 1, target: 9 });
		assert_eq!(Some(9), query_surrounding(&queue, &states, 1));
	}
	#[test]
	fn snoop_dest_covers_flocks() {
		let mut queue = CommandQueue::default();
		queue.push(MovementCommand::MakeFlocks {
			ents: vec![4, 5],
			target: Vec2::new(10.0, 20.0),
			orientation: None,
			formation: FormationType::None,
			attack: true,
		});
		assert_eq!(Some((Vec2::new(10.0, 20.0), true)), queue.snoop_dest(5));
		assert_eq!(None, queue.snoop_dest(6));
	}
}
