//! A copy of the external gamestate the movement tick reads: entity
//! positions, radii, factions, flags, diplomacy and fog state. The snapshot
//! is rebuilt once per tick and immutable while the tick runs so workers can
//! read it without locks.
//!

use std::collections::BTreeMap;

use crate::prelude::*;
use bevy::prelude::*;

/// Side length of the coarse buckets backing rectangle queries
const BUCKET_SIZE: f32 = 16.0;

/// External entity flags the movement core cares about
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EntityFlags(u32);

impl EntityFlags {
	pub const BUILDING: EntityFlags = EntityFlags(1 << 0);
	pub const STATIC: EntityFlags = EntityFlags(1 << 1);
	pub const DYING: EntityFlags = EntityFlags(1 << 2);
	pub const WATER: EntityFlags = EntityFlags(1 << 3);
	pub const AIR: EntityFlags = EntityFlags(1 << 4);
	/// Combine flags
	pub fn with(self, other: EntityFlags) -> EntityFlags {
		EntityFlags(self.0 | other.0)
	}
	/// Whether every bit of `other` is set
	pub fn contains(self, other: EntityFlags) -> bool {
		self.0 & other.0 == other.0
	}
}

/// One entity as the tick sees it
#[derive(Clone, Copy, Debug)]
pub struct EntitySnapshot {
	pub uid: u32,
	pub pos: Vec2,
	pub radius: f32,
	pub faction_id: u8,
	/// Unit type, partitions formations into subformations
	pub type_id: u32,
	pub flags: EntityFlags,
	/// Whether the local player can currently see the entity through fog
	pub player_visible: bool,
}

/// Deep copy of the gamestate needed by the tick, released and rebuilt at
/// every tick boundary
#[derive(Resource, Default)]
pub struct GameStateSnapshot {
	ents: BTreeMap<u32, EntitySnapshot>,
	/// Coarse spatial buckets for rectangle queries
	buckets: BTreeMap<(i32, i32), Vec<u32>>,
	/// Per-faction enemy bitmask from the diplomacy table
	enemy_masks: [u16; MAX_FACTIONS],
}

impl GameStateSnapshot {
	/// Rebuild the snapshot from the current external state. `hostile` is
	/// the diplomacy predicate between two faction ids
	pub fn rebuild(
		&mut self,
		ents: impl IntoIterator<Item = EntitySnapshot>,
		hostile: impl Fn(u8, u8) -> bool,
	) {
		self.ents.clear();
		self.buckets.clear();
		for ent in ents {
			let bucket = bucket_of(ent.pos);
			self.buckets.entry(bucket).or_default().push(ent.uid);
			self.ents.insert(ent.uid, ent);
		}
		for a in 0..MAX_FACTIONS {
			let mut mask = 0u16;
			for b in 0..MAX_FACTIONS {
				if a != b && hostile(a as u8, b as u8) {
					mask |= 1 << b;
				}
			}
			self.enemy_masks[a] = mask;
		}
	}
	/// Look up an entity
	pub fn ent(&self, uid: u32) -> Option<&EntitySnapshot> {
		self.ents.get(&uid)
	}
	/// Number of entities captured
	pub fn len(&self) -> usize {
		self.ents.len()
	}
	/// Whether the snapshot captured no entities
	pub fn is_empty(&self) -> bool {
		self.ents.is_empty()
	}
	/// Enemy bitmask of a faction
	pub fn enemies_for_faction(&self, faction_id: u8) -> u16 {
		self.enemy_masks
			.get(faction_id as usize)
			.copied()
			.unwrap_or(0)
	}
	/// Whether `other` is an enemy of `faction_id`
	pub fn is_enemy(&self, faction_id: u8, other: u8) -> bool {
		self.enemies_for_faction(faction_id) & (1 << other) != 0
	}
	/// Every entity whose position lies within the rectangle
	pub fn ents_in_rect(&self, min: Vec2, max: Vec2) -> Vec<u32> {
		let (bc0, br0) = bucket_of(min);
		let (bc1, br1) = bucket_of(max);
		let mut out = Vec::new();
		for bc in bc0..=bc1 {
			for br in br0..=br1 {
				let Some(bucket) = self.buckets.get(&(bc, br)) else {
					continue;
				};
				for uid in bucket.iter() {
					let ent = &self.ents[uid];
					if ent.pos.x >= min.x && ent.pos.x <= max.x && ent.pos.y >= min.y && ent.pos.y <= max.y
					{
						out.push(*uid);
					}
				}
			}
		}
		out
	}
	/// Tiles held by live enemies of the faction in and around a chunks
	/// seek region, dilated per layer so wide footprints close gaps
	pub fn enemy_tiles(
		&self,
		map: &MapDimensions,
		layer: NavLayer,
		faction_id: u8,
		min: Vec2,
		max: Vec2,
	) -> Vec<TileDesc> {
		let enemies = self.enemies_for_faction(faction_id);
		let mut out = Vec::new();
		for uid in self.ents_in_rect(min, max) {
			let ent = &self.ents[&uid];
			if enemies & (1 << ent.faction_id) == 0 {
				continue;
			}
			if ent.flags.contains(EntityFlags::DYING) {
				continue;
			}
			out.extend(self.footprint_tiles(map, layer, ent));
		}
		out
	}
	/// Tiles covered by one entitys footprint, dilated per layer
	pub fn footprint_tiles(
		&self,
		map: &MapDimensions,
		layer: NavLayer,
		ent: &EntitySnapshot,
	) -> Vec<TileDesc> {
		let mut all = map.tiles_under_circle(ent.pos, ent.radius.max(0.25));
		let mut frontier = all.clone();
		for _ in 0..layer.dilation_passes() {
			frontier = map.tile_contour(&frontier);
			all.extend(frontier.iter().copied());
		}
		all
	}
}

/// Bucket coordinate of a position
fn bucket_of(pos: Vec2) -> (i32, i32) {
	(
		(pos.x / BUCKET_SIZE).floor() as i32,
		(pos.y / BUCKET_SIZE).floor() as i32,
	)
}
