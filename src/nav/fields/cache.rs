//! Each generated [FlowField] is placed into this cache so that multiple
//! agents can read from the same dataset. Entries are keyed by the packed
//! [FieldId], evicted least-recently-used first and invalidated whenever the
//! chunk they reference goes dirty.
//!

use std::collections::{BTreeMap, BTreeSet};

use crate::prelude::*;
use bevy::prelude::*;

/// Default number of fields kept before least-recently-used eviction starts
const DEFAULT_CAPACITY: usize = 1024;

/// A cached field: the packed flow plus the optional line-of-sight data of
/// destination chunks
pub struct FieldCacheEntry {
	pub flow: FlowField,
	pub los: Option<LosField>,
	/// Monotonic use stamp driving eviction
	stamp: u64,
}

/// LRU-ish store of computed fields keyed by [FieldId].
///
/// Build deduplication: a builder claims an id with
/// [FieldCache::try_begin_build] before spawning work, later publishing with
/// [FieldCache::finish_build]. A second request for an id that is pending
/// simply waits for the first build to land, guaranteeing at most one
/// concurrent build per id
#[derive(Component)]
pub struct FieldCache {
	entries: BTreeMap<FieldId, FieldCacheEntry>,
	/// Ids claimed by an in-flight build
	pending: BTreeSet<FieldId>,
	capacity: usize,
	stamp: u64,
}

impl Default for FieldCache {
	fn default() -> Self {
		FieldCache {
			entries: BTreeMap::new(),
			pending: BTreeSet::new(),
			capacity: DEFAULT_CAPACITY,
			stamp: 0,
		}
	}
}

impl FieldCache {
	/// Create a cache bounded to `capacity` entries
	pub fn with_capacity(capacity: usize) -> Self {
		FieldCache {
			capacity: capacity.max(1),
			..Default::default()
		}
	}
	/// Number of cached fields
	pub fn len(&self) -> usize {
		self.entries.len()
	}
	/// Whether the cache holds no fields
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
	/// Look up a field, refreshing its use stamp
	pub fn get(&mut self, id: FieldId) -> Option<&FieldCacheEntry> {
		self.stamp += 1;
		let stamp = self.stamp;
		if let Some(entry) = self.entries.get_mut(&id) {
			entry.stamp = stamp;
			return self.entries.get(&id);
		}
		None
	}
	/// Look up a field without touching its use stamp
	pub fn peek(&self, id: FieldId) -> Option<&FieldCacheEntry> {
		self.entries.get(&id)
	}
	/// Insert a field, evicting the least-recently-used entry when full
	pub fn put(&mut self, id: FieldId, flow: FlowField, los: Option<LosField>) {
		self.stamp += 1;
		self.entries.insert(
			id,
			FieldCacheEntry {
				flow,
				los,
				stamp: self.stamp,
			},
		);
		while self.entries.len() > self.capacity {
			let Some(oldest) = self
				.entries
				.iter()
				.min_by_key(|(_, entry)| entry.stamp)
				.map(|(id, _)| *id)
			else {
				break;
			};
			self.entries.remove(&oldest);
		}
	}
	/// Claim an id for building. Returns false when the field is already
	/// cached or another build of the same id is in flight
	pub fn try_begin_build(&mut self, id: FieldId) -> bool {
		if self.entries.contains_key(&id) || self.pending.contains(&id) {
			return false;
		}
		self.pending.insert(id);
		true
	}
	/// Whether a build of the id is in flight
	pub fn is_pending(&self, id: FieldId) -> bool {
		self.pending.contains(&id)
	}
	/// Publish the result of a claimed build
	pub fn finish_build(&mut self, id: FieldId, flow: FlowField, los: Option<LosField>) {
		self.pending.remove(&id);
		self.put(id, flow, los);
	}
	/// Release a claimed id without publishing, used when a build is
	/// cancelled or its inputs went stale mid-flight
	pub fn abort_build(&mut self, id: FieldId) {
		self.pending.remove(&id);
	}
	/// Drop every entry referencing the chunk on the layer
	pub fn invalidate(&mut self, chunk: ChunkID, layer: NavLayer) {
		self.entries
			.retain(|id, _| !(id.chunk() == chunk && id.layer() == layer));
	}
	/// Drop every entry of the layer, used after a global island relabel
	/// renders the island ids baked into portal field ids meaningless
	pub fn flush_layer(&mut self, layer: NavLayer) {
		self.entries.retain(|id, _| id.layer() != layer);
	}
	/// Drop every entity-seek entry targetting the uid, used when the
	/// tracked entity moved and its pull fields went stale
	pub fn invalidate_entity(&mut self, uid: u32) {
		let entity_type = FieldTarget::Entity { uid }.type_bits();
		self.entries
			.retain(|id, _| !(id.target_type() == entity_type && id.target_specific() == uid as u64));
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn id(column: u32, row: u32, layer: NavLayer) -> FieldId {
		let chunk = ChunkID::new(column, row);
		FieldId::new(
			layer,
			&FieldTarget::Tile(TileDesc::new(chunk, FieldCell::new(0, 0))),
			chunk,
		)
	}
	#[test]
	fn put_get() {
		let mut cache = FieldCache::default();
		let id = id(0, 0, NavLayer::Ground1x1);
		cache.put(id, FlowField::default(), None);
		assert!(cache.get(id).is_some());
		assert!(cache.get(self::id(1, 0, NavLayer::Ground1x1)).is_none());
	}
	#[test]
	fn lru_eviction_prefers_stale() {
		let mut cache = FieldCache::with_capacity(2);
		let a = id(0, 0, NavLayer::Ground1x1);
		let b = id(1, 0, NavLayer::Ground1x1);
		let c = id(2, 0, NavLayer::Ground1x1);
		cache.put(a, FlowField::default(), None);
		cache.put(b, FlowField::default(), None);
		// touch `a` so `b` is the stale one
		assert!(cache.get(a).is_some());
		cache.put(c, FlowField::default(), None);
		assert!(cache.peek(a).is_some());
		assert!(cache.peek(b).is_none());
		assert!(cache.peek(c).is_some());
	}
	#[test]
	fn at_most_one_build_per_id() {
		let mut cache = FieldCache::default();
		let id = id(0, 0, NavLayer::Ground1x1);
		assert!(cache.try_begin_build(id));
		assert!(!cache.try_begin_build(id));
		cache.finish_build(id, FlowField::default(), None);
		// cached now, still no rebuild
		assert!(!cache.try_begin_build(id));
	}
	#[test]
	fn invalidate_by_chunk_and_layer() {
		let mut cache = FieldCache::default();
		let a = id(0, 0, NavLayer::Ground1x1);
		let b = id(0, 0, NavLayer::Ground3x3);
		let c = id(1, 1, NavLayer::Ground1x1);
		cache.put(a, FlowField::default(), None);
		cache.put(b, FlowField::default(), None);
		cache.put(c, FlowField::default(), None);
		cache.invalidate(ChunkID::new(0, 0), NavLayer::Ground1x1);
		assert!(cache.peek(a).is_none());
		assert!(cache.peek(b).is_some());
		assert!(cache.peek(c).is_some());
	}
	#[test]
	fn flush_layer_clears_everything_on_it() {
		let mut cache = FieldCache::default();
		let a = id(0, 0, NavLayer::Ground1x1);
		let b = id(3, 2, NavLayer::Ground1x1);
		let c = id(0, 0, NavLayer::Air);
		cache.put(a, FlowField::default(), None);
		cache.put(b, FlowField::default(), None);
		cache.put(c, FlowField::default(), None);
		cache.flush_layer(NavLayer::Ground1x1);
		assert!(cache.peek(a).is_none());
		assert!(cache.peek(b).is_none());
		assert!(cache.peek(c).is_some());
	}
}
