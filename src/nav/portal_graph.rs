//! Routing over the portal graph. When an agent needs to path to another
//! chunk it is first given a high-level route of portal hops produced by an
//! a-star walk over the portal windows. The field builder then consumes the
//! hops one chunk at a time, using the `(own island, neighbour island)` pair
//! of each hop to seed the integration frontier.
//!

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::prelude::*;
use bevy::prelude::*;

/// One element of a portal route: leave the chunk owning `portal` through its
/// window, standing on local island `port_iid`, arriving on local island
/// `next_iid` of the neighbouring chunk
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct PortalHop {
	/// Portal being exited, resolvable via [ChunkPortals]
	pub portal: PortalRef,
	/// Inclusive endpoint cells of the window in the chunk being exited,
	/// denormalised here so consumers need no portal table lookup
	pub endpoints: (FieldCell, FieldCell),
	/// Local island the agent stands on at the window
	pub port_iid: u16,
	/// Local island on the far side of the window
	pub next_iid: u16,
}

/// Search node: crossing `portal` and arriving on `to_iid` beyond it
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct NodeKey {
	portal: PortalRef,
	to_iid: u16,
}

/// Entry of the open set ordered by smallest f-score first
struct OpenEntry {
	f_score: f32,
	g_score: f32,
	key: NodeKey,
	hop: PortalHop,
	prev: Option<NodeKey>,
}

impl PartialEq for OpenEntry {
	fn eq(&self, other: &Self) -> bool {
		self.f_score == other.f_score
	}
}
impl Eq for OpenEntry {}
impl PartialOrd for OpenEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for OpenEntry {
	fn cmp(&self, other: &Self) -> Ordering {
		// reversed so the BinaryHeap pops the smallest f-score
		other.f_score.total_cmp(&self.f_score)
	}
}

/// A* over the portal graph of one layer
pub struct PortalRouter<'a> {
	pub map: &'a MapDimensions,
	pub chunks: &'a NavChunks,
	pub portals: &'a ChunkPortals,
	pub layer: NavLayer,
}

impl<'a> PortalRouter<'a> {
	/// Find the best sequence of portal hops from `source_pos` to
	/// `target_pos`.
	///
	/// Returns `Some(vec![])` when source and target share a chunk and local
	/// island so no portal needs crossing, [None] when no admissible route
	/// exists
	pub fn find_best_path(&self, source_pos: Vec2, target_pos: Vec2) -> Option<Vec<PortalHop>> {
		let source_td = self.map.get_tile_desc_from_xz(source_pos)?;
		let target_td = self.map.get_tile_desc_from_xz(target_pos)?;
		let src_iid = self
			.chunks
			.closest_pathable_local_island(self.map, self.layer, source_td);
		let dst_iid = self
			.chunks
			.closest_pathable_local_island(self.map, self.layer, target_td);
		if src_iid == ISLAND_NONE || dst_iid == ISLAND_NONE {
			return None;
		}
		if source_td.chunk == target_td.chunk && src_iid == dst_iid {
			return Some(Vec::new());
		}
		let mut open = BinaryHeap::new();
		let mut best: HashMap<NodeKey, f32> = HashMap::new();
		let mut came_from: HashMap<NodeKey, (PortalHop, Option<NodeKey>)> = HashMap::new();
		// seed the open set with every portal leaving the source chunk from
		// the island the agent stands on
		for (index, portal) in self
			.portals
			.get(self.layer, source_td.chunk)
			.iter()
			.enumerate()
		{
			let portal_ref = PortalRef {
				chunk: source_td.chunk,
				index,
			};
			let center = portal.center(self.map, source_td.chunk);
			for (from_iid, to_iid) in portal.get_transitions().iter().copied() {
				if from_iid != src_iid {
					continue;
				}
				let key = NodeKey {
					portal: portal_ref,
					to_iid,
				};
				let g_score = source_pos.distance(center);
				let f_score = g_score + center.distance(target_pos);
				open.push(OpenEntry {
					f_score,
					g_score,
					key,
					hop: PortalHop {
						portal: portal_ref,
						endpoints: portal.get_endpoints(),
						port_iid: from_iid,
						next_iid: to_iid,
					},
					prev: None,
				});
			}
		}
		while let Some(entry) = open.pop() {
			if let Some(best_g) = best.get(&entry.key) {
				if *best_g <= entry.g_score {
					continue;
				}
			}
			best.insert(entry.key, entry.g_score);
			came_from.insert(entry.key, (entry.hop, entry.prev));
			let crossed = self.portals.resolve(self.layer, entry.key.portal);
			let arrived_chunk = crossed.get_peer().chunk;
			if arrived_chunk == target_td.chunk && entry.key.to_iid == dst_iid {
				// unwind the hops
				let mut hops = Vec::new();
				let mut cursor = Some(entry.key);
				while let Some(key) = cursor {
					let (hop, prev) = came_from
						.get(&key)
						.expect("every expanded node records its hop");
					hops.push(*hop);
					cursor = *prev;
				}
				hops.reverse();
				return Some(hops);
			}
			let arrived_center = crossed.center(self.map, entry.key.portal.chunk);
			// expand every portal leaving the arrival chunk from the island
			// we stand on after crossing
			for (index, next_portal) in self
				.portals
				.get(self.layer, arrived_chunk)
				.iter()
				.enumerate()
			{
				let next_ref = PortalRef {
					chunk: arrived_chunk,
					index,
				};
				let next_center = next_portal.center(self.map, arrived_chunk);
				for (from_iid, to_iid) in next_portal.get_transitions().iter().copied() {
					if from_iid != entry.key.to_iid {
						continue;
					}
					let key = NodeKey {
						portal: next_ref,
						to_iid,
					};
					let g_score = entry.g_score + arrived_center.distance(next_center);
					if best.get(&key).map_or(false, |b| *b <= g_score) {
						continue;
					}
					let f_score = g_score + next_center.distance(target_pos);
					open.push(OpenEntry {
						f_score,
						g_score,
						key,
						hop: PortalHop {
							portal: next_ref,
							endpoints: next_portal.get_endpoints(),
							port_iid: from_iid,
							next_iid: to_iid,
						},
						prev: Some(entry.key),
					});
				}
			}
		}
		None
	}
	/// O(1) reachability: two positions connect when their tiles carry the
	/// same global island label
	pub fn reachable(&self, source_pos: Vec2, target_pos: Vec2) -> bool {
		let Some(source_td) = self.map.get_tile_desc_from_xz(source_pos) else {
			return false;
		};
		let Some(target_td) = self.map.get_tile_desc_from_xz(target_pos) else {
			return false;
		};
		let a = self
			.chunks
			.get_chunk(self.map, self.layer, source_td.chunk)
			.get_island(source_td.cell);
		let b = self
			.chunks
			.get_chunk(self.map, self.layer, target_td.chunk)
			.get_island(target_td.cell);
		a != ISLAND_NONE && a == b
	}
}

// #[rustfmt::skip]
#[cfg(test)]
mod tests {
	use super::*;
	fn build(map: &MapDimensions, chunks: &NavChunks) -> ChunkPortals {
		let mut portals = ChunkPortals::new(map);
		portals.rebuild_layer(map, chunks, NavLayer::Ground1x1);
		portals
	}
	#[test]
	fn same_chunk_direct() {
		let map = MapDimensions::new(128, 128);
		let chunks = NavChunks::new(&map);
		let portals = build(&map, &chunks);
		let router = PortalRouter {
			map: &map,
			chunks: &chunks,
			portals: &portals,
			layer: NavLayer::Ground1x1,
		};
		let path = router
			.find_best_path(Vec2::new(-60.0, -60.0), Vec2::new(-10.0, -10.0))
			.unwrap();
		assert!(path.is_empty());
	}
	#[test]
	fn neighbouring_chunk_single_hop() {
		let map = MapDimensions::new(128, 128);
		let chunks = NavChunks::new(&map);
		let portals = build(&map, &chunks);
		let router = PortalRouter {
			map: &map,
			chunks: &chunks,
			portals: &portals,
			layer: NavLayer::Ground1x1,
		};
		let path = router
			.find_best_path(Vec2::new(-60.0, -60.0), Vec2::new(60.0, -60.0))
			.unwrap();
		assert_eq!(1, path.len());
		assert_eq!(ChunkID::new(0, 0), path[0].portal.chunk);
	}
	#[test]
	fn diagonal_route_crosses_two_boundaries() {
		let map = MapDimensions::new(128, 128);
		let chunks = NavChunks::new(&map);
		let portals = build(&map, &chunks);
		let router = PortalRouter {
			map: &map,
			chunks: &chunks,
			portals: &portals,
			layer: NavLayer::Ground1x1,
		};
		let path = router
			.find_best_path(Vec2::new(-60.0, -60.0), Vec2::new(60.0, 60.0))
			.unwrap();
		assert_eq!(2, path.len());
	}
	#[test]
	fn no_route_through_sealed_wall() {
		let map = MapDimensions::new(128, 128);
		let mut chunks = NavChunks::new(&map);
		for gr in 0..map.get_depth() {
			let td = TileDesc::from_global(64, gr);
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, td.chunk)
				.set_cost(td.cell, COST_IMPASSABLE);
		}
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let portals = build(&map, &chunks);
		let router = PortalRouter {
			map: &map,
			chunks: &chunks,
			portals: &portals,
			layer: NavLayer::Ground1x1,
		};
		assert!(router
			.find_best_path(Vec2::new(-60.0, 0.0), Vec2::new(60.0, 0.0))
			.is_none());
	}
	#[test]
	fn reachability_is_island_equality() {
		let map = MapDimensions::new(128, 128);
		let mut chunks = NavChunks::new(&map);
		for gr in 0..map.get_depth() {
			let td = TileDesc::from_global(64, gr);
			chunks
				.get_chunk_mut(&map, NavLayer::Ground1x1, td.chunk)
				.set_cost(td.cell, COST_IMPASSABLE);
		}
		chunks.repaint_islands(&map, NavLayer::Ground1x1);
		let portals = build(&map, &chunks);
		let router = PortalRouter {
			map: &map,
			chunks: &chunks,
			portals: &portals,
			layer: NavLayer::Ground1x1,
		};
		assert!(router.reachable(Vec2::new(-60.0, 0.0), Vec2::new(-10.0, 40.0)));
		assert!(!router.reachable(Vec2::new(-60.0, 0.0), Vec2::new(60.0, 0.0)));
	}
}
