//! This is a plugin for the Bevy game engine providing the unit navigation
//! and formation movement core of a real-time strategy game: hierarchical
//! flowfield pathfinding over a chunked map, formation planning with optimal
//! cell assignment and a fixed-rate movement simulation with steering and
//! collision avoidance.
//!

pub mod bundle;
pub mod formation;
pub mod movement;
pub mod nav;
pub mod plugin;

pub mod prelude;
