//! `use bevy_rts_nav_plugin::prelude::*;` to import common structures and
//! methods
//!

#[doc(hidden)]
pub use crate::nav::{
	chunk::*,
	fields::{builder::*, cache::*, flow_field::*, integration_field::*, los_field::*, *},
	grid::*,
	portal::*,
	portal_graph::*,
	*,
};

#[doc(hidden)]
pub use crate::{
	bundle::*,
	formation::{hungarian, *},
	movement::{clearpath, steering, *},
	plugin::{commands::*, savefile, snapshot::*, tick::*, *},
};
