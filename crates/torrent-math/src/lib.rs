// SPDX-License-Identifier: CEPL-1.0
//! Small numeric helpers shared by mesh ingest and the cluster builder.

pub mod bounds;
pub mod quantize;

pub use bounds::{Cone, Sphere};
pub use glam;
pub use quantize::*;
