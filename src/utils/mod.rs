//! Small geometry and bookkeeping types used throughout the toolkit.

mod geometry;
mod serial;

pub use geometry::{Point, Rectangle, Size, Transform};
pub use serial::Serial;
