//! Various utilities functions and types

mod fixed;
mod geometry;
mod region;

pub use self::fixed::Fixed;
pub use self::geometry::{
    Buffer, Coordinate, Logical, Physical, Point, Rectangle, Size, Transform, UnknownTransform,
};
pub use self::region::Region;
