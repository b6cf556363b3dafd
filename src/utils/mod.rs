//! Various utilities functions and types

mod fd;
mod geometry;

pub use self::fd::{dup_fd, DevPath, DeviceFd};
pub use self::geometry::{
    Buffer, Coordinate, Physical, Point, Rectangle, Size, Transform, TRANSFORM_FLIP_H, TRANSFORM_FLIP_V,
    TRANSFORM_ROT_90,
};
