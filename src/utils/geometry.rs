use std::fmt;

/// A point in surface-local coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Point {
        Point { x, y }
    }
}

/// A two-dimensional extent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Size {
        Size { width, height }
    }

    /// True if both dimensions are strictly positive.
    pub fn is_valid(self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An axis-aligned rectangle in surface-local coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Rectangle {
        Rectangle {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(size: Size) -> Rectangle {
        Rectangle {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }

    pub const fn size(&self) -> Size {
        Size {
            width: self.width,
            height: self.height,
        }
    }

    pub const fn location(&self) -> Point {
        Point {
            x: self.x,
            y: self.y,
        }
    }

    /// Whether the rectangle contains the given point. The right and bottom
    /// edges are exclusive.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x as f64
            && y >= self.y as f64
            && x < (self.x + self.width) as f64
            && y < (self.y + self.height) as f64
    }
}

/// Output rotation/reflection applied between surface and buffer coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    #[default]
    Normal,
    Rotated90,
    Rotated180,
    Rotated270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    /// Whether the transform exchanges width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Transform::Rotated90 | Transform::Rotated270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    /// Map a logical surface size to the matching buffer size.
    pub fn surface_to_buffer(self, scale: i32, size: Size) -> Size {
        let size = if self.swaps_dimensions() {
            Size::new(size.height, size.width)
        } else {
            size
        };
        Size::new(size.width * scale, size.height * scale)
    }

    /// Map a buffer size back to the logical surface size the server will
    /// display it at.
    pub fn buffer_to_surface(self, scale: i32, size: Size) -> Size {
        let size = if self.swaps_dimensions() {
            Size::new(size.height, size.width)
        } else {
            size
        };
        Size::new(size.width / scale, size.height / scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_contains_excludes_far_edges() {
        let rect = Rectangle::new(10, 10, 20, 20);
        assert!(rect.contains(10.0, 10.0));
        assert!(rect.contains(29.9, 29.9));
        assert!(!rect.contains(30.0, 10.0));
        assert!(!rect.contains(9.9, 15.0));
    }

    #[test]
    fn transform_round_trips_size() {
        let size = Size::new(300, 200);
        for transform in [
            Transform::Normal,
            Transform::Rotated90,
            Transform::Rotated180,
            Transform::Flipped270,
        ] {
            for scale in [1, 2] {
                let buffer = transform.surface_to_buffer(scale, size);
                assert_eq!(transform.buffer_to_surface(scale, buffer), size);
            }
        }
    }

    #[test]
    fn rotated_transform_swaps_dimensions() {
        let buffer = Transform::Rotated90.surface_to_buffer(2, Size::new(300, 200));
        assert_eq!(buffer, Size::new(400, 600));
    }
}
