use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// Type-level marker for the global compositor coordinate space
#[derive(Debug)]
pub struct Logical;

/// Type-level marker for the coordinate space of a single output (CRTC-local)
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// Trait for types serving as a coordinate for other geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Convert to this coordinate from a f64
    fn from_f64(v: f64) -> Self;
    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
    /// Saturating addition
    fn saturating_add(self, other: Self) -> Self;
    /// Saturating subtraction
    fn saturating_sub(self, other: Self) -> Self;
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        i32::saturating_add(self, other)
    }
    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        i32::saturating_sub(self, other)
    }
}

// The marker types carry no data, so the usual derives would put needless bounds on `Kind`.
macro_rules! marker_generic_impls {
    ($ty:ident { $($field:ident),* }) => {
        impl<N: Clone, Kind> Clone for $ty<N, Kind> {
            #[inline]
            fn clone(&self) -> Self {
                $ty {
                    $($field: self.$field.clone(),)*
                    _kind: PhantomData,
                }
            }
        }

        impl<N: Copy, Kind> Copy for $ty<N, Kind> {}

        impl<N: PartialEq, Kind> PartialEq for $ty<N, Kind> {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                true $(&& self.$field == other.$field)*
            }
        }

        impl<N: Eq, Kind> Eq for $ty<N, Kind> {}

        impl<N: Default, Kind> Default for $ty<N, Kind> {
            #[inline]
            fn default() -> Self {
                $ty {
                    $($field: N::default(),)*
                    _kind: PhantomData,
                }
            }
        }

        impl<N: fmt::Debug, Kind> fmt::Debug for $ty<N, Kind> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))*
                    .finish()
            }
        }

        impl<N, Kind> From<(N, N)> for $ty<N, Kind> {
            #[inline]
            fn from(($($field),*): (N, N)) -> Self {
                $ty {
                    $($field,)*
                    _kind: PhantomData,
                }
            }
        }

        impl<N, Kind> From<$ty<N, Kind>> for (N, N) {
            #[inline]
            fn from(value: $ty<N, Kind>) -> (N, N) {
                ($(value.$field),*)
            }
        }
    };
}

/// A point as defined by its x and y coordinates
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

marker_generic_impls!(Point { x, y });

impl<N: Coordinate> Point<N, Logical> {
    /// Reinterpret a global point relative to the origin of an output.
    #[inline]
    pub fn to_output_local(self, output_origin: Point<N, Logical>) -> Point<N, Physical> {
        let local = self - output_origin;
        Point::from((local.x, local.y))
    }
}

impl<N: Coordinate, Kind> Add for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Point<N, Kind>) -> Point<N, Kind> {
        Point::from((self.x + other.x, self.y + other.y))
    }
}

impl<N: Coordinate, Kind> AddAssign for Point<N, Kind> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<N: Coordinate, Kind> Sub for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn sub(self, other: Point<N, Kind>) -> Point<N, Kind> {
        Point::from((self.x - other.x, self.y - other.y))
    }
}

impl<N: Coordinate, Kind> SubAssign for Point<N, Kind> {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<N: Coordinate, Kind> Add<Size<N, Kind>> for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Size<N, Kind>) -> Point<N, Kind> {
        Point::from((self.x + other.w, self.y + other.h))
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive via
/// `debug_assert!()`, however manually changing the values of the fields
/// can break this invariant.
pub struct Size<N, Kind> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
    _kind: PhantomData<Kind>,
}

marker_generic_impls!(Size { w, h });

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Check if this [`Size`] is empty
    ///
    /// Returns true if either the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= N::ZERO || self.h <= N::ZERO
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N: Clone, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Rectangle {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    #[inline]
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    #[inline]
    pub fn from_extremities(
        topleft: impl Into<Point<N, Kind>>,
        bottomright: impl Into<Point<N, Kind>>,
    ) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        let extent = bottomright - topleft;
        Rectangle {
            loc: topleft,
            size: (extent.x, extent.y).into(),
        }
    }

    /// Coordinates of the bottom-right corner (exclusive)
    #[inline]
    pub fn bottom_right(&self) -> Point<N, Kind> {
        self.loc + self.size
    }

    /// Checks whether the rectangle covers no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Checks whether given [`Point`] is inside the rectangle
    #[inline]
    pub fn contains<P: Into<Point<N, Kind>>>(self, point: P) -> bool {
        let p: Point<N, Kind> = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x.saturating_add(self.size.w))
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y.saturating_add(self.size.h))
    }

    /// Checks whether given [`Rectangle`] is fully inside this one, edges included
    #[inline]
    pub fn contains_rect<R: Into<Rectangle<N, Kind>>>(self, rect: R) -> bool {
        let r: Rectangle<N, Kind> = rect.into();
        r.loc.x >= self.loc.x
            && r.loc.y >= self.loc.y
            && r.loc.x.saturating_add(r.size.w) <= self.loc.x.saturating_add(self.size.w)
            && r.loc.y.saturating_add(r.size.h) <= self.loc.y.saturating_add(self.size.h)
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    ///
    /// Touching edges do not count as an overlap.
    #[inline]
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();

        self.loc.x < other.loc.x.saturating_add(other.size.w)
            && other.loc.x < self.loc.x.saturating_add(self.size.w)
            && self.loc.y < other.loc.y.saturating_add(other.size.h)
            && other.loc.y < self.loc.y.saturating_add(self.size.h)
    }

    /// The overlapping area of two rectangles, `None` if they don't overlap
    #[inline]
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (
                (self.loc.x.saturating_add(self.size.w)).min(other.loc.x.saturating_add(other.size.w)),
                (self.loc.y.saturating_add(self.size.h)).min(other.loc.y.saturating_add(other.size.h)),
            ),
        ))
    }

    /// Compute the bounding box of a given set of points
    pub fn bounding_box(points: impl IntoIterator<Item = Point<N, Kind>>) -> Self {
        let ret = points.into_iter().fold(None, |acc, point| match acc {
            None => Some((point, point)),
            Some((min_point, max_point)) => Some((
                Point::from((point.x.min(min_point.x), point.y.min(min_point.y))),
                Point::from((point.x.max(max_point.x), point.y.max(max_point.y))),
            )),
        });

        match ret {
            None => Rectangle::default(),
            Some((min_point, max_point)) => Rectangle::from_extremities(min_point, max_point),
        }
    }

    /// Subtract another [`Rectangle`] from this one
    ///
    /// Returns up to four non-overlapping pieces. An empty list means `other`
    /// covered `self` completely.
    pub fn subtract_rect(self, other: Self) -> Vec<Self> {
        let Some(hole) = self.intersection(other) else {
            return vec![self];
        };
        if other.contains_rect(self) {
            return Vec::new();
        }

        let hole_end = hole.bottom_right();
        let self_end = self.bottom_right();
        let top = Rectangle::new(self.loc, (self.size.w, hole.loc.y - self.loc.y).into());
        let left = Rectangle::new(
            (self.loc.x, hole.loc.y).into(),
            (hole.loc.x - self.loc.x, hole.size.h).into(),
        );
        let right = Rectangle::new(
            (hole_end.x, hole.loc.y).into(),
            (self_end.x - hole_end.x, hole.size.h).into(),
        );
        let bottom = Rectangle::new(
            (self.loc.x, hole_end.y).into(),
            (self.size.w, self_end.y - hole_end.y).into(),
        );

        [top, left, right, bottom]
            .into_iter()
            .filter(|rect| !rect.is_empty())
            .collect()
    }

    /// Move the rectangle by the given offset
    #[inline]
    pub fn translate(self, offset: Point<N, Kind>) -> Self {
        Rectangle::new(self.loc + offset, self.size)
    }
}

impl<N: Coordinate> Rectangle<N, Logical> {
    /// Reinterpret a global rectangle relative to the origin of an output.
    #[inline]
    pub fn to_output_local(self, output_origin: Point<N, Logical>) -> Rectangle<N, Physical> {
        Rectangle::new(self.loc.to_output_local(output_origin), (self.size.w, self.size.h).into())
    }
}

/// Possible transformations to two-dimensional planes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Hash)]
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

impl Transform {
    /// Transformed size after applying this transformation.
    pub fn transform_size<N: Coordinate, Kind>(&self, size: Size<N, Kind>) -> Size<N, Kind> {
        if matches!(
            self,
            Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270
        ) {
            (size.h, size.w).into()
        } else {
            size
        }
    }

    /// Transforms a rectangle inside an area of a given size by applying this transformation.
    pub fn transform_rect_in<N: Coordinate, Kind>(
        &self,
        rect: Rectangle<N, Kind>,
        area: &Size<N, Kind>,
    ) -> Rectangle<N, Kind> {
        let size = self.transform_size(rect.size);
        let right = area.w - rect.loc.x - rect.size.w;
        let bottom = area.h - rect.loc.y - rect.size.h;

        let loc = match *self {
            Transform::Normal => rect.loc,
            Transform::_90 => (bottom, rect.loc.x).into(),
            Transform::_180 => (right, bottom).into(),
            Transform::_270 => (rect.loc.y, right).into(),
            Transform::Flipped => (right, rect.loc.y).into(),
            Transform::Flipped90 => (bottom, right).into(),
            Transform::Flipped180 => (rect.loc.x, bottom).into(),
            Transform::Flipped270 => (rect.loc.y, rect.loc.x).into(),
        };

        Rectangle::new(loc, size)
    }

    /// Returns true if the transformation would flip contents
    pub fn flipped(&self) -> bool {
        !matches!(
            self,
            Transform::Normal | Transform::_90 | Transform::_180 | Transform::_270
        )
    }

    /// Name used for this transform in the output configuration
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Normal => "normal",
            Transform::_90 => "90",
            Transform::_180 => "180",
            Transform::_270 => "270",
            Transform::Flipped => "flipped",
            Transform::Flipped90 => "flipped-90",
            Transform::Flipped180 => "flipped-180",
            Transform::Flipped270 => "flipped-270",
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The given string does not name a transform
#[derive(Debug, thiserror::Error)]
#[error("Unknown transform `{0}`")]
pub struct UnknownTransform(pub String);

impl FromStr for Transform {
    type Err = UnknownTransform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "normal" => Transform::Normal,
            "90" => Transform::_90,
            "180" => Transform::_180,
            "270" => Transform::_270,
            "flipped" => Transform::Flipped,
            "flipped-90" => Transform::Flipped90,
            "flipped-180" => Transform::Flipped180,
            "flipped-270" => Transform::Flipped270,
            other => return Err(UnknownTransform(other.to_string())),
        })
    }
}
