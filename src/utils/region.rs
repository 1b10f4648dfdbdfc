use std::fmt;

use super::geometry::{Point, Rectangle};

/// An area made of integer rectangles
///
/// The rectangles stored are kept pairwise disjoint, so the area of a
/// region is the sum of the areas of its rectangles.
pub struct Region<Kind> {
    rects: Vec<Rectangle<i32, Kind>>,
}

impl<Kind> Clone for Region<Kind> {
    fn clone(&self) -> Self {
        Region {
            rects: self.rects.clone(),
        }
    }
}

impl<Kind> Default for Region<Kind> {
    fn default() -> Self {
        Region { rects: Vec::new() }
    }
}

impl<Kind> fmt::Debug for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rects.iter()).finish()
    }
}

impl<Kind> From<Rectangle<i32, Kind>> for Region<Kind> {
    fn from(rect: Rectangle<i32, Kind>) -> Self {
        let mut region = Region::new();
        region.union_rect(rect);
        region
    }
}

impl<Kind> FromIterator<Rectangle<i32, Kind>> for Region<Kind> {
    fn from_iter<T: IntoIterator<Item = Rectangle<i32, Kind>>>(iter: T) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.union_rect(rect);
        }
        region
    }
}

impl<Kind> Region<Kind> {
    /// An empty region
    pub fn new() -> Self {
        Region::default()
    }

    /// Whether the region covers no area at all
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The disjoint rectangles making up this region
    pub fn rects(&self) -> &[Rectangle<i32, Kind>] {
        &self.rects
    }

    /// Total area covered
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|rect| rect.size.w as i64 * rect.size.h as i64)
            .sum()
    }

    /// Smallest rectangle containing the whole region
    pub fn extents(&self) -> Rectangle<i32, Kind> {
        Rectangle::bounding_box(
            self.rects
                .iter()
                .flat_map(|rect| [rect.loc, rect.bottom_right()]),
        )
    }

    /// Add a rectangle to the region
    pub fn union_rect(&mut self, rect: Rectangle<i32, Kind>) {
        if rect.is_empty() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .into_iter()
                .flat_map(|piece| piece.subtract_rect(*existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    /// Add another region to this one
    pub fn union(&mut self, other: &Region<Kind>) {
        for rect in &other.rects {
            self.union_rect(*rect);
        }
    }

    /// Remove a rectangle from the region
    pub fn subtract_rect(&mut self, rect: Rectangle<i32, Kind>) {
        if rect.is_empty() {
            return;
        }
        self.rects = self
            .rects
            .drain(..)
            .flat_map(|existing| existing.subtract_rect(rect))
            .collect();
    }

    /// Remove another region from this one
    pub fn subtract(&mut self, other: &Region<Kind>) {
        for rect in &other.rects {
            self.subtract_rect(*rect);
        }
    }

    /// The part of this region inside `rect`
    pub fn intersect_rect(&self, rect: Rectangle<i32, Kind>) -> Region<Kind> {
        Region {
            rects: self
                .rects
                .iter()
                .filter_map(|existing| existing.intersection(rect))
                .collect(),
        }
    }

    /// Whether any part of `rect` is covered by this region
    pub fn intersects_rect(&self, rect: Rectangle<i32, Kind>) -> bool {
        self.rects.iter().any(|existing| existing.overlaps(rect))
    }

    /// Whether `rect` is covered by this region entirely
    pub fn contains_rect(&self, rect: Rectangle<i32, Kind>) -> bool {
        let mut rest = Region::from(rect);
        rest.subtract(self);
        rest.is_empty()
    }

    /// Move the whole region by `offset`
    pub fn translate(&mut self, offset: Point<i32, Kind>) {
        for rect in &mut self.rects {
            *rect = rect.translate(offset);
        }
    }
}
