//! Integer pixel geometry shared by the host seam and the preview pipeline.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self { Point { x, y } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub fn new(width: i32, height: i32) -> Self { Size { width, height } }

    pub fn is_empty(&self) -> bool { self.width <= 0 || self.height <= 0 }

    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.width as usize * self.height as usize
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self { Rect { x, y, width, height } }

    pub fn from_size(size: Size) -> Self { Rect::new(0, 0, size.width, size.height) }

    pub fn size(&self) -> Size { Size::new(self.width, self.height) }

    pub fn is_empty(&self) -> bool { self.size().is_empty() }

    pub fn max_x(&self) -> i32 { self.x + self.width }

    pub fn max_y(&self) -> i32 { self.y + self.height }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Scales the rectangle, growing it outward so partially covered pixels
    /// stay inside the result.
    pub fn scale(&self, factor: f32) -> Rect {
        let x0 = (self.x as f32 * factor).floor() as i32;
        let y0 = (self.y as f32 * factor).floor() as i32;
        let x1 = (self.max_x() as f32 * factor).ceil() as i32;
        let y1 = (self.max_y() as f32 * factor).ceil() as i32;
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        Rect::new(x0, y0, (x1 - x0).max(0), (y1 - y0).max(0))
    }

    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.max_x().max(other.max_x());
        let y1 = self.max_y().max(other.max_y());
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.max_x() >= other.max_x()
            && self.max_y() >= other.max_y()
    }
}

/// Fractional source box, used when sampling from a captured buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self { FRect { x, y, width, height } }
}

impl From<Size> for FRect {
    fn from(size: Size) -> Self { FRect::new(0.0, 0.0, size.width as f32, size.height as f32) }
}

/// A set of damaged rectangles.
///
/// Rectangles are kept as given rather than merged; consumers only need
/// coverage queries and the extents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self { Region::default() }

    pub fn is_empty(&self) -> bool { self.rects.is_empty() }

    pub fn rects(&self) -> &[Rect] { &self.rects }

    pub fn clear(&mut self) { self.rects.clear(); }

    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() || self.rects.iter().any(|r| r.contains_rect(&rect)) {
            return;
        }
        self.rects.retain(|r| !rect.contains_rect(r));
        self.rects.push(rect);
    }

    pub fn add_region(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Region {
        self.rects.iter().map(|r| r.translate(dx, dy)).collect()
    }

    pub fn scale(&self, factor: f32) -> Region { self.rects.iter().map(|r| r.scale(factor)).collect() }

    pub fn clip(&self, bounds: Rect) -> Region {
        self.rects.iter().map(|r| r.intersection(&bounds)).collect()
    }

    pub fn extents(&self) -> Rect { self.rects.iter().fold(Rect::default(), |acc, r| acc.union(r)) }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        let mut region = Region::new();
        region.add_rect(rect);
        region
    }
}

impl FromIterator<Rect> for Region {
    fn from_iter<I: IntoIterator<Item = Rect>>(iter: I) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.add_rect(rect);
        }
        region
    }
}
