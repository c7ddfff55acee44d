use crate::common::config::MAX_DIMENSION_LIMIT;
use crate::sys::geometry::Size;

/// Target geometry for a preview: the destination mode and the capture scale
/// that produces it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewGeometry {
    pub size: Size,
    pub downscale: f32,
}

/// Fits `content` into a box whose longest edge is `max_dimension`, keeping
/// the aspect ratio.
///
/// The derived edge is rounded to the nearest pixel and never drops below 1.
/// Degenerate content edges are treated as 1 pixel. `max_dimension` is
/// clamped to `1..=MAX_DIMENSION_LIMIT`.
pub fn fit(content: Size, max_dimension: u32) -> PreviewGeometry {
    let m = i64::from(max_dimension.clamp(1, MAX_DIMENSION_LIMIT));
    let cw = i64::from(content.width.max(1));
    let ch = i64::from(content.height.max(1));
    let (tw, th) = if cw >= ch {
        (m, round_div(ch * m, cw).max(1))
    } else {
        (round_div(cw * m, ch).max(1), m)
    };
    PreviewGeometry {
        size: Size::new(edge(tw), edge(th)),
        downscale: m as f32 / cw.max(ch) as f32,
    }
}

fn round_div(num: i64, den: i64) -> i64 { (2 * num + den) / (2 * den) }

fn edge(value: i64) -> i32 { i32::try_from(value).unwrap_or(MAX_DIMENSION_LIMIT as i32) }
