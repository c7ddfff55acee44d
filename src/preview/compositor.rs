//! Snapshot the source view and stretch it into the destination buffer.

use tracing::trace;

use crate::sys::geometry::{FRect, Rect};
use crate::sys::host::{Host, HostError, RenderBuffer, RenderContext, ViewId};

/// Captures `source` at `downscale` and blits it over the whole of `target`.
///
/// The view is captured at the reduced scale directly instead of being shrunk
/// afterwards. Its own capture scale is restored before the blit, and it is
/// damaged again once the graphics context is released.
pub fn capture_into(
    host: &mut dyn Host,
    source: ViewId,
    downscale: f32,
    target: &mut RenderBuffer,
) -> Result<(), HostError> {
    let dst_rect = Rect::from_size(target.size());
    let mut result = Ok(());
    host.run_in_context(&mut |ctx: &mut dyn RenderContext| {
        result = snapshot_and_blit(ctx, source, downscale, target, dst_rect);
    })?;
    result?;
    host.damage_view(source);
    Ok(())
}

fn snapshot_and_blit(
    ctx: &mut dyn RenderContext,
    source: ViewId,
    downscale: f32,
    target: &mut RenderBuffer,
    dst_rect: Rect,
) -> Result<(), HostError> {
    let saved = ctx.capture_scale(source).ok_or(HostError::NoSuchView(source))?;
    ctx.set_capture_scale(source, downscale);
    let snapshot = ctx.take_snapshot(source);
    ctx.set_capture_scale(source, saved);
    let snapshot = snapshot?;

    trace!(view = %source, snapshot = %snapshot.size(), target = %dst_rect.size(), "blitting preview");
    ctx.blit(&snapshot, FRect::from(snapshot.size()), target, dst_rect);
    ctx.release(snapshot);
    Ok(())
}
