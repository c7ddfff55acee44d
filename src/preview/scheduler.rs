//! Per-destination render hooks driving the capture loop.

use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use super::compositor;
use super::session::SessionInner;
use crate::sys::host::{Host, HookId, OutputId, PostRenderHook, PreRenderHook, RenderBuffer};

/// Frame throttle for captures.
///
/// Captures land on hook invocations 0, N+1, 2(N+1), ... for a threshold of
/// N. The counter starts primed so the first frame after a bind is captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throttle {
    threshold: u32,
    counter: u32,
}

impl Throttle {
    pub fn new(threshold: u32) -> Self { Throttle { threshold, counter: threshold } }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
        self.counter = self.counter.min(threshold);
    }

    /// Advances one frame and reports whether it should be captured.
    pub fn tick(&mut self) -> bool {
        if self.threshold > 0 && self.counter < self.threshold {
            self.counter += 1;
            false
        } else {
            self.counter = 0;
            true
        }
    }
}

/// Keeps the destination permanently dirty so it renders every frame.
struct DamageHook;

impl PreRenderHook for DamageHook {
    fn pre_render(&self, host: &mut dyn Host, output: OutputId) {
        host.damage_output_whole(output);
        host.schedule_redraw(output);
    }
}

struct CaptureHook {
    session: Weak<SessionInner>,
}

impl PostRenderHook for CaptureHook {
    fn post_render(&self, host: &mut dyn Host, output: OutputId, target: &mut RenderBuffer) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.destination_output() != Some(output) {
            return;
        }
        let Some(source) = session.source() else {
            return;
        };
        if !session.tick_throttle() {
            trace!(view = %source, "capture throttled");
            return;
        }
        if let Err(err) = compositor::capture_into(host, source, session.downscale(), target) {
            warn!(view = %source, %err, "preview capture failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledHooks {
    pre: HookId,
    post: HookId,
}

impl InstalledHooks {
    pub fn install(
        host: &mut dyn Host,
        output: OutputId,
        session: Weak<SessionInner>,
    ) -> Option<InstalledHooks> {
        let pre = host.add_pre_render_hook(output, Rc::new(DamageHook))?;
        let Some(post) = host.add_post_render_hook(output, Rc::new(CaptureHook { session })) else {
            host.remove_hook(pre);
            return None;
        };
        Some(InstalledHooks { pre, post })
    }

    pub fn uninstall(self, host: &mut dyn Host) {
        host.remove_hook(self.pre);
        host.remove_hook(self.post);
    }
}
