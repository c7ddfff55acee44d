//! Binding state for the single preview stream and the lifecycle around it.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::PreviewError;
use super::node::NodeHandle;
use super::output::{PREVIEW_OUTPUT_NAME, Provisioned, VirtualOutputManager};
use super::scale;
use super::scheduler::{InstalledHooks, Throttle};
use crate::common::config::PreviewSettings;
use crate::sys::geometry::Size;
use crate::sys::host::{
    Host, OutputId, Signal, SignalHandler, SignalKind, SubscriptionId, ViewId, ViewKind,
};

/// What the session knows about the current preview output. Hooks and the
/// removal subscription belong to one output and go away with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Destination {
    output: OutputId,
    hooks: Option<InstalledHooks>,
    removed_sub: Option<SubscriptionId>,
}

pub(super) struct SessionInner {
    outputs: VirtualOutputManager,
    settings: Cell<PreviewSettings>,
    source: Cell<Option<ViewId>>,
    destination: Cell<Option<Destination>>,
    size: Cell<Size>,
    downscale: Cell<f32>,
    throttle: Cell<Throttle>,
    node: RefCell<Option<NodeHandle>>,
    unmapped_sub: Cell<Option<SubscriptionId>>,
    suspend_sub: Cell<Option<SubscriptionId>>,
    generation: Cell<u64>,
}

impl SessionInner {
    pub(super) fn source(&self) -> Option<ViewId> { self.source.get() }

    pub(super) fn destination_output(&self) -> Option<OutputId> {
        self.destination.get().map(|d| d.output)
    }

    pub(super) fn size(&self) -> Size { self.size.get() }

    pub(super) fn downscale(&self) -> f32 { self.downscale.get() }

    /// Runs the frame throttle for one post-render invocation, picking up the
    /// current `frame_skip` first.
    pub(super) fn tick_throttle(&self) -> bool {
        let mut throttle = self.throttle.get();
        throttle.set_threshold(self.settings.get().frame_skip);
        let capture = throttle.tick();
        self.throttle.set(throttle);
        capture
    }

    fn listener(self: &Rc<Self>) -> Rc<dyn SignalHandler> {
        Rc::new(LifecycleListener { session: Rc::downgrade(self) })
    }

    fn bind(self: &Rc<Self>, host: &mut dyn Host, view: ViewId) -> Result<(), PreviewError> {
        let geometry = match host.resolve_view(view) {
            None => return Err(PreviewError::NoSuchView),
            Some(ViewKind::Surface) => return Err(PreviewError::NotAToplevel),
            Some(ViewKind::Toplevel { geometry }) => geometry,
        };
        let settings = self.settings.get();
        let target = scale::fit(geometry.size(), settings.max_dimension);

        if self.source.get() == Some(view)
            && self.size.get() == target.size
            && self.downscale.get() == target.downscale
            && self.node.borrow().is_some()
        {
            debug!(view = %view, "already bound");
            return Ok(());
        }

        // Old wiring goes before anything new is installed.
        self.detach_source(host);
        // Provisioning may retire the current output itself, which is not a
        // removal to tear down for.
        if let Some(mut destination) = self.destination.get()
            && let Some(sub) = destination.removed_sub.take()
        {
            host.unsubscribe(sub);
            self.destination.set(Some(destination));
        }

        let provisioned = match self.outputs.create_or_resize(
            host,
            PREVIEW_OUTPUT_NAME,
            target.size,
            target.downscale,
        ) {
            Ok(provisioned) => provisioned,
            Err(err) => {
                warn!(view = %view, %err, "preview output unavailable");
                self.teardown(host, true);
                return Err(err.into());
            }
        };
        let output = provisioned.output();

        // Recreation may have retired the previous output already.
        let mut destination = match self.destination.take() {
            Some(dest) if dest.output == output => dest,
            stale => {
                if let Some(stale) = stale {
                    release_destination(host, stale);
                }
                Destination { output, hooks: None, removed_sub: None }
            }
        };
        if destination.hooks.is_none() {
            destination.hooks = InstalledHooks::install(host, output, Rc::downgrade(self));
        }
        if destination.removed_sub.is_none() {
            destination.removed_sub = Some(host.subscribe(SignalKind::OutputRemoved, self.listener()));
        }
        self.destination.set(Some(destination));

        self.source.set(Some(view));
        self.size.set(target.size);
        self.downscale.set(target.downscale);
        self.throttle.set(Throttle::new(settings.frame_skip));

        match NodeHandle::attach(host, Rc::downgrade(self), view, output) {
            Ok(node) => *self.node.borrow_mut() = Some(node),
            Err(err) => {
                warn!(view = %view, %err, "could not attach preview node");
                self.teardown(host, true);
                return Err(err.into());
            }
        }
        self.unmapped_sub.set(Some(host.subscribe(SignalKind::ViewUnmapped, self.listener())));
        host.damage_view(view);

        // The first frame can run before the hooks see the new binding; force
        // one more full redraw from the next idle turn.
        let generation = self.bump_generation();
        let weak = Rc::downgrade(self);
        host.defer_idle(Box::new(move |host| {
            if let Some(session) = weak.upgrade()
                && session.generation.get() == generation
            {
                session.kick(host);
            }
        }));

        info!(
            view = %view,
            size = %target.size,
            downscale = target.downscale,
            resized = matches!(provisioned, Provisioned::Resized(_)),
            "preview bound"
        );
        Ok(())
    }

    fn kick(&self, host: &mut dyn Host) {
        if let Some(view) = self.source.get() {
            host.damage_view(view);
        }
        if let Some(output) = self.destination_output() {
            host.damage_output_whole(output);
            host.schedule_redraw(output);
        }
    }

    fn detach_source(&self, host: &mut dyn Host) {
        let node = self.node.borrow_mut().take();
        if let Some(node) = node {
            node.detach(host);
        }
        if let Some(sub) = self.unmapped_sub.take() {
            host.unsubscribe(sub);
        }
        self.source.set(None);
    }

    /// Unwinds everything back to idle. Every step checks what still exists,
    /// so repeated and out-of-order calls are harmless.
    fn teardown(&self, host: &mut dyn Host, destroy_destination: bool) {
        let was_bound = self.source.get().is_some() || self.destination.get().is_some();
        self.detach_source(host);
        if let Some(destination) = self.destination.take() {
            release_destination(host, destination);
        }
        if destroy_destination {
            self.outputs.destroy(host, PREVIEW_OUTPUT_NAME);
        }
        self.size.set(Size::default());
        self.downscale.set(1.0);
        self.throttle.set(Throttle::default());
        self.bump_generation();
        if was_bound {
            info!(destroyed = destroy_destination, "preview released");
        }
    }

    fn bump_generation(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }

    fn on_view_unmapped(&self, host: &mut dyn Host, view: ViewId) {
        if self.source.get() == Some(view) {
            debug!(view = %view, "bound view unmapped");
            self.teardown(host, true);
        }
    }

    fn on_output_removed(&self, host: &mut dyn Host, output: OutputId) {
        if self.destination_output() == Some(output) {
            debug!(?output, "preview output removed");
            self.teardown(host, false);
        }
    }

    fn on_session_suspended(&self, host: &mut dyn Host) {
        debug!("session suspended");
        self.teardown(host, true);
    }
}

fn release_destination(host: &mut dyn Host, destination: Destination) {
    if let Some(sub) = destination.removed_sub {
        host.unsubscribe(sub);
    }
    if let Some(hooks) = destination.hooks {
        hooks.uninstall(host);
    }
}

struct LifecycleListener {
    session: Weak<SessionInner>,
}

impl SignalHandler for LifecycleListener {
    fn handle(&self, host: &mut dyn Host, signal: Signal) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match signal {
            Signal::ViewUnmapped(view) => session.on_view_unmapped(host, view),
            Signal::OutputRemoved(output) => session.on_output_removed(host, output),
            Signal::SessionSuspended => session.on_session_suspended(host),
        }
    }
}

fn checked(settings: PreviewSettings) -> PreviewSettings {
    let issues = settings.validate();
    if issues.is_empty() {
        return settings;
    }
    let sanitized = settings.sanitized();
    for issue in issues {
        warn!(%issue, "ignoring invalid preview setting");
    }
    debug!(?sanitized, "using sanitized preview settings");
    sanitized
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PreviewState {
    Idle,
    Bound {
        view: ViewId,
        output: String,
        size: Size,
        downscale: f32,
    },
}

/// The one preview stream a plugin instance owns.
///
/// Host callbacks only hold weak references, so dropping the session (after
/// [`PreviewSession::shutdown`]) leaves nothing reachable behind.
pub struct PreviewSession {
    inner: Rc<SessionInner>,
}

static_assertions::assert_not_impl_any!(PreviewSession: Send, Sync);

/// Non-owning reference handed to method handlers.
#[derive(Clone)]
pub struct WeakPreviewSession(Weak<SessionInner>);

impl WeakPreviewSession {
    pub fn upgrade(&self) -> Option<PreviewSession> {
        self.0.upgrade().map(|inner| PreviewSession { inner })
    }
}

impl PreviewSession {
    pub fn new(host: &mut dyn Host, settings: PreviewSettings) -> Self {
        let inner = Rc::new(SessionInner {
            outputs: VirtualOutputManager::new(),
            settings: Cell::new(checked(settings)),
            source: Cell::new(None),
            destination: Cell::new(None),
            size: Cell::new(Size::default()),
            downscale: Cell::new(1.0),
            throttle: Cell::new(Throttle::default()),
            node: RefCell::new(None),
            unmapped_sub: Cell::new(None),
            suspend_sub: Cell::new(None),
            generation: Cell::new(0),
        });
        let sub = host.subscribe(SignalKind::SessionSuspended, inner.listener());
        inner.suspend_sub.set(Some(sub));
        PreviewSession { inner }
    }

    pub fn downgrade(&self) -> WeakPreviewSession { WeakPreviewSession(Rc::downgrade(&self.inner)) }

    /// Starts (or retargets) the preview stream for `view`.
    pub fn bind(&self, host: &mut dyn Host, view: ViewId) -> Result<(), PreviewError> {
        self.inner.bind(host, view)
    }

    /// Stops the stream and destroys the preview output. Always succeeds.
    pub fn release(&self, host: &mut dyn Host) { self.inner.teardown(host, true); }

    /// Full teardown plus dropping the session-wide subscriptions.
    pub fn shutdown(&self, host: &mut dyn Host) {
        self.inner.teardown(host, true);
        if let Some(sub) = self.inner.suspend_sub.take() {
            host.unsubscribe(sub);
        }
    }

    pub fn source(&self) -> Option<ViewId> { self.inner.source() }

    pub fn destination(&self) -> Option<OutputId> { self.inner.destination_output() }

    pub fn settings(&self) -> PreviewSettings { self.inner.settings.get() }

    /// `frame_skip` applies from the next frame, `max_dimension` from the
    /// next bind. Out-of-range values fall back to their defaults.
    pub fn set_settings(&self, settings: PreviewSettings) { self.inner.settings.set(checked(settings)); }

    pub fn state(&self, host: &dyn Host) -> PreviewState {
        match (self.inner.source(), self.inner.destination_output()) {
            (Some(view), Some(output)) => PreviewState::Bound {
                view,
                output: host
                    .output_info(output)
                    .map_or_else(|| PREVIEW_OUTPUT_NAME.to_string(), |info| info.name),
                size: self.inner.size(),
                downscale: self.inner.downscale(),
            },
            _ => PreviewState::Idle,
        }
    }
}
