//! The compositor host as seen by the preview subsystem.
//!
//! Everything the previews need from the compositor (view lookup, headless
//! outputs, render hooks, the per-output scene graph, signals, the idle queue
//! and the graphics context) goes through the traits here. All handles are
//! slotmap keys owned by the host; removing through a stale handle is a no-op.

use std::rc::Rc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::geometry::{FRect, Rect, Region, Size};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ViewId(u64);

impl ViewId {
    pub fn new(id: u64) -> ViewId { ViewId(id) }

    pub fn get(&self) -> u64 { self.0 }
}

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

slotmap::new_key_type! {
    pub struct BackendId;
    pub struct OutputId;
    pub struct HookId;
    pub struct SceneNodeId;
    pub struct SubscriptionId;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("headless backend could not be created: {0}")]
    BackendUnavailable(String),
    #[error("backend is not usable")]
    NoSuchBackend,
    #[error("output not found")]
    NoSuchOutput,
    #[error("view {0} not found")]
    NoSuchView(ViewId),
    #[error("output state rejected: {0}")]
    CommitRejected(String),
    #[error("graphics context is already acquired")]
    ContextBusy,
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
}

/// Pixel layouts a render target can be configured with. Names follow DRM
/// fourcc conventions, so `Abgr8888` is R, G, B, A in memory order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum PixelFormat {
    #[default]
    Xrgb8888,
    Abgr8888,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OutputStateFields: u32 {
        const MODE = 1 << 0;
        const RENDER_FORMAT = 1 << 1;
        const SCALE = 1 << 2;
    }
}

/// A pending output configuration. Only the fields that were set are applied
/// on commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputState {
    committed: OutputStateFields,
    mode: Size,
    render_format: PixelFormat,
    scale: f32,
}

impl OutputState {
    pub fn new() -> Self { OutputState::default() }

    pub fn set_mode(&mut self, mode: Size) -> &mut Self {
        self.mode = mode;
        self.committed |= OutputStateFields::MODE;
        self
    }

    pub fn set_render_format(&mut self, format: PixelFormat) -> &mut Self {
        self.render_format = format;
        self.committed |= OutputStateFields::RENDER_FORMAT;
        self
    }

    pub fn set_scale(&mut self, scale: f32) -> &mut Self {
        self.scale = scale;
        self.committed |= OutputStateFields::SCALE;
        self
    }

    pub fn committed(&self) -> OutputStateFields { self.committed }

    pub fn mode(&self) -> Option<Size> {
        self.committed.contains(OutputStateFields::MODE).then_some(self.mode)
    }

    pub fn render_format(&self) -> Option<PixelFormat> {
        self.committed.contains(OutputStateFields::RENDER_FORMAT).then_some(self.render_format)
    }

    pub fn scale(&self) -> Option<f32> {
        self.committed.contains(OutputStateFields::SCALE).then_some(self.scale)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputInfo {
    pub name: String,
    pub mode: Size,
    pub format: PixelFormat,
    pub scale: f32,
    pub headless: bool,
    pub layout_geometry: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// A window with its own screen geometry.
    Toplevel { geometry: Rect },
    /// An embedded surface (popup, subsurface, layer child).
    Surface,
}

/// Draw-priority layers of an output's scene graph, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum SceneLayer {
    Background,
    Bottom,
    Workspace,
    Top,
    Overlay,
}

/// One node's contribution to a composited frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderInstruction {
    pub target: Rect,
    pub damage: Region,
}

/// CPU-visible RGBA render buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderBuffer {
    size: Size,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl RenderBuffer {
    pub fn new(size: Size, format: PixelFormat) -> Self {
        RenderBuffer { size, format, pixels: vec![0; size.area() * 4] }
    }

    pub fn size(&self) -> Size { self.size }

    pub fn format(&self) -> PixelFormat { self.format }

    pub fn pixels(&self) -> &[u8] { &self.pixels }

    pub fn pixel(&self, x: i32, y: i32) -> Option<[u8; 4]> {
        if x < 0 || y < 0 || x >= self.size.width || y >= self.size.height {
            return None;
        }
        let idx = (y as usize * self.size.width as usize + x as usize) * 4;
        let mut px = [0; 4];
        px.copy_from_slice(&self.pixels[idx..idx + 4]);
        Some(px)
    }

    pub fn put_pixel(&mut self, x: i32, y: i32, px: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.size.width || y >= self.size.height {
            return;
        }
        let idx = (y as usize * self.size.width as usize + x as usize) * 4;
        self.pixels[idx..idx + 4].copy_from_slice(&px);
    }
}

/// Transient off-screen buffer holding a snapshot. Only obtainable inside a
/// graphics context and handed back through [`RenderContext::release`].
#[derive(Debug)]
pub struct AuxBuffer {
    buffer: RenderBuffer,
}

impl AuxBuffer {
    pub fn new(buffer: RenderBuffer) -> Self { AuxBuffer { buffer } }

    pub fn size(&self) -> Size { self.buffer.size() }

    pub fn buffer(&self) -> &RenderBuffer { &self.buffer }
}

/// Operations that need the graphics context to be current.
pub trait RenderContext {
    fn capture_scale(&self, view: ViewId) -> Option<f32>;
    fn set_capture_scale(&mut self, view: ViewId, scale: f32);
    fn take_snapshot(&mut self, view: ViewId) -> Result<AuxBuffer, HostError>;
    fn blit(&mut self, src: &AuxBuffer, src_box: FRect, dst: &mut RenderBuffer, dst_rect: Rect);
    fn release(&mut self, buffer: AuxBuffer);
}

pub trait PreRenderHook {
    fn pre_render(&self, host: &mut dyn Host, output: OutputId);
}

pub trait PostRenderHook {
    fn post_render(&self, host: &mut dyn Host, output: OutputId, target: &mut RenderBuffer);
}

pub trait SceneNode {
    fn render_instructions(
        &self,
        host: &dyn Host,
        target: Rect,
        damage: &Region,
        instructions: &mut Vec<RenderInstruction>,
    );

    fn describe(&self) -> String;
}

/// Receives damage raised in a watched view subtree, in root coordinates.
pub trait DamageSink {
    fn damaged(&self, host: &mut dyn Host, region: &Region);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    ViewUnmapped(ViewId),
    OutputRemoved(OutputId),
    SessionSuspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SignalKind {
    ViewUnmapped,
    OutputRemoved,
    SessionSuspended,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::ViewUnmapped(_) => SignalKind::ViewUnmapped,
            Signal::OutputRemoved(_) => SignalKind::OutputRemoved,
            Signal::SessionSuspended => SignalKind::SessionSuspended,
        }
    }
}

pub trait SignalHandler {
    fn handle(&self, host: &mut dyn Host, signal: Signal);
}

pub type IdleCallback = Box<dyn FnOnce(&mut dyn Host)>;

pub trait Views {
    fn resolve_view(&self, id: ViewId) -> Option<ViewKind>;
    fn bounding_box(&self, view: ViewId) -> Option<Rect>;
    fn damage_view(&mut self, view: ViewId);
    /// Mirrors the view's render subtree so damage raised anywhere in it is
    /// reported to `sink`. Released with [`Signals::unsubscribe`].
    fn watch_damage(&mut self, view: ViewId, sink: Rc<dyn DamageSink>) -> Option<SubscriptionId>;
}

pub trait Outputs {
    fn create_headless_backend(&mut self) -> Result<BackendId, HostError>;
    fn attach_backend(&mut self, backend: BackendId) -> Result<(), HostError>;
    fn start_backend(&mut self, backend: BackendId) -> Result<(), HostError>;
    fn add_headless_output(&mut self, backend: BackendId, mode: Size)
    -> Result<OutputId, HostError>;
    fn test_state(&self, output: OutputId, state: &OutputState) -> bool;
    fn commit_state(&mut self, output: OutputId, state: &OutputState) -> Result<(), HostError>;
    fn output_by_name(&self, name: &str) -> Option<OutputId>;
    fn output_info(&self, output: OutputId) -> Option<OutputInfo>;
    fn outputs(&self) -> Vec<OutputId>;
    fn set_output_name(&mut self, output: OutputId, name: &str);
    fn is_advertised(&self, output: OutputId) -> bool;
    fn set_advertised(&mut self, output: OutputId, advertised: bool);
    fn focused_output(&self) -> Option<OutputId>;
    fn focus_output(&mut self, output: OutputId);
    fn remove_from_layout(&mut self, output: OutputId);
    fn destroy_output(&mut self, output: OutputId) -> bool;
    fn damage_output(&mut self, output: OutputId, region: &Region);
    fn damage_output_whole(&mut self, output: OutputId);
    fn schedule_redraw(&mut self, output: OutputId);
}

pub trait RenderHooks {
    fn add_pre_render_hook(&mut self, output: OutputId, hook: Rc<dyn PreRenderHook>)
    -> Option<HookId>;
    fn add_post_render_hook(
        &mut self,
        output: OutputId,
        hook: Rc<dyn PostRenderHook>,
    ) -> Option<HookId>;
    fn remove_hook(&mut self, hook: HookId) -> bool;
}

pub trait Scene {
    fn add_scene_node(
        &mut self,
        output: OutputId,
        layer: SceneLayer,
        node: Rc<dyn SceneNode>,
    ) -> Option<SceneNodeId>;
    fn remove_scene_node(&mut self, node: SceneNodeId) -> bool;
}

pub trait Signals {
    fn subscribe(&mut self, kind: SignalKind, handler: Rc<dyn SignalHandler>) -> SubscriptionId;
    fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool;
}

pub trait EventLoop {
    /// Queues `callback` for the next idle turn of the loop. It never runs on
    /// the current call stack.
    fn defer_idle(&mut self, callback: IdleCallback);
}

pub trait Host: Views + Outputs + RenderHooks + Scene + Signals + EventLoop {
    /// Acquires the graphics context for the duration of `f`.
    fn run_in_context(&mut self, f: &mut dyn FnMut(&mut dyn RenderContext))
    -> Result<(), HostError>;
}
