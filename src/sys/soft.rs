//! In-process software compositor implementing [`Host`].
//!
//! Views are painted procedurally, outputs own CPU RGBA buffers, and frames are
//! driven explicitly with [`SoftHost::render_frame`]. The binary runs on this
//! host and the preview tests use it as their compositor.

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use slotmap::SlotMap;
use tracing::{debug, trace};

use super::geometry::{FRect, Point, Rect, Region, Size};
use super::host::{
    AuxBuffer, BackendId, DamageSink, EventLoop, HookId, Host, HostError, IdleCallback,
    OutputId, OutputInfo, OutputState, Outputs, PixelFormat, PostRenderHook, PreRenderHook,
    RenderBuffer, RenderContext, RenderHooks, RenderInstruction, Scene, SceneLayer, SceneNode,
    SceneNodeId, Signal, SignalHandler, SignalKind, Signals, SubscriptionId, ViewId, ViewKind,
    Views,
};
use crate::common::collections::HashMap;

/// How a view's content is generated when it is snapshotted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Paint {
    Solid([u8; 4]),
    /// Left-to-right blend across the view's width.
    HorizontalGradient { from: [u8; 4], to: [u8; 4] },
}

impl Paint {
    fn sample(&self, u: f32) -> [u8; 4] {
        match *self {
            Paint::Solid(px) => px,
            Paint::HorizontalGradient { from, to } => {
                let t = u.clamp(0.0, 1.0);
                let mut px = [0; 4];
                for i in 0..4 {
                    px[i] = (from[i] as f32 + (to[i] as f32 - from[i] as f32) * t).round() as u8;
                }
                px
            }
        }
    }
}

struct SoftView {
    toplevel: bool,
    geometry: Rect,
    paint: Paint,
    capture_scale: f32,
}

struct SoftBackend {
    attached: bool,
    started: bool,
}

struct SoftOutput {
    backend: Option<BackendId>,
    name: String,
    mode: Size,
    format: PixelFormat,
    scale: f32,
    advertised: bool,
    in_layout: bool,
    position: Point,
    buffer: RenderBuffer,
    damage: Region,
    redraw_scheduled: bool,
    frames: u64,
    instructions: Vec<RenderInstruction>,
}

impl SoftOutput {
    fn layout_geometry(&self) -> Rect {
        let width = (self.mode.width as f32 / self.scale).round() as i32;
        let height = (self.mode.height as f32 / self.scale).round() as i32;
        Rect::new(self.position.x, self.position.y, width, height)
    }
}

enum HookEntry {
    Pre { output: OutputId, hook: Rc<dyn PreRenderHook> },
    Post { output: OutputId, hook: Rc<dyn PostRenderHook> },
}

impl HookEntry {
    fn output(&self) -> OutputId {
        match self {
            HookEntry::Pre { output, .. } | HookEntry::Post { output, .. } => *output,
        }
    }
}

struct SceneEntry {
    output: OutputId,
    layer: SceneLayer,
    node: Rc<dyn SceneNode>,
}

enum SubscriptionEntry {
    Signal { kind: SignalKind, handler: Rc<dyn SignalHandler> },
    Damage { view: ViewId, sink: Rc<dyn DamageSink> },
}

#[derive(Default)]
pub struct SoftHost {
    views: HashMap<ViewId, SoftView>,
    backends: SlotMap<BackendId, SoftBackend>,
    outputs: SlotMap<OutputId, SoftOutput>,
    hooks: SlotMap<HookId, HookEntry>,
    scene: SlotMap<SceneNodeId, SceneEntry>,
    subscriptions: SlotMap<SubscriptionId, SubscriptionEntry>,
    idle: VecDeque<IdleCallback>,
    focused: Option<OutputId>,
    in_context: bool,
    live_aux_buffers: usize,
    snapshots: usize,
    backend_failure: bool,
    reject_mode_changes: bool,
    headless_counter: u32,
}

impl SoftHost {
    pub fn new() -> Self { SoftHost::default() }

    pub fn add_view(&mut self, id: ViewId, geometry: Rect, paint: Paint) {
        self.views.insert(id, SoftView {
            toplevel: true,
            geometry,
            paint,
            capture_scale: 1.0,
        });
    }

    /// Adds a surface without toplevel geometry, such as a popup.
    pub fn add_surface(&mut self, id: ViewId, geometry: Rect) {
        self.views.insert(id, SoftView {
            toplevel: false,
            geometry,
            paint: Paint::Solid([0, 0, 0, 0]),
            capture_scale: 1.0,
        });
    }

    pub fn set_view_geometry(&mut self, id: ViewId, geometry: Rect) {
        if let Some(view) = self.views.get_mut(&id) {
            view.geometry = geometry;
        }
    }

    /// Emits `ViewUnmapped` while the view is still valid, then drops it.
    pub fn unmap_view(&mut self, id: ViewId) -> bool {
        if !self.views.contains_key(&id) {
            return false;
        }
        debug!(view = %id, "unmapping view");
        self.emit(Signal::ViewUnmapped(id));
        self.subscriptions.retain(|_, sub| {
            !matches!(sub, SubscriptionEntry::Damage { view, .. } if *view == id)
        });
        self.views.remove(&id);
        true
    }

    /// Raises damage inside a view's subtree, in root coordinates.
    pub fn damage_region(&mut self, view: ViewId, region: Region) {
        let sinks: Vec<(SubscriptionId, Rc<dyn DamageSink>)> = self
            .subscriptions
            .iter()
            .filter_map(|(id, sub)| match sub {
                SubscriptionEntry::Damage { view: v, sink } if *v == view => {
                    Some((id, sink.clone()))
                }
                _ => None,
            })
            .collect();
        for (id, sink) in sinks {
            if self.subscriptions.contains_key(id) {
                sink.damaged(self, &region);
            }
        }
    }

    /// Adds a display backed by (pretend) hardware.
    pub fn add_physical_output(&mut self, name: &str, mode: Size) -> OutputId {
        self.insert_output(None, name.to_string(), mode)
    }

    pub fn suspend_session(&mut self) {
        debug!("session suspended");
        self.emit(Signal::SessionSuspended);
    }

    pub fn set_backend_failure(&mut self, fail: bool) { self.backend_failure = fail; }

    pub fn set_reject_mode_changes(&mut self, reject: bool) { self.reject_mode_changes = reject; }

    /// Composites one frame: pre-render hooks, scene traversal, post-render hooks.
    pub fn render_frame(&mut self, output: OutputId) -> bool {
        let Some(out) = self.outputs.get_mut(output) else {
            return false;
        };
        // Hooks may schedule the next frame from inside this one.
        out.redraw_scheduled = false;

        let pre: Vec<(HookId, Rc<dyn PreRenderHook>)> = self
            .hooks
            .iter()
            .filter_map(|(id, entry)| match entry {
                HookEntry::Pre { output: o, hook } if *o == output => Some((id, hook.clone())),
                _ => None,
            })
            .collect();
        for (id, hook) in pre {
            if self.hooks.contains_key(id) {
                hook.pre_render(self, output);
            }
        }

        let Some(out) = self.outputs.get(output) else {
            return true;
        };
        let target = Rect::from_size(out.mode);
        let damage = out.damage.clip(target);
        let mut nodes: Vec<(SceneLayer, SceneNodeId, Rc<dyn SceneNode>)> = self
            .scene
            .iter()
            .filter(|(_, entry)| entry.output == output)
            .map(|(id, entry)| (entry.layer, id, entry.node.clone()))
            .collect();
        nodes.sort_by_key(|(layer, id, _)| (*layer, *id));
        let mut instructions = Vec::new();
        for (_, _, node) in &nodes {
            node.render_instructions(&*self, target, &damage, &mut instructions);
        }
        trace!(nodes = nodes.len(), instructions = instructions.len(), "scene traversed");

        let Some(out) = self.outputs.get_mut(output) else {
            return true;
        };
        out.damage.clear();
        out.frames += 1;
        out.instructions = instructions;
        let mut buffer = std::mem::take(&mut out.buffer);

        let post: Vec<(HookId, Rc<dyn PostRenderHook>)> = self
            .hooks
            .iter()
            .filter_map(|(id, entry)| match entry {
                HookEntry::Post { output: o, hook } if *o == output => Some((id, hook.clone())),
                _ => None,
            })
            .collect();
        for (id, hook) in post {
            if self.hooks.contains_key(id) {
                hook.post_render(self, output, &mut buffer);
            }
        }

        if let Some(out) = self.outputs.get_mut(output) {
            out.buffer = buffer;
        }
        true
    }

    /// Renders every output that has a redraw scheduled. Returns the number of
    /// frames rendered.
    pub fn render_scheduled(&mut self) -> usize {
        let pending: Vec<OutputId> = self
            .outputs
            .iter()
            .filter(|(_, out)| out.redraw_scheduled)
            .map(|(id, _)| id)
            .collect();
        pending.into_iter().filter(|id| self.render_frame(*id)).count()
    }

    /// Runs the callbacks queued before this call. Callbacks they queue wait
    /// for the next turn.
    pub fn dispatch_idle(&mut self) -> usize {
        let batch: Vec<IdleCallback> = self.idle.drain(..).collect();
        let count = batch.len();
        for callback in batch {
            callback(self);
        }
        count
    }

    pub fn pending_idle(&self) -> usize { self.idle.len() }

    pub fn output_buffer(&self, output: OutputId) -> Option<&RenderBuffer> {
        self.outputs.get(output).map(|out| &out.buffer)
    }

    pub fn output_damage(&self, output: OutputId) -> Option<&Region> {
        self.outputs.get(output).map(|out| &out.damage)
    }

    pub fn redraw_scheduled(&self, output: OutputId) -> bool {
        self.outputs.get(output).is_some_and(|out| out.redraw_scheduled)
    }

    pub fn frame_count(&self, output: OutputId) -> u64 {
        self.outputs.get(output).map_or(0, |out| out.frames)
    }

    pub fn last_instructions(&self, output: OutputId) -> &[RenderInstruction] {
        self.outputs.get(output).map_or(&[], |out| &out.instructions)
    }

    pub fn hook_count(&self, output: OutputId) -> usize {
        self.hooks.values().filter(|entry| entry.output() == output).count()
    }

    pub fn scene_node_count(&self, output: OutputId) -> usize {
        self.scene.values().filter(|entry| entry.output == output).count()
    }

    pub fn signal_subscriptions(&self, kind: SignalKind) -> usize {
        self.subscriptions
            .values()
            .filter(|sub| matches!(sub, SubscriptionEntry::Signal { kind: k, .. } if *k == kind))
            .count()
    }

    pub fn damage_watchers(&self, view: ViewId) -> usize {
        self.subscriptions
            .values()
            .filter(|sub| matches!(sub, SubscriptionEntry::Damage { view: v, .. } if *v == view))
            .count()
    }

    pub fn backend_count(&self) -> usize { self.backends.len() }

    pub fn live_aux_buffers(&self) -> usize { self.live_aux_buffers }

    pub fn snapshot_count(&self) -> usize { self.snapshots }

    pub fn view_capture_scale(&self, view: ViewId) -> Option<f32> {
        self.views.get(&view).map(|v| v.capture_scale)
    }

    /// Renders an output's scene graph as a tree, grouped by layer.
    pub fn scene_tree(&self, output: OutputId) -> Option<String> {
        let out = self.outputs.get(output)?;
        let mut layers: BTreeMap<SceneLayer, Vec<String>> = BTreeMap::new();
        for entry in self.scene.values().filter(|entry| entry.output == output) {
            layers.entry(entry.layer).or_default().push(entry.node.describe());
        }
        let children = layers
            .into_iter()
            .map(|(layer, nodes)| {
                ascii_tree::Tree::Node(
                    layer.to_string(),
                    nodes.into_iter().map(|n| ascii_tree::Tree::Leaf(vec![n])).collect(),
                )
            })
            .collect();
        let tree = ascii_tree::Tree::Node(out.name.clone(), children);
        let mut rendered = String::new();
        ascii_tree::write_tree(&mut rendered, &tree).ok()?;
        Some(rendered)
    }

    fn insert_output(&mut self, backend: Option<BackendId>, name: String, mode: Size) -> OutputId {
        let x = self
            .outputs
            .values()
            .filter(|out| out.in_layout)
            .map(|out| out.layout_geometry().max_x())
            .max()
            .unwrap_or(0);
        let format = PixelFormat::default();
        let id = self.outputs.insert(SoftOutput {
            backend,
            name,
            mode,
            format,
            scale: 1.0,
            advertised: true,
            in_layout: true,
            position: Point::new(x, 0),
            buffer: RenderBuffer::new(mode, format),
            damage: Region::from(Rect::from_size(mode)),
            redraw_scheduled: false,
            frames: 0,
            instructions: Vec::new(),
        });
        if self.focused.is_none() {
            self.focused = Some(id);
        }
        id
    }

    fn emit(&mut self, signal: Signal) {
        let kind = signal.kind();
        let handlers: Vec<(SubscriptionId, Rc<dyn SignalHandler>)> = self
            .subscriptions
            .iter()
            .filter_map(|(id, sub)| match sub {
                SubscriptionEntry::Signal { kind: k, handler } if *k == kind => {
                    Some((id, handler.clone()))
                }
                _ => None,
            })
            .collect();
        for (id, handler) in handlers {
            if self.subscriptions.contains_key(id) {
                handler.handle(self, signal);
            }
        }
    }
}

impl Views for SoftHost {
    fn resolve_view(&self, id: ViewId) -> Option<ViewKind> {
        self.views.get(&id).map(|view| {
            if view.toplevel {
                ViewKind::Toplevel { geometry: view.geometry }
            } else {
                ViewKind::Surface
            }
        })
    }

    fn bounding_box(&self, view: ViewId) -> Option<Rect> { self.views.get(&view).map(|v| v.geometry) }

    fn damage_view(&mut self, view: ViewId) {
        if let Some(geometry) = self.bounding_box(view) {
            self.damage_region(view, Region::from(geometry));
        }
    }

    fn watch_damage(&mut self, view: ViewId, sink: Rc<dyn DamageSink>) -> Option<SubscriptionId> {
        if !self.views.contains_key(&view) {
            return None;
        }
        Some(self.subscriptions.insert(SubscriptionEntry::Damage { view, sink }))
    }
}

impl Outputs for SoftHost {
    fn create_headless_backend(&mut self) -> Result<BackendId, HostError> {
        if self.backend_failure {
            return Err(HostError::BackendUnavailable("no render node available".into()));
        }
        Ok(self.backends.insert(SoftBackend { attached: false, started: false }))
    }

    fn attach_backend(&mut self, backend: BackendId) -> Result<(), HostError> {
        let backend = self.backends.get_mut(backend).ok_or(HostError::NoSuchBackend)?;
        backend.attached = true;
        Ok(())
    }

    fn start_backend(&mut self, backend: BackendId) -> Result<(), HostError> {
        let backend = self.backends.get_mut(backend).ok_or(HostError::NoSuchBackend)?;
        if !backend.attached {
            return Err(HostError::NoSuchBackend);
        }
        backend.started = true;
        Ok(())
    }

    fn add_headless_output(
        &mut self,
        backend: BackendId,
        mode: Size,
    ) -> Result<OutputId, HostError> {
        if !self.backends.get(backend).is_some_and(|b| b.started) {
            return Err(HostError::NoSuchBackend);
        }
        if mode.is_empty() {
            return Err(HostError::CommitRejected(format!("invalid mode {mode}")));
        }
        self.headless_counter += 1;
        let name = format!("HEADLESS-{}", self.headless_counter);
        debug!(%name, %mode, "adding headless output");
        Ok(self.insert_output(Some(backend), name, mode))
    }

    fn test_state(&self, output: OutputId, state: &OutputState) -> bool {
        let Some(out) = self.outputs.get(output) else {
            return false;
        };
        if let Some(mode) = state.mode() {
            if mode.is_empty() || (self.reject_mode_changes && mode != out.mode) {
                return false;
            }
        }
        if let Some(scale) = state.scale() {
            if !scale.is_finite() || scale <= 0.0 {
                return false;
            }
        }
        true
    }

    fn commit_state(&mut self, output: OutputId, state: &OutputState) -> Result<(), HostError> {
        if !self.test_state(output, state) {
            return Err(HostError::CommitRejected(format!("{:?}", state.committed())));
        }
        let out = self.outputs.get_mut(output).ok_or(HostError::NoSuchOutput)?;
        if let Some(format) = state.render_format() {
            out.format = format;
        }
        if let Some(mode) = state.mode() {
            out.mode = mode;
        }
        if let Some(scale) = state.scale() {
            out.scale = scale;
        }
        if out.buffer.size() != out.mode || out.buffer.format() != out.format {
            out.buffer = RenderBuffer::new(out.mode, out.format);
            out.damage = Region::from(Rect::from_size(out.mode));
        }
        Ok(())
    }

    fn output_by_name(&self, name: &str) -> Option<OutputId> {
        self.outputs.iter().find(|(_, out)| out.name == name).map(|(id, _)| id)
    }

    fn output_info(&self, output: OutputId) -> Option<OutputInfo> {
        self.outputs.get(output).map(|out| OutputInfo {
            name: out.name.clone(),
            mode: out.mode,
            format: out.format,
            scale: out.scale,
            headless: out.backend.is_some(),
            layout_geometry: out.layout_geometry(),
        })
    }

    fn outputs(&self) -> Vec<OutputId> { self.outputs.keys().collect() }

    fn set_output_name(&mut self, output: OutputId, name: &str) {
        if let Some(out) = self.outputs.get_mut(output) {
            out.name = name.to_string();
        }
    }

    fn is_advertised(&self, output: OutputId) -> bool {
        self.outputs.get(output).is_some_and(|out| out.advertised)
    }

    fn set_advertised(&mut self, output: OutputId, advertised: bool) {
        if let Some(out) = self.outputs.get_mut(output) {
            out.advertised = advertised;
        }
    }

    fn focused_output(&self) -> Option<OutputId> { self.focused }

    fn focus_output(&mut self, output: OutputId) {
        if self.outputs.contains_key(output) {
            self.focused = Some(output);
        }
    }

    fn remove_from_layout(&mut self, output: OutputId) {
        if let Some(out) = self.outputs.get_mut(output) {
            out.in_layout = false;
        }
    }

    fn destroy_output(&mut self, output: OutputId) -> bool {
        if !self.outputs.contains_key(output) {
            return false;
        }
        self.emit(Signal::OutputRemoved(output));
        self.hooks.retain(|_, entry| entry.output() != output);
        self.scene.retain(|_, entry| entry.output != output);
        let Some(removed) = self.outputs.remove(output) else {
            return true;
        };
        if self.focused == Some(output) {
            self.focused = self.outputs.keys().next();
        }
        debug!(name = %removed.name, "output destroyed");
        true
    }

    fn damage_output(&mut self, output: OutputId, region: &Region) {
        if let Some(out) = self.outputs.get_mut(output) {
            let clipped = region.clip(Rect::from_size(out.mode));
            out.damage.add_region(&clipped);
        }
    }

    fn damage_output_whole(&mut self, output: OutputId) {
        if let Some(out) = self.outputs.get_mut(output) {
            out.damage = Region::from(Rect::from_size(out.mode));
        }
    }

    fn schedule_redraw(&mut self, output: OutputId) {
        if let Some(out) = self.outputs.get_mut(output) {
            out.redraw_scheduled = true;
        }
    }
}

impl RenderHooks for SoftHost {
    fn add_pre_render_hook(
        &mut self,
        output: OutputId,
        hook: Rc<dyn PreRenderHook>,
    ) -> Option<HookId> {
        self.outputs
            .contains_key(output)
            .then(|| self.hooks.insert(HookEntry::Pre { output, hook }))
    }

    fn add_post_render_hook(
        &mut self,
        output: OutputId,
        hook: Rc<dyn PostRenderHook>,
    ) -> Option<HookId> {
        self.outputs
            .contains_key(output)
            .then(|| self.hooks.insert(HookEntry::Post { output, hook }))
    }

    fn remove_hook(&mut self, hook: HookId) -> bool { self.hooks.remove(hook).is_some() }
}

impl Scene for SoftHost {
    fn add_scene_node(
        &mut self,
        output: OutputId,
        layer: SceneLayer,
        node: Rc<dyn SceneNode>,
    ) -> Option<SceneNodeId> {
        self.outputs
            .contains_key(output)
            .then(|| self.scene.insert(SceneEntry { output, layer, node }))
    }

    fn remove_scene_node(&mut self, node: SceneNodeId) -> bool { self.scene.remove(node).is_some() }
}

impl Signals for SoftHost {
    fn subscribe(&mut self, kind: SignalKind, handler: Rc<dyn SignalHandler>) -> SubscriptionId {
        self.subscriptions.insert(SubscriptionEntry::Signal { kind, handler })
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        self.subscriptions.remove(subscription).is_some()
    }
}

impl EventLoop for SoftHost {
    fn defer_idle(&mut self, callback: IdleCallback) { self.idle.push_back(callback); }
}

impl Host for SoftHost {
    fn run_in_context(
        &mut self,
        f: &mut dyn FnMut(&mut dyn RenderContext),
    ) -> Result<(), HostError> {
        if self.in_context {
            return Err(HostError::ContextBusy);
        }
        self.in_context = true;
        let mut ctx = SoftContext {
            views: &mut self.views,
            live_aux_buffers: &mut self.live_aux_buffers,
            snapshots: &mut self.snapshots,
        };
        f(&mut ctx);
        self.in_context = false;
        Ok(())
    }
}

struct SoftContext<'a> {
    views: &'a mut HashMap<ViewId, SoftView>,
    live_aux_buffers: &'a mut usize,
    snapshots: &'a mut usize,
}

impl RenderContext for SoftContext<'_> {
    fn capture_scale(&self, view: ViewId) -> Option<f32> {
        self.views.get(&view).map(|v| v.capture_scale)
    }

    fn set_capture_scale(&mut self, view: ViewId, scale: f32) {
        if let Some(v) = self.views.get_mut(&view) {
            v.capture_scale = scale;
        }
    }

    fn take_snapshot(&mut self, view: ViewId) -> Result<AuxBuffer, HostError> {
        let v = self.views.get(&view).ok_or(HostError::NoSuchView(view))?;
        let scale = v.capture_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(HostError::SnapshotFailed(format!("invalid capture scale {scale}")));
        }
        let size = Size::new(
            ((v.geometry.width as f32 * scale).round() as i32).max(1),
            ((v.geometry.height as f32 * scale).round() as i32).max(1),
        );
        let mut buffer = RenderBuffer::new(size, PixelFormat::Abgr8888);
        for x in 0..size.width {
            let px = v.paint.sample((x as f32 + 0.5) / size.width as f32);
            for y in 0..size.height {
                buffer.put_pixel(x, y, px);
            }
        }
        *self.live_aux_buffers += 1;
        *self.snapshots += 1;
        Ok(AuxBuffer::new(buffer))
    }

    fn blit(&mut self, src: &AuxBuffer, src_box: FRect, dst: &mut RenderBuffer, dst_rect: Rect) {
        let clip = dst_rect.intersection(&Rect::from_size(dst.size()));
        if clip.is_empty() || src_box.width <= 0.0 || src_box.height <= 0.0 {
            return;
        }
        let src_size = src.size();
        let step_x = src_box.width / dst_rect.width as f32;
        let step_y = src_box.height / dst_rect.height as f32;
        for dy in clip.y..clip.max_y() {
            let sy = (src_box.y + ((dy - dst_rect.y) as f32 + 0.5) * step_y).floor() as i32;
            let sy = sy.clamp(0, src_size.height - 1);
            for dx in clip.x..clip.max_x() {
                let sx = (src_box.x + ((dx - dst_rect.x) as f32 + 0.5) * step_x).floor() as i32;
                let sx = sx.clamp(0, src_size.width - 1);
                if let Some(px) = src.buffer().pixel(sx, sy) {
                    dst.put_pixel(dx, dy, px);
                }
            }
        }
    }

    fn release(&mut self, buffer: AuxBuffer) {
        drop(buffer);
        *self.live_aux_buffers = self.live_aux_buffers.saturating_sub(1);
    }
}
