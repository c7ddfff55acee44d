//! Invisible scene node on the preview output that mirrors the source view's
//! damage.

use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use super::session::SessionInner;
use crate::sys::geometry::{Rect, Region};
use crate::sys::host::{
    DamageSink, Host, HostError, OutputId, RenderInstruction, SceneLayer, SceneNode,
    SceneNodeId, SubscriptionId, ViewId,
};

pub struct PreviewNode {
    session: Weak<SessionInner>,
}

impl SceneNode for PreviewNode {
    fn render_instructions(
        &self,
        _host: &dyn Host,
        target: Rect,
        damage: &Region,
        instructions: &mut Vec<RenderInstruction>,
    ) {
        let bound = self.session.upgrade().and_then(|s| s.source()).is_some();
        // Draws nothing itself; the capture hook fills the buffer.
        let damage = if bound { damage.clip(target) } else { Region::new() };
        instructions.push(RenderInstruction { target, damage });
    }

    fn describe(&self) -> String {
        match self.session.upgrade().and_then(|s| s.source()) {
            Some(view) => format!("live-preview mirror of view {view}"),
            None => "live-preview mirror (detached)".to_string(),
        }
    }
}

impl DamageSink for PreviewNode {
    fn damaged(&self, host: &mut dyn Host, region: &Region) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let (Some(view), Some(output)) = (session.source(), session.destination_output()) else {
            return;
        };
        let Some(bbox) = host.bounding_box(view) else {
            return;
        };
        let local = region
            .translate(-bbox.x, -bbox.y)
            .scale(session.downscale())
            .clip(Rect::from_size(session.size()));
        if local.is_empty() {
            return;
        }
        trace!(view = %view, extents = ?local.extents(), "forwarding damage");
        host.damage_output(output, &local);
    }
}

/// The node as inserted into a destination's scene graph, together with the
/// damage mirror of its source.
pub struct NodeHandle {
    node: Rc<PreviewNode>,
    scene: SceneNodeId,
    mirror: Option<SubscriptionId>,
}

impl NodeHandle {
    pub fn attach(
        host: &mut dyn Host,
        session: Weak<SessionInner>,
        view: ViewId,
        output: OutputId,
    ) -> Result<NodeHandle, HostError> {
        if host.resolve_view(view).is_none() {
            return Err(HostError::NoSuchView(view));
        }
        if host.output_info(output).is_none() {
            return Err(HostError::NoSuchOutput);
        }
        let node = Rc::new(PreviewNode { session });
        let mirror = host.watch_damage(view, node.clone());
        let Some(scene) = host.add_scene_node(output, SceneLayer::Overlay, node.clone()) else {
            if let Some(mirror) = mirror {
                host.unsubscribe(mirror);
            }
            return Err(HostError::NoSuchOutput);
        };
        Ok(NodeHandle { node, scene, mirror })
    }

    /// Drops the damage mirror first so no callback reaches a node that is
    /// halfway gone.
    pub fn detach(self, host: &mut dyn Host) {
        if let Some(mirror) = self.mirror {
            host.unsubscribe(mirror);
        }
        host.remove_scene_node(self.scene);
        debug!(node = %self.node.describe(), "preview node detached");
    }
}
