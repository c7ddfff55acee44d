use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use test_log::test;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::Registry;

use super::*;
use crate::common::config::PreviewSettings;
use crate::sys::geometry::{Rect, Region, Size};
use crate::sys::host::{Outputs, OutputId, PixelFormat, SignalKind, ViewId};
use crate::sys::soft::{Paint, SoftHost};

const GREEN: [u8; 4] = [0, 200, 0, 255];

struct Fixture {
    host: SoftHost,
    session: PreviewSession,
}

impl Fixture {
    fn new() -> Self { Self::with_settings(PreviewSettings { max_dimension: 200, frame_skip: 0 }) }

    fn with_settings(settings: PreviewSettings) -> Self {
        let mut host = SoftHost::new();
        host.add_physical_output("DP-1", Size::new(1920, 1080));
        host.add_view(ViewId::new(1), Rect::new(100, 50, 400, 200), Paint::Solid(GREEN));
        host.add_view(ViewId::new(2), Rect::new(0, 0, 300, 600), Paint::Solid(GREEN));
        host.add_surface(ViewId::new(3), Rect::new(10, 10, 50, 50));
        let session = PreviewSession::new(&mut host, settings);
        Fixture { host, session }
    }

    fn bind(&mut self, view: u64) -> Result<(), PreviewError> {
        self.session.bind(&mut self.host, ViewId::new(view))
    }

    fn release(&mut self) { self.session.release(&mut self.host); }

    fn preview_output(&self) -> Option<OutputId> { self.host.output_by_name(PREVIEW_OUTPUT_NAME) }

    fn render(&mut self) {
        if let Some(output) = self.preview_output() {
            self.host.render_frame(output);
        }
    }

    fn assert_idle(&self) {
        assert_eq!(self.session.state(&self.host), PreviewState::Idle);
        assert_eq!(self.session.source(), None);
        assert_eq!(self.session.destination(), None);
        assert_eq!(self.host.signal_subscriptions(SignalKind::ViewUnmapped), 0);
        assert_eq!(self.host.signal_subscriptions(SignalKind::OutputRemoved), 0);
        assert_eq!(self.host.damage_watchers(ViewId::new(1)), 0);
        assert_eq!(self.host.damage_watchers(ViewId::new(2)), 0);
    }
}

#[test]
fn it_binds_a_toplevel_and_wires_the_destination() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();

    let output = fx.preview_output().expect("preview output exists");
    assert_eq!(fx.session.destination(), Some(output));
    assert_eq!(fx.session.state(&fx.host), PreviewState::Bound {
        view: ViewId::new(1),
        output: PREVIEW_OUTPUT_NAME.to_string(),
        size: Size::new(200, 100),
        downscale: 0.5,
    });

    let info = fx.host.output_info(output).unwrap();
    assert_eq!(info.mode, Size::new(200, 100));
    assert_eq!(info.format, PixelFormat::Abgr8888);
    // Logical size matches the source window.
    assert_eq!(info.layout_geometry.size(), Size::new(400, 200));
    assert_eq!(fx.host.hook_count(output), 2);
    assert_eq!(fx.host.scene_node_count(output), 1);
    assert_eq!(fx.host.damage_watchers(ViewId::new(1)), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::ViewUnmapped), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::OutputRemoved), 1);

    let tree = fx.host.scene_tree(output).unwrap();
    assert!(tree.contains("Overlay"), "{tree}");
    assert!(tree.contains("live-preview mirror of view 1"), "{tree}");
}

#[test]
fn it_rejects_unknown_views_without_touching_the_binding() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let before = fx.session.state(&fx.host);

    assert_eq!(fx.bind(99), Err(PreviewError::NoSuchView));
    assert_eq!(fx.bind(99).unwrap_err().to_string(), "no such view");
    assert_eq!(fx.session.state(&fx.host), before);
    assert_eq!(fx.host.damage_watchers(ViewId::new(1)), 1);
}

#[test]
fn it_rejects_surfaces_without_toplevel_geometry() {
    let mut fx = Fixture::new();
    let err = fx.bind(3).unwrap_err();
    assert_eq!(err, PreviewError::NotAToplevel);
    assert_eq!(err.to_string(), "view is not a toplevel");
    assert_eq!(fx.preview_output(), None);
    fx.assert_idle();
}

#[test]
fn it_releases_idempotently() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();

    fx.release();
    fx.assert_idle();
    assert_eq!(fx.preview_output(), None);
    assert_eq!(fx.host.hook_count(output), 0);
    assert_eq!(fx.host.outputs().len(), 1);

    fx.release();
    fx.assert_idle();
    assert_eq!(fx.host.outputs().len(), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::SessionSuspended), 1);
}

#[test]
fn it_rebinds_onto_the_same_destination() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let first = fx.preview_output().unwrap();

    fx.bind(2).unwrap();
    let second = fx.preview_output().unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.host.outputs().len(), 2);
    assert_eq!(fx.host.output_info(second).unwrap().mode, Size::new(100, 200));
    assert_eq!(fx.host.hook_count(second), 2);
    assert_eq!(fx.host.scene_node_count(second), 1);
    assert_eq!(fx.host.damage_watchers(ViewId::new(1)), 0);
    assert_eq!(fx.host.damage_watchers(ViewId::new(2)), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::ViewUnmapped), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::OutputRemoved), 1);

    // The old source going away no longer concerns the session.
    fx.host.unmap_view(ViewId::new(1));
    assert_eq!(fx.session.source(), Some(ViewId::new(2)));
    assert_eq!(fx.preview_output(), Some(second));
}

#[test]
fn it_short_circuits_a_repeated_bind() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();
    let pending = fx.host.pending_idle();

    fx.bind(1).unwrap();
    assert_eq!(fx.host.hook_count(output), 2);
    assert_eq!(fx.host.scene_node_count(output), 1);
    assert_eq!(fx.host.damage_watchers(ViewId::new(1)), 1);
    assert_eq!(fx.host.pending_idle(), pending);
}

#[test]
fn it_rebinds_the_same_view_after_it_resizes() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();

    fx.host.set_view_geometry(ViewId::new(1), Rect::new(100, 50, 300, 300));
    fx.bind(1).unwrap();
    assert_eq!(fx.preview_output(), Some(output));
    assert_eq!(fx.host.output_info(output).unwrap().mode, Size::new(200, 200));
    assert_eq!(fx.host.hook_count(output), 2);
    assert_eq!(fx.host.scene_node_count(output), 1);
    assert_eq!(fx.host.damage_watchers(ViewId::new(1)), 1);
}

#[test]
fn it_tears_down_when_the_source_unmaps() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();

    assert!(fx.host.unmap_view(ViewId::new(1)));
    fx.assert_idle();
    assert_eq!(fx.host.output_info(output), None);
    assert_eq!(fx.host.hook_count(output), 0);
}

#[test]
fn it_tears_down_when_the_destination_is_removed_elsewhere() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();

    assert!(fx.host.destroy_output(output));
    fx.assert_idle();
    assert_eq!(fx.host.hook_count(output), 0);

    // Nothing left to destroy, and binding again starts from scratch.
    fx.release();
    fx.bind(2).unwrap();
    assert_ne!(fx.preview_output(), Some(output));
    assert_eq!(fx.host.signal_subscriptions(SignalKind::OutputRemoved), 1);
}

#[test]
fn it_tears_down_on_session_suspend() {
    let mut fx = Fixture::new();
    fx.bind(2).unwrap();
    fx.host.suspend_session();
    fx.assert_idle();
    assert_eq!(fx.preview_output(), None);

    // Suspending while idle is harmless.
    fx.host.suspend_session();
    fx.assert_idle();
}

#[test]
fn it_recreates_the_destination_when_a_resize_is_rejected() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let first = fx.preview_output().unwrap();

    fx.host.set_reject_mode_changes(true);
    fx.bind(2).unwrap();
    let second = fx.preview_output().unwrap();
    assert_ne!(first, second);
    assert_eq!(fx.host.hook_count(first), 0);
    assert_eq!(fx.host.hook_count(second), 2);
    assert_eq!(fx.host.scene_node_count(second), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::OutputRemoved), 1);
    assert_eq!(fx.host.output_info(second).unwrap().format, PixelFormat::Abgr8888);
    assert_eq!(fx.session.destination(), Some(second));
    assert_eq!(fx.session.source(), Some(ViewId::new(2)));
}

#[test]
fn it_rebinds_a_resized_view_onto_a_recreated_destination() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let first = fx.preview_output().unwrap();

    fx.host.set_reject_mode_changes(true);
    fx.host.set_view_geometry(ViewId::new(1), Rect::new(100, 50, 300, 300));
    fx.bind(1).unwrap();
    let second = fx.preview_output().unwrap();
    assert_ne!(first, second);
    assert_eq!(fx.session.source(), Some(ViewId::new(1)));
    assert_eq!(fx.session.destination(), Some(second));
    assert_eq!(fx.host.output_info(second).unwrap().mode, Size::new(200, 200));
    assert_eq!(fx.host.hook_count(first), 0);
    assert_eq!(fx.host.hook_count(second), 2);
    assert_eq!(fx.host.scene_node_count(second), 1);
    assert_eq!(fx.host.damage_watchers(ViewId::new(1)), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::OutputRemoved), 1);
    assert_eq!(fx.host.signal_subscriptions(SignalKind::ViewUnmapped), 1);

    fx.host.dispatch_idle();
    assert!(fx.host.redraw_scheduled(second));
    let before = fx.host.snapshot_count();
    fx.host.render_scheduled();
    assert!(fx.host.snapshot_count() > before);
    let buffer = fx.host.output_buffer(second).unwrap();
    assert_eq!(buffer.size(), Size::new(200, 200));
    assert!(buffer.pixels().chunks_exact(4).all(|px| px == GREEN));
}

/// Collects the message of every event emitted while installed.
#[derive(Clone, Default)]
struct Messages(Arc<Mutex<Vec<String>>>);

impl<S: tracing::Subscriber> Layer<S> for Messages {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        struct Message(Option<String>);
        impl Visit for Message {
            fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = Some(format!("{value:?}"));
                }
            }
        }
        let mut message = Message(None);
        event.record(&mut message);
        if let Some(message) = message.0 {
            self.0.lock().unwrap().push(message);
        }
    }
}

#[test]
fn it_does_not_release_while_recreating_its_own_destination() {
    let messages = Messages::default();
    let subscriber = Registry::default().with(messages.clone());
    tracing::subscriber::with_default(subscriber, || {
        let mut fx = Fixture::new();
        fx.bind(1).unwrap();
        fx.host.set_reject_mode_changes(true);
        fx.bind(2).unwrap();
        assert_eq!(fx.session.source(), Some(ViewId::new(2)));
    });

    let messages = messages.0.lock().unwrap();
    assert!(messages.iter().any(|m| m == "mode change rejected, recreating preview output"));
    assert_eq!(messages.iter().filter(|m| *m == "preview bound").count(), 2, "{messages:?}");
    assert!(!messages.iter().any(|m| m == "preview released"), "{messages:?}");
}

#[test]
fn it_ignores_out_of_range_settings() {
    let mut fx = Fixture::with_settings(PreviewSettings { max_dimension: 3_000_000_000, frame_skip: 0 });
    assert_eq!(fx.session.settings().max_dimension, 256);
    fx.bind(1).unwrap();
    assert_eq!(fx.host.output_info(fx.preview_output().unwrap()).unwrap().mode, Size::new(256, 128));

    fx.session.set_settings(PreviewSettings { max_dimension: 40_000, frame_skip: 5000 });
    assert_eq!(fx.session.settings(), PreviewSettings::default());
    fx.session.set_settings(PreviewSettings { max_dimension: 100, frame_skip: 3 });
    assert_eq!(fx.session.settings(), PreviewSettings { max_dimension: 100, frame_skip: 3 });
}

#[test]
fn it_fails_gracefully_without_a_backend() {
    let mut fx = Fixture::new();
    fx.host.set_backend_failure(true);

    let err = fx.bind(1).unwrap_err();
    assert!(matches!(err, PreviewError::ResourceUnavailable(_)), "{err:?}");
    fx.assert_idle();
    assert!(fx.bind(1).is_err());

    fx.host.set_backend_failure(false);
    fx.bind(1).unwrap();
    assert!(fx.preview_output().is_some());
}

#[test]
fn it_renders_the_source_into_the_destination() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();

    fx.render();
    let buffer = fx.host.output_buffer(output).unwrap();
    assert_eq!(buffer.size(), Size::new(200, 100));
    assert!(buffer.pixels().chunks_exact(4).all(|px| px == GREEN));
    assert_eq!(fx.host.live_aux_buffers(), 0);
    assert_eq!(fx.host.view_capture_scale(ViewId::new(1)), Some(1.0));

    // The pre-render hook keeps the destination scheduled.
    assert!(fx.host.redraw_scheduled(output));
    let instructions = fx.host.last_instructions(output);
    assert_eq!(instructions.len(), 1);
    assert_eq!(instructions[0].target, Rect::new(0, 0, 200, 100));
}

#[test]
fn it_throttles_captures_by_frame_skip() {
    let mut fx = Fixture::with_settings(PreviewSettings { max_dimension: 64, frame_skip: 2 });
    fx.bind(1).unwrap();

    let mut captured = Vec::new();
    for frame in 0..9 {
        let before = fx.host.snapshot_count();
        fx.render();
        if fx.host.snapshot_count() > before {
            captured.push(frame);
        }
    }
    assert_eq!(captured, vec![0, 3, 6]);
}

#[test]
fn it_picks_up_frame_skip_changes_on_the_next_frame() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    fx.render();
    fx.render();
    assert_eq!(fx.host.snapshot_count(), 2);

    fx.session.set_settings(PreviewSettings { max_dimension: 200, frame_skip: 1 });
    fx.render();
    fx.render();
    fx.render();
    assert_eq!(fx.host.snapshot_count(), 3);
}

#[test]
fn it_applies_max_dimension_on_the_next_bind() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    fx.session.set_settings(PreviewSettings { max_dimension: 100, frame_skip: 0 });
    assert_eq!(fx.host.output_info(fx.preview_output().unwrap()).unwrap().mode, Size::new(200, 100));

    fx.bind(1).unwrap();
    assert_eq!(fx.host.output_info(fx.preview_output().unwrap()).unwrap().mode, Size::new(100, 50));
}

#[test]
fn it_forwards_source_damage_in_destination_coordinates() {
    let mut fx = Fixture::with_settings(PreviewSettings { max_dimension: 200, frame_skip: 5 });
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();
    // First frame captures (and re-damages the source), the second is quiet.
    fx.render();
    fx.render();
    assert!(fx.host.output_damage(output).unwrap().is_empty());

    fx.host.damage_region(ViewId::new(1), Region::from(Rect::new(120, 60, 40, 20)));
    assert_eq!(fx.host.output_damage(output).unwrap().rects(), &[Rect::new(10, 5, 20, 10)]);
}

#[test]
fn it_kicks_a_redraw_from_the_next_idle_turn() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();
    assert!(!fx.host.redraw_scheduled(output));
    assert_eq!(fx.host.pending_idle(), 1);

    fx.host.dispatch_idle();
    assert!(fx.host.redraw_scheduled(output));
    assert_eq!(fx.host.render_scheduled(), 1);
}

#[test]
fn it_drops_a_stale_idle_kick_after_release() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    fx.release();
    fx.bind(1).unwrap();
    let output = fx.preview_output().unwrap();
    fx.release();

    assert_eq!(fx.host.dispatch_idle(), 2);
    assert!(!fx.host.redraw_scheduled(output));
    fx.assert_idle();
}

#[test]
fn it_shuts_down_completely() {
    let mut fx = Fixture::new();
    fx.bind(1).unwrap();
    fx.session.shutdown(&mut fx.host);
    fx.assert_idle();
    assert_eq!(fx.host.signal_subscriptions(SignalKind::SessionSuspended), 0);
    assert_eq!(fx.preview_output(), None);
}
