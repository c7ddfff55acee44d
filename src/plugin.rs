//! Plugin entry points: owns the preview session and exposes it through the
//! method registry.

use serde_json::Value;
use tracing::info;

use crate::common::config::{Config, ConfigCommand};
use crate::ipc::{MethodRegistry, Response, json_get_uint64};
use crate::preview::{PreviewSession, PreviewState, WeakPreviewSession};
use crate::sys::host::{Host, ViewId};

pub const REQUEST_STREAM: &str = "live_previews/request_stream";
pub const RELEASE_OUTPUT: &str = "live_previews/release_output";

pub struct LivePreviewsPlugin {
    session: PreviewSession,
    config: Config,
}

impl LivePreviewsPlugin {
    pub fn init(host: &mut dyn Host, registry: &mut MethodRegistry, config: Config) -> Self {
        let session = PreviewSession::new(host, config.settings);

        let weak = session.downgrade();
        registry.register_method(
            REQUEST_STREAM,
            Box::new(move |host: &mut dyn Host, data: &Value| request_stream(&weak, host, data)),
        );
        let weak = session.downgrade();
        registry.register_method(
            RELEASE_OUTPUT,
            Box::new(move |host: &mut dyn Host, _data: &Value| release_output(&weak, host)),
        );

        info!(
            max_dimension = config.settings.max_dimension,
            frame_skip = config.settings.frame_skip,
            "live previews initialized"
        );
        LivePreviewsPlugin { session, config }
    }

    /// Unregisters the methods and tears everything down, including the
    /// preview output.
    pub fn fini(self, host: &mut dyn Host, registry: &mut MethodRegistry) {
        registry.unregister_method(REQUEST_STREAM);
        registry.unregister_method(RELEASE_OUTPUT);
        self.session.shutdown(host);
        info!("live previews finished");
    }

    pub fn session(&self) -> &PreviewSession { &self.session }

    pub fn config(&self) -> &Config { &self.config }

    pub fn state(&self, host: &dyn Host) -> PreviewState { self.session.state(host) }

    pub fn apply_config(&mut self, command: &ConfigCommand) -> anyhow::Result<()> {
        self.config.apply(command)?;
        self.session.set_settings(self.config.settings);
        Ok(())
    }
}

fn request_stream(session: &WeakPreviewSession, host: &mut dyn Host, data: &Value) -> Response {
    let Some(id) = json_get_uint64(data, "id") else {
        return Response::error("missing or invalid id");
    };
    let Some(session) = session.upgrade() else {
        return Response::error("live previews are not running");
    };
    match session.bind(host, ViewId::new(id)) {
        Ok(()) => Response::ok(),
        Err(err) => Response::error(err.to_string()),
    }
}

fn release_output(session: &WeakPreviewSession, host: &mut dyn Host) -> Response {
    if let Some(session) = session.upgrade() {
        session.release(host);
    }
    Response::ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_log::test;

    use super::*;
    use crate::preview::PREVIEW_OUTPUT_NAME;
    use crate::sys::geometry::{Rect, Size};
    use crate::sys::host::Outputs;
    use crate::sys::soft::{Paint, SoftHost};

    fn setup() -> (SoftHost, MethodRegistry, LivePreviewsPlugin) {
        let mut host = SoftHost::new();
        host.add_view(ViewId::new(5), Rect::new(0, 0, 800, 600), Paint::Solid([9, 9, 9, 255]));
        host.add_surface(ViewId::new(6), Rect::new(0, 0, 20, 20));
        let mut registry = MethodRegistry::new();
        let plugin = LivePreviewsPlugin::init(&mut host, &mut registry, Config::default());
        (host, registry, plugin)
    }

    #[test]
    fn test_request_stream_responses() {
        let (mut host, registry, plugin) = setup();

        let cases = [
            (json!({}), Response::error("missing or invalid id")),
            (json!({ "id": "5" }), Response::error("missing or invalid id")),
            (json!({ "id": 77 }), Response::error("no such view")),
            (json!({ "id": 6 }), Response::error("view is not a toplevel")),
            (json!({ "id": 5 }), Response::ok()),
        ];
        for (data, expected) in cases {
            assert_eq!(registry.call(&mut host, REQUEST_STREAM, &data), expected, "{data}");
        }
        assert_eq!(plugin.state(&host), PreviewState::Bound {
            view: ViewId::new(5),
            output: PREVIEW_OUTPUT_NAME.to_string(),
            size: Size::new(256, 192),
            downscale: 0.32,
        });
    }

    #[test]
    fn test_release_output_always_succeeds() {
        let (mut host, registry, plugin) = setup();
        assert_eq!(registry.call(&mut host, RELEASE_OUTPUT, &Value::Null), Response::ok());
        registry.call(&mut host, REQUEST_STREAM, &json!({ "id": 5 }));
        assert_eq!(registry.call(&mut host, RELEASE_OUTPUT, &json!({})), Response::ok());
        assert_eq!(registry.call(&mut host, RELEASE_OUTPUT, &json!({})), Response::ok());
        assert_eq!(plugin.state(&host), PreviewState::Idle);
        assert_eq!(host.output_by_name(PREVIEW_OUTPUT_NAME), None);
    }

    #[test]
    fn test_fini_unregisters_and_tears_down() {
        let (mut host, mut registry, plugin) = setup();
        registry.call(&mut host, REQUEST_STREAM, &json!({ "id": 5 }));
        assert!(host.output_by_name(PREVIEW_OUTPUT_NAME).is_some());

        plugin.fini(&mut host, &mut registry);
        assert!(registry.methods().is_empty());
        assert_eq!(host.output_by_name(PREVIEW_OUTPUT_NAME), None);
    }

    #[test]
    fn test_apply_config_reaches_the_session() {
        let (_host, _registry, mut plugin) = setup();
        plugin.apply_config(&ConfigCommand::SetFrameSkip(3)).unwrap();
        assert_eq!(plugin.session().settings().frame_skip, 3);
        assert!(plugin.apply_config(&ConfigCommand::SetMaxDimension(0)).is_err());
        assert_eq!(plugin.config().settings.max_dimension, 256);
    }
}
