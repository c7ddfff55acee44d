//! The single ephemeral headless output that previews are rendered into.

use std::cell::Cell;

use tracing::{debug, warn};

use crate::sys::geometry::Size;
use crate::sys::host::{BackendId, Host, HostError, OutputId, OutputState, PixelFormat};

/// Well-known name consumers use to find the preview among the host's outputs.
pub const PREVIEW_OUTPUT_NAME: &str = "live-preview";

/// Render format of the preview output. Capture clients read it as RGBA.
pub const PREVIEW_FORMAT: PixelFormat = PixelFormat::Abgr8888;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created(OutputId),
    Resized(OutputId),
    Unchanged(OutputId),
}

impl Provisioned {
    pub fn output(&self) -> OutputId {
        match *self {
            Provisioned::Created(id) | Provisioned::Resized(id) | Provisioned::Unchanged(id) => id,
        }
    }
}

/// Owns the headless backend and provisions the preview output on it.
///
/// The backend is created on first use and kept for the life of the manager.
/// A failed creation is not remembered, so later requests retry and fail the
/// same way instead of wedging.
#[derive(Debug, Default)]
pub struct VirtualOutputManager {
    backend: Cell<Option<BackendId>>,
}

impl VirtualOutputManager {
    pub fn new() -> Self { VirtualOutputManager::default() }

    pub fn backend(&self) -> Option<BackendId> { self.backend.get() }

    pub fn ensure_backend(&self, host: &mut dyn Host) -> Result<BackendId, HostError> {
        if let Some(backend) = self.backend.get() {
            return Ok(backend);
        }
        let backend = host.create_headless_backend()?;
        host.attach_backend(backend)?;
        host.start_backend(backend)?;
        debug!(?backend, "headless backend started");
        self.backend.set(Some(backend));
        Ok(backend)
    }

    /// Makes sure an output called `name` exists with the given mode and
    /// scale. An existing output is resized in place when the backend accepts
    /// the new mode, and rebuilt from scratch otherwise.
    pub fn create_or_resize(
        &self,
        host: &mut dyn Host,
        name: &str,
        mode: Size,
        scale: f32,
    ) -> Result<Provisioned, HostError> {
        if let Some(output) = host.output_by_name(name) {
            if let Some(info) = host.output_info(output)
                && info.mode == mode
                && info.scale == scale
            {
                return Ok(Provisioned::Unchanged(output));
            }

            let mut state = OutputState::new();
            state.set_mode(mode).set_scale(scale);
            if host.test_state(output, &state) {
                host.commit_state(output, &state)?;
                debug!(%name, %mode, scale, "preview output resized");
                return Ok(Provisioned::Resized(output));
            }
            warn!(%name, %mode, "mode change rejected, recreating preview output");
            self.destroy(host, name);
        }
        self.create(host, name, mode, scale).map(Provisioned::Created)
    }

    fn create(
        &self,
        host: &mut dyn Host,
        name: &str,
        mode: Size,
        scale: f32,
    ) -> Result<OutputId, HostError> {
        let backend = self.ensure_backend(host)?;
        let output = host.add_headless_output(backend, mode)?;

        let mut state = OutputState::new();
        state.set_render_format(PREVIEW_FORMAT);
        if let Err(err) = host.commit_state(output, &state) {
            host.destroy_output(output);
            return Err(err);
        }

        // Keep the half-configured output hidden from clients while renaming.
        let advertised = host.is_advertised(output);
        host.set_advertised(output, false);
        host.set_output_name(output, name);
        host.set_advertised(output, advertised);

        let mut state = OutputState::new();
        state.set_scale(scale);
        if let Err(err) = host.commit_state(output, &state) {
            host.destroy_output(output);
            return Err(err);
        }

        debug!(%name, %mode, scale, "preview output created");
        Ok(output)
    }

    /// Destroys the output called `name`, if any. Returns whether one existed.
    pub fn destroy(&self, host: &mut dyn Host, name: &str) -> bool {
        let Some(output) = host.output_by_name(name) else {
            return false;
        };
        if host.focused_output() == Some(output)
            && let Some(next) = host.outputs().into_iter().find(|o| *o != output)
        {
            host.focus_output(next);
        }
        host.remove_from_layout(output);
        let destroyed = host.destroy_output(output);
        debug!(%name, destroyed, "preview output destroyed");
        destroyed
    }
}
