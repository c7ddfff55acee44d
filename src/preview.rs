//! Live previews: a scaled, continuously updated copy of one window rendered
//! into a headless output that capture clients can read.
//!
//! [`PreviewSession`] owns the binding. Everything the host calls back into
//! (render hooks, the scene node, signal listeners) holds a weak reference to
//! it and checks the binding on every call.

mod compositor;
pub mod error;
mod node;
pub mod output;
pub mod scale;
mod scheduler;
mod session;

pub use error::PreviewError;
pub use output::{PREVIEW_FORMAT, PREVIEW_OUTPUT_NAME};
pub use session::{PreviewSession, PreviewState, WeakPreviewSession};

#[cfg(test)]
mod tests;
