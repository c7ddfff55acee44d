use thiserror::Error;

use crate::sys::host::HostError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreviewError {
    #[error("no such view")]
    NoSuchView,
    #[error("view is not a toplevel")]
    NotAToplevel,
    #[error("preview output unavailable: {0}")]
    ResourceUnavailable(#[from] HostError),
}
