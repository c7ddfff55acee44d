pub mod common;
pub mod ipc;
pub mod plugin;
pub mod preview;
pub mod sys;
