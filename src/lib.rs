//! rootbox: run a command inside a rootless sandbox built from Linux
//! namespaces, a chroot (optionally over overlayfs) and a pseudo-terminal

pub mod cleanup;
pub mod cli;
pub mod config;
pub mod filesystem;
pub mod fsutil;
pub mod logging;
pub mod namespace;
pub mod overlay;
pub mod pty;
pub mod supervisor;
pub mod types;

pub use supervisor::launch;
pub use types::{Invocation, Mode, Personality, Result, RootboxError};
