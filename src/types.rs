/// Core types and structures for the rootbox sandbox runtime
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit code when the sandbox ran and the command exited 0
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for any fatal setup, mount, chroot or exec failure
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a malformed invocation
pub const EXIT_USAGE: i32 = 2;
/// Exit code when the contained command was killed by a signal
pub const EXIT_SIGNALED: i32 = 1;

/// The two executable personalities, selected from the invoked file name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Personality {
    /// `rootbox`: chroot straight into the image directory
    Direct,
    /// `rootbox-ofs`: chroot into an overlay mounted on top of the image
    Overlay,
}

impl Personality {
    pub const DIRECT_NAME: &'static str = "rootbox";
    pub const OVERLAY_NAME: &'static str = "rootbox-ofs";

    /// Pick the personality from argv[0]. Anything that is not exactly
    /// `rootbox-ofs` after stripping the directory is the direct personality.
    pub fn from_program(argv0: &OsStr) -> Self {
        match Path::new(argv0).file_name() {
            Some(name) if name == Self::OVERLAY_NAME => Personality::Overlay,
            _ => Personality::Direct,
        }
    }

    /// Program name, also used as hostname and domain name inside the sandbox
    pub fn name(&self) -> &'static str {
        match self {
            Personality::Direct => Self::DIRECT_NAME,
            Personality::Overlay => Self::OVERLAY_NAME,
        }
    }
}

/// How the eventual root filesystem is produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The image directory is the root and must be writable by the command
    Direct,
    /// Overlay with a scratch upper layer that is deleted on exit
    OverlayEphemeral,
    /// Overlay whose upper layer is a caller-supplied directory that survives
    OverlayPersistent { persist_dir: PathBuf },
}

impl Mode {
    pub fn is_overlay(&self) -> bool {
        !matches!(self, Mode::Direct)
    }

    pub fn persist_path(&self) -> Option<&Path> {
        match self {
            Mode::OverlayPersistent { persist_dir } => Some(persist_dir),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::OverlayEphemeral => "overlay-ephemeral",
            Mode::OverlayPersistent { .. } => "overlay-persistent",
        }
    }
}

/// A fully resolved sandbox request. Built once by the argument resolver
/// and only read afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub personality: Personality,
    pub mode: Mode,
    /// Chroot root in direct mode, bottom lower layer in overlay mode
    pub image_path: PathBuf,
    /// Extra read-only layers stacked above `image_path`, bottom first
    pub extra_layers: Vec<PathBuf>,
    /// Program followed by its arguments, never empty
    pub command: Vec<OsString>,
}

impl Invocation {
    pub fn program(&self) -> &OsStr {
        &self.command[0]
    }
}

/// Custom error types for rootbox
#[derive(Error, Debug)]
pub enum RootboxError {
    #[error("{0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Overlay error: {0}")]
    Overlay(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Chroot error: {0}")]
    Chroot(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call error: {0}")]
    Sys(#[from] nix::Error),
}

impl RootboxError {
    /// Exit code the top-level handler reports for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            RootboxError::Usage(_) | RootboxError::Config(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }
}

/// Result type alias for rootbox operations
pub type Result<T> = std::result::Result<T, RootboxError>;

/// A best-effort step failed; isolation degrades but execution continues.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct Warning(#[from] pub RootboxError);

/// Outcome of a best-effort step
pub type Degradable = std::result::Result<(), Warning>;

/// Log-and-continue for best-effort steps
pub trait Tolerate {
    fn tolerate(self);
}

impl Tolerate for Degradable {
    fn tolerate(self) {
        if let Err(warning) = self {
            log::warn!("{}", warning);
        }
    }
}
