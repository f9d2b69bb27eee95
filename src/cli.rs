/// Command line interface: resolves argv into an `Invocation`
use crate::types::{Invocation, Mode, Personality, Result, RootboxError};
use clap::error::ErrorKind;
use clap::{Args, Parser};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Flags shared by both personalities
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Log every setup step to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// JSON configuration file (defaults to $ROOTBOX_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(name = "rootbox", version)]
#[command(about = "Run a command chrooted into a root directory inside new namespaces", long_about = None)]
struct DirectCli {
    #[command(flatten)]
    common: CommonArgs,

    /// Root directory to chroot into (must be writable by the command)
    #[arg(value_name = "ROOT_DIR")]
    root_dir: PathBuf,

    /// Command and arguments, given after `--`
    #[arg(last = true, required = true, value_name = "CMD")]
    command: Vec<OsString>,
}

#[derive(Parser, Debug)]
#[command(name = "rootbox-ofs", version)]
#[command(about = "Run a command in an overlayfs view of a root directory inside new namespaces", long_about = None)]
struct OverlayCli {
    #[command(flatten)]
    common: CommonArgs,

    /// Read-only root directory used as the lower layer
    #[arg(value_name = "ROOT_DIR")]
    root_dir: PathBuf,

    /// Keep changes in this directory (upper layer) instead of discarding them
    #[arg(short, long, value_name = "PERSIST_DIR")]
    persist: Option<PathBuf>,

    /// Extra read-only layer stacked above ROOT_DIR (repeatable, bottom first)
    #[arg(short = 'l', long = "layer", value_name = "LAYER")]
    layers: Vec<PathBuf>,

    /// Command and arguments, given after `--`
    #[arg(last = true, required = true, value_name = "CMD")]
    command: Vec<OsString>,
}

/// Everything the resolver produced for a run
#[derive(Debug, Clone)]
pub struct ParsedArgs {
    pub common: CommonArgs,
    pub invocation: Invocation,
}

/// Outcome of argument resolution
#[derive(Debug)]
pub enum Resolution {
    /// A sandbox should be started
    Run(ParsedArgs),
    /// `--help` or `--version`: print the text and exit 0
    Info(String),
}

/// Resolve process arguments. argv[0] selects the personality.
///
/// Nothing here touches the kernel beyond `stat`, so a usage error never
/// leaves resources behind.
pub fn resolve<I, T>(args: I) -> Result<Resolution>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let personality = args
        .first()
        .map(|argv0| Personality::from_program(argv0))
        .unwrap_or(Personality::Direct);

    let parsed = match personality {
        Personality::Direct => DirectCli::try_parse_from(&args).map(|cli| {
            (cli.common, cli.root_dir, Vec::new(), None, cli.command)
        }),
        Personality::Overlay => OverlayCli::try_parse_from(&args).map(|cli| {
            (cli.common, cli.root_dir, cli.layers, cli.persist, cli.command)
        }),
    };

    let (common, root_dir, layers, persist, command) = match parsed {
        Ok(parts) => parts,
        Err(e) => {
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    Ok(Resolution::Info(e.to_string()))
                }
                _ => Err(RootboxError::Usage(e.to_string())),
            }
        }
    };

    let image_path = existing_dir(&root_dir, "root directory")?;
    let extra_layers = layers
        .iter()
        .map(|layer| existing_dir(layer, "layer"))
        .collect::<Result<Vec<_>>>()?;

    let mode = match (personality, persist) {
        (Personality::Direct, _) => Mode::Direct,
        (Personality::Overlay, None) => Mode::OverlayEphemeral,
        (Personality::Overlay, Some(dir)) => Mode::OverlayPersistent {
            persist_dir: absolute(&dir)?,
        },
    };

    if mode.is_overlay() {
        let mut overlay_paths: Vec<&Path> = vec![&image_path];
        overlay_paths.extend(extra_layers.iter().map(PathBuf::as_path));
        overlay_paths.extend(mode.persist_path());
        for path in overlay_paths {
            check_overlay_safe(path)?;
        }
    }

    Ok(Resolution::Run(ParsedArgs {
        common,
        invocation: Invocation {
            personality,
            mode,
            image_path,
            extra_layers,
            command,
        },
    }))
}

/// Canonicalize a caller-supplied directory, rejecting anything else
fn existing_dir(path: &Path, what: &str) -> Result<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| {
        RootboxError::Usage(format!("{} {}: {}", what, path.display(), e))
    })?;
    if !canonical.is_dir() {
        return Err(RootboxError::Usage(format!(
            "{} {} is not a directory",
            what,
            path.display()
        )));
    }
    Ok(canonical)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// overlayfs splits its option string on `,` and lowerdir on `:`
fn check_overlay_safe(path: &Path) -> Result<()> {
    let text = path.to_string_lossy();
    if text.contains(',') || text.contains(':') {
        return Err(RootboxError::Usage(format!(
            "path {} cannot be used as an overlay layer (contains ',' or ':')",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(args: &[&str]) -> Result<ParsedArgs> {
        match resolve(args.iter().copied())? {
            Resolution::Run(parsed) => Ok(parsed),
            Resolution::Info(text) => panic!("unexpected info output: {}", text),
        }
    }

    #[test]
    fn test_direct_mode() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().to_str().unwrap();
        let parsed = run(&["rootbox", root_str, "--", "/bin/echo", "hello", "-n"]).unwrap();

        let inv = parsed.invocation;
        assert_eq!(inv.personality, Personality::Direct);
        assert_eq!(inv.mode, Mode::Direct);
        assert_eq!(inv.image_path, root.path().canonicalize().unwrap());
        assert_eq!(inv.command, vec!["/bin/echo", "hello", "-n"]);
        assert_eq!(inv.program(), "/bin/echo");
    }

    #[test]
    fn test_overlay_ephemeral_and_persistent() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().to_str().unwrap();

        let parsed = run(&["/usr/bin/rootbox-ofs", root_str, "--", "sh"]).unwrap();
        assert_eq!(parsed.invocation.personality, Personality::Overlay);
        assert_eq!(parsed.invocation.mode, Mode::OverlayEphemeral);

        let parsed = run(&["rootbox-ofs", root_str, "-p", "/var/lib/penv/persist/x", "--", "sh"])
            .unwrap();
        assert_eq!(
            parsed.invocation.mode,
            Mode::OverlayPersistent { persist_dir: PathBuf::from("/var/lib/penv/persist/x") }
        );
    }

    #[test]
    fn test_arguments_after_separator_are_verbatim() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().to_str().unwrap();
        let parsed =
            run(&["rootbox-ofs", root_str, "--", "sh", "-c", "echo -p -- x", "-v", "--"]).unwrap();
        assert_eq!(parsed.invocation.command, vec!["sh", "-c", "echo -p -- x", "-v", "--"]);
        assert!(!parsed.common.verbose);
    }

    #[test]
    fn test_missing_separator_is_usage_error() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().to_str().unwrap();
        let err = run(&["rootbox", root_str, "/bin/echo", "hi"]).unwrap_err();
        assert!(matches!(err, RootboxError::Usage(_)));
        assert_eq!(err.exit_code(), crate::types::EXIT_USAGE);
    }

    #[test]
    fn test_no_command_after_separator() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().to_str().unwrap();
        assert!(matches!(run(&["rootbox", root_str, "--"]), Err(RootboxError::Usage(_))));
        assert!(matches!(run(&["rootbox"]), Err(RootboxError::Usage(_))));
    }

    #[test]
    fn test_persist_flag_rejected_in_direct_mode() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().to_str().unwrap();
        let err = run(&["rootbox", root_str, "-p", "/tmp/x", "--", "sh"]).unwrap_err();
        assert!(matches!(err, RootboxError::Usage(_)));
    }

    #[test]
    fn test_missing_root_dir() {
        let err = run(&["rootbox", "/definitely/not/here", "--", "sh"]).unwrap_err();
        match err {
            RootboxError::Usage(msg) => assert!(msg.contains("/definitely/not/here")),
            other => panic!("expected usage error, got {:?}", other),
        }
    }

    #[test]
    fn test_layers_and_flags() {
        let root = TempDir::new().unwrap();
        let layer = TempDir::new().unwrap();
        let parsed = run(&[
            "rootbox-ofs",
            "-v",
            "-l",
            layer.path().to_str().unwrap(),
            root.path().to_str().unwrap(),
            "--",
            "true",
        ])
        .unwrap();
        assert!(parsed.common.verbose);
        assert_eq!(parsed.invocation.extra_layers, vec![layer.path().canonicalize().unwrap()]);
    }

    #[test]
    fn test_overlay_rejects_separator_characters() {
        let base = TempDir::new().unwrap();
        let root = base.path().join("a,b");
        std::fs::create_dir(&root).unwrap();
        let err = run(&["rootbox-ofs", root.to_str().unwrap(), "--", "sh"]).unwrap_err();
        assert!(matches!(err, RootboxError::Usage(_)));

        // direct mode does not go through overlayfs option parsing
        assert!(run(&["rootbox", root.to_str().unwrap(), "--", "sh"]).is_ok());
    }

    #[test]
    fn test_help_is_informational() {
        match resolve(["rootbox-ofs", "--help"]).unwrap() {
            Resolution::Info(text) => assert!(text.contains("PERSIST_DIR")),
            Resolution::Run(_) => panic!("help should not start a sandbox"),
        }
    }
}
