/// Overlay filesystem root: scratch path planning, mount with unwind on
/// failure, metadata file, and best-effort teardown after the command exits
use crate::cleanup::{CleanupStats, UndoStack};
use crate::filesystem::{MountKind, MountSet};
use crate::fsutil::{mkdirp, remove_dir_recursive};
use crate::types::{Invocation, Mode, RootboxError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::mount::{mount, umount2, MntFlags, MsFlags};

/// Metadata file written at the top of the merged view
pub const META_FILE: &str = ".rootbox-meta";

/// Prefix of every generated scratch path
pub const SCRATCH_PREFIX: &str = "rootbox-ofs";

const WORKDIR_KEY: &str = "WORKDIR";
const UPPERDIR_KEY: &str = "UPPERDIR";

/// Contents of `.rootbox-meta`: line-oriented `KEY=VALUE`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayMeta {
    pub workdir: Option<PathBuf>,
    pub upperdir: Option<PathBuf>,
}

impl OverlayMeta {
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(work) = &self.workdir {
            out.push_str(&format!("{}={}\n", WORKDIR_KEY, work.display()));
        }
        if let Some(upper) = &self.upperdir {
            out.push_str(&format!("{}={}\n", UPPERDIR_KEY, upper.display()));
        }
        out
    }

    /// Parse metadata. Unknown keys and malformed lines are skipped; only
    /// the first `=` separates key from value.
    pub fn parse(content: &str) -> Self {
        let mut meta = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                WORKDIR_KEY => meta.workdir = Some(PathBuf::from(value)),
                UPPERDIR_KEY => meta.upperdir = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        meta
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }
}

/// Everything needed to build and tear down one overlay root.
///
/// Planned by the parent before fork, so both processes agree on the paths
/// without any further communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPlan {
    /// Read-only layers, bottom first
    pub lowers: Vec<PathBuf>,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
    /// Upper layer is generated and deleted at teardown
    pub ephemeral: bool,
}

impl OverlayPlan {
    /// Plan the overlay for `invocation`, or `None` in direct mode.
    /// `pid` and `timestamp` make the scratch paths unique per run.
    pub fn new(invocation: &Invocation, scratch_dir: &Path, pid: u32, timestamp: i64) -> Option<Self> {
        let scratch = |suffix: &str| {
            scratch_dir.join(format!("{}-{}-{}-{}", SCRATCH_PREFIX, pid, timestamp, suffix))
        };

        let (upper, ephemeral) = match &invocation.mode {
            Mode::Direct => return None,
            Mode::OverlayEphemeral => (scratch("upper"), true),
            Mode::OverlayPersistent { persist_dir } => (persist_dir.clone(), false),
        };

        let mut lowers = vec![invocation.image_path.clone()];
        lowers.extend(invocation.extra_layers.iter().cloned());

        Some(Self {
            lowers,
            upper,
            work: scratch("work"),
            merged: scratch("merged"),
            ephemeral,
        })
    }

    /// Plan with this process's PID and the current time
    pub fn for_invocation(invocation: &Invocation, scratch_dir: &Path) -> Option<Self> {
        Self::new(
            invocation,
            scratch_dir,
            std::process::id(),
            chrono::Utc::now().timestamp(),
        )
    }

    /// overlayfs wants the topmost layer first
    pub fn lowerdir_option(&self) -> String {
        self.lowers
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lowerdir_option(),
            self.upper.display(),
            self.work.display()
        )
    }

    pub fn meta_path(&self) -> PathBuf {
        self.merged.join(META_FILE)
    }

    /// Metadata recorded for this plan. A persistent upper is never listed,
    /// so nothing reading the file could delete the caller's data.
    pub fn metadata(&self) -> OverlayMeta {
        OverlayMeta {
            workdir: Some(self.work.clone()),
            upperdir: self.ephemeral.then(|| self.upper.clone()),
        }
    }

    /// Create the directories, mount the overlay on `merged` and write the
    /// metadata file. On any failure everything created so far is removed
    /// in reverse order and a single overlay error is returned.
    pub fn setup(&self, mounts: &mut MountSet) -> Result<()> {
        log::info!("setting up overlay on {}", self.merged.display());
        let mut undo = UndoStack::new();

        create_scratch_dir(&self.merged, "merged")?;
        let merged = self.merged.clone();
        undo.push(format!("rmdir {}", merged.display()), move || {
            Ok(fs::remove_dir(&merged)?)
        });

        create_scratch_dir(&self.work, "work")?;
        let work = self.work.clone();
        undo.push(format!("remove {}", work.display()), move || {
            remove_dir_recursive(&work)
        });

        if self.ephemeral {
            create_scratch_dir(&self.upper, "upper")?;
            let upper = self.upper.clone();
            undo.push(format!("remove {}", upper.display()), move || {
                remove_dir_recursive(&upper)
            });
        } else if !self.upper.is_dir() {
            log::info!("creating persistent upper dir {}", self.upper.display());
            create_scratch_dir(&self.upper, "persistent upper")?;
        }

        let options = self.mount_options();
        log::debug!("overlay options: {}", options);
        mount(
            Some("overlay"),
            &self.merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| {
            RootboxError::Overlay(format!(
                "failed to mount overlay on {}: {}",
                self.merged.display(),
                e
            ))
        })?;
        let target = self.merged.clone();
        undo.push(format!("umount {}", target.display()), move || {
            Ok(umount2(&target, MntFlags::MNT_DETACH)?)
        });

        let meta_path = self.meta_path();
        fs::write(&meta_path, self.metadata().render()).map_err(|e| {
            RootboxError::Overlay(format!("failed to write {}: {}", meta_path.display(), e))
        })?;

        undo.commit();
        mounts.record(MountKind::Overlay, self.merged.clone());
        Ok(())
    }

    /// Undo everything `setup` made. Runs in the parent after the child has
    /// been reaped; every failure is a warning.
    pub fn teardown(&self) -> CleanupStats {
        log::info!("tearing down overlay on {}", self.merged.display());
        let meta = self.verified_teardown_paths();

        let mut undo = UndoStack::new();

        let merged = self.merged.clone();
        undo.push(format!("rmdir {}", merged.display()), move || {
            match fs::remove_dir(&merged) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        });

        if let Some(upper) = meta.upperdir {
            undo.push(format!("remove {}", upper.display()), move || {
                remove_dir_recursive(&upper)
            });
        }
        if let Some(work) = meta.workdir {
            undo.push(format!("remove {}", work.display()), move || {
                remove_dir_recursive(&work)
            });
        }

        let target = self.merged.clone();
        undo.push(format!("umount {}", target.display()), move || {
            match umount2(&target, MntFlags::MNT_DETACH) {
                Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
                Err(e) => Err(e.into()),
            }
        });

        // Removed first so it never lands in a persistent upper layer
        let meta_path = self.meta_path();
        undo.push(format!("remove {}", meta_path.display()), move || {
            match fs::remove_file(&meta_path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        });

        let stats = undo.unwind();
        log::debug!(
            "overlay teardown: {} done, {} failed",
            stats.completed,
            stats.failed
        );
        stats
    }

    /// The paths teardown deletes. Always the planned ones.
    ///
    /// The metadata file sits inside the contained command's writable view,
    /// so it is only cross-checked against the plan and a mismatch is logged.
    /// Nothing it records is ever deleted.
    fn verified_teardown_paths(&self) -> OverlayMeta {
        let planned = self.metadata();
        let recorded = match OverlayMeta::read(&self.meta_path()) {
            Ok(meta) => meta,
            Err(e) => {
                log::debug!("no overlay metadata ({}), using planned paths", e);
                return planned;
            }
        };
        if recorded != planned {
            log::warn!(
                "overlay metadata in {} does not match this run, ignoring it",
                self.meta_path().display()
            );
        }
        planned
    }
}

fn create_scratch_dir(path: &Path, what: &str) -> Result<()> {
    mkdirp(path).map_err(|e| {
        RootboxError::Overlay(format!(
            "failed to create {} dir {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Personality;
    use std::ffi::OsString;
    use tempfile::TempDir;

    fn invocation(mode: Mode, extra_layers: Vec<PathBuf>) -> Invocation {
        Invocation {
            personality: Personality::Overlay,
            mode,
            image_path: PathBuf::from("/images/debian"),
            extra_layers,
            command: vec![OsString::from("/bin/echo"), OsString::from("hello")],
        }
    }

    #[test]
    fn test_ephemeral_scratch_paths() {
        let inv = invocation(Mode::OverlayEphemeral, Vec::new());
        let plan = OverlayPlan::new(&inv, Path::new("/tmp"), 4242, 1700000000).unwrap();

        assert_eq!(plan.merged, PathBuf::from("/tmp/rootbox-ofs-4242-1700000000-merged"));
        assert_eq!(plan.work, PathBuf::from("/tmp/rootbox-ofs-4242-1700000000-work"));
        assert_eq!(plan.upper, PathBuf::from("/tmp/rootbox-ofs-4242-1700000000-upper"));
        assert!(plan.ephemeral);
        assert_eq!(
            plan.mount_options(),
            "lowerdir=/images/debian,upperdir=/tmp/rootbox-ofs-4242-1700000000-upper,\
             workdir=/tmp/rootbox-ofs-4242-1700000000-work"
        );
        assert_eq!(plan.meta_path(), plan.merged.join(".rootbox-meta"));
    }

    #[test]
    fn test_persistent_upper_is_caller_dir() {
        let inv = invocation(
            Mode::OverlayPersistent { persist_dir: PathBuf::from("/var/lib/penv/persist/x") },
            Vec::new(),
        );
        let plan = OverlayPlan::new(&inv, Path::new("/scratch"), 7, 9).unwrap();
        assert_eq!(plan.upper, PathBuf::from("/var/lib/penv/persist/x"));
        assert_eq!(plan.work, PathBuf::from("/scratch/rootbox-ofs-7-9-work"));
        assert!(!plan.ephemeral);
        assert_eq!(plan.metadata().upperdir, None);
        assert_eq!(plan.metadata().render(), "WORKDIR=/scratch/rootbox-ofs-7-9-work\n");
    }

    #[test]
    fn test_direct_mode_has_no_overlay() {
        let mut inv = invocation(Mode::Direct, Vec::new());
        inv.personality = Personality::Direct;
        assert!(OverlayPlan::new(&inv, Path::new("/tmp"), 1, 1).is_none());
    }

    #[test]
    fn test_layers_topmost_first() {
        let inv = invocation(
            Mode::OverlayEphemeral,
            vec![PathBuf::from("/layers/python"), PathBuf::from("/layers/app")],
        );
        let plan = OverlayPlan::new(&inv, Path::new("/tmp"), 1, 1).unwrap();
        assert_eq!(plan.lowerdir_option(), "/layers/app:/layers/python:/images/debian");
    }

    #[test]
    fn test_distinct_runs_get_distinct_paths() {
        let inv = invocation(Mode::OverlayEphemeral, Vec::new());
        let a = OverlayPlan::new(&inv, Path::new("/tmp"), 100, 5).unwrap();
        let b = OverlayPlan::new(&inv, Path::new("/tmp"), 101, 5).unwrap();
        let c = OverlayPlan::new(&inv, Path::new("/tmp"), 100, 6).unwrap();
        assert_ne!(a.merged, b.merged);
        assert_ne!(a.merged, c.merged);
    }

    #[test]
    fn test_meta_parse() {
        let meta = OverlayMeta::parse(
            "WORKDIR=/tmp/rootbox-ofs-1-2-work\nJUNK\nOTHER=x\nUPPERDIR=/tmp/a=b\n",
        );
        assert_eq!(meta.workdir, Some(PathBuf::from("/tmp/rootbox-ofs-1-2-work")));
        assert_eq!(meta.upperdir, Some(PathBuf::from("/tmp/a=b")));

        assert_eq!(OverlayMeta::parse(""), OverlayMeta::default());
        assert_eq!(OverlayMeta::parse("WORKDIR=\n").workdir, None);
    }

    #[test]
    fn test_teardown_without_mount_removes_scratch() {
        let temp = TempDir::new().unwrap();
        let inv = invocation(Mode::OverlayEphemeral, Vec::new());
        let plan = OverlayPlan::new(&inv, temp.path(), 3, 4).unwrap();

        // What a child that died right after mkdir would leave behind
        for dir in [&plan.merged, &plan.work, &plan.upper] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::create_dir_all(plan.work.join("work")).unwrap();
        fs::write(plan.upper.join("file"), "x").unwrap();

        // umount of a plain directory may fail; removal still goes ahead
        plan.teardown();
        assert!(!plan.merged.exists());
        assert!(!plan.work.exists());
        assert!(!plan.upper.exists());
    }

    #[test]
    fn test_teardown_ignores_foreign_metadata_paths() {
        let temp = TempDir::new().unwrap();
        let victim = temp.path().join("victim");
        fs::create_dir(&victim).unwrap();
        fs::write(victim.join("keep"), "x").unwrap();

        let inv = invocation(
            Mode::OverlayPersistent { persist_dir: temp.path().join("persist") },
            Vec::new(),
        );
        let plan = OverlayPlan::new(&inv, temp.path(), 3, 4).unwrap();
        fs::create_dir_all(&plan.merged).unwrap();
        fs::create_dir_all(&plan.work).unwrap();
        fs::create_dir_all(&plan.upper).unwrap();
        fs::write(
            plan.meta_path(),
            format!("WORKDIR={}\nUPPERDIR={}\n", victim.display(), victim.display()),
        )
        .unwrap();

        plan.teardown();
        assert!(victim.join("keep").exists());
        assert!(plan.upper.exists());
        assert!(!plan.work.exists());
        assert!(!plan.merged.exists());
    }

    #[test]
    fn test_teardown_paths_are_planned_even_with_tampered_metadata() {
        let temp = TempDir::new().unwrap();
        let inv = invocation(Mode::OverlayEphemeral, Vec::new());
        let plan = OverlayPlan::new(&inv, temp.path(), 5, 6).unwrap();

        assert_eq!(plan.verified_teardown_paths(), plan.metadata());

        fs::create_dir_all(&plan.merged).unwrap();
        fs::write(plan.meta_path(), "WORKDIR=/etc\nUPPERDIR=/home\n").unwrap();
        assert_eq!(plan.verified_teardown_paths(), plan.metadata());
    }
}
