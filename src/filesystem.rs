/// Mount orchestration inside the sandbox's mount namespace, and the final
/// chroot into the new root
use crate::config::{BindMount, MountConfig};
use crate::fsutil::mkdirp;
use crate::types::{Degradable, RootboxError, Result, Tolerate, Warning};
use std::fs;
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use nix::mount::{mount, MsFlags};
#[cfg(unix)]
use nix::unistd::chroot;

/// What a mount entry is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Overlay,
    Dev,
    Proc,
    Sys,
    Tmp,
    Bind,
}

/// A mount the runtime made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub kind: MountKind,
    pub target: PathBuf,
}

/// Ordered record of the mounts this runtime created.
///
/// Everything except the overlay lives and dies with the sandbox's mount
/// namespace; the overlay is unmounted explicitly by the overlay manager.
#[derive(Debug, Clone, Default)]
pub struct MountSet {
    entries: Vec<MountEntry>,
}

impl MountSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: MountKind, target: impl Into<PathBuf>) {
        self.entries.push(MountEntry {
            kind,
            target: target.into(),
        });
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn contains(&self, kind: MountKind) -> bool {
        self.entries.iter().any(|entry| entry.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A mount to perform, relative to the eventual root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMount {
    pub kind: MountKind,
    pub source: PathBuf,
    /// Path inside the sandbox, relative (no leading `/`)
    pub target: PathBuf,
    pub fstype: Option<&'static str>,
    pub flags: MsFlags,
    pub data: Option<String>,
    /// Remount read-only after the bind (MS_RDONLY is ignored on the bind itself)
    pub readonly: bool,
}

/// Mount orchestrator for the standard sandbox mounts
pub struct MountOrchestrator {
    config: MountConfig,
}

impl MountOrchestrator {
    pub fn new(config: &MountConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Make the whole mount tree recursively private so nothing mounted
    /// here propagates to, or gets unmounted by, another namespace.
    pub fn make_private() -> Degradable {
        log::debug!("making / recursively private");
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| {
            Warning(RootboxError::Mount(format!(
                "failed to make / private: {}",
                e
            )))
        })
    }

    /// The mounts to make, in order: /dev, /proc, /sys, /tmp, then extra binds
    pub fn plan(&self) -> Vec<PlannedMount> {
        let mut planned = Vec::new();

        if self.config.dev {
            planned.push(PlannedMount {
                kind: MountKind::Dev,
                source: PathBuf::from("/dev"),
                target: PathBuf::from("dev"),
                fstype: None,
                flags: MsFlags::MS_BIND | MsFlags::MS_REC,
                data: None,
                readonly: false,
            });
        }

        if self.config.proc {
            planned.push(PlannedMount {
                kind: MountKind::Proc,
                source: PathBuf::from("proc"),
                target: PathBuf::from("proc"),
                fstype: Some("proc"),
                flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                data: None,
                readonly: false,
            });
        }

        // sysfs cannot be mounted from an unprivileged user namespace
        if self.config.sys {
            planned.push(PlannedMount {
                kind: MountKind::Sys,
                source: PathBuf::from("/sys"),
                target: PathBuf::from("sys"),
                fstype: None,
                flags: MsFlags::MS_BIND | MsFlags::MS_REC,
                data: None,
                readonly: self.config.sys_readonly,
            });
        }

        if self.config.tmp {
            planned.push(PlannedMount {
                kind: MountKind::Tmp,
                source: PathBuf::from("tmpfs"),
                target: PathBuf::from("tmp"),
                fstype: Some("tmpfs"),
                flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                data: self.config.tmp_options.clone(),
                readonly: false,
            });
        }

        for bind in &self.config.binds {
            match bind_plan(bind) {
                Ok(p) => planned.push(p),
                Err(warning) => log::warn!("{}", warning),
            }
        }

        planned
    }

    /// Create mountpoints and mount everything in the plan under `new_root`.
    /// Each failure is a warning; the sandbox stays usable without it.
    pub fn setup(&self, new_root: &Path, mounts: &mut MountSet) {
        log::info!("setting up mounts in {}", new_root.display());
        for planned in self.plan() {
            let target = new_root.join(&planned.target);
            match mount_planned(&planned, &target) {
                Ok(()) => mounts.record(planned.kind, target),
                Err(warning) => log::warn!("{}", warning),
            }
        }
    }

    /// chroot into `new_root` and move to its `/`
    pub fn chroot_into(new_root: &Path) -> Result<()> {
        log::info!("chroot to {}", new_root.display());
        chroot(new_root).map_err(|e| {
            RootboxError::Chroot(format!("chroot to {} failed: {}", new_root.display(), e))
        })?;
        std::env::set_current_dir("/")
            .map_err(|e| RootboxError::Chroot(format!("chdir to / failed: {}", e)))?;
        Ok(())
    }
}

fn bind_plan(bind: &BindMount) -> std::result::Result<PlannedMount, Warning> {
    let relative: PathBuf = bind
        .destination
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .collect();
    if relative.as_os_str().is_empty()
        || relative.components().any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Warning(RootboxError::Mount(format!(
            "bind destination {} must be a path inside the sandbox",
            bind.destination.display()
        ))));
    }
    Ok(PlannedMount {
        kind: MountKind::Bind,
        source: bind.source.clone(),
        target: relative,
        fstype: None,
        flags: MsFlags::MS_BIND | MsFlags::MS_REC,
        data: None,
        readonly: bind.readonly,
    })
}

/// Create the mountpoint: a directory, or an empty file when binding a file
fn ensure_mountpoint(source: &Path, target: &Path, is_bind: bool) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    if is_bind && source.is_file() {
        if let Some(parent) = target.parent() {
            mkdirp(parent)?;
        }
        fs::File::create(target)?;
        return Ok(());
    }
    mkdirp(target)
}

fn mount_planned(planned: &PlannedMount, target: &Path) -> Degradable {
    let is_bind = planned.flags.contains(MsFlags::MS_BIND);
    let what = format!("{} at {}", planned.source.display(), target.display());

    ensure_mountpoint(&planned.source, target, is_bind).map_err(|e| {
        Warning(RootboxError::Mount(format!(
            "failed to create mountpoint {}: {}",
            target.display(),
            e
        )))
    })?;

    log::debug!("mounting {}", what);
    mount(
        Some(planned.source.as_path()),
        target,
        planned.fstype,
        planned.flags,
        planned.data.as_deref(),
    )
    .map_err(|e| Warning(RootboxError::Mount(format!("failed to mount {}: {}", what, e))))?;

    if planned.readonly {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| {
            Warning(RootboxError::Mount(format!(
                "failed to make {} read-only: {}",
                target.display(),
                e
            )))
        })
        .tolerate();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_plan_order() {
        let orchestrator = MountOrchestrator::new(&MountConfig::default());
        let kinds: Vec<MountKind> = orchestrator.plan().iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![MountKind::Dev, MountKind::Proc, MountKind::Sys, MountKind::Tmp]);

        let plan = orchestrator.plan();
        assert!(plan[0].flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC));
        assert_eq!(plan[1].fstype, Some("proc"));
        assert!(plan[2].readonly);
        assert_eq!(plan[3].fstype, Some("tmpfs"));
        assert!(plan.iter().all(|p| p.target.is_relative()));
    }

    #[test]
    fn test_plan_respects_toggles_and_binds() {
        let config = MountConfig {
            sys: false,
            tmp_options: Some("size=64m".into()),
            binds: vec![
                BindMount {
                    source: PathBuf::from("/srv/cache"),
                    destination: PathBuf::from("/var/cache/apt"),
                    readonly: true,
                },
                BindMount {
                    source: PathBuf::from("/etc"),
                    destination: PathBuf::from("/../escape"),
                    readonly: false,
                },
            ],
            ..MountConfig::default()
        };
        let plan = MountOrchestrator::new(&config).plan();
        let kinds: Vec<MountKind> = plan.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![MountKind::Dev, MountKind::Proc, MountKind::Tmp, MountKind::Bind]
        );
        assert_eq!(plan[2].data.as_deref(), Some("size=64m"));
        assert_eq!(plan[3].target, PathBuf::from("var/cache/apt"));
        assert!(plan[3].readonly);
    }

    #[test]
    fn test_mountpoints_created_for_file_and_dir_binds() {
        let temp = TempDir::new().unwrap();
        let source_file = temp.path().join("resolv.conf");
        fs::write(&source_file, "nameserver 127.0.0.1\n").unwrap();

        let file_target = temp.path().join("root/etc/resolv.conf");
        ensure_mountpoint(&source_file, &file_target, true).unwrap();
        assert!(file_target.is_file());

        let dir_target = temp.path().join("root/proc");
        ensure_mountpoint(Path::new("proc"), &dir_target, false).unwrap();
        assert!(dir_target.is_dir());
    }

    #[test]
    fn test_mount_set_records_in_order() {
        let mut set = MountSet::new();
        assert!(set.is_empty());
        set.record(MountKind::Overlay, "/tmp/rootbox-ofs-1-2-merged");
        set.record(MountKind::Dev, "/tmp/rootbox-ofs-1-2-merged/dev");
        assert_eq!(set.len(), 2);
        assert!(set.contains(MountKind::Overlay));
        assert!(!set.contains(MountKind::Tmp));
        assert_eq!(set.entries()[1].target, PathBuf::from("/tmp/rootbox-ofs-1-2-merged/dev"));
    }
}
