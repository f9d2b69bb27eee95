/// Namespace setup: user namespace with identity mapping, then mount, PID
/// and UTS namespaces with an isolated hostname
use crate::config::Config;
use crate::fsutil::write_control_file;
use crate::types::{Degradable, Personality, RootboxError, Result, Tolerate, Warning};
use std::path::Path;

#[cfg(unix)]
use nix::sched::{unshare, CloneFlags};
#[cfg(unix)]
use nix::unistd::{getegid, geteuid, getgid, getpid, getuid, sethostname};
#[cfg(unix)]
use std::fs;

/// One line of a user namespace ID map: `inside outside count`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

impl IdMapping {
    /// Map a single outer ID to 0 inside the namespace
    pub fn root_for(outside: u32) -> Self {
        Self {
            inside: 0,
            outside,
            count: 1,
        }
    }

    /// Content written to `uid_map` / `gid_map`
    pub fn to_map_line(&self) -> String {
        format!("{} {} {}\n", self.inside, self.outside, self.count)
    }
}

/// Which namespaces the runtime actually obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Namespaces {
    pub user: bool,
    pub mount: bool,
    pub pid: bool,
    pub uts: bool,
}

/// Namespace setup controller
pub struct NamespaceSetup {
    outer_uid: u32,
    outer_gid: u32,
    privileged: bool,
    hostname: String,
    domainname: String,
    parent_death_signal: bool,
}

impl NamespaceSetup {
    pub fn new(personality: Personality, config: &Config) -> Self {
        Self {
            outer_uid: getuid().as_raw(),
            outer_gid: getgid().as_raw(),
            privileged: geteuid().is_root(),
            hostname: config
                .hostname
                .clone()
                .unwrap_or_else(|| personality.name().to_string()),
            domainname: config
                .domainname
                .clone()
                .unwrap_or_else(|| personality.name().to_string()),
            parent_death_signal: config.security.parent_death_signal,
        }
    }

    /// Already root: no user namespace is created
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn uid_mapping(&self) -> IdMapping {
        IdMapping::root_for(self.outer_uid)
    }

    pub fn gid_mapping(&self) -> IdMapping {
        IdMapping::root_for(self.outer_gid)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Run the whole namespace sequence in the calling process.
    ///
    /// Only failing to create the user namespace (when one is needed) is
    /// fatal; every other step degrades to whatever the kernel allowed.
    pub fn apply(&self) -> Result<Namespaces> {
        let mut obtained = Namespaces::default();

        if self.parent_death_signal {
            request_parent_death_signal().tolerate();
        }

        if !self.privileged {
            self.enter_user_namespace()?;
            obtained.user = true;
        } else {
            log::debug!("running as root, skipping user namespace");
        }

        self.unshare_isolation(&mut obtained);

        if obtained.uts {
            self.set_names().tolerate();
        } else {
            log::warn!("no UTS namespace, leaving hostname untouched");
        }

        Ok(obtained)
    }

    /// unshare(CLONE_NEWUSER), then uid_map, setgroups=deny, gid_map.
    /// `setgroups` must be denied before the kernel accepts a gid_map.
    fn enter_user_namespace(&self) -> Result<()> {
        log::info!("creating user namespace");
        unshare(CloneFlags::CLONE_NEWUSER).map_err(|e| {
            RootboxError::Namespace(format!("unshare(CLONE_NEWUSER) failed: {}", e))
        })?;

        self.write_uid_map().tolerate();
        deny_setgroups().tolerate();
        self.write_gid_map().tolerate();
        Ok(())
    }

    fn write_uid_map(&self) -> Degradable {
        let line = self.uid_mapping().to_map_line();
        log::debug!("uid_map: {}", line.trim_end());
        write_control_file(Path::new("/proc/self/uid_map"), &line)
            .map_err(|e| Warning(RootboxError::Namespace(format!("uid_map: {}", e))))
    }

    fn write_gid_map(&self) -> Degradable {
        let line = self.gid_mapping().to_map_line();
        log::debug!("gid_map: {}", line.trim_end());
        write_control_file(Path::new("/proc/self/gid_map"), &line)
            .map_err(|e| Warning(RootboxError::Namespace(format!("gid_map: {}", e))))
    }

    /// Mount, PID and UTS together; if the kernel refuses the combination,
    /// fall back to each one alone so isolation degrades piecewise.
    fn unshare_isolation(&self, obtained: &mut Namespaces) {
        let all = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS;
        match unshare(all) {
            Ok(()) => {
                obtained.mount = true;
                obtained.pid = true;
                obtained.uts = true;
                return;
            }
            Err(e) => log::warn!("unshare(mount|pid|uts) failed: {}, trying one by one", e),
        }

        let wanted = [
            (CloneFlags::CLONE_NEWNS, "mount", &mut obtained.mount),
            (CloneFlags::CLONE_NEWPID, "pid", &mut obtained.pid),
            (CloneFlags::CLONE_NEWUTS, "uts", &mut obtained.uts),
        ];
        for (flag, name, slot) in wanted {
            match unshare(flag) {
                Ok(()) => *slot = true,
                Err(e) => log::warn!("unshare({}) failed: {}", name, e),
            }
        }
    }

    fn set_names(&self) -> Degradable {
        log::debug!("hostname: {}", self.hostname);
        sethostname(&self.hostname).map_err(|e| {
            Warning(RootboxError::Namespace(format!("sethostname failed: {}", e)))
        })?;

        let result = unsafe {
            libc::setdomainname(
                self.domainname.as_ptr() as *const libc::c_char,
                self.domainname.len(),
            )
        };
        if result != 0 {
            return Err(Warning(RootboxError::Namespace(format!(
                "setdomainname failed: {}",
                std::io::Error::last_os_error()
            ))));
        }
        Ok(())
    }
}

fn deny_setgroups() -> Degradable {
    write_control_file(Path::new("/proc/self/setgroups"), "deny\n")
        .map_err(|e| Warning(RootboxError::Namespace(format!("setgroups: {}", e))))
}

/// Ask the kernel to SIGKILL this process when its parent dies.
/// Cleared by fork, so the sandbox child requests it again.
pub fn request_parent_death_signal() -> Degradable {
    let result = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
    if result != 0 {
        return Err(Warning(RootboxError::Namespace(format!(
            "PR_SET_PDEATHSIG failed: {}",
            std::io::Error::last_os_error()
        ))));
    }
    Ok(())
}

/// Stop this process and its descendants from gaining privileges on exec
pub fn set_no_new_privs() -> Result<()> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(RootboxError::Namespace(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Check if namespace isolation is supported on this system
pub fn is_supported() -> bool {
    fs::read_dir("/proc/self/ns").is_ok()
}

/// Namespace identity of the current process, for diagnostics
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub user_namespace: String,
    pub mount_namespace: String,
    pub pid_namespace: String,
    pub uts_namespace: String,
}

impl NamespaceInfo {
    pub fn current() -> Self {
        Self {
            pid: getpid().as_raw() as u32,
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
            user_namespace: read_namespace_id("user"),
            mount_namespace: read_namespace_id("mnt"),
            pid_namespace: read_namespace_id("pid"),
            uts_namespace: read_namespace_id("uts"),
        }
    }
}

/// Read namespace ID from /proc/self/ns/
fn read_namespace_id(ns_type: &str) -> String {
    match fs::read_link(format!("/proc/self/ns/{}", ns_type)) {
        Ok(link) => link.to_string_lossy().to_string(),
        Err(_) => "unknown".to_string(),
    }
}

impl std::fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PID: {}, UID: {}, GID: {}, Namespaces: [User: {}, Mount: {}, PID: {}, UTS: {}]",
            self.pid,
            self.uid,
            self.gid,
            self.user_namespace,
            self.mount_namespace,
            self.pid_namespace,
            self.uts_namespace
        )
    }
}
