/// Process supervisor: namespace setup, fork, the child's path to exec and
/// the parent's bridge/wait/teardown sequence
use crate::cli::{self, ParsedArgs, Resolution};
use crate::config::Config;
use crate::filesystem::{MountOrchestrator, MountSet};
use crate::logging;
use crate::namespace::{self, NamespaceInfo, NamespaceSetup, Namespaces};
use crate::overlay::OverlayPlan;
use crate::pty::{self, attach_slave, Bridge, BridgeExit, PtyPair, RawModeGuard};
use crate::types::{
    Invocation, Personality, Result, RootboxError, Tolerate, EXIT_FAILURE, EXIT_SIGNALED,
    EXIT_SUCCESS,
};
use anyhow::Context;
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::sys::wait::{waitpid, WaitStatus};
#[cfg(unix)]
use nix::unistd::{execvp, fork, ForkResult, Pid};

/// Where the supervisor is in a sandbox run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    PtyAllocated,
    NamespacesReady,
    Forked,
    ChildSetup,
    Executing,
    Bridging,
    Waiting,
    TearingDown,
    Finished(i32),
}

/// The two sides of the fork, each holding only what it needs
pub enum Branch {
    Parent { child: Pid, master: OwnedFd },
    Child { slave: OwnedFd },
}

/// Drives one sandbox run
pub struct Supervisor {
    invocation: Invocation,
    config: Config,
    overlay: Option<OverlayPlan>,
    state: SupervisorState,
}

impl Supervisor {
    /// Overlay paths are planned here, before fork, from the host PID
    pub fn new(invocation: Invocation, config: Config) -> Self {
        let overlay = OverlayPlan::for_invocation(&invocation, &config.overlay.scratch_dir);
        Self {
            invocation,
            config,
            overlay,
            state: SupervisorState::Init,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn overlay(&self) -> Option<&OverlayPlan> {
        self.overlay.as_ref()
    }

    fn transition(&mut self, next: SupervisorState) {
        log::debug!("supervisor: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the sandbox and return the exit code for the runtime.
    ///
    /// In the child this only returns on failure; on success the process
    /// image is replaced by the command.
    pub fn run(mut self) -> Result<i32> {
        log::info!(
            "{} mode, root {}",
            self.invocation.mode.describe(),
            self.invocation.image_path.display()
        );

        let pty = PtyPair::allocate(&self.config.pty)?;
        self.transition(SupervisorState::PtyAllocated);

        let namespaces =
            NamespaceSetup::new(self.invocation.personality, &self.config).apply()?;
        log::debug!("namespaces: {:?}", namespaces);
        log::debug!("{}", NamespaceInfo::current());
        self.transition(SupervisorState::NamespacesReady);

        pty::install_signal_handlers()?;

        match fork_branch(pty)? {
            Branch::Child { slave } => {
                self.transition(SupervisorState::ChildSetup);
                match self.run_child(namespaces, slave)? {}
            }
            Branch::Parent { child, master } => {
                self.transition(SupervisorState::Forked);
                log::debug!("child pid {}", child);
                self.run_parent(child, master)
            }
        }
    }

    fn run_child(&mut self, namespaces: Namespaces, slave: OwnedFd) -> Result<Infallible> {
        if self.config.security.parent_death_signal {
            namespace::request_parent_death_signal().tolerate();
        }

        let mut mounts = MountSet::new();
        if namespaces.mount {
            MountOrchestrator::make_private().tolerate();
        } else {
            log::warn!("no mount namespace, skipping sandbox mounts");
        }

        let root: PathBuf = match &self.overlay {
            Some(plan) => {
                plan.setup(&mut mounts)?;
                plan.merged.clone()
            }
            None => self.invocation.image_path.clone(),
        };

        if namespaces.mount {
            MountOrchestrator::new(&self.config.mounts).setup(&root, &mut mounts);
        }
        log::debug!("mounts: {:?}", mounts.entries());

        MountOrchestrator::chroot_into(&root)?;
        attach_slave(slave)?;

        if self.config.security.no_new_privs {
            namespace::set_no_new_privs()?;
        }

        pty::reset_signals_for_exec()?;
        self.transition(SupervisorState::Executing);
        exec_command(&self.invocation.command)
    }

    fn run_parent(&mut self, child: Pid, master: OwnedFd) -> Result<i32> {
        // Dropped in reverse: the terminal is restored before overlay teardown
        let _teardown = OverlayTeardown(self.overlay.clone());
        let mut terminal = RawModeGuard::enter();

        self.transition(SupervisorState::Bridging);
        let exit = match Bridge::new(master) {
            Ok(mut bridge) => bridge.run(),
            Err(e) => {
                log::warn!("cannot bridge terminal: {}", e);
                BridgeExit::Failed
            }
        };
        log::debug!("bridge finished: {:?}", exit);

        let forwarded = match exit {
            BridgeExit::Signaled(signal) => {
                forward_signal(child, signal);
                true
            }
            _ => false,
        };

        self.transition(SupervisorState::Waiting);
        let status = wait_for_child(child, forwarded);

        terminal.restore();
        self.transition(SupervisorState::TearingDown);

        let code = status?;
        self.transition(SupervisorState::Finished(code));
        Ok(code)
    }
}

/// Runs overlay teardown when the parent leaves `run_parent`, however it leaves
struct OverlayTeardown(Option<OverlayPlan>);

impl Drop for OverlayTeardown {
    fn drop(&mut self) {
        if let Some(plan) = self.0.take() {
            plan.teardown();
        }
    }
}

/// Fork, closing the PTY end the other side owns
pub fn fork_branch(pty: PtyPair) -> Result<Branch> {
    let PtyPair { master, slave } = pty;
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(slave);
            Ok(Branch::Parent { child, master })
        }
        Ok(ForkResult::Child) => {
            drop(master);
            Ok(Branch::Child { slave })
        }
        Err(e) => Err(RootboxError::Process(format!("fork failed: {}", e))),
    }
}

/// Replace the process image, searching PATH inside the new root
fn exec_command(command: &[OsString]) -> Result<Infallible> {
    let args = command
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RootboxError::Exec(format!("argument contains a NUL byte: {}", e)))?;
    let program = args
        .first()
        .ok_or_else(|| RootboxError::Exec("empty command".to_string()))?;

    log::debug!("exec {:?}", command);
    execvp(program, &args).map_err(|e| {
        RootboxError::Exec(format!("{}: {}", program.to_string_lossy(), e))
    })
}

fn forward_signal(child: Pid, signal: Signal) {
    log::debug!("forwarding {} to {}", signal, child);
    if let Err(e) = kill(child, signal) {
        log::warn!("failed to forward {} to child: {}", signal, e);
    }
}

/// Exit code the runtime reports for a child status, if it has terminated
pub fn exit_code_for(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => {
            log::debug!("child killed by {}", signal);
            Some(EXIT_SIGNALED)
        }
        _ => None,
    }
}

/// Reap the child. A signal that arrives while waiting is forwarded, unless
/// one was already forwarded: then the child is killed, since the sandbox's
/// PID 1 ignores signals it has no handler for.
fn wait_for_child(child: Pid, mut forwarded: bool) -> Result<i32> {
    loop {
        if let Some(signal) = pty::take_pending_signal() {
            forward_signal(child, escalation(signal, forwarded));
            forwarded = true;
        }
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = exit_code_for(status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(RootboxError::Process(format!(
                    "waitpid({}) failed: {}",
                    child, e
                )))
            }
        }
    }
}

/// Signal to send the child for a signal the runtime received
fn escalation(received: Signal, already_forwarded: bool) -> Signal {
    if already_forwarded {
        Signal::SIGKILL
    } else {
        received
    }
}

/// Resolve arguments, set up logging and configuration, run the sandbox.
/// Returns the process exit code; the binaries pass it to `exit`.
pub fn launch<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let prog = args
        .first()
        .map(|argv0| Personality::from_program(argv0))
        .unwrap_or(Personality::Direct)
        .name();

    let parsed = match cli::resolve(args) {
        Ok(Resolution::Run(parsed)) => parsed,
        Ok(Resolution::Info(text)) => {
            print!("{}", text);
            return EXIT_SUCCESS;
        }
        Err(e) => {
            eprintln!("{}: {}", prog, e.to_string().trim_end());
            return e.exit_code();
        }
    };

    logging::init(prog, parsed.common.verbose);

    match run_parsed(parsed) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            e.downcast_ref::<RootboxError>()
                .map_or(EXIT_FAILURE, RootboxError::exit_code)
        }
    }
}

fn run_parsed(parsed: ParsedArgs) -> anyhow::Result<i32> {
    let config = Config::load(parsed.common.config.as_deref())?;
    let program = parsed.invocation.program().to_string_lossy().into_owned();
    let code = Supervisor::new(parsed.invocation, config)
        .run()
        .with_context(|| format!("failed to run {}", program))?;
    Ok(code)
}
