/// rootbox: chroot into a root directory inside fresh user, mount, PID and
/// UTS namespaces, with the command attached to its own pseudo-terminal.
///
/// # Usage
/// ```bash
/// rootbox /images/debian -- /bin/sh
/// rootbox-ofs /images/debian -p /var/lib/penv/persist/dev -- /bin/sh
/// ```
///
/// The same program serves both modes: invoked as `rootbox-ofs` it mounts an
/// overlay over the root directory instead of using it directly.
fn main() {
    if !cfg!(target_os = "linux") {
        eprintln!("rootbox: Linux namespaces are required");
        std::process::exit(rootbox::types::EXIT_FAILURE);
    }
    std::process::exit(rootbox::launch(std::env::args_os()));
}
