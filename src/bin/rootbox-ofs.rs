/// rootbox-ofs: overlayfs personality of rootbox.
///
/// Changes land in a scratch upper layer that is deleted on exit, or in the
/// directory given with `-p` when they should persist.
fn main() {
    if !cfg!(target_os = "linux") {
        eprintln!("rootbox-ofs: Linux namespaces are required");
        std::process::exit(rootbox::types::EXIT_FAILURE);
    }
    std::process::exit(rootbox::launch(std::env::args_os()));
}
