//! Named network namespace links.

use std::path::{Path, PathBuf};

use dovesnap_common::{DovesnapPaths, DovesnapResult};

/// Create the netns directory if missing.
pub fn ensure_netns_dir(dir: &Path) -> DovesnapResult<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Link a process's network namespace as `<netns dir>/<name>` so that
/// `ip netns exec <name>` can enter it. An existing link is replaced.
pub fn link_netns(paths: &DovesnapPaths, pid: i64, name: &str) -> DovesnapResult<PathBuf> {
    let target = DovesnapPaths::proc_netns(pid);
    let link = paths.netns_link(name);
    tracing::debug!(link = %link.display(), target = %target.display(), "Linking netns");

    if link.symlink_metadata().is_ok() {
        tracing::debug!(link = %link.display(), "Remove existing");
        std::fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(&target, &link)?;
    Ok(link)
}

/// Remove a link created by [`link_netns`]. A missing link is not an error.
pub fn unlink_netns(link: &Path) -> DovesnapResult<()> {
    match std::fs::remove_file(link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
