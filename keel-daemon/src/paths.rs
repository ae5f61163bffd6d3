use std::path::{Path, PathBuf};

pub use keel_core::config::keel_root;

pub const DAEMON_SOCKET: &str = "keel.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    keel_root(home).join(DAEMON_SOCKET)
}
