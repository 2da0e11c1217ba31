use crate::{PreviewError, Result};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// macOS sun_path limit; the socket path must stay under it.
pub const MAX_SUN_PATH_LEN: usize = 104;

/// Resolved once per process: `$PREVIEWD_CACHE_DIR` override, else
/// `~/Library/Caches/previewd`.
static CACHE_BASE: Lazy<PathBuf> = Lazy::new(|| {
    if let Some(dir) = std::env::var_os("PREVIEWD_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join("Library").join("Caches").join("previewd")
});

/// Deterministic per-(project, device) path scheme.
///
/// `root` and `build` are shared by every stream of a project; `session`
/// and its children are private to one (project, device) pair. The socket
/// lives directly under `root` to keep it short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewDirs {
    pub root: PathBuf,
    pub build: PathBuf,
    pub session: PathBuf,
    pub thunk: PathBuf,
    pub loader: PathBuf,
    pub staging: PathBuf,
    pub socket: PathBuf,
}

fn cache_base() -> &'static Path {
    &CACHE_BASE
}

fn project_hash(project_key: &str) -> String {
    let digest = Sha256::digest(project_key.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

impl PreviewDirs {
    pub fn new(project_key: &str, udid: &str) -> Result<Self> {
        let root = cache_base().join(project_hash(project_key));
        let session = root.join("devices").join(udid);
        let socket = root.join("s.sock");
        if socket.as_os_str().len() >= MAX_SUN_PATH_LEN {
            return Err(PreviewError::ConfigInvalid(format!(
                "socket path too long for a Unix domain socket ({} >= {} bytes): {}",
                socket.as_os_str().len(),
                MAX_SUN_PATH_LEN,
                socket.display()
            )));
        }
        Ok(Self {
            build: root.join("build"),
            thunk: session.join("thunk"),
            loader: session.join("loader"),
            staging: session.join("staging"),
            root,
            session,
            socket,
        })
    }

    /// Creates every directory a stream writes into.
    pub fn ensure_created(&self) -> Result<()> {
        for dir in [&self.build, &self.thunk, &self.loader, &self.staging] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// The injection target watched by the host-side loader.
    pub fn current_dylib(&self) -> PathBuf {
        self.thunk.join("current.dylib")
    }
}
