// crates/forkserver/src/image.rs
use std::env;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

/// Overrides where the helper binary is looked up.
pub const HELPER_PATH_ENV: &str = "SANDFORK_HELPER_PATH";

pub const HELPER_BIN_NAME: &str = "sandfork-helper";

/// Source of the helper binary image the launcher executes.
pub trait HelperImage: Send + Sync {
    fn open_image(&self) -> io::Result<OwnedFd>;
}

/// Resolves the helper binary installed next to the current executable,
/// unless [`HELPER_PATH_ENV`] points somewhere else.
#[derive(Debug, Default)]
pub struct InstalledImage;

impl InstalledImage {
    fn resolve(&self) -> io::Result<PathBuf> {
        if let Some(path) = env::var_os(HELPER_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let exe = env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "current executable has no parent directory",
            )
        })?;
        Ok(dir.join(HELPER_BIN_NAME))
    }
}

impl HelperImage for InstalledImage {
    fn open_image(&self) -> io::Result<OwnedFd> {
        let path = self.resolve()?;
        // File::open sets close-on-exec; fexecve is fine with that.
        let file = File::open(&path)
            .map_err(|err| io::Error::new(err.kind(), format!("{}: {err}", path.display())))?;
        Ok(file.into())
    }
}
