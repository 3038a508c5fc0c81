/// Default file locations, resolved through the platform's environment
/// conventions.
use std::env;
use std::path::PathBuf;

use crate::error::Result;

/// Default public key file name inside the config directory.
pub const PUBLIC_KEY_FILE: &str = "enchive.pub";
/// Default secret key file name inside the config directory.
pub const SECRET_KEY_FILE: &str = "enchive.sec";
/// Suffix appended to archive output files and stripped on extraction.
pub const ARCHIVE_SUFFIX: &str = ".enchive";

/// The per-user config directory, created with owner-only permissions if
/// missing: `$XDG_CONFIG_HOME/enchive`, else `$HOME/.config/enchive`.
#[cfg(not(windows))]
pub fn storage_directory() -> Result<PathBuf> {
    use crate::error::EnchiveError;

    let base = match env::var_os("XDG_CONFIG_HOME") {
        Some(dir) => {
            let dir = PathBuf::from(dir);
            if !dir.is_absolute() {
                return Err(EnchiveError::BadArgument(
                    "$XDG_CONFIG_HOME is not absolute".into(),
                ));
            }
            dir
        }
        None => {
            let home = env::var_os("HOME").ok_or_else(|| {
                EnchiveError::NotFound("no $HOME or $XDG_CONFIG_HOME, giving up".into())
            })?;
            let home = PathBuf::from(home);
            if !home.is_absolute() {
                return Err(EnchiveError::BadArgument("$HOME is not absolute".into()));
            }
            home.join(".config")
        }
    };

    let dir = base.join("enchive");
    create_private_dir(&dir)?;
    Ok(dir)
}

/// The per-user config directory under `%APPDATA%`.
#[cfg(windows)]
pub fn storage_directory() -> Result<PathBuf> {
    use crate::error::EnchiveError;

    let appdata = env::var_os("APPDATA")
        .ok_or_else(|| EnchiveError::NotFound("$APPDATA is unset".into()))?;
    let dir = PathBuf::from(appdata).join("enchive");
    create_private_dir(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
fn create_private_dir(dir: &std::path::Path) -> Result<()> {
    use crate::error::EnchiveError;
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| EnchiveError::Open {
            path: dir.to_path_buf(),
            source: e,
        })
}

#[cfg(not(unix))]
fn create_private_dir(dir: &std::path::Path) -> Result<()> {
    use crate::error::EnchiveError;

    std::fs::create_dir_all(dir).map_err(|e| EnchiveError::Open {
        path: dir.to_path_buf(),
        source: e,
    })
}

pub fn default_public_key_file() -> Result<PathBuf> {
    Ok(storage_directory()?.join(PUBLIC_KEY_FILE))
}

pub fn default_secret_key_file() -> Result<PathBuf> {
    Ok(storage_directory()?.join(SECRET_KEY_FILE))
}

/// The directory hosting agent sockets: the first set of
/// `$XDG_RUNTIME_DIR`, `$TMPDIR`, else `/tmp`.
#[cfg(unix)]
pub fn runtime_directory() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .or_else(|| env::var_os("TMPDIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
