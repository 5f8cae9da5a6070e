use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Directory under the sync root holding in-progress downloads.
pub const TEMP_DIR_NAME: &str = ".cumulus-tmp";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("{0} is outside the sync root")]
    OutsideRoot(PathBuf),
}

/// Maps a `/`-separated remote path onto the local sync root.
pub fn local_path_for(sync_root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = sync_root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(remote_path.to_string()));
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]; `/` for the root itself.
pub fn remote_path_for(sync_root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(sync_root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            _ => return Err(PathError::OutsideRoot(local.to_path_buf())),
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Paths the daemon itself owns and never syncs.
pub fn is_internal(remote_path: &str) -> bool {
    remote_path
        .trim_start_matches('/')
        .split('/')
        .next()
        .is_some_and(|first| first == TEMP_DIR_NAME)
}
