//! Fetching application sources into the install path.

use crate::error::{Error, Result};
use crate::script::has_scripts;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Cloned with git
    Git(String),
    /// Copied from a local directory
    Local(PathBuf),
}

impl SourceLocation {
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        let looks_remote = trimmed.starts_with("https://")
            || trimmed.starts_with("http://")
            || trimmed.starts_with("git@")
            || trimmed.starts_with("ssh://")
            || trimmed.ends_with(".git");
        if looks_remote && !Path::new(trimmed).is_dir() {
            SourceLocation::Git(trimmed.to_string())
        } else {
            SourceLocation::Local(PathBuf::from(trimmed))
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceLocation::Git(url) => write!(f, "{}", url),
            SourceLocation::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// How the install path was populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    Cloned,
    Copied,
    /// The install path already held scripts and was left as is
    Reused,
}

/// Make sure `dest` holds the application's sources.
pub async fn fetch(source: &SourceLocation, dest: &Path) -> Result<Fetched> {
    if dest.is_dir() && has_scripts(dest) {
        tracing::debug!(path = %dest.display(), "Install path already populated, reusing");
        return Ok(Fetched::Reused);
    }
    if dest.exists() && !is_empty_dir(dest)? {
        return Err(Error::Filesystem(format!(
            "'{}' exists but contains no install or start script",
            dest.display()
        )));
    }

    let source = source.clone();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || match &source {
        SourceLocation::Git(url) => {
            tracing::info!(url = %url, path = %dest.display(), "Cloning");
            git2::build::RepoBuilder::new().clone(url, &dest)?;
            Ok(Fetched::Cloned)
        }
        SourceLocation::Local(from) => {
            if !from.is_dir() {
                return Err(Error::Filesystem(format!(
                    "source '{}' is not a directory",
                    from.display()
                )));
            }
            tracing::info!(from = %from.display(), path = %dest.display(), "Copying");
            copy_dir(from, &dest)?;
            Ok(Fetched::Copied)
        }
    })
    .await
    .map_err(|e| Error::Filesystem(format!("source fetch task failed: {}", e)))?
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(std::fs::read_dir(path)?.next().is_none())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(&link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source() {
        assert_eq!(
            SourceLocation::parse("https://github.com/cocktailpeanut/comfyui.pinokio.git"),
            SourceLocation::Git("https://github.com/cocktailpeanut/comfyui.pinokio.git".into())
        );
        assert_eq!(
            SourceLocation::parse("/srv/scripts/fooocus"),
            SourceLocation::Local(PathBuf::from("/srv/scripts/fooocus"))
        );
    }

    #[tokio::test]
    async fn test_copy_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("src");
        std::fs::create_dir_all(from.join("sub")).unwrap();
        std::fs::write(from.join("install.json"), "[]").unwrap();
        std::fs::write(from.join("sub/readme.txt"), "hi").unwrap();

        let dest = dir.path().join("apps/demo");
        let source = SourceLocation::Local(from);
        assert_eq!(fetch(&source, &dest).await.unwrap(), Fetched::Copied);
        assert!(dest.join("sub/readme.txt").is_file());
        assert_eq!(fetch(&source, &dest).await.unwrap(), Fetched::Reused);
    }

    #[tokio::test]
    async fn test_populated_dir_without_scripts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("random.txt"), "x").unwrap();
        let source = SourceLocation::Local(PathBuf::from("/nowhere"));
        assert!(fetch(&source, dir.path()).await.is_err());
    }
}
