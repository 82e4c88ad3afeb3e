//! Atomic file replacement for small JSON state files
//!
//! Both the OAuth credential files and the request counter file are rewritten
//! in full on every mutation. Writing to a sibling temp file and renaming it
//! over the target means a reader never observes a half-written file.

use std::path::Path;

use tracing::debug;

/// Write `contents` to `path` atomically with 0600 permissions.
///
/// The temp file name carries a random suffix so concurrent writers in the
/// same process never share a temp path; the last rename wins.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp_path = dir.join(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().as_simple()
    ));

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!(path = %path.display(), bytes = contents.len(), "persisted file");
    Ok(())
}
