//! Exposes downloaded files in the media library without copying them.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    /// Something already exists at the destination; it was left alone.
    Skipped,
}

/// Links `source` into `media_dir` under the same file name, skipping when the
/// name is already taken.
pub fn link_into(source: &Path, media_dir: &Path) -> io::Result<LinkOutcome> {
    let file_name = source.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", source.display()),
        )
    })?;
    fs::create_dir_all(media_dir)?;
    let destination: PathBuf = media_dir.join(file_name);

    if destination.symlink_metadata().is_ok() {
        debug!(destination = %destination.display(), "hardlink target exists, skipping");
        return Ok(LinkOutcome::Skipped);
    }

    match fs::hard_link(source, &destination) {
        Ok(()) => Ok(LinkOutcome::Linked),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(LinkOutcome::Skipped),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    #[test]
    fn links_share_an_inode() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        fs::write(&source, b"data").unwrap();
        let media = dir.path().join("media");

        assert_eq!(link_into(&source, &media).unwrap(), LinkOutcome::Linked);
        let linked = media.join("clip.mp4");
        assert_eq!(
            fs::metadata(&source).unwrap().ino(),
            fs::metadata(&linked).unwrap().ino()
        );
    }

    #[test]
    fn existing_destination_is_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        fs::write(&source, b"new").unwrap();
        let media = dir.path().join("media");
        fs::create_dir_all(&media).unwrap();
        fs::write(media.join("clip.mp4"), b"old").unwrap();

        assert_eq!(link_into(&source, &media).unwrap(), LinkOutcome::Skipped);
        assert_eq!(fs::read(media.join("clip.mp4")).unwrap(), b"old");
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(link_into(&dir.path().join("ghost.mp4"), &dir.path().join("media")).is_err());
    }
}
