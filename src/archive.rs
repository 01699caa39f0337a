//! Canonical gzip-compressed tar archives.
//!
//! Packing walks the directory in sorted order and normalizes every header
//! (mtime 0, uid/gid 0, mode 0644 or 0755, symlinks preserved), so packing the
//! same tree twice yields byte-identical archives and therefore identical
//! blob digests. Unpacking refuses entries that would land outside the
//! destination directory.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

/// Errors for archive operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Path is not within archive root: {0}")]
    PathNotInRoot(PathBuf),

    #[error("Archive entry escapes destination: {0}")]
    UnsafeEntry(PathBuf),
}

/// Result type for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Pack the contents of `root` into a gzip tar at `dest`.
///
/// Entries are relative to `root`; `root` itself is not an entry.
pub fn pack_dir(root: &Path, dest: &Path) -> ArchiveResult<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        let path = entry.path();

        let rel_path = path
            .strip_prefix(root)
            .map_err(|_| ArchiveError::PathNotInRoot(path.to_path_buf()))?;

        // Skip root itself
        if rel_path.as_os_str().is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        let mut header = canonical_header();

        if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, rel_path, &target)?;
        } else if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, rel_path, io::empty())?;
        } else {
            let contents = fs::read(path)?;
            header.set_entry_type(EntryType::Regular);
            // Preserve executable bit, normalize others
            header.set_mode(if is_executable(path) { 0o755 } else { 0o644 });
            header.set_size(contents.len() as u64);
            builder.append_data(&mut header, rel_path, contents.as_slice())?;
        }
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

/// Unpack the gzip tar at `archive` into `dest`, creating `dest` if needed.
pub fn unpack(archive: &Path, dest: &Path) -> ArchiveResult<()> {
    fs::create_dir_all(dest)?;

    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !entry.unpack_in(dest)? {
            return Err(ArchiveError::UnsafeEntry(path));
        }
    }

    Ok(())
}

fn canonical_header() -> Header {
    let mut header = Header::new_gnu();
    header.set_mtime(0); // Epoch
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_tree(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::create_dir_all(dir.join("lib/ruby")).unwrap();
        fs::write(dir.join("bin/ruby"), "#!/bin/sh\necho ruby\n").unwrap();
        fs::write(dir.join("lib/ruby/core.rb"), "puts 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.join("bin/ruby"), fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn test_pack_and_unpack() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);

        let archive = temp.path().join("out.tgz");
        pack_dir(&src, &archive).unwrap();

        let dest = temp.path().join("dest");
        unpack(&archive, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("lib/ruby/core.rb")).unwrap(),
            "puts 1\n"
        );
        if cfg!(unix) {
            assert!(is_executable(&dest.join("bin/ruby")));
        }
    }

    #[test]
    fn test_packing_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);

        let first = temp.path().join("first.tgz");
        let second = temp.path().join("second.tgz");
        pack_dir(&src, &first).unwrap();

        // Touch a file so mtimes differ between the two packs
        fs::write(src.join("lib/ruby/core.rb"), "puts 1\n").unwrap();
        pack_dir(&src, &second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_content_change_changes_archive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);

        let first = temp.path().join("first.tgz");
        let second = temp.path().join("second.tgz");
        pack_dir(&src, &first).unwrap();
        fs::write(src.join("lib/ruby/core.rb"), "puts 2\n").unwrap();
        pack_dir(&src, &second).unwrap();

        assert_ne!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_preserved() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);
        std::os::unix::fs::symlink("bin/ruby", src.join("ruby")).unwrap();

        let archive = temp.path().join("out.tgz");
        pack_dir(&src, &archive).unwrap();

        let dest = temp.path().join("dest");
        unpack(&archive, &dest).unwrap();
        assert_eq!(
            fs::read_link(dest.join("ruby")).unwrap(),
            PathBuf::from("bin/ruby")
        );
    }

    #[test]
    fn test_not_an_archive() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.tgz");
        fs::write(&bogus, "plain text").unwrap();

        let result = unpack(&bogus, &temp.path().join("dest"));
        assert!(result.is_err());
    }
}
