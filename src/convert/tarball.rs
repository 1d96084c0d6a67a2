//! Root filesystem tarball.
//!
//! Entries are written with paths relative to the root filesystem, in sorted
//! order, owned by root. Directories, regular files and symlinks are kept;
//! sockets, fifos and device nodes are skipped.

use crate::error::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tracing::debug;

/// Writes `rootfs` as a tar archive at `output`. Returns the entry count.
pub fn write(rootfs: &Path, output: &Path) -> Result<usize> {
    let file = File::create(output)?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    let mut count = 0;
    append_dir(&mut builder, rootfs, Path::new(""), &mut count)?;

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    debug!("Wrote {} tar entries to {}", count, output.display());
    Ok(count)
}

fn append_dir<W: Write>(
    builder: &mut Builder<W>,
    dir: &Path,
    relative: &Path,
    count: &mut usize,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        let path = entry.path();
        let rel = relative.join(&name);
        let meta = fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();

        let mut header = Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root")?;
        header.set_groupname("root")?;
        header.set_mode(mode(&meta));
        header.set_mtime(
            meta.modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs()),
        );

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &rel, std::io::empty())?;
            *count += 1;
            append_dir(builder, &path, &rel, count)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
            *count += 1;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let file = File::open(&path)?;
            builder.append_data(&mut header, &rel, file)?;
            *count += 1;
        } else {
            debug!("Skipping special file {}", rel.display());
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_relative_and_sorted() {
        let root = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("b/c")).unwrap();
        fs::write(root.path().join("b/c/file"), b"data").unwrap();
        fs::write(root.path().join("a"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a", root.path().join("link")).unwrap();

        let out = tempfile::TempDir::new().unwrap();
        let tar_path = out.path().join("rootfs.tar");
        write(root.path(), &tar_path).unwrap();

        let mut archive = tar::Archive::new(File::open(&tar_path).unwrap());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 0);
            assert_eq!(entry.header().username().unwrap(), Some("root"));
            names.push(entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string());
        }

        #[cfg(unix)]
        assert_eq!(names, vec!["a", "b", "b/c", "b/c/file", "link"]);
        #[cfg(not(unix))]
        assert_eq!(names, vec!["a", "b", "b/c", "b/c/file"]);
    }
}
