// stackvault/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};
use std::time::{Duration, UNIX_EPOCH};
use tar::{Archive, Builder, Entry};
use walkdir::WalkDir;

use crate::errors::{AppError, Result as AppResult};

/// Serializes a directory tree to a single artifact and back.
pub trait ArchiveEngine: Send + Sync {
    fn capture(&self, source_dir: &Path, dest_file: &Path, compressed: bool) -> AppResult<()>;

    /// Unpacks into `dest_dir`, which must already exist and be empty.
    fn restore(&self, src_file: &Path, dest_dir: &Path, compressed: bool) -> AppResult<()>;

    /// Reads the whole artifact without writing anything, failing on truncation or corruption.
    fn verify(&self, src_file: &Path, compressed: bool) -> AppResult<()>;
}

/// tar archives, gzip-compressed when requested.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchiver;

impl ArchiveEngine for TarArchiver {
    fn capture(&self, source_dir: &Path, dest_file: &Path, compressed: bool) -> AppResult<()> {
        create_tar_archive(source_dir, dest_file, compressed).map_err(AppError::archive)
    }

    fn restore(&self, src_file: &Path, dest_dir: &Path, compressed: bool) -> AppResult<()> {
        extract_tar_archive(src_file, dest_dir, compressed).map_err(AppError::archive)
    }

    fn verify(&self, src_file: &Path, compressed: bool) -> AppResult<()> {
        verify_tar_archive(src_file, compressed)
            .map(|_| ())
            .map_err(AppError::archive)
    }
}

fn open_reader(archive_path: &Path, compressed: bool) -> Result<Box<dyn Read>> {
    if !archive_path.is_file() {
        return Err(anyhow::anyhow!(
            "Archive is not a file: {}",
            archive_path.display()
        ));
    }
    let archive_file = File::open(archive_path).with_context(|| {
        format!("Failed to open archive file: {}", archive_path.display())
    })?;
    let reader = BufReader::new(archive_file);
    Ok(if compressed {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    })
}

/// Creates a TAR archive (optionally gzipped) from a source directory.
///
/// Paths inside the archive are relative to `source_dir`. Symlinks are stored
/// as links, and permission bits and modification times are recorded.
pub fn create_tar_archive(source_dir: &Path, archive_dest_path: &Path, compressed: bool) -> Result<()> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }

    tracing::debug!(
        source = %source_dir.display(),
        dest = %archive_dest_path.display(),
        compressed,
        "creating archive"
    );

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!(
            "Failed to create archive file: {}",
            archive_dest_path.display()
        )
    })?;
    let writer = BufWriter::new(archive_file);

    if compressed {
        let mut tar_builder = Builder::new(GzEncoder::new(writer, Compression::default()));
        append_tree(&mut tar_builder, source_dir)?;
        let encoder = tar_builder.into_inner().with_context(|| {
            format!("Failed to finish tar stream for archive: {}", archive_dest_path.display())
        })?;
        // finish() writes the gzip trailer; relying on Drop would swallow its errors.
        let mut writer = encoder.finish().with_context(|| {
            format!(
                "Failed to finish Gzip encoding for archive: {}",
                archive_dest_path.display()
            )
        })?;
        writer.flush()?;
    } else {
        let mut tar_builder = Builder::new(writer);
        append_tree(&mut tar_builder, source_dir)?;
        let mut writer = tar_builder.into_inner().with_context(|| {
            format!("Failed to finish tar stream for archive: {}", archive_dest_path.display())
        })?;
        writer.flush()?;
    }
    Ok(())
}

fn append_tree<W: Write>(tar_builder: &mut Builder<W>, source_dir: &Path) -> Result<()> {
    tar_builder.follow_symlinks(false);

    // WalkDir yields parents before children, so directories exist before their files on extract.
    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            )
        })?;

        if name.as_os_str().is_empty() {
            // The root travels as "." so restore can give the target directory its mode and mtime.
            tar_builder.append_dir(".", path).with_context(|| {
                format!("Failed to append root directory {} to archive", path.display())
            })?;
            continue;
        }

        tar_builder.append_path_with_name(path, name).with_context(|| {
            format!("Failed to append {} as {} to archive", path.display(), name.display())
        })?;
    }
    Ok(())
}

/// Extracts a TAR archive (optionally gzipped) into an existing, empty directory.
///
/// Directory attributes are applied after their contents are in place, and the
/// archive's root entry carries the mode and mtime of `extract_to_dir` itself.
pub fn extract_tar_archive(archive_path: &Path, extract_to_dir: &Path, compressed: bool) -> Result<()> {
    if !extract_to_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Extraction target is not a directory: {}",
            extract_to_dir.display()
        ));
    }
    let not_empty = fs::read_dir(extract_to_dir)
        .with_context(|| format!("Failed to read extraction directory: {}", extract_to_dir.display()))?
        .next()
        .is_some();
    if not_empty {
        return Err(anyhow::anyhow!(
            "Extraction target is not empty: {}",
            extract_to_dir.display()
        ));
    }

    tracing::debug!(
        archive = %archive_path.display(),
        dest = %extract_to_dir.display(),
        compressed,
        "extracting archive"
    );

    let mut archive = open_archive(archive_path, compressed)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(false);

    let mut data_end = 0;
    let mut root_attributes = None;
    {
        let entries = archive
            .entries()
            .with_context(|| format!("Failed to read entries of {}", archive_path.display()))?;
        let mut directories = Vec::new();
        for entry in entries {
            let mut entry = entry
                .with_context(|| format!("Corrupt entry header in {}", archive_path.display()))?;
            data_end = data_end.max(entry_end(&entry));

            if is_archive_root(&entry)? {
                let header = entry.header();
                root_attributes = Some((header.mode()?, header.mtime()?));
            } else if entry.header().entry_type().is_dir() {
                directories.push(entry);
            } else {
                unpack_entry(&mut entry, extract_to_dir, archive_path)?;
            }
        }
        // Deepest first, so a read-only parent is locked down after its children exist.
        directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
        for mut dir in directories {
            unpack_entry(&mut dir, extract_to_dir, archive_path)?;
        }
    }
    ensure_end_marker(archive.into_inner(), data_end, archive_path)?;

    if let Some((mode, mtime)) = root_attributes {
        let modified = UNIX_EPOCH + Duration::from_secs(mtime);
        File::open(extract_to_dir)
            .and_then(|dir| dir.set_modified(modified))
            .with_context(|| format!("Failed to set mtime of {}", extract_to_dir.display()))?;
        fs::set_permissions(extract_to_dir, fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("Failed to set mode of {}", extract_to_dir.display()))?;
    }
    Ok(())
}

fn unpack_entry<R: Read>(entry: &mut Entry<'_, R>, dest_dir: &Path, archive_path: &Path) -> Result<()> {
    let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
    let unpacked = entry.unpack_in(dest_dir).with_context(|| {
        format!(
            "Failed to unpack '{}' from {} to {}",
            path,
            archive_path.display(),
            dest_dir.display()
        )
    })?;
    if !unpacked {
        tracing::warn!(entry = %path, "skipped archive entry pointing outside the destination");
    }
    Ok(())
}

/// Streams every entry of the archive to nowhere, checking that each body and the archive itself are complete.
pub fn verify_tar_archive(archive_path: &Path, compressed: bool) -> Result<u64> {
    let mut archive = open_archive(archive_path, compressed)?;
    let mut entries_seen = 0u64;
    let mut data_end = 0;

    let entries = archive
        .entries()
        .with_context(|| format!("Failed to read entries of {}", archive_path.display()))?;
    for entry in entries {
        let mut entry = entry
            .with_context(|| format!("Corrupt entry header in {}", archive_path.display()))?;
        data_end = data_end.max(entry_end(&entry));
        let expected = entry.size();
        let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
        let copied = io::copy(&mut entry, &mut io::sink())
            .with_context(|| format!("Failed to read '{}' from {}", path, archive_path.display()))?;
        if copied != expected {
            return Err(anyhow::anyhow!(
                "Archive {} is truncated: '{}' has {} of {} bytes",
                archive_path.display(),
                path,
                copied,
                expected
            ));
        }
        entries_seen += 1;
    }
    ensure_end_marker(archive.into_inner(), data_end, archive_path)?;

    if entries_seen == 0 {
        tracing::warn!(archive = %archive_path.display(), "archive contains no entries");
    }
    Ok(entries_seen)
}

const BLOCK_SIZE: u64 = 512;

/// Counts the bytes handed to the tar reader, so the end-of-archive marker can be located.
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

fn open_archive(archive_path: &Path, compressed: bool) -> Result<Archive<CountingReader<Box<dyn Read>>>> {
    let inner = open_reader(archive_path, compressed)?;
    Ok(Archive::new(CountingReader { inner, consumed: 0 }))
}

/// Offset just past an entry's data, padded to the block size.
fn entry_end<R: Read>(entry: &Entry<'_, R>) -> u64 {
    entry.raw_file_position() + entry.size().div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn is_archive_root<R: Read>(entry: &Entry<'_, R>) -> Result<bool> {
    Ok(entry.header().entry_type().is_dir()
        && entry
            .path()?
            .components()
            .all(|c| matches!(c, Component::CurDir)))
}

/// The tar reader stops quietly both at the zero-block marker and at a bare EOF on an
/// entry boundary. Only the marker means nothing was cut off.
fn ensure_end_marker<R: Read>(mut reader: CountingReader<R>, data_end: u64, archive_path: &Path) -> Result<()> {
    let truncated = || {
        anyhow::anyhow!(
            "Archive {} is truncated: end-of-archive marker missing after byte {}",
            archive_path.display(),
            data_end
        )
    };
    // With the marker present the reader has consumed exactly its first zero block.
    if reader.consumed != data_end + BLOCK_SIZE {
        return Err(truncated());
    }
    let mut block = [0u8; BLOCK_SIZE as usize];
    reader.read_exact(&mut block).map_err(|_| truncated())?;
    if block.iter().any(|b| *b != 0) {
        return Err(truncated());
    }
    // Drain the rest so a gzip trailer checksum is checked too.
    io::copy(&mut reader, &mut io::sink())
        .with_context(|| format!("Failed to read to the end of {}", archive_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::tempdir;

    fn sample_tree(root: &Path) -> Result<()> {
        fs::create_dir_all(root.join("apps/files"))?;
        fs::write(root.join("index.php"), b"<?php echo 'hi';")?;
        fs::write(root.join("apps/files/app.js"), vec![7u8; 64 * 1024])?;
        fs::create_dir_all(root.join("empty"))?;
        fs::set_permissions(root.join("index.php"), fs::Permissions::from_mode(0o640))?;
        symlink("index.php", root.join("link.php"))?;
        Ok(())
    }

    #[test]
    fn test_capture_and_restore_preserve_tree() -> Result<()> {
        for compressed in [true, false] {
            let src = tempdir()?;
            let out = tempdir()?;
            let dest = tempdir()?;
            sample_tree(src.path())?;
            fs::set_permissions(src.path(), fs::Permissions::from_mode(0o770))?;
            let artifact = out.path().join("installation.tar");

            TarArchiver.capture(src.path(), &artifact, compressed)?;
            TarArchiver.restore(&artifact, dest.path(), compressed)?;

            // The target directory itself takes the source root's mode and mtime.
            let root = fs::metadata(dest.path())?;
            assert_eq!(root.permissions().mode() & 0o777, 0o770);
            let root_drift = fs::metadata(src.path())?
                .modified()?
                .duration_since(root.modified()?)
                .unwrap_or_else(|e| e.duration());
            assert!(root_drift.as_secs() < 1);

            assert_eq!(fs::read(dest.path().join("index.php"))?, b"<?php echo 'hi';");
            assert_eq!(fs::read(dest.path().join("apps/files/app.js"))?.len(), 64 * 1024);
            assert!(dest.path().join("empty").is_dir());
            let mode = fs::metadata(dest.path().join("index.php"))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o640);
            assert_eq!(fs::read_link(dest.path().join("link.php"))?, Path::new("index.php"));

            let src_mtime = fs::metadata(src.path().join("apps/files/app.js"))?.modified()?;
            let dest_mtime = fs::metadata(dest.path().join("apps/files/app.js"))?.modified()?;
            let drift = src_mtime
                .duration_since(dest_mtime)
                .unwrap_or_else(|e| e.duration());
            assert!(drift.as_secs() < 1);
        }
        Ok(())
    }

    #[test]
    fn test_restore_requires_empty_destination() -> Result<()> {
        let src = tempdir()?;
        let dest = tempdir()?;
        sample_tree(src.path())?;
        let out = tempdir()?;
        let artifact = out.path().join("installation.tar.gz");
        TarArchiver.capture(src.path(), &artifact, true)?;

        fs::write(dest.path().join("stale.txt"), b"old")?;
        let err = TarArchiver.restore(&artifact, dest.path(), true).unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
        assert!(err.to_string().contains("not empty"));
        Ok(())
    }

    #[test]
    fn test_capture_missing_source_fails() -> Result<()> {
        let out = tempdir()?;
        let err = TarArchiver
            .capture(&out.path().join("missing"), &out.path().join("a.tar"), false)
            .unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
        Ok(())
    }

    #[test]
    fn test_verify_detects_truncation() -> Result<()> {
        let src = tempdir()?;
        let out = tempdir()?;
        sample_tree(src.path())?;
        let artifact = out.path().join("data.tar.gz");
        TarArchiver.capture(src.path(), &artifact, true)?;
        assert!(verify_tar_archive(&artifact, true)? >= 4);

        let bytes = fs::read(&artifact)?;
        fs::write(&artifact, &bytes[..bytes.len() / 2])?;
        assert!(matches!(TarArchiver.verify(&artifact, true), Err(AppError::Archive(_))));

        let dest = tempdir()?;
        assert!(TarArchiver.restore(&artifact, dest.path(), true).is_err());
        Ok(())
    }

    #[test]
    fn test_verify_detects_truncated_plain_tar() -> Result<()> {
        let src = tempdir()?;
        let out = tempdir()?;
        fs::write(src.path().join("big.bin"), vec![1u8; 100_000])?;
        let artifact = out.path().join("data.tar");
        TarArchiver.capture(src.path(), &artifact, false)?;

        let bytes = fs::read(&artifact)?;
        fs::write(&artifact, &bytes[..20_000])?;
        assert!(TarArchiver.verify(&artifact, false).is_err());
        Ok(())
    }

    #[test]
    fn test_plain_tar_cut_at_entry_boundary_is_rejected() -> Result<()> {
        let src = tempdir()?;
        let out = tempdir()?;
        fs::write(src.path().join("a.txt"), vec![b'a'; 1024])?;
        fs::write(src.path().join("b.txt"), vec![b'b'; 1024])?;
        let artifact = out.path().join("data.tar");
        TarArchiver.capture(src.path(), &artifact, false)?;
        TarArchiver.verify(&artifact, false)?;

        let bytes = fs::read(&artifact)?;
        // Root header, then a.txt header and body: the cut lands right before b.txt.
        let after_first_file = 512 + 512 + 1024;
        for cut in [512, after_first_file, bytes.len() - 1024, bytes.len() - 512] {
            let cut_artifact = out.path().join(format!("cut-{}.tar", cut));
            fs::write(&cut_artifact, &bytes[..cut])?;

            let err = TarArchiver.verify(&cut_artifact, false).unwrap_err();
            assert!(matches!(err, AppError::Archive(ref msg) if msg.contains("truncated")), "cut at {}", cut);

            let dest = tempdir()?;
            assert!(
                TarArchiver.restore(&cut_artifact, dest.path(), false).is_err(),
                "restore accepted archive cut at {}",
                cut
            );
        }
        Ok(())
    }

    #[test]
    fn test_trailing_garbage_after_entries_is_rejected() -> Result<()> {
        let src = tempdir()?;
        let out = tempdir()?;
        fs::write(src.path().join("a.txt"), b"alpha")?;
        let artifact = out.path().join("data.tar");
        TarArchiver.capture(src.path(), &artifact, false)?;

        let mut bytes = fs::read(&artifact)?;
        let marker = bytes.len() - 1024;
        bytes.truncate(marker + 512);
        bytes.extend(vec![0xAB; 512]);
        fs::write(&artifact, &bytes)?;
        assert!(TarArchiver.verify(&artifact, false).is_err());
        Ok(())
    }
}
