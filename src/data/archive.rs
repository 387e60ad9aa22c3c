//! Directory <-> tar.gz codec
//!
//! Used for whole-tree backup/restore. Symlinks are stored as symlinks, never
//! followed. Long names go through the GNU long-name extension.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{EntryType, Header, HeaderMode};
use thiserror::Error;

/// Fallback when the page size cannot be queried
const DEFAULT_COPY_BUFFER: usize = 4096;

/// Owner-executable permission bit
const OWNER_EXEC: u32 = 0o100;

/// Archive errors. Any I/O failure aborts the whole pack/unpack.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Copy buffer size: one memory page
pub fn copy_buffer_size() -> usize {
    use nix::unistd::{sysconf, SysconfVar};

    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|v| usize::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_COPY_BUFFER)
}

/// Stream `reader` into `writer` through a page-sized buffer
pub fn copy_stream<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; copy_buffer_size()];
    let mut total = 0u64;
    loop {
        let len = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..len])?;
        total += len as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// A relative path that cannot climb out of the extraction root
pub fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Stateless tar.gz packer/unpacker
pub struct Archiver;

impl Archiver {
    /// Pack the tree under `source_dir` into a gzip-compressed tar at `dest_archive`.
    ///
    /// The root directory itself gets no entry; every path is relative to it.
    pub fn pack(source_dir: &Path, dest_archive: &Path) -> Result<(), ArchiveError> {
        tracing::info!(
            "Packing {} into {}",
            source_dir.display(),
            dest_archive.display()
        );

        let file = File::create(dest_archive).map_err(ArchiveError::io(dest_archive))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        pack_recursive(source_dir, source_dir, &mut builder)?;

        let encoder = builder
            .into_inner()
            .map_err(ArchiveError::io(dest_archive))?;
        encoder.finish().map_err(ArchiveError::io(dest_archive))?;
        Ok(())
    }

    /// Extract `archive` into `dest_dir`, creating it if needed.
    ///
    /// Partially extracted content is left in place on failure.
    pub fn unpack(archive: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
        tracing::info!("Unpacking {} into {}", archive.display(), dest_dir.display());

        fs::create_dir_all(dest_dir).map_err(ArchiveError::io(dest_dir))?;

        let file = File::open(archive).map_err(ArchiveError::io(archive))?;
        let decoder = GzDecoder::new(BufReader::with_capacity(copy_buffer_size(), file));
        let mut tar = tar::Archive::new(decoder);

        for entry in tar.entries().map_err(ArchiveError::io(archive))? {
            let mut entry = entry.map_err(ArchiveError::io(archive))?;
            let rel = entry
                .path()
                .map_err(ArchiveError::io(archive))?
                .into_owned();
            if !is_safe_relative(&rel) {
                tracing::warn!("Skipping unsafe archive entry: {}", rel.display());
                continue;
            }
            let out = dest_dir.join(&rel);
            let kind = entry.header().entry_type();

            // A link extracted earlier must not redirect later entries outside dest_dir
            if crosses_symlink(dest_dir, &rel, kind != EntryType::Symlink) {
                tracing::warn!("Skipping archive entry below a symlink: {}", rel.display());
                continue;
            }

            match kind {
                EntryType::Directory => {
                    fs::create_dir_all(&out).map_err(ArchiveError::io(&out))?;
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .map_err(ArchiveError::io(archive))?
                        .map(|t| t.into_owned());
                    match target {
                        Some(target) => {
                            if let Some(parent) = out.parent() {
                                fs::create_dir_all(parent).map_err(ArchiveError::io(parent))?;
                            }
                            if let Err(e) = std::os::unix::fs::symlink(&target, &out) {
                                tracing::warn!(
                                    "symlink failed: {} -> {}: {}",
                                    out.display(),
                                    target.display(),
                                    e
                                );
                            }
                        }
                        None => tracing::warn!("Symlink entry without target: {}", rel.display()),
                    }
                }
                kind if kind.is_file() => {
                    extract_file(&mut entry, &out)?;
                }
                other => {
                    tracing::debug!("Skipping {:?} entry: {}", other, rel.display());
                }
            }
        }

        Ok(())
    }
}

/// Whether any existing component of `rel` under `root` is a symlink.
///
/// The last component is only checked when `include_leaf` is set.
fn crosses_symlink(root: &Path, rel: &Path, include_leaf: bool) -> bool {
    let components: Vec<Component> = rel.components().collect();
    let checked = if include_leaf {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };

    let mut current = root.to_path_buf();
    for component in &components[..checked] {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return true,
            Ok(_) => {}
            // Nothing below a missing component exists yet
            Err(_) => return false,
        }
    }
    false
}

fn pack_recursive<W: Write>(
    root: &Path,
    path: &Path,
    builder: &mut tar::Builder<W>,
) -> Result<(), ArchiveError> {
    let meta = fs::symlink_metadata(path).map_err(ArchiveError::io(path))?;
    let name = path.strip_prefix(root).unwrap_or(path).to_path_buf();

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&meta, HeaderMode::Complete);

    if meta.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(ArchiveError::io(path))?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, &name, &target)
            .map_err(ArchiveError::io(path))?;
    } else if meta.is_dir() {
        if !name.as_os_str().is_empty() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            let dir_name = format!("{}/", name.display());
            builder
                .append_data(&mut header, dir_name, io::empty())
                .map_err(ArchiveError::io(path))?;
        }
        for child in fs::read_dir(path).map_err(ArchiveError::io(path))? {
            let child = child.map_err(ArchiveError::io(path))?;
            pack_recursive(root, &child.path(), builder)?;
        }
    } else if meta.is_file() {
        let file = File::open(path).map_err(ArchiveError::io(path))?;
        let reader = BufReader::with_capacity(copy_buffer_size(), file);
        builder
            .append_data(&mut header, &name, reader)
            .map_err(ArchiveError::io(path))?;
    } else {
        tracing::debug!("Skipping special file: {}", path.display());
    }

    Ok(())
}

fn extract_file<R: Read>(entry: &mut tar::Entry<'_, R>, out: &Path) -> Result<(), ArchiveError> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(ArchiveError::io(parent))?;
    }

    let mut file = File::create(out).map_err(ArchiveError::io(out))?;
    copy_stream(entry, &mut file).map_err(ArchiveError::io(out))?;

    let header = entry.header();
    let mtime = header.mtime().map_err(ArchiveError::io(out))?;
    file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
        .map_err(ArchiveError::io(out))?;

    let mode = header.mode().map_err(ArchiveError::io(out))?;
    set_owner_executable(out, mode & OWNER_EXEC != 0).map_err(ArchiveError::io(out))?;
    Ok(())
}

fn set_owner_executable(path: &Path, executable: bool) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    let new_mode = if executable {
        mode | OWNER_EXEC
    } else {
        mode & !OWNER_EXEC
    };
    if new_mode != mode {
        perms.set_mode(new_mode);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
