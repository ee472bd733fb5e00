use crate::error::Result;
use std::path::Path;
use tracing::debug;

/// uid/gid of the `claude` user inside agent images
pub const GUEST_UID: u64 = 1001;
pub const GUEST_GID: u64 = 1001;

/// A file to place in an archive
#[derive(Debug, Clone)]
pub struct ArchiveFile {
    /// Path relative to the archive root
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

fn header(entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(GUEST_UID);
    header.set_gid(GUEST_GID);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header
}

/// Build a tar archive from in-memory files; parent directories are added
pub fn tar_files(files: &[ArchiveFile]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut dirs_added: Vec<String> = Vec::new();

    for file in files {
        let mut prefix = String::new();
        let parents: Vec<&str> = file.path.split('/').collect();
        for part in &parents[..parents.len().saturating_sub(1)] {
            prefix.push_str(part);
            prefix.push('/');
            if !dirs_added.contains(&prefix) {
                let mut dir_header = header(tar::EntryType::Directory, 0, 0o755);
                builder.append_data(&mut dir_header, &prefix, std::io::empty())?;
                dirs_added.push(prefix.clone());
            }
        }

        let mut file_header = header(
            tar::EntryType::Regular,
            file.content.len() as u64,
            file.mode,
        );
        builder.append_data(&mut file_header, &file.path, file.content.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

/// Archive the contents of `src` (not `src` itself), owned by the guest user.
///
/// A leading `./` entry carries the guest ownership onto the extraction
/// directory, so a volume root created by the daemon as root becomes writable.
pub fn tar_directory(src: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut root_header = header(tar::EntryType::Directory, 0, 0o755);
    builder.append_data(&mut root_header, "./", std::io::empty())?;
    append_dir(&mut builder, src, "")?;
    Ok(builder.into_inner()?)
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, dir: &Path, prefix: &str) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = format!("{}{}", prefix, entry.file_name().to_string_lossy());
        // Follows symlinks so linked config files are archived by content
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping unreadable entry {}: {}", path.display(), e);
                continue;
            }
        };

        if metadata.is_dir() {
            let dir_name = format!("{name}/");
            let mut dir_header = header(tar::EntryType::Directory, 0, 0o755);
            builder.append_data(&mut dir_header, &dir_name, std::io::empty())?;
            append_dir(builder, &path, &dir_name)?;
        } else if metadata.is_file() {
            let content = std::fs::read(&path)?;
            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                metadata.permissions().mode() & 0o777
            };
            #[cfg(not(unix))]
            let mode = 0o644;
            let mut file_header = header(tar::EntryType::Regular, content.len() as u64, mode);
            builder.append_data(&mut file_header, &name, content.as_slice())?;
        } else {
            debug!("Skipping special file {}", path.display());
        }
    }

    Ok(())
}

/// Entry paths and file contents of an archive
#[cfg(test)]
pub fn read_entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let mut reader = tar::Archive::new(archive);
    reader
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            (path, content)
        })
        .collect()
}
