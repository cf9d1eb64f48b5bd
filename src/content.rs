//! Content resolution: pick the single servable path, zipping when needed.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// The single servable item for a session.
///
/// Ephemeral content is a temporary archive created solely for this transfer
/// and is deleted during shutdown cleanup.
pub struct Content {
    path: PathBuf,
    ephemeral: bool,
    cleaned: AtomicBool,
}

impl Content {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name shown in the Content-Disposition header.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string())
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Delete ephemeral content from disk. At most one call has an effect,
    /// so racing shutdown paths cannot double-delete.
    pub fn cleanup(&self) -> io::Result<()> {
        if !self.ephemeral || self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        std::fs::remove_file(&self.path)
    }
}

/// Resolve CLI paths into one servable item. Archives when the operator
/// asked for it, when more than one path is given, or when the path is a
/// directory.
pub fn resolve(paths: &[PathBuf], zip_requested: bool) -> Result<Content> {
    if paths.is_empty() {
        bail!("at least one path is required");
    }
    for path in paths {
        if !path.exists() {
            bail!("path not found: {}", path.display());
        }
    }

    if should_archive(paths, zip_requested) {
        let archive = create_temp_zip_archive(paths)?;
        Ok(Content {
            path: archive,
            ephemeral: true,
            cleaned: AtomicBool::new(false),
        })
    } else {
        Ok(Content {
            path: paths[0].clone(),
            ephemeral: false,
            cleaned: AtomicBool::new(false),
        })
    }
}

fn should_archive(paths: &[PathBuf], zip_requested: bool) -> bool {
    zip_requested || paths.len() > 1 || paths[0].is_dir()
}

/// Build a temporary zip archive of the passed paths and return its
/// location. Directories keep their tree under the directory's own name.
fn create_temp_zip_archive(inputs: &[PathBuf]) -> Result<PathBuf> {
    let mut entries = Vec::<(PathBuf, PathBuf)>::new();
    let mut names = HashSet::<PathBuf>::new();

    for input in inputs {
        if input.is_dir() {
            let root = input
                .file_name()
                .and_then(|x| x.to_str())
                .unwrap_or("dir")
                .to_string();
            for entry in WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
            {
                let file_path = entry.path().to_path_buf();
                let rel = file_path
                    .strip_prefix(input)
                    .unwrap_or(file_path.as_path())
                    .to_path_buf();
                let wanted = Path::new(&root).join(rel);
                let archive_name = unique_archive_path(&wanted, &mut names);
                entries.push((file_path, archive_name));
            }
        } else {
            let wanted =
                PathBuf::from(input.file_name().and_then(|x| x.to_str()).unwrap_or("file"));
            let archive_name = unique_archive_path(&wanted, &mut names);
            entries.push((input.clone(), archive_name));
        }
    }

    if entries.is_empty() {
        bail!("No files found for zip archive");
    }

    let archive_path = std::env::temp_dir().join(format!("qrsend-{}.zip", Uuid::new_v4()));
    write_zip_archive(&archive_path, &entries)?;
    Ok(archive_path)
}

fn unique_archive_path(wanted: &Path, names: &mut HashSet<PathBuf>) -> PathBuf {
    if names.insert(wanted.to_path_buf()) {
        return wanted.to_path_buf();
    }

    let stem = wanted
        .file_stem()
        .and_then(|x| x.to_str())
        .unwrap_or("file");
    let ext = wanted.extension().and_then(|x| x.to_str());
    let parent = wanted.parent().map(|x| x.to_path_buf()).unwrap_or_default();

    let mut idx = 2usize;
    loop {
        let candidate_name = match ext {
            Some(ext) if !ext.is_empty() => format!("{}-{}.{}", stem, idx, ext),
            _ => format!("{}-{}", stem, idx),
        };
        let candidate = parent.join(candidate_name);
        if names.insert(candidate.clone()) {
            return candidate;
        }
        idx += 1;
    }
}

fn write_zip_archive(archive_path: &Path, entries: &[(PathBuf, PathBuf)]) -> Result<()> {
    let file = File::create(archive_path)
        .with_context(|| format!("Failed to create zip archive {}", archive_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (source_path, archive_path) in entries {
        let mut source = File::open(source_path)
            .with_context(|| format!("Failed to open {}", source_path.display()))?;
        let entry_name = archive_path.to_string_lossy().replace('\\', "/");
        writer
            .start_file(entry_name, options)
            .with_context(|| format!("Failed to start zip entry {}", archive_path.display()))?;
        io::copy(&mut source, &mut writer)
            .with_context(|| format!("Failed to add {} to zip", source_path.display()))?;
    }

    writer.finish().context("Failed to finalize zip archive")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).expect("write fixture");
        path
    }

    #[test]
    fn single_file_is_served_in_place() {
        let dir = TempDir::new().expect("temp dir");
        let file = fixture(&dir, "report.pdf", b"pdf bytes");

        let content = resolve(&[file.clone()], false).expect("resolve");
        assert!(!content.is_ephemeral());
        assert_eq!(content.path(), file.as_path());
        assert_eq!(content.name(), "report.pdf");

        // cleanup must not touch non-ephemeral content
        content.cleanup().expect("cleanup");
        assert!(file.exists());
    }

    #[test]
    fn multiple_paths_become_an_ephemeral_archive() {
        let dir = TempDir::new().expect("temp dir");
        let a = fixture(&dir, "a.txt", b"aaa");
        let b = fixture(&dir, "b.txt", b"bbb");

        let content = resolve(&[a, b], false).expect("resolve");
        assert!(content.is_ephemeral());
        assert!(content.path().exists());
        assert!(content.name().ends_with(".zip"));

        let archive = File::open(content.path()).expect("open archive");
        let zip = zip::ZipArchive::new(archive).expect("read archive");
        let names: Vec<_> = zip.file_names().collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"b.txt"));
        drop(zip);

        content.cleanup().expect("cleanup");
        assert!(!content.path().exists());
        // second cleanup is a no-op, not a second delete attempt
        content.cleanup().expect("cleanup again");
    }

    #[test]
    fn directory_is_archived_under_its_own_name() {
        let dir = TempDir::new().expect("temp dir");
        let sub = dir.path().join("docs");
        std::fs::create_dir(&sub).expect("mkdir");
        std::fs::write(sub.join("note.txt"), b"hello").expect("write");

        let content = resolve(&[sub], false).expect("resolve");
        assert!(content.is_ephemeral());

        let archive = File::open(content.path()).expect("open archive");
        let zip = zip::ZipArchive::new(archive).expect("read archive");
        assert!(zip.file_names().any(|n| n == "docs/note.txt"));
        drop(zip);

        content.cleanup().expect("cleanup");
    }

    #[test]
    fn zip_flag_forces_archiving_a_single_file() {
        let dir = TempDir::new().expect("temp dir");
        let file = fixture(&dir, "a.txt", b"aaa");

        let content = resolve(&[file], true).expect("resolve");
        assert!(content.is_ephemeral());
        content.cleanup().expect("cleanup");
    }

    #[test]
    fn missing_path_is_a_setup_error() {
        let result = resolve(&[PathBuf::from("/no/such/file")], false);
        assert!(result.is_err());
    }

    #[test]
    fn colliding_archive_names_are_deduplicated() {
        let mut names = HashSet::new();
        let first = unique_archive_path(Path::new("a.txt"), &mut names);
        let second = unique_archive_path(Path::new("a.txt"), &mut names);
        assert_eq!(first, PathBuf::from("a.txt"));
        assert_eq!(second, PathBuf::from("a-2.txt"));
    }
}
