use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use walkdir::WalkDir;

/// Creates a file and all parent directories if they don't exist
pub fn create_file<S>(path: S) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }
    File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))
}

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Reads the content of a file and trims it
pub fn read_file_trim(file_path: &Path) -> Result<String, Error> {
    let content = fs::read_to_string(file_path)
        .context(format!("Could not read file contents: {file_path:?}"))?;
    Ok(content.trim().to_string())
}

/// Write `contents` to `path` atomically: the bytes land in a temporary file
/// in the same directory, are fsynced, and the temporary file is renamed over
/// the destination. Readers never observe a torn file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let parent = path
        .parent()
        .context(format!("Path has no parent directory: {}", path.display()))?;
    create_dirs(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .context("Failed to create temporary file for atomic write")?;
    temp.write_all(contents)
        .context("Failed to write temporary file")?;
    temp.as_file()
        .sync_all()
        .context("Failed to sync temporary file")?;
    temp.persist(path)
        .context(format!("Failed to move temporary file to {}", path.display()))?;
    Ok(())
}

/// Copy `source` to `destination` with the atomic-rename discipline of
/// [`atomic_write`], preserving the source file's permissions.
pub fn atomic_copy(source: &Path, destination: &Path) -> Result<(), Error> {
    let contents = fs::read(source).context(format!("Failed to read {}", source.display()))?;
    atomic_write(destination, &contents)?;
    let permissions = fs::metadata(source)
        .context(format!("Failed to stat {}", source.display()))?
        .permissions();
    fs::set_permissions(destination, permissions).context(format!(
        "Failed to set permissions on {}",
        destination.display()
    ))?;
    Ok(())
}

/// Atomically repoint `link` at `target` by renaming a fresh symlink over it.
pub fn atomic_symlink_swap(link: &Path, target: &Path) -> Result<(), Error> {
    let parent = link
        .parent()
        .context(format!("Link has no parent directory: {}", link.display()))?;
    create_dirs(parent)?;

    let staging = tempfile::TempDir::new_in(parent)
        .context("Failed to create staging directory for symlink swap")?;
    let staged_link = staging.path().join("link");
    std::os::unix::fs::symlink(target, &staged_link)
        .context(format!("Failed to create symlink to {}", target.display()))?;
    fs::rename(&staged_link, link).context(format!(
        "Failed to move symlink into place at {}",
        link.display()
    ))?;
    Ok(())
}

/// Recursively copy the tree rooted at `source` into `destination`,
/// preserving file permissions. `destination` is created if missing.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<(), Error> {
    create_dirs(destination)?;
    for entry in WalkDir::new(source) {
        let entry = entry.context(format!("Failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("Walked entry escapes the source root")?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            create_dirs(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                create_dirs(parent)?;
            }
            fs::copy(entry.path(), &target).context(format!(
                "Failed to copy {} to {}",
                entry.path().display(),
                target.display()
            ))?;
        }
    }
    Ok(())
}

/// Collect the paths of all regular files under `root`, relative to `root`,
/// sorted for stable iteration.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.context(format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_file() {
            files.push(
                entry
                    .path()
                    .strip_prefix(root)
                    .context("Walked entry escapes the root")?
                    .to_path_buf(),
            );
        }
    }
    files.sort();
    Ok(files)
}

/// Remove a file or directory tree if it exists.
pub fn remove_path_if_exists(path: &Path) -> Result<(), Error> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)
            .context(format!("Failed to remove directory {}", path.display())),
        Ok(_) => fs::remove_file(path).context(format!("Failed to remove {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(format!("Failed to stat {}", path.display())),
    }
}

/// Fsync a directory so a preceding rename inside it is durable.
pub fn fsync_dir(path: &Path) -> Result<(), Error> {
    File::open(path)
        .context(format!("Failed to open directory {}", path.display()))?
        .sync_all()
        .context(format!("Failed to sync directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.txt");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        // Overwrites in place.
        atomic_write(&path, b"world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "world");
    }

    #[test]
    fn test_atomic_copy_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src.sh");
        fs::write(&source, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755)).unwrap();

        let dest = dir.path().join("dst.sh");
        atomic_copy(&source, &dest).unwrap();
        assert_eq!(
            fs::metadata(&dest).unwrap().permissions().mode() & 0o777,
            0o755
        );
    }

    #[test]
    fn test_symlink_swap() {
        let dir = TempDir::new().unwrap();
        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        fs::create_dir(&v1).unwrap();
        fs::create_dir(&v2).unwrap();

        let link = dir.path().join("current");
        atomic_symlink_swap(&link, &v1).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), v1);

        // Swapping over an existing link replaces it.
        atomic_symlink_swap(&link, &v2).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), v2);
    }

    #[test]
    fn test_copy_tree_and_list_files() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("top.txt"), "top").unwrap();
        fs::write(source.join("nested/deep.txt"), "deep").unwrap();

        let dest = dir.path().join("dest");
        copy_tree(&source, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(dest.join("nested/deep.txt")).unwrap(),
            "deep"
        );

        let files = list_files(&dest).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("nested/deep.txt"), PathBuf::from("top.txt")]
        );
    }

    #[test]
    fn test_remove_path_if_exists() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        remove_path_if_exists(&file).unwrap();
        assert!(!file.exists());

        // Absent paths are fine.
        remove_path_if_exists(&file).unwrap();

        let tree = dir.path().join("tree/nested");
        fs::create_dir_all(&tree).unwrap();
        remove_path_if_exists(&dir.path().join("tree")).unwrap();
        assert!(!tree.exists());
    }
}
