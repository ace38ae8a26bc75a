use std::path::{Path, PathBuf};

fn strip_root(path: &Path) -> &Path {
    match path.strip_prefix("/") {
        Ok(relative) => relative,
        Err(_) => path,
    }
}

/// Join `path` under `root`, treating an absolute `path` as relative to
/// `root`.
pub fn join_relative(root: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    root.as_ref().join(strip_root(path.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative() {
        assert_eq!(join_relative("/stage", "/etc"), Path::new("/stage/etc"));
        assert_eq!(join_relative("/stage", "etc"), Path::new("/stage/etc"));
        assert_eq!(
            join_relative("/stage", "files/app.conf"),
            Path::new("/stage/files/app.conf")
        );
    }
}
