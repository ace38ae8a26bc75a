use std::{
    fmt::Write as _,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};

/// Wraps a reader and computes the MD5 digest of the data as it is read.
pub struct Md5Reader<R: Read>(R, md5::Context);

impl<R: Read> Md5Reader<R> {
    pub fn new(reader: R) -> Self {
        Self(reader, md5::Context::new())
    }

    pub fn digest(&self) -> String {
        format!("{:x}", self.1.clone().compute())
    }
}

impl<R: Read> Read for Md5Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.read(buf)?;
        self.1.consume(&buf[..n]);
        Ok(n)
    }
}

/// MD5 digest of a file, as a lowercase hex string.
pub fn file_md5(path: &Path) -> Result<String, Error> {
    let file = File::open(path).context(format!("Failed to open {}", path.display()))?;
    let mut reader = Md5Reader::new(file);
    io::copy(&mut reader, &mut io::sink())
        .context(format!("Failed to read {}", path.display()))?;
    Ok(reader.digest())
}

/// One `"<md5>  <path>"` line of a digest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub md5: String,
    pub path: PathBuf,
}

/// A digest verification failure, carrying the offending path.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("'{path}' is listed in the digest file but missing")]
    Missing { path: String },
    #[error("checksum mismatch for '{path}': expected {expected}, found {found}")]
    Mismatch {
        path: String,
        expected: String,
        found: String,
    },
}

/// Parse a digest file: one `"<md5>  <path>"` entry per line, blank lines
/// ignored.
pub fn parse_digest_file(contents: &str) -> Result<Vec<DigestEntry>, Error> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((md5, path)) = line.split_once(char::is_whitespace) else {
            bail!("Malformed digest line: '{line}'");
        };
        let md5 = md5.trim().to_ascii_lowercase();
        if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("Malformed MD5 digest in line: '{line}'");
        }
        entries.push(DigestEntry {
            md5,
            path: PathBuf::from(path.trim()),
        });
    }
    Ok(entries)
}

/// Render digest entries in the on-disk format, sorted by path.
pub fn format_digest_file(entries: &[DigestEntry]) -> String {
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let mut out = String::new();
    for entry in sorted {
        let _ = writeln!(out, "{}  {}", entry.md5, entry.path.display());
    }
    out
}

/// Verify every entry of a digest file against the files under `root`,
/// stopping at the first missing or mismatching file.
pub fn verify_tree(root: &Path, entries: &[DigestEntry]) -> Result<(), DigestError> {
    for entry in entries {
        let path = root.join(&entry.path);
        if !path.is_file() {
            return Err(DigestError::Missing {
                path: entry.path.display().to_string(),
            });
        }
        let found = file_md5(&path).map_err(|_| DigestError::Missing {
            path: entry.path.display().to_string(),
        })?;
        if found != entry.md5 {
            return Err(DigestError::Mismatch {
                path: entry.path.display().to_string(),
                expected: entry.md5.clone(),
                found,
            });
        }
    }
    Ok(())
}

/// Compute digest entries for every regular file under `root`.
pub fn digest_tree(root: &Path) -> Result<Vec<DigestEntry>, Error> {
    let mut entries = Vec::new();
    for path in crate::files::list_files(root)? {
        entries.push(DigestEntry {
            md5: file_md5(&root.join(&path))?,
            path,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_md5_reader() {
        let input = b"Hello, world!";
        let mut reader = Md5Reader::new(io::Cursor::new(&input));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(sink, input);
        assert_eq!(reader.digest(), "6cd3556deb0da54bca060b4c39479839");
    }

    #[test]
    fn test_file_md5() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "v2\n").unwrap();
        assert_eq!(file_md5(&path).unwrap(), "e30260020baeb0398ff07b37dd33ed16");
    }

    #[test]
    fn test_parse_and_format_roundtrip() {
        let text = "d41d8cd98f00b204e9800998ecf8427e  files/empty\n6cd3556deb0da54bca060b4c39479839  manifest.yml\n";
        let entries = parse_digest_file(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, PathBuf::from("files/empty"));
        assert_eq!(format_digest_file(&entries), text);

        parse_digest_file("not-a-digest  x").unwrap_err();
        parse_digest_file("no-separator").unwrap_err();
    }

    #[test]
    fn test_verify_tree() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("files")).unwrap();
        fs::write(dir.path().join("files/x"), "payload").unwrap();

        let entries = digest_tree(dir.path()).unwrap();
        verify_tree(dir.path(), &entries).unwrap();

        // Flip a byte: verification must name the file.
        fs::write(dir.path().join("files/x"), "payloaD").unwrap();
        match verify_tree(dir.path(), &entries).unwrap_err() {
            DigestError::Mismatch { path, .. } => assert_eq!(path, "files/x"),
            other => panic!("expected mismatch, got {other:?}"),
        }

        // Remove it: the failure becomes a missing file.
        fs::remove_file(dir.path().join("files/x")).unwrap();
        assert!(matches!(
            verify_tree(dir.path(), &entries).unwrap_err(),
            DigestError::Missing { .. }
        ));
    }
}
