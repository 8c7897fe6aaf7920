//! Digest map construction for artifact trees
//!
//! Uses SHA-512 over file contents. A small ordered list of content transforms
//! can replace the hashed bytes of specific files before hashing; the first
//! transform that applies and yields content wins, everything else is hashed
//! as-is.

use crate::error::IntegrityError;
use crate::walker::{absolute_path, relative_path, FileEntry};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Sorted relative path to hex SHA-512 mapping
pub type DigestMap = BTreeMap<String, String>;

/// Descriptor files that are never part of their own digest map
pub const SIGNATURE_FILES: &[&str] = &["appinfo/signature.json", "core/signature.json"];

/// Marker line in the root `.htaccess`; content below it is written at install time
pub const HTACCESS_SENTINEL: &str = "#### DO NOT CHANGE ANYTHING ABOVE THIS LINE ####";

/// A pre-hash rewrite of a file's content, keyed by relative path
pub trait ContentTransform: Send + Sync {
    /// Relative path this transform is responsible for
    fn applies_to(&self, relative_path: &str) -> bool;

    /// Content to hash instead of the raw bytes, or `None` to hash the file as-is
    fn transform(&self, content: &[u8]) -> Option<Vec<u8>>;
}

/// Hash only the bytes before a sentinel line
///
/// Falls back to the whole file when the sentinel is missing or repeated.
#[derive(Debug, Clone)]
pub struct SentinelTruncation {
    relative_path: String,
    sentinel: String,
}

impl SentinelTruncation {
    pub fn new(relative_path: impl Into<String>, sentinel: impl Into<String>) -> Self {
        SentinelTruncation {
            relative_path: relative_path.into(),
            sentinel: sentinel.into(),
        }
    }

    /// The root `.htaccess` rule
    pub fn htaccess() -> Self {
        Self::new(".htaccess", HTACCESS_SENTINEL)
    }
}

impl ContentTransform for SentinelTruncation {
    fn applies_to(&self, relative_path: &str) -> bool {
        relative_path == self.relative_path
    }

    fn transform(&self, content: &[u8]) -> Option<Vec<u8>> {
        let needle = self.sentinel.as_bytes();
        let positions = find_all(content, needle);
        match positions.as_slice() {
            [only] => Some(content[..*only].to_vec()),
            _ => None,
        }
    }
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return Vec::new();
    }
    let mut found = Vec::new();
    let mut start = 0;
    while start + needle.len() <= haystack.len() {
        match haystack[start..]
            .windows(needle.len())
            .position(|window| window == needle)
        {
            Some(offset) => {
                found.push(start + offset);
                start += offset + needle.len();
            }
            None => break,
        }
    }
    found
}

/// Builds the digest map of one artifact root
#[derive(Clone)]
pub struct DigestBuilder {
    root: PathBuf,
    transforms: Vec<Arc<dyn ContentTransform>>,
}

impl DigestBuilder {
    /// `root` is resolved like the walk root so entry paths strip cleanly
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DigestBuilder {
            root: absolute_path(&root.into()),
            transforms: Vec::new(),
        }
    }

    /// Append transforms, evaluated in order before whole-file hashing
    pub fn with_transforms<I>(mut self, transforms: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ContentTransform>>,
    {
        self.transforms.extend(transforms);
        self
    }

    /// Hash every entry of the enumeration into a sorted digest map
    pub fn build<I>(&self, entries: I) -> Result<DigestMap, IntegrityError>
    where
        I: IntoIterator<Item = Result<FileEntry, IntegrityError>>,
    {
        let mut hashes = DigestMap::new();

        for entry in entries {
            let entry = entry?;
            let Some(relative) = relative_path(&entry.path, &self.root) else {
                continue;
            };

            if SIGNATURE_FILES.contains(&relative.as_str()) {
                trace!("Skipping signature descriptor: {}", relative);
                continue;
            }

            let digest = self.digest_entry(&entry, &relative)?;
            hashes.insert(relative, digest);
        }

        debug!("Hashed {} files below {:?}", hashes.len(), self.root);
        Ok(hashes)
    }

    fn digest_entry(&self, entry: &FileEntry, relative: &str) -> Result<String, IntegrityError> {
        let applicable: Vec<&Arc<dyn ContentTransform>> = self
            .transforms
            .iter()
            .filter(|t| t.applies_to(relative))
            .collect();

        if applicable.is_empty() {
            return hash_file_sync(&entry.path);
        }

        let content = entry.read()?;
        for transform in applicable {
            if let Some(replaced) = transform.transform(&content) {
                debug!("Hashing transformed content for {}", relative);
                return Ok(hash_bytes(&replaced));
            }
        }
        Ok(hash_bytes(&content))
    }
}

/// Hash a file's contents with SHA-512, streaming
pub fn hash_file_sync(path: &Path) -> Result<String, IntegrityError> {
    let io_err = |source| IntegrityError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;

    let mut hasher = Sha512::new();
    let mut buffer = [0; 8192]; // 8KB buffer for streaming

    loop {
        let bytes_read = file.read(&mut buffer).map_err(io_err)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a byte slice with SHA-512
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::TreeWalker;
    use std::fs;
    use tempfile::TempDir;

    fn digest(root: &Path, transforms: Vec<Arc<dyn ContentTransform>>) -> DigestMap {
        DigestBuilder::new(root)
            .with_transforms(transforms)
            .build(TreeWalker::new(root).walk())
            .unwrap()
    }

    #[test]
    fn test_hash_bytes_is_sha512_hex() {
        let hash = hash_bytes(b"");
        assert_eq!(hash.len(), 128);
        assert!(hash.starts_with("cf83e1357eefb8bd"));
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        let content = vec![7u8; 20_000];
        fs::write(&path, &content).unwrap();
        assert_eq!(hash_file_sync(&path).unwrap(), hash_bytes(&content));
    }

    #[test]
    fn test_build_skips_signature_descriptors() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("appinfo")).unwrap();
        fs::create_dir_all(root.join("core")).unwrap();
        fs::write(root.join("appinfo/signature.json"), "{}").unwrap();
        fs::write(root.join("core/signature.json"), "{}").unwrap();
        fs::write(root.join("appinfo/info.xml"), "<info/>").unwrap();

        let hashes = digest(root, Vec::new());
        assert_eq!(hashes.keys().collect::<Vec<_>>(), vec!["appinfo/info.xml"]);
    }

    #[test]
    fn test_sentinel_truncation_hashes_prefix_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let head = "RewriteEngine on\n";
        fs::write(
            root.join(".htaccess"),
            format!("{head}{HTACCESS_SENTINEL}\nErrorDocument 404 /index.php\n"),
        )
        .unwrap();

        let hashes = digest(root, vec![Arc::new(SentinelTruncation::htaccess())]);
        assert_eq!(hashes[".htaccess"], hash_bytes(head.as_bytes()));
    }

    #[test]
    fn test_sentinel_repeated_hashes_whole_file() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let content = format!("a\n{HTACCESS_SENTINEL}\nb\n{HTACCESS_SENTINEL}\n");
        fs::write(root.join(".htaccess"), &content).unwrap();

        let hashes = digest(root, vec![Arc::new(SentinelTruncation::htaccess())]);
        assert_eq!(hashes[".htaccess"], hash_bytes(content.as_bytes()));
    }

    #[test]
    fn test_sentinel_absent_hashes_whole_file() {
        let transform = SentinelTruncation::htaccess();
        assert_eq!(transform.transform(b"no marker here"), None);
        assert!(!transform.applies_to("lib/.htaccess"));
    }

    #[test]
    fn test_build_is_independent_of_enumeration_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b/z.txt"), "z").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("c.txt"), "c").unwrap();

        let builder = DigestBuilder::new(root);
        let forward: Vec<_> = TreeWalker::new(root).walk().collect::<Result<_, _>>().unwrap();
        let mut backward = forward.clone();
        backward.reverse();

        let first = builder.build(forward.into_iter().map(Ok)).unwrap();
        let second = builder.build(backward.into_iter().map(Ok)).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            vec!["a.txt", "b/z.txt", "c.txt"]
        );
    }
}
