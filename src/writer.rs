use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::encoding::{DecodedText, EncodingPolicy, FileEncoding};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("{} is outside the project root {}", path.display(), root.display())]
    PathOutsideProject { path: PathBuf, root: PathBuf },
    #[error("creating directory {}: {source}", dir.display())]
    DirectoryCreateFailed {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An open view of a file whose encoding is already known.
#[derive(Debug, Clone, Copy)]
struct TrackedBuffer {
    encoding: FileEncoding,
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub path: PathBuf,
    pub created: bool,
    pub encoding: &'static str,
    pub bytes: usize,
    /// Some characters could not be represented in the target encoding.
    pub lossy: bool,
    /// A tracked buffer existed, so cached views of the path are stale.
    pub needs_refresh: bool,
}

/// The only component allowed to mutate files. Every target is checked against
/// the project root before anything touches the disk.
#[derive(Debug)]
pub struct SafeWriter {
    root: PathBuf,
    policy: EncodingPolicy,
    buffers: HashMap<PathBuf, TrackedBuffer>,
}

impl SafeWriter {
    pub fn new(root: impl AsRef<Path>, policy: EncodingPolicy) -> io::Result<Self> {
        let root = normalize_lexically(&std::path::absolute(root.as_ref())?);
        Ok(Self {
            root,
            policy,
            buffers: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &EncodingPolicy {
        &self.policy
    }

    /// Absolute, normalized form of `raw`; relative paths hang off the root.
    pub fn resolve(&self, raw: &Path) -> PathBuf {
        if raw.is_absolute() {
            normalize_lexically(raw)
        } else {
            normalize_lexically(&self.root.join(raw))
        }
    }

    pub fn contain(&self, raw: &Path) -> Result<PathBuf, WriteError> {
        let path = self.resolve(raw);
        if path.starts_with(&self.root) {
            Ok(path)
        } else {
            Err(WriteError::PathOutsideProject {
                path,
                root: self.root.clone(),
            })
        }
    }

    /// Remembers the encoding a file was read with. Paths outside the root are
    /// never tracked.
    pub fn track(&mut self, path: &Path, encoding: FileEncoding) {
        let Ok(path) = self.contain(path) else {
            debug!(path = %path.display(), "not tracking a file outside the project");
            return;
        };
        self.buffers
            .entry(path)
            .and_modify(|buffer| buffer.encoding = encoding)
            .or_insert(TrackedBuffer {
                encoding,
                generation: 0,
            });
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.buffers.contains_key(&self.resolve(path))
    }

    /// Drops the tracked buffer for `path`, if any.
    pub fn forget(&mut self, path: &Path) {
        self.buffers.remove(&self.resolve(path));
    }

    /// Number of writes made through the tracked buffer for `path`.
    pub fn generation(&self, path: &Path) -> Option<u64> {
        self.buffers.get(&self.resolve(path)).map(|b| b.generation)
    }

    pub fn write(&mut self, raw: &Path, content: &str) -> Result<WriteReceipt, WriteError> {
        let path = self.contain(raw)?;
        let tracked = self.buffers.get(&path).copied();
        let existed = path.exists();

        let encoding = match tracked {
            Some(buffer) => buffer.encoding,
            None if existed => {
                let bytes = fs::read(&path).map_err(|source| WriteError::IoFailure {
                    path: path.clone(),
                    source,
                })?;
                self.policy.detect(&bytes)
            }
            None => self.policy.for_new_file(),
        };

        if !existed {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|source| WriteError::DirectoryCreateFailed {
                    dir: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        let (bytes, lossy) = encoding.encode(content);
        write_via_temp(&path, &bytes).map_err(|source| WriteError::IoFailure {
            path: path.clone(),
            source,
        })?;

        let generation = tracked.map_or(0, |b| b.generation + 1);
        self.buffers.insert(
            path.clone(),
            TrackedBuffer {
                encoding,
                generation,
            },
        );

        info!(path = %path.display(), encoding = encoding.name(), bytes = bytes.len(), created = !existed, "wrote file");
        Ok(WriteReceipt {
            path,
            created: !existed,
            encoding: encoding.name(),
            bytes: bytes.len(),
            lossy,
            needs_refresh: tracked.is_some(),
        })
    }
}

/// Reads and decodes a file. Safe to run off the serialized context.
pub fn read_decoded(policy: &EncodingPolicy, path: &Path) -> io::Result<DecodedText> {
    let bytes = fs::read(path)?;
    let decoded = policy.decode(&bytes);
    if decoded.had_errors {
        debug!(path = %path.display(), encoding = decoded.encoding.name(), "decoded with replacement characters");
    }
    Ok(decoded)
}

/// Folds `.` and `..` without touching the filesystem, so paths that do not
/// exist yet can still be checked.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // popping past the root leaves the root in place
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn write_via_temp(path: &Path, data: &[u8]) -> io::Result<()> {
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = base_dir.join(format!(
        ".{name}.editreview-tmp-{}-{}",
        std::process::id(),
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));

    let staged = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if staged.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    staged
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    fn writer(root: &Path) -> SafeWriter {
        SafeWriter::new(root, EncodingPolicy::default()).unwrap()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn traversal_is_rejected_without_mutation() {
        let outer = tempdir().unwrap();
        let root = outer.path().join("proj");
        fs::create_dir(&root).unwrap();
        let mut safe = writer(&root);

        let err = safe
            .write(Path::new("../escape.txt"), "nope")
            .unwrap_err();
        assert!(matches!(err, WriteError::PathOutsideProject { .. }));
        let err = safe
            .write(Path::new("nested/../../escape.txt"), "nope")
            .unwrap_err();
        assert!(matches!(err, WriteError::PathOutsideProject { .. }));
        assert_eq!(entries(outer.path()), vec!["proj".to_string()]);
        assert!(entries(&root).is_empty());
    }

    #[test]
    fn absolute_path_elsewhere_is_rejected() {
        let outer = tempdir().unwrap();
        let root = outer.path().join("proj");
        let sibling = outer.path().join("proj2");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&sibling).unwrap();
        let mut safe = writer(&root);

        let err = safe.write(&sibling.join("a.txt"), "x").unwrap_err();
        assert!(matches!(err, WriteError::PathOutsideProject { .. }));
        assert!(!sibling.join("a.txt").exists());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let mut safe = writer(dir.path());
        let receipt = safe
            .write(Path::new("src/deep/new.rs"), "fn main() {}\n")
            .unwrap();
        assert!(receipt.created);
        assert!(!receipt.needs_refresh);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/deep/new.rs")).unwrap(),
            "fn main() {}\n"
        );
        assert_eq!(entries(&dir.path().join("src/deep")), vec!["new.rs".to_string()]);
    }

    #[test]
    fn directory_create_failure_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("blocker"), "file, not dir").unwrap();
        let mut safe = writer(dir.path());
        let err = safe
            .write(Path::new("blocker/child.txt"), "x")
            .unwrap_err();
        assert!(matches!(err, WriteError::DirectoryCreateFailed { .. }));
    }

    #[test]
    fn untracked_existing_file_keeps_detected_encoding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("utf16.txt");
        fs::write(&path, [0xFF, 0xFE, b'a', 0x00]).unwrap();
        let mut safe = writer(dir.path());
        let receipt = safe.write(&path, "ab").unwrap();
        assert_eq!(receipt.encoding, "UTF-16LE");
        assert_eq!(fs::read(&path).unwrap(), [0xFF, 0xFE, b'a', 0x00, b'b', 0x00]);
    }

    #[test]
    fn tracked_buffer_drives_encoding_and_refresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin.txt");
        fs::write(&path, b"caf\xE9\n").unwrap();
        let policy = EncodingPolicy::new(Some("windows-1252")).unwrap();
        let mut safe = SafeWriter::new(dir.path(), policy).unwrap();
        let decoded = read_decoded(safe.policy(), &path).unwrap();
        assert_eq!(decoded.text, "café\n");
        safe.track(&path, decoded.encoding);

        let receipt = safe.write(&path, "café au lait\n").unwrap();
        assert!(receipt.needs_refresh);
        assert!(!receipt.created);
        assert_eq!(fs::read(&path).unwrap(), b"caf\xE9 au lait\n");
        assert_eq!(safe.generation(&path), Some(1));
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_lexically(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn tracking_is_limited_to_the_root_and_can_be_dropped() {
        let outer = tempdir().unwrap();
        let root = outer.path().join("proj");
        fs::create_dir(&root).unwrap();
        let mut safe = writer(&root);
        let outside = outer.path().join("other.txt");

        safe.track(&outside, FileEncoding::utf8());
        assert!(!safe.is_tracked(&outside));

        safe.track(Path::new("inside.txt"), FileEncoding::utf8());
        assert!(safe.is_tracked(&root.join("inside.txt")));
        safe.forget(Path::new("./inside.txt"));
        assert!(!safe.is_tracked(Path::new("inside.txt")));
    }

    /// Relative paths that climb above the root, or absolute paths elsewhere.
    fn arb_escaping_path() -> impl Strategy<Value = PathBuf> {
        let climbing = (
            prop::collection::vec("[a-z]{1,4}", 0..3),
            0usize..3,
            "[a-z]{1,6}\\.txt",
        )
            .prop_map(|(down, extra, name)| {
                let mut path = PathBuf::new();
                for dir in &down {
                    path.push(dir);
                }
                for _ in 0..down.len() + 1 + extra {
                    path.push("..");
                }
                path.push(name);
                path
            });
        let absolute = ("[a-z]{1,6}", "[a-z]{1,6}").prop_map(|(dir, name)| {
            PathBuf::from(format!("/editreview-elsewhere-{dir}/{name}.txt"))
        });
        prop_oneof![climbing, absolute]
    }

    proptest! {
        #[test]
        fn prop_escaping_writes_fail_without_mutation(raw in arb_escaping_path()) {
            let outer = tempdir().unwrap();
            let root = outer.path().join("proj");
            fs::create_dir(&root).unwrap();
            let mut safe = writer(&root);

            let err = safe.write(&raw, "nope").unwrap_err();
            prop_assert!(matches!(err, WriteError::PathOutsideProject { .. }), "{err}");
            prop_assert_eq!(entries(outer.path()), vec!["proj".to_string()]);
            prop_assert!(entries(&root).is_empty());
            prop_assert!(!safe.is_tracked(&raw));
        }
    }
}
