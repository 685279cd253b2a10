//! Root-anchored path validation and the per-file read/write lock map.
//! Policies are fixed before the server starts; after that every
//! operation here is safe to call from any worker.

use crate::interlock::Interlock;
use hashbrown::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Policy {
    Disallow,
    Allow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathError {
    /// The path never became absolute; nothing sensible can be checked.
    InvalidFormat,
    /// The resolved path's parent chain does not contain the root.
    EscapesRoot,
    /// The target does not exist and creation is disallowed.
    CantCreateFile,
    NoSuchFile,
    IsDirectory,
    AccessForbidden,
    /// The OS refused to even describe the file.
    Permissions,
}

pub struct FileSecurity {
    root: PathBuf,
    can_create: bool,
    can_overwrite: bool,
    can_read: bool,
    locks: Mutex<HashMap<PathBuf, Interlock>>,
}

impl FileSecurity {
    /// A relative root is anchored at the current directory; either way
    /// the stored root is in lexically normal form so ancestor
    /// comparisons are exact.
    pub fn new<P: Into<PathBuf>>(root: P) -> FileSecurity {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir().unwrap_or_default().join(root)
        };

        FileSecurity {
            root: normalize(&root),
            can_create: false,
            can_overwrite: false,
            can_read: true,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn creation_policy(mut self, policy: Policy) -> FileSecurity {
        self.can_create = policy == Policy::Allow;
        self
    }

    pub fn overwrite_policy(mut self, policy: Policy) -> FileSecurity {
        self.can_overwrite = policy == Policy::Allow;
        self
    }

    pub fn read_policy(mut self, policy: Policy) -> FileSecurity {
        self.can_read = policy == Policy::Allow;
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins a client-supplied name onto the root and normalizes the
    /// result lexically. No traversal checking happens here; that is
    /// `is_path_valid`'s job.
    pub fn absolute_from_root(&self, relative: &str) -> PathBuf {
        normalize(&self.root.join(relative))
    }

    /// The path must be absolute and its parent chain must contain the
    /// exact configured root. A `..` sequence cannot slip through
    /// because the path was normalized before the walk.
    pub fn is_path_valid(&self, path: &Path) -> Result<(), PathError> {
        if !path.is_absolute() {
            return Err(PathError::InvalidFormat);
        }

        for ancestor in path.ancestors().skip(1) {
            if ancestor == self.root {
                return Ok(());
            }
        }

        Err(PathError::EscapesRoot)
    }

    /// Path validity is established before any filesystem probe so an
    /// escaping request touches nothing outside the root.
    pub fn is_valid_for_read(&self, path: &Path) -> Result<(), PathError> {
        if !self.can_read {
            return Err(PathError::AccessForbidden);
        }

        self.is_path_valid(path)?;

        let meta = fs::metadata(path).map_err(metadata_error)?;
        if !meta.is_file() {
            return Err(PathError::IsDirectory);
        }

        Ok(())
    }

    pub fn is_valid_for_write(&self, path: &Path) -> Result<(), PathError> {
        self.is_path_valid(path)?;

        match fs::metadata(path) {
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                if self.can_create {
                    Ok(())
                } else {
                    Err(PathError::CantCreateFile)
                }
            }
            Err(err) => Err(metadata_error(err)),
            Ok(meta) => {
                if !meta.is_file() {
                    Err(PathError::IsDirectory)
                } else if !self.can_overwrite {
                    Err(PathError::AccessForbidden)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn lock_read(&self, path: &Path) -> bool {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(Interlock::new)
            .try_lock_read()
    }

    pub fn lock_write(&self, path: &Path) -> bool {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(Interlock::new)
            .try_lock_write()
    }

    pub fn unlock_read(&self, path: &Path) -> bool {
        let mut locks = self.locks.lock().unwrap();

        let free = match locks.get(path) {
            Some(lock) => {
                lock.unlock_read();
                lock.is_free()
            }
            None => return false,
        };

        if free {
            locks.remove(path);
        }

        true
    }

    pub fn unlock_write(&self, path: &Path) -> bool {
        let mut locks = self.locks.lock().unwrap();

        let free = match locks.get(path) {
            Some(lock) => {
                lock.unlock_write();
                lock.is_free()
            }
            None => return false,
        };

        if free {
            locks.remove(path);
        }

        true
    }

    /// Number of paths with live lock entries.
    pub fn locked_paths(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

fn metadata_error(err: io::Error) -> PathError {
    match err.kind() {
        io::ErrorKind::NotFound => PathError::NoSuchFile,
        io::ErrorKind::PermissionDenied => PathError::Permissions,
        _ => PathError::AccessForbidden,
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem. A `..` at the root clamps there.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => result.push(prefix.as_os_str()),
            Component::RootDir => result.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(part) => result.push(part),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn security(root: &Path) -> FileSecurity {
        FileSecurity::new(root)
            .creation_policy(Policy::Allow)
            .overwrite_policy(Policy::Allow)
    }

    #[test]
    fn test_normalize_resolves_dots() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/a/../../b")), PathBuf::from("/b"));
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn test_path_inside_root_is_valid() {
        let sec = security(Path::new("/srv/tftp"));

        assert_eq!(sec.is_path_valid(Path::new("/srv/tftp/file.bin")), Ok(()));
        assert_eq!(
            sec.is_path_valid(Path::new("/srv/tftp/sub/dir/file.bin")),
            Ok(())
        );
    }

    #[test]
    fn test_escape_is_rejected_without_file_io() {
        let sec = security(Path::new("/srv/tftp"));

        // The sibling path does not exist anywhere; the verdict must be
        // the escape, not a missing-file probe result.
        assert_eq!(
            sec.is_path_valid(Path::new("/srv/outside.txt")),
            Err(PathError::EscapesRoot)
        );

        let escaped = sec.absolute_from_root("../outside.txt");
        assert_eq!(escaped, PathBuf::from("/srv/outside.txt"));
        assert_eq!(
            sec.is_valid_for_read(&escaped),
            Err(PathError::EscapesRoot)
        );
    }

    #[test]
    fn test_absolute_filename_cannot_replace_root() {
        let sec = security(Path::new("/srv/tftp"));

        let path = sec.absolute_from_root("/etc/passwd");
        assert_eq!(sec.is_path_valid(&path), Err(PathError::EscapesRoot));
    }

    #[test]
    fn test_relative_path_is_invalid_format() {
        let sec = security(Path::new("/srv/tftp"));
        assert_eq!(
            sec.is_path_valid(Path::new("srv/tftp/file")),
            Err(PathError::InvalidFormat)
        );
    }

    #[test]
    fn test_root_itself_is_not_a_valid_target() {
        let sec = security(Path::new("/srv/tftp"));
        assert_eq!(
            sec.is_path_valid(Path::new("/srv/tftp")),
            Err(PathError::EscapesRoot)
        );
    }

    #[test]
    fn test_read_validation() {
        let dir = tempfile::tempdir().unwrap();
        let sec = security(dir.path());

        let present = sec.absolute_from_root("present.txt");
        File::create(&present).unwrap().write_all(b"x").unwrap();

        assert_eq!(sec.is_valid_for_read(&present), Ok(()));
        assert_eq!(
            sec.is_valid_for_read(&sec.absolute_from_root("absent.txt")),
            Err(PathError::NoSuchFile)
        );

        std::fs::create_dir(sec.absolute_from_root("subdir")).unwrap();
        assert_eq!(
            sec.is_valid_for_read(&sec.absolute_from_root("subdir")),
            Err(PathError::IsDirectory)
        );
    }

    #[test]
    fn test_read_policy_disallow() {
        let dir = tempfile::tempdir().unwrap();
        let sec = security(dir.path()).read_policy(Policy::Disallow);

        assert_eq!(
            sec.is_valid_for_read(&sec.absolute_from_root("anything")),
            Err(PathError::AccessForbidden)
        );
    }

    #[test]
    fn test_write_validation_policies() {
        let dir = tempfile::tempdir().unwrap();

        let permissive = security(dir.path());
        let absent = permissive.absolute_from_root("new.bin");
        assert_eq!(permissive.is_valid_for_write(&absent), Ok(()));

        let no_create = FileSecurity::new(dir.path())
            .creation_policy(Policy::Disallow)
            .overwrite_policy(Policy::Allow);
        assert_eq!(
            no_create.is_valid_for_write(&absent),
            Err(PathError::CantCreateFile)
        );

        let present = permissive.absolute_from_root("present.bin");
        File::create(&present).unwrap().write_all(b"x").unwrap();

        let no_overwrite = FileSecurity::new(dir.path())
            .creation_policy(Policy::Allow)
            .overwrite_policy(Policy::Disallow);
        assert_eq!(
            no_overwrite.is_valid_for_write(&present),
            Err(PathError::AccessForbidden)
        );
        assert_eq!(permissive.is_valid_for_write(&present), Ok(()));

        std::fs::create_dir(permissive.absolute_from_root("subdir")).unwrap();
        assert_eq!(
            permissive.is_valid_for_write(&permissive.absolute_from_root("subdir")),
            Err(PathError::IsDirectory)
        );
    }

    #[test]
    fn test_lock_map_lifecycle() {
        let sec = security(Path::new("/srv/tftp"));
        let a = PathBuf::from("/srv/tftp/a");
        let b = PathBuf::from("/srv/tftp/b");

        assert!(sec.lock_read(&a));
        assert!(sec.lock_read(&a));
        assert!(sec.lock_write(&b));
        assert_eq!(sec.locked_paths(), 2);

        // Writer excluded while readers hold the entry.
        assert!(!sec.lock_write(&a));
        // Reader excluded while the writer holds the entry.
        assert!(!sec.lock_read(&b));

        assert!(sec.unlock_read(&a));
        assert_eq!(sec.locked_paths(), 2);
        assert!(sec.unlock_read(&a));
        // The entry disappears once the counter reaches zero.
        assert_eq!(sec.locked_paths(), 1);

        assert!(sec.unlock_write(&b));
        assert_eq!(sec.locked_paths(), 0);

        assert!(!sec.unlock_read(&a));
    }
}
