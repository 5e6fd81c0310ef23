/*!
Two-layer virtual filesystem for honeypot sessions.

`base` holds the process-wide immutable image of an Ubuntu root; `session`
layers a per-connection copy-on-write overlay on top of it. Every attacker
sees the same pristine machine, and nothing an attacker writes ever reaches
another session or the base image.
*/
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use thiserror::Error;

pub mod base;
pub mod session;

/// Errors surfaced by filesystem operations. Display strings match the
/// zh-CN coreutils locale the simulated host runs under.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("没有那个文件或目录")]
    NotFound,
    #[error("不是目录")]
    NotADirectory,
    #[error("是一个目录")]
    IsADirectory,
    #[error("超出磁盘限额")]
    QuotaExceeded,
}

/// Mutable portion of a file record, guarded by the per-entry lock.
#[derive(Clone, Debug)]
pub struct EntryState {
    pub content: Vec<u8>,
    pub mode: u32,
    pub mtime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

/// Universal filesystem record shared by the base image and the overlays.
///
/// Base entries are never mutated after init; overlay entries take the
/// per-entry lock for in-place writes so the overlay map lock is only held
/// for pointer-level work.
#[derive(Debug)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    state: RwLock<EntryState>,
}

impl FileEntry {
    pub fn file(name: impl Into<String>, content: Vec<u8>, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            state: RwLock::new(EntryState {
                content,
                mode,
                mtime: SystemTime::now(),
                uid,
                gid,
                nlink: 1,
            }),
        }
    }

    pub fn dir(name: impl Into<String>, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            state: RwLock::new(EntryState {
                content: Vec::new(),
                mode,
                mtime: SystemTime::now(),
                uid,
                gid,
                nlink: 2,
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, EntryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, EntryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Byte snapshot of the content, taken under the entry read lock.
    pub fn content(&self) -> Vec<u8> {
        self.read().content.clone()
    }

    /// Deep copy under a new name with a fresh lock. Content bytes are
    /// cloned so no two entries ever alias the same buffer.
    pub fn detach(&self, name: impl Into<String>) -> Self {
        let mut st = self.read().clone();
        st.mtime = SystemTime::now();
        Self {
            name: name.into(),
            is_dir: self.is_dir,
            state: RwLock::new(st),
        }
    }
}

/// Collapse `.`, `..`, and duplicate slashes into an absolute normalized
/// path. Input is treated as absolute whether or not it starts with `/`.
pub fn normalize(p: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Parent directory of a normalized absolute path (`/` is its own parent).
pub fn parent_of(p: &str) -> &str {
    match p.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &p[..i],
    }
}

/// Final component of a normalized absolute path.
pub fn basename(p: &str) -> &str {
    match p.rfind('/') {
        Some(i) if i + 1 < p.len() => &p[i + 1..],
        _ => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_standard() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/home/user"), "/home/user");
    }

    #[test]
    fn test_normalize_dots() {
        assert_eq!(normalize("/home/user/./documents"), "/home/user/documents");
        assert_eq!(normalize("/home/user/../admin"), "/home/admin");
        assert_eq!(normalize("/home/./user/../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn test_normalize_beyond_root() {
        assert_eq!(normalize("/home/../../../../"), "/");
    }

    #[test]
    fn test_normalize_mixed() {
        assert_eq!(normalize("/./home//user/./docs/../files/./"), "/home/user/files");
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent_of("/etc/passwd"), "/etc");
        assert_eq!(parent_of("/etc"), "/");
        assert_eq!(parent_of("/"), "/");
        assert_eq!(basename("/etc/passwd"), "passwd");
        assert_eq!(basename("/etc"), "etc");
        assert_eq!(basename("/"), "/");
    }

    #[test]
    fn test_detach_is_deep() {
        let a = FileEntry::file("a", b"hello".to_vec(), 0o644, 0, 0);
        let b = a.detach("b");
        b.write().content.extend_from_slice(b" world");
        assert_eq!(a.content(), b"hello");
        assert_eq!(b.content(), b"hello world");
        assert_eq!(b.name, "b");
    }
}
