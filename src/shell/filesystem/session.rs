//! Per-session copy-on-write overlay over the shared base image.
//!
//! The overlay maps absolute normalized paths to either a private
//! `FileEntry` or a tombstone (`None`) meaning "deleted in this session".
//! The map's own lock is only ever held for pointer-level work; byte
//! copying happens under each entry's lock so concurrent writers to
//! distinct files never serialize on the overlay.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use super::base::base;
use super::{basename, normalize, parent_of, FileEntry, FsError};

/// Hard cap on any single file's content.
pub const MAX_FILE_SIZE: usize = 5 << 20;

pub struct SessionFs {
    overlay: RwLock<HashMap<String, Option<Arc<FileEntry>>>>,
    cwd: RwLock<String>,
}

impl SessionFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            overlay: RwLock::new(HashMap::new()),
            cwd: RwLock::new("/root".to_string()),
        })
    }

    pub fn cwd(&self) -> String {
        self.cwd.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_cwd(&self, dir: String) {
        *self.cwd.write().unwrap_or_else(PoisonError::into_inner) = dir;
    }

    /// Expand `~`, join relative paths against the cwd, and normalize.
    pub fn abs(&self, p: &str) -> String {
        if p.is_empty() {
            return self.cwd();
        }
        if p == "~" {
            return "/root".to_string();
        }
        if let Some(rest) = p.strip_prefix("~/") {
            return normalize(&format!("/root/{rest}"));
        }
        if !p.starts_with('/') {
            return normalize(&format!("{}/{}", self.cwd(), p));
        }
        normalize(p)
    }

    /// Overlay-then-base lookup. A tombstone hides the base entry.
    pub fn entry(&self, p: &str) -> Option<Arc<FileEntry>> {
        let p = normalize(p);
        {
            let overlay = self.overlay.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = overlay.get(&p) {
                return slot.clone();
            }
        }
        base().entry(&p).cloned()
    }

    /// Full content snapshot of a regular file.
    pub fn read_file(&self, p: &str) -> Result<Vec<u8>, FsError> {
        let e = self.entry(p).ok_or(FsError::NotFound)?;
        if e.is_dir {
            return Err(FsError::IsADirectory);
        }
        Ok(e.content())
    }

    /// Merged directory listing, sorted by lower-cased name.
    pub fn list_dir(&self, p: &str) -> Result<Vec<Arc<FileEntry>>, FsError> {
        let p = normalize(p);
        match self.entry(&p) {
            Some(e) if e.is_dir => {}
            _ => return Err(FsError::NotFound),
        }

        let mut items: HashMap<String, Arc<FileEntry>> = base()
            .children_of(&p)
            .iter()
            .map(|e| (e.name.clone(), e.clone()))
            .collect();

        {
            let overlay = self.overlay.read().unwrap_or_else(PoisonError::into_inner);
            for (path, slot) in overlay.iter() {
                if parent_of(path) == p && *path != p {
                    match slot {
                        None => {
                            items.remove(basename(path));
                        }
                        Some(e) => {
                            items.insert(e.name.clone(), e.clone());
                        }
                    }
                }
            }
        }

        let mut res: Vec<Arc<FileEntry>> = items.into_values().collect();
        res.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(res)
    }

    /// Replace a file's entire content, materializing a private copy first
    /// when the path only resolves to the base image. `mode` of `None`
    /// inherits the base entry's mode (0644 for brand-new files).
    pub fn write(&self, p: &str, data: Vec<u8>, mode: Option<u32>) -> Result<(), FsError> {
        if data.len() > MAX_FILE_SIZE {
            return Err(FsError::QuotaExceeded);
        }
        let p = normalize(p);

        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(Some(existing)) = overlay.get(&p) {
            let mut st = existing.write();
            st.content = data;
            st.mtime = SystemTime::now();
            if let Some(m) = mode {
                st.mode = m;
            }
        } else {
            let (mut uid, mut gid) = (0, 0);
            let mut eff_mode = mode;
            if let Some(b) = base().entry(&p) {
                let st = b.read();
                uid = st.uid;
                gid = st.gid;
                if eff_mode.is_none() {
                    eff_mode = Some(st.mode);
                }
            }
            overlay.insert(
                p.clone(),
                Some(Arc::new(FileEntry::file(
                    basename(&p),
                    data,
                    eff_mode.unwrap_or(0o644),
                    uid,
                    gid,
                ))),
            );
        }
        Ok(())
    }

    pub fn mkdir(&self, p: &str) -> Result<(), FsError> {
        let p = normalize(p);
        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        overlay.insert(p.clone(), Some(Arc::new(FileEntry::dir(basename(&p), 0o755, 0, 0))));
        Ok(())
    }

    /// Unconditional tombstone. Removing a directory does not recurse into
    /// overlay descendants; they stay reachable by full path. Known
    /// simplification, acceptable for a honeypot.
    pub fn remove(&self, p: &str) -> Result<(), FsError> {
        let p = normalize(p);
        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        overlay.insert(p, None);
        Ok(())
    }

    /// Copy the source into the overlay under the new path and tombstone
    /// the old one. The copy is deep, so the two names never share bytes.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let old = normalize(old);
        let new = normalize(new);
        let src = self.entry(&old).ok_or(FsError::NotFound)?;
        let copy = Arc::new(src.detach(basename(&new)));
        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        overlay.insert(new, Some(copy));
        overlay.insert(old, None);
        Ok(())
    }

    /// Replace the permission bits, copying a base entry into the overlay
    /// first if needed.
    pub fn chmod(&self, p: &str, mode: u32) -> Result<(), FsError> {
        let p = normalize(p);
        let src = self.entry(&p).ok_or(FsError::NotFound)?;
        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(Some(existing)) = overlay.get(&p) {
            let mut st = existing.write();
            st.mode = (st.mode & !0o777) | (mode & 0o777);
            st.mtime = SystemTime::now();
        } else {
            let copy = src.detach(basename(&p));
            {
                let mut st = copy.write();
                st.mode = (st.mode & !0o777) | (mode & 0o777);
            }
            overlay.insert(p, Some(Arc::new(copy)));
        }
        Ok(())
    }

    /// Change ownership; a sentinel of -1 preserves the field.
    pub fn chown(&self, p: &str, uid: i64, gid: i64) -> Result<(), FsError> {
        let p = normalize(p);
        let src = self.entry(&p).ok_or(FsError::NotFound)?;
        let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(Some(existing)) = overlay.get(&p) {
            let mut st = existing.write();
            if uid != -1 {
                st.uid = uid as u32;
            }
            if gid != -1 {
                st.gid = gid as u32;
            }
            st.mtime = SystemTime::now();
        } else {
            let copy = src.detach(basename(&p));
            {
                let mut st = copy.write();
                if uid != -1 {
                    st.uid = uid as u32;
                }
                if gid != -1 {
                    st.gid = gid as u32;
                }
            }
            overlay.insert(p, Some(Arc::new(copy)));
        }
        Ok(())
    }

    /// Random-offset write, the SFTP upload path.
    ///
    /// Phase 1 finds or materializes the overlay entry under the overlay
    /// lock, pre-sizing capacity; phase 2 copies bytes under the entry's
    /// own lock. Holding the overlay lock across the copy would serialize
    /// every session's uploads globally.
    pub fn write_at(&self, p: &str, off: u64, data: &[u8]) -> Result<(), FsError> {
        let p = normalize(p);
        let off = off as usize;
        let end = off.checked_add(data.len()).ok_or(FsError::QuotaExceeded)?;
        if end > MAX_FILE_SIZE {
            return Err(FsError::QuotaExceeded);
        }

        let entry = {
            let mut overlay = self.overlay.write().unwrap_or_else(PoisonError::into_inner);
            match overlay.get(&p) {
                Some(Some(e)) => e.clone(),
                _ => {
                    let (mut content, mode, uid, gid) = match base().entry(&p) {
                        Some(b) => {
                            let st = b.read();
                            let mut c = Vec::with_capacity(st.content.len().max(end));
                            c.extend_from_slice(&st.content);
                            (c, st.mode, st.uid, st.gid)
                        }
                        None => (Vec::with_capacity(end), 0o644, 0, 0),
                    };
                    content.reserve(end.saturating_sub(content.len()));
                    let e = Arc::new(FileEntry::file(basename(&p), content, mode, uid, gid));
                    overlay.insert(p.clone(), Some(e.clone()));
                    e
                }
            }
        };

        let mut st = entry.write();
        if end > st.content.capacity() {
            let mut new_cap = st.content.capacity().saturating_mul(2);
            if new_cap < end {
                new_cap = end;
            }
            if new_cap > MAX_FILE_SIZE {
                new_cap = MAX_FILE_SIZE;
            }
            let additional = new_cap - st.content.len();
            st.content.reserve_exact(additional);
        }
        if end > st.content.len() {
            st.content.resize(end, 0);
        }
        st.content[off..end].copy_from_slice(data);
        st.mtime = SystemTime::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_your_own_writes() {
        let fs = SessionFs::new();
        fs.write("/tmp/x", b"payload".to_vec(), None).unwrap();
        let e = fs.entry("/tmp/x").unwrap();
        assert_eq!(e.content(), b"payload");
        assert_eq!(fs.read_file("/tmp/x").unwrap(), b"payload");
    }

    #[test]
    fn test_read_file_error_kinds() {
        let fs = SessionFs::new();
        assert_eq!(fs.read_file("/missing").unwrap_err(), FsError::NotFound);
        assert_eq!(fs.read_file("/etc").unwrap_err(), FsError::IsADirectory);
    }

    #[test]
    fn test_cow_isolation_between_sessions() {
        let canonical = b"127.0.0.1 localhost\n127.0.1.1 ubuntu-server\n".to_vec();
        let a = SessionFs::new();
        let b = SessionFs::new();

        a.write("/etc/hosts", b"hello\n".to_vec(), None).unwrap();

        assert_eq!(a.entry("/etc/hosts").unwrap().content(), b"hello\n");
        assert_eq!(b.entry("/etc/hosts").unwrap().content(), canonical);

        // A fresh session after both still sees the canonical content.
        drop(a);
        drop(b);
        let c = SessionFs::new();
        assert_eq!(c.entry("/etc/hosts").unwrap().content(), canonical);
    }

    #[test]
    fn test_tombstone_hides_base_entry() {
        let fs = SessionFs::new();
        assert!(fs.entry("/etc/hosts").is_some());
        fs.remove("/etc/hosts").unwrap();
        assert!(fs.entry("/etc/hosts").is_none());
        let names: Vec<String> = fs
            .list_dir("/etc")
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert!(!names.contains(&"hosts".to_string()));
        assert!(names.contains(&"passwd".to_string()));
    }

    #[test]
    fn test_list_dir_merges_overlay() {
        let fs = SessionFs::new();
        fs.write("/etc/planted", b"x".to_vec(), None).unwrap();
        let names: Vec<String> = fs
            .list_dir("/etc")
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert!(names.contains(&"planted".to_string()));
        let mut sorted = names.clone();
        sorted.sort_by_key(|n| n.to_lowercase());
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_list_dir_on_file_is_not_found() {
        let fs = SessionFs::new();
        assert_eq!(fs.list_dir("/etc/passwd").unwrap_err(), FsError::NotFound);
        assert_eq!(fs.list_dir("/no/such/dir").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn test_quota_boundary() {
        let fs = SessionFs::new();
        fs.write("/tmp/max", vec![0u8; MAX_FILE_SIZE], None).unwrap();
        assert_eq!(
            fs.write("/tmp/over", vec![0u8; MAX_FILE_SIZE + 1], None),
            Err(FsError::QuotaExceeded)
        );
        // Same boundary through the offset-write path.
        fs.write_at("/tmp/off", (MAX_FILE_SIZE - 1) as u64, b"x").unwrap();
        assert_eq!(
            fs.write_at("/tmp/off", MAX_FILE_SIZE as u64, b"x"),
            Err(FsError::QuotaExceeded)
        );
    }

    #[test]
    fn test_write_at_extends_with_zeros() {
        let fs = SessionFs::new();
        fs.write("/tmp/hole", b"ab".to_vec(), None).unwrap();
        fs.write_at("/tmp/hole", 10, b"cd").unwrap();
        let content = fs.entry("/tmp/hole").unwrap().content();
        assert_eq!(content.len(), 12);
        assert_eq!(&content[..2], b"ab");
        assert_eq!(&content[2..10], &[0u8; 8]);
        assert_eq!(&content[10..], b"cd");
    }

    #[test]
    fn test_write_at_cow_preserves_base_bytes() {
        let fs = SessionFs::new();
        fs.write_at("/etc/hosts", 0, b"X").unwrap();
        let mine = fs.entry("/etc/hosts").unwrap().content();
        assert!(mine.starts_with(b"X27.0.0.1"));
        let fresh = SessionFs::new();
        assert!(fresh.entry("/etc/hosts").unwrap().content().starts_with(b"127.0.0.1"));
    }

    #[test]
    fn test_rename_moves_and_tombstones() {
        let fs = SessionFs::new();
        fs.write("/tmp/a", b"data".to_vec(), None).unwrap();
        fs.rename("/tmp/a", "/tmp/b").unwrap();
        assert!(fs.entry("/tmp/a").is_none());
        let b = fs.entry("/tmp/b").unwrap();
        assert_eq!(b.name, "b");
        assert_eq!(b.content(), b"data");
        assert_eq!(fs.rename("/tmp/nope", "/tmp/x"), Err(FsError::NotFound));
    }

    #[test]
    fn test_rename_base_entry_leaves_base_intact() {
        let fs = SessionFs::new();
        fs.rename("/etc/hosts", "/tmp/hosts").unwrap();
        assert!(fs.entry("/etc/hosts").is_none());
        assert!(fs.entry("/tmp/hosts").is_some());
        let fresh = SessionFs::new();
        assert!(fresh.entry("/etc/hosts").is_some());
    }

    #[test]
    fn test_chmod_touches_permission_bits_only() {
        let fs = SessionFs::new();
        fs.chmod("/etc/hosts", 0o600).unwrap();
        let st = fs.entry("/etc/hosts").unwrap().read().clone();
        assert_eq!(st.mode & 0o777, 0o600);
        // Base copy untouched.
        let fresh = SessionFs::new();
        assert_eq!(fresh.entry("/etc/hosts").unwrap().read().mode & 0o777, 0o644);
    }

    #[test]
    fn test_chown_sentinel_preserves_field() {
        let fs = SessionFs::new();
        fs.chown("/etc/hosts", 1000, -1).unwrap();
        let st = fs.entry("/etc/hosts").unwrap().read().clone();
        assert_eq!(st.uid, 1000);
        assert_eq!(st.gid, 0);
        fs.chown("/etc/hosts", -1, 33).unwrap();
        let st = fs.entry("/etc/hosts").unwrap().read().clone();
        assert_eq!(st.uid, 1000);
        assert_eq!(st.gid, 33);
    }

    #[test]
    fn test_abs_expansion() {
        let fs = SessionFs::new();
        assert_eq!(fs.abs("~"), "/root");
        assert_eq!(fs.abs("~/notes"), "/root/notes");
        assert_eq!(fs.abs("x/y"), "/root/x/y");
        fs.set_cwd("/var/log".to_string());
        assert_eq!(fs.abs("syslog"), "/var/log/syslog");
        assert_eq!(fs.abs(".."), "/var");
        assert_eq!(fs.abs("/etc//passwd"), "/etc/passwd");
        assert_eq!(fs.abs(""), "/var/log");
    }

    #[test]
    fn test_concurrent_writers_distinct_paths() {
        let fs = SessionFs::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let fs = fs.clone();
            handles.push(std::thread::spawn(move || {
                let p = format!("/tmp/f{i}");
                for round in 0..50 {
                    fs.write(&p, vec![round as u8; 512], None).unwrap();
                    assert_eq!(fs.entry(&p).unwrap().content(), vec![round as u8; 512]);
                    let _ = fs.list_dir("/tmp").unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fs.list_dir("/tmp").unwrap().len(), 32);
    }

    #[test]
    fn test_concurrent_offset_writes_same_file() {
        let fs = SessionFs::new();
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let fs = fs.clone();
            handles.push(std::thread::spawn(move || {
                fs.write_at("/tmp/big", i * 1024, &[i as u8; 1024]).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let content = fs.entry("/tmp/big").unwrap().content();
        assert_eq!(content.len(), 8 * 1024);
        for i in 0..8usize {
            assert!(content[i * 1024..(i + 1) * 1024].iter().all(|&b| b == i as u8));
        }
    }
}
