//! SFTP adapter: maps SFTP v3 request kinds onto the session filesystem.
//! Reads snapshot content under the per-entry lock; writes go through the
//! two-phase offset-write path, so concurrent uploads from different
//! sessions never serialize on each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use russh_sftp::server::Handler;

use crate::shell::filesystem::session::SessionFs;
use crate::shell::filesystem::{FileEntry, FsError};

enum HandleState {
    File { path: String },
    Dir { path: String, listed: bool },
}

pub struct SftpSession {
    fs: Arc<SessionFs>,
    handles: HashMap<String, HandleState>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(fs: Arc<SessionFs>) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn alloc_handle(&mut self, state: HandleState) -> String {
        self.next_handle += 1;
        let handle = format!("h{}", self.next_handle);
        self.handles.insert(handle.clone(), state);
        handle
    }

    fn ok_status(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "".to_string(),
            language_tag: "".to_string(),
        }
    }

    fn fail_status(id: u32, message: String) -> Status {
        Status {
            id,
            status_code: StatusCode::Failure,
            error_message: message,
            language_tag: "".to_string(),
        }
    }

    fn map_err(err: FsError) -> StatusCode {
        match err {
            FsError::NotFound => StatusCode::NoSuchFile,
            // SFTP v3 has no finer-grained codes for these.
            FsError::NotADirectory | FsError::IsADirectory | FsError::QuotaExceeded => {
                StatusCode::Failure
            }
        }
    }

    fn attrs_of(entry: &Arc<FileEntry>) -> FileAttributes {
        let st = entry.read();
        let mut attrs = FileAttributes::default();
        attrs.size = Some(st.content.len() as u64);
        attrs.uid = Some(st.uid);
        attrs.gid = Some(st.gid);
        attrs.permissions = Some(if entry.is_dir {
            0o040000 | (st.mode & 0o7777)
        } else {
            0o100000 | (st.mode & 0o7777)
        });
        attrs.mtime = Some(
            st.mtime
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
        );
        attrs
    }
}

impl Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> impl Future<Output = Result<Version, Self::Error>> + Send {
        log::debug!("sftp session initialized (client version {version})");
        async { Ok(Version::new()) }
    }

    fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> impl Future<Output = Result<Handle, Self::Error>> + Send {
        let path = self.fs.abs(&filename);
        log::debug!("sftp open: {path} ({pflags:?})");

        let wants_create = pflags.contains(OpenFlags::CREATE);
        let truncate = pflags.contains(OpenFlags::TRUNCATE);
        let exists = self.fs.entry(&path).is_some();
        if (wants_create && !exists) || (truncate && exists) {
            let _ = self.fs.write(&path, Vec::new(), None);
        }

        let handle = self.alloc_handle(HandleState::File { path });
        async move { Ok(Handle { id, handle }) }
    }

    fn close(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        self.handles.remove(&handle);
        async move { Ok(Self::ok_status(id)) }
    }

    fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> impl Future<Output = Result<Data, Self::Error>> + Send {
        let result = match self.handles.get(&handle) {
            Some(HandleState::File { path }) => match self.fs.read_file(path) {
                // The snapshot is taken under the entry read lock; a
                // concurrent writer can't shrink it out from under us.
                Ok(content) => {
                    let start = offset as usize;
                    if start >= content.len() {
                        Err(StatusCode::Eof)
                    } else {
                        let end = (start + len as usize).min(content.len());
                        Ok(Data {
                            id,
                            data: content[start..end].to_vec(),
                        })
                    }
                }
                Err(err) => Err(Self::map_err(err)),
            },
            _ => Err(StatusCode::Failure),
        };
        async move { result }
    }

    fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let result = match self.handles.get(&handle) {
            Some(HandleState::File { path }) => match self.fs.write_at(path, offset, &data) {
                Ok(()) => Ok(Self::ok_status(id)),
                Err(err @ FsError::QuotaExceeded) => Ok(Self::fail_status(id, err.to_string())),
                Err(_) => Err(StatusCode::Failure),
            },
            _ => Err(StatusCode::Failure),
        };
        async move { result }
    }

    fn opendir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Handle, Self::Error>> + Send {
        let abs = self.fs.abs(&path);
        let result = match self.fs.entry(&abs) {
            Some(e) if e.is_dir => {
                let handle = self.alloc_handle(HandleState::Dir {
                    path: abs,
                    listed: false,
                });
                Ok(Handle { id, handle })
            }
            Some(_) => Err(Self::map_err(FsError::NotADirectory)),
            None => Err(Self::map_err(FsError::NotFound)),
        };
        async move { result }
    }

    fn readdir(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        let result = match self.handles.get_mut(&handle) {
            Some(HandleState::Dir { path, listed }) => {
                if *listed {
                    Err(StatusCode::Eof)
                } else {
                    *listed = true;
                    match self.fs.list_dir(path) {
                        Ok(entries) => Ok(Name {
                            id,
                            files: entries
                                .iter()
                                .map(|e| File::new(e.name.as_str(), Self::attrs_of(e)))
                                .collect(),
                        }),
                        Err(_) => Err(StatusCode::NoSuchFile),
                    }
                }
            }
            _ => Err(StatusCode::Failure),
        };
        async move { result }
    }

    fn remove(
        &mut self,
        id: u32,
        filename: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let path = self.fs.abs(&filename);
        log::debug!("sftp remove: {path}");
        let _ = self.fs.remove(&path);
        async move { Ok(Self::ok_status(id)) }
    }

    fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let abs = self.fs.abs(&path);
        log::debug!("sftp mkdir: {abs}");
        let _ = self.fs.mkdir(&abs);
        async move { Ok(Self::ok_status(id)) }
    }

    fn rmdir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let abs = self.fs.abs(&path);
        log::debug!("sftp rmdir: {abs}");
        let _ = self.fs.remove(&abs);
        async move { Ok(Self::ok_status(id)) }
    }

    fn realpath(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        let abs = self.fs.abs(&path);
        async move {
            Ok(Name {
                id,
                files: vec![File::new(abs, FileAttributes::default())],
            })
        }
    }

    fn stat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        let result = match self.fs.entry(&self.fs.abs(&path)) {
            Some(entry) => Ok(Attrs {
                id,
                attrs: Self::attrs_of(&entry),
            }),
            None => Err(StatusCode::NoSuchFile),
        };
        async move { result }
    }

    fn lstat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        self.stat(id, path)
    }

    fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let abs = self.fs.abs(&path);
        let result = match attrs.permissions {
            Some(perm) => match self.fs.chmod(&abs, perm) {
                Ok(()) => Ok(Self::ok_status(id)),
                Err(_) => Err(StatusCode::NoSuchFile),
            },
            None => Ok(Self::ok_status(id)),
        };
        async move { result }
    }

    fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let old = self.fs.abs(&oldpath);
        let new = self.fs.abs(&newpath);
        log::debug!("sftp rename: {old} -> {new}");
        let result = match self.fs.rename(&old, &new) {
            Ok(()) => Ok(Self::ok_status(id)),
            Err(_) => Err(StatusCode::NoSuchFile),
        };
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::filesystem::session::MAX_FILE_SIZE;

    fn session() -> SftpSession {
        SftpSession::new(SessionFs::new())
    }

    #[tokio::test]
    async fn test_create_write_read_round_trip() {
        let mut s = session();
        let h = s
            .open(
                1,
                "/tmp/x".to_string(),
                OpenFlags::CREATE | OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        let st = s
            .write(2, h.handle.clone(), 0, b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(st.status_code, StatusCode::Ok);
        s.close(3, h.handle).await.unwrap();

        let h = s
            .open(4, "/tmp/x".to_string(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = s.read(5, h.handle.clone(), 0, 1024).await.unwrap();
        assert_eq!(data.data, b"payload");
        // Reading past the end is EOF, not an error status.
        assert_eq!(
            s.read(6, h.handle.clone(), 7, 1024).await.unwrap_err(),
            StatusCode::Eof
        );
    }

    #[tokio::test]
    async fn test_readdir_lists_new_file_once() {
        let mut s = session();
        let h = s
            .open(
                1,
                "/tmp/x".to_string(),
                OpenFlags::CREATE | OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        s.write(2, h.handle.clone(), 0, b"d".to_vec()).await.unwrap();

        let dh = s.opendir(3, "/tmp".to_string()).await.unwrap();
        let listing = s.readdir(4, dh.handle.clone()).await.unwrap();
        assert!(listing.files.iter().any(|f| f.filename == "x"));
        // Second call signals end-of-listing.
        assert_eq!(
            s.readdir(5, dh.handle).await.unwrap_err(),
            StatusCode::Eof
        );
    }

    #[tokio::test]
    async fn test_quota_surfaces_as_failure_status() {
        let mut s = session();
        let h = s
            .open(
                1,
                "/tmp/big".to_string(),
                OpenFlags::CREATE | OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        let st = s
            .write(2, h.handle, MAX_FILE_SIZE as u64, b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(st.status_code, StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_stat_and_setstat() {
        let mut s = session();
        let attrs = s.stat(1, "/etc/hosts".to_string()).await.unwrap();
        assert_eq!(attrs.attrs.permissions, Some(0o100644));
        assert!(attrs.attrs.size.unwrap() > 0);

        let dir = s.stat(2, "/etc".to_string()).await.unwrap();
        assert_eq!(dir.attrs.permissions, Some(0o040755));

        let mut set = FileAttributes::default();
        set.permissions = Some(0o600);
        s.setstat(3, "/etc/hosts".to_string(), set).await.unwrap();
        let attrs = s.stat(4, "/etc/hosts".to_string()).await.unwrap();
        assert_eq!(attrs.attrs.permissions, Some(0o100600));

        assert_eq!(
            s.stat(5, "/missing".to_string()).await.unwrap_err(),
            StatusCode::NoSuchFile
        );
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let mut s = session();
        let h = s
            .open(
                1,
                "/tmp/a".to_string(),
                OpenFlags::CREATE | OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        s.write(2, h.handle, 0, b"v".to_vec()).await.unwrap();

        s.rename(3, "/tmp/a".to_string(), "/tmp/b".to_string())
            .await
            .unwrap();
        assert!(s.fs.entry("/tmp/a").is_none());
        assert_eq!(s.fs.entry("/tmp/b").unwrap().content(), b"v");

        s.remove(4, "/tmp/b".to_string()).await.unwrap();
        assert!(s.fs.entry("/tmp/b").is_none());
    }
}
