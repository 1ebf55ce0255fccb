//! Per-user cookie storage.
//!
//! Every file-system operation on a user's cookie runs with the process's
//! file-system identity switched to that user, so the kernel's permission
//! checks apply as if the user had made them. The identity switch is
//! per-thread, which is why the work runs on a dedicated blocking thread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use cardkeeper_types::{Cookie, COOKIE_SIZE};

use crate::users::UserEntry;
use crate::CookieError;

/// Switches the calling thread's file-system uid and gid, restoring the
/// previous identity when dropped.
pub struct Impersonation {
    prev_uid: libc::uid_t,
    prev_gid: libc::gid_t,
    // Identity is per-thread; the guard must not migrate.
    _thread_bound: PhantomData<*const ()>,
}

impl Impersonation {
    pub fn assume(uid: u32, gid: u32) -> Result<Self, CookieError> {
        // SAFETY: setfsgid/setfsuid only change the calling thread's
        // credentials; passing -1 queries the current value.
        unsafe {
            let prev_gid = libc::setfsgid(gid) as libc::gid_t;
            if libc::setfsgid(u32::MAX) as libc::gid_t != gid {
                libc::setfsgid(prev_gid);
                return Err(CookieError::Impersonate { id: gid });
            }
            let prev_uid = libc::setfsuid(uid) as libc::uid_t;
            if libc::setfsuid(u32::MAX) as libc::uid_t != uid {
                libc::setfsuid(prev_uid);
                libc::setfsgid(prev_gid);
                return Err(CookieError::Impersonate { id: uid });
            }
            Ok(Self {
                prev_uid,
                prev_gid,
                _thread_bound: PhantomData,
            })
        }
    }
}

impl Drop for Impersonation {
    fn drop(&mut self) {
        // SAFETY: see `assume`.
        unsafe {
            libc::setfsuid(self.prev_uid);
            libc::setfsgid(self.prev_gid);
        }
    }
}

/// Return `user`'s cookie, creating it if it is missing or malformed.
pub async fn get_cookie(user: UserEntry, cookie_file: PathBuf) -> Result<Cookie, CookieError> {
    tokio::task::spawn_blocking(move || {
        let _identity = Impersonation::assume(user.uid, user.gid)?;
        load_or_create(&user.home.join(&cookie_file), user.uid, user.gid)
    })
    .await
    .map_err(|e| CookieError::Join(e.to_string()))?
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CookieError + '_ {
    move |source| CookieError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn load_or_create(path: &Path, uid: u32, gid: u32) -> Result<Cookie, CookieError> {
    match load_existing(path)? {
        Some(cookie) => Ok(cookie),
        None => create(path, uid, gid),
    }
}

/// Read an existing cookie. Returns `None` if there is none, removing a file
/// that fails the shape checks.
fn load_existing(path: &Path) -> Result<Option<Cookie>, CookieError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };

    let problem = if meta.file_type().is_symlink() {
        Some("is a link")
    } else if meta.nlink() != 1 {
        Some("too many hard links")
    } else if !meta.is_file() {
        Some("not a regular file")
    } else if meta.len() != COOKIE_SIZE as u64 {
        Some("bad size")
    } else {
        None
    };
    if let Some(problem) = problem {
        tracing::warn!(path = %path.display(), problem, "cookie malformed - remove and recreate");
        fs::remove_file(path).map_err(io_err(path))?;
        return Ok(None);
    }

    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(io_err(path))?;
    let mut bytes = Zeroizing::new(Vec::with_capacity(COOKIE_SIZE + 1));
    Read::by_ref(&mut file)
        .take(COOKIE_SIZE as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(io_err(path))?;
    match Cookie::from_slice(&bytes) {
        Ok(cookie) => Ok(Some(cookie)),
        Err(_) => {
            tracing::warn!(path = %path.display(), len = bytes.len(), "cookie changed size - remove and recreate");
            fs::remove_file(path).map_err(io_err(path))?;
            Ok(None)
        }
    }
}

fn create(path: &Path, uid: u32, gid: u32) -> Result<Cookie, CookieError> {
    let mut bytes = Zeroizing::new([0u8; COOKIE_SIZE]);
    getrandom::getrandom(&mut bytes[..]).map_err(|e| CookieError::Random(e.to_string()))?;

    let mut file: File = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(&bytes[..]).map_err(io_err(path))?;
    std::os::unix::fs::fchown(&file, Some(uid), Some(gid)).map_err(io_err(path))?;
    tracing::info!(path = %path.display(), "created cookie");
    Ok(Cookie::new(*bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn me() -> (u32, u32) {
        // SAFETY: getuid/getgid cannot fail.
        unsafe { (libc::getuid(), libc::getgid()) }
    }

    #[test]
    fn creates_owner_read_only_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        let (uid, gid) = me();

        let cookie = load_or_create(&path, uid, gid).unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        assert_eq!(meta.len(), COOKIE_SIZE as u64);
        assert_eq!(meta.permissions().mode() & 0o777, 0o400);
        assert_eq!(meta.uid(), uid);
        assert_eq!(fs::read(&path).unwrap(), cookie.as_bytes());
    }

    #[test]
    fn wrong_size_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        fs::write(&path, b"short").unwrap();
        let (uid, gid) = me();

        let cookie = load_or_create(&path, uid, gid).unwrap();
        assert_eq!(fs::read(&path).unwrap(), cookie.as_bytes());
    }

    #[test]
    fn extra_hard_link_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        let (uid, gid) = me();
        let first = load_or_create(&path, uid, gid).unwrap();
        fs::hard_link(&path, dir.path().join("other")).unwrap();

        let second = load_or_create(&path, uid, gid).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::symlink_metadata(&path).unwrap().nlink(), 1);
        assert_eq!(fs::read(dir.path().join("other")).unwrap(), first.as_bytes());
    }

    #[test]
    fn impersonating_self_succeeds_and_restores() {
        let (uid, gid) = me();
        {
            let _guard = Impersonation::assume(uid, gid).unwrap();
        }
        // SAFETY: query only.
        let current = unsafe { libc::setfsuid(u32::MAX) } as u32;
        assert_eq!(current, uid);
    }
}
