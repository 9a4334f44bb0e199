pub mod config;
pub mod daemon;
pub mod db;
pub mod fuse_fs;
pub mod meta;

use sha1::{Digest, Sha1};

/// Compute the filesystem id for a user-supplied filesystem name: the
/// SHA-1 hex digest of its UTF-8 bytes. Every row in the shared database
/// is scoped by this value.
pub fn fsid(fsname: &str) -> String {
    hex::encode(Sha1::digest(fsname.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum UdavError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("no matching row")]
    NoSuchRow,

    #[error("more than one matching row")]
    NotUnique,

    #[error("entry already exists")]
    Exists,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("parent has no remaining links")]
    OrphanParent,

    #[error("not a symlink")]
    NotSymlink,

    #[error("{0}")]
    Other(String),
}

impl UdavError {
    /// Map to the errno reported through the kernel bridge. Database
    /// failures and violated uniqueness invariants surface as EIO.
    pub fn errno(&self) -> libc::c_int {
        match self {
            UdavError::NoSuchRow => libc::ENOENT,
            UdavError::Exists => libc::EEXIST,
            UdavError::IsDirectory => libc::EISDIR,
            UdavError::NotDirectory => libc::ENOTDIR,
            UdavError::NotEmpty => libc::ENOTEMPTY,
            UdavError::OrphanParent | UdavError::NotSymlink => libc::EINVAL,
            UdavError::Db(_) | UdavError::NotUnique | UdavError::Other(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, UdavError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsid_is_sha1_hex() {
        // Known SHA-1 of "hello".
        assert_eq!(fsid("hello"), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(fsid("hello").len(), 40);
    }

    #[test]
    fn test_fsid_distinct_names() {
        assert_ne!(fsid("alpha"), fsid("beta"));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(UdavError::NoSuchRow.errno(), libc::ENOENT);
        assert_eq!(UdavError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(UdavError::NotUnique.errno(), libc::EIO);
    }
}
