// src/error.rs
use libc::{EUCLEAN, ENOENT, ENOMEM};
use thiserror::Error;

use crate::qgroup::QgroupId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QgroupError {
    #[error("fallo del kernel (errno {0})")]
    Kernel(i32),
    #[error("qgroup {0} no encontrado")]
    NotFound(QgroupId),
    #[error("datos de cuota malformados: {0}")]
    Malformed(String),
    #[error("memoria insuficiente")]
    OutOfMemory,
}

impl QgroupError {
    pub fn as_errno(&self) -> i32 {
        match self {
            QgroupError::Kernel(errno) => *errno,
            QgroupError::NotFound(_) => ENOENT,
            QgroupError::Malformed(_) => EUCLEAN,
            QgroupError::OutOfMemory => ENOMEM,
        }
    }
}

impl From<nix::errno::Errno> for QgroupError {
    fn from(errno: nix::errno::Errno) -> Self {
        QgroupError::Kernel(errno as i32)
    }
}

impl From<std::collections::TryReserveError> for QgroupError {
    fn from(_: std::collections::TryReserveError) -> Self {
        QgroupError::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, QgroupError>;
