pub mod admin;
pub mod backend;
pub mod config;
pub mod demo;
mod error;
pub mod ioctl;
pub mod logging;
pub mod mock;
mod printer;
mod qgroup;
pub mod repository;
pub mod search;

pub use crate::backend::{BtrfsBackend, IoctlBackend};
pub use crate::config::{ConfigError, DemoConfig};
pub use crate::error::{QgroupError, Result};
pub use crate::printer::{format_size, render, render_list};
pub use crate::qgroup::{
    Direction,
    Qgroup,
    QgroupId,
    QgroupInherit,
    ParseQgroupIdError,
};
pub use crate::repository::{classify_relation, QgroupRepository, Relation};
pub use crate::search::{SearchKey, SearchOutcome, SearchRecord, Walk};
