// src/ioctl.rs
//
// Estructuras y números de ioctl de btrfs, con el layout exacto de
// <linux/btrfs.h> y <linux/btrfs_tree.h>.
use nix::{ioctl_none, ioctl_read, ioctl_readwrite, ioctl_write_ptr};

pub const BTRFS_IOCTL_MAGIC: u8 = 0x94;

pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;

pub const BTRFS_QGROUP_INFO_KEY: u32 = 242;
pub const BTRFS_QGROUP_LIMIT_KEY: u32 = 244;
pub const BTRFS_QGROUP_RELATION_KEY: u32 = 246;

pub const BTRFS_QGROUP_LIMIT_MAX_EXCL: u64 = 1 << 1;
pub const BTRFS_SUBVOL_QGROUP_INHERIT: u64 = 1 << 2;

pub const BTRFS_SUBVOL_NAME_MAX: usize = 4039;
pub const BTRFS_SEARCH_ARGS_BUFSIZE: usize = 4096 - std::mem::size_of::<IoctlSearchKey>();

// -------------------- Qgroups --------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QgroupCreateArgs {
    pub create: u64,
    pub qgroupid: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QgroupAssignArgs {
    pub assign: u64,
    pub src: u64,
    pub dst: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QgroupLimit {
    pub flags: u64,
    pub max_rfer: u64,
    pub max_excl: u64,
    pub rsv_rfer: u64,
    pub rsv_excl: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QgroupLimitArgs {
    pub qgroupid: u64,
    pub lim: QgroupLimit,
}

// -------------------- Subvolúmenes --------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VolArgsV2 {
    pub fd: i64,
    pub transid: u64,
    pub flags: u64,
    // union con unused[4]; solo usamos la variante de qgroup_inherit
    pub size: u64,
    pub qgroup_inherit: u64,
    pub unused: [u64; 2],
    pub name: [u8; BTRFS_SUBVOL_NAME_MAX + 1],
}

impl Default for VolArgsV2 {
    fn default() -> Self {
        Self {
            fd: 0,
            transid: 0,
            flags: 0,
            size: 0,
            qgroup_inherit: 0,
            unused: [0; 2],
            name: [0; BTRFS_SUBVOL_NAME_MAX + 1],
        }
    }
}

// -------------------- Tree search --------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoctlSearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    pub unused: u32,
    pub unused1: u64,
    pub unused2: u64,
    pub unused3: u64,
    pub unused4: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoctlSearchArgs {
    pub key: IoctlSearchKey,
    pub buf: [u8; BTRFS_SEARCH_ARGS_BUFSIZE],
}

impl Default for IoctlSearchArgs {
    fn default() -> Self {
        Self {
            key: IoctlSearchKey::default(),
            buf: [0; BTRFS_SEARCH_ARGS_BUFSIZE],
        }
    }
}

/// Cabecera de cada registro dentro de `buf`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct IoctlSearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub r#type: u32,
    pub len: u32,
}

pub const SEARCH_HEADER_SIZE: usize = std::mem::size_of::<IoctlSearchHeader>();

ioctl_none!(btrfs_sync, BTRFS_IOCTL_MAGIC, 8);
ioctl_readwrite!(btrfs_tree_search, BTRFS_IOCTL_MAGIC, 17, IoctlSearchArgs);
ioctl_write_ptr!(btrfs_snap_create_v2, BTRFS_IOCTL_MAGIC, 23, VolArgsV2);
ioctl_write_ptr!(btrfs_subvol_create_v2, BTRFS_IOCTL_MAGIC, 24, VolArgsV2);
ioctl_write_ptr!(btrfs_qgroup_assign, BTRFS_IOCTL_MAGIC, 41, QgroupAssignArgs);
ioctl_write_ptr!(btrfs_qgroup_create, BTRFS_IOCTL_MAGIC, 42, QgroupCreateArgs);
ioctl_read!(btrfs_qgroup_limit, BTRFS_IOCTL_MAGIC, 43, QgroupLimitArgs);
