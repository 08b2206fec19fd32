// src/backend.rs
//
// Interfaz hacia el kernel. Existe para permitir varios backends: el real
// (ioctls de btrfs) y el simulado de `mock`, que usan las pruebas.
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use libc::{EINVAL, ENAMETOOLONG};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::error::{QgroupError, Result};
use crate::ioctl::{
    self, IoctlSearchArgs, QgroupAssignArgs, QgroupCreateArgs, QgroupLimit, QgroupLimitArgs,
    VolArgsV2, BTRFS_QGROUP_LIMIT_MAX_EXCL, BTRFS_SUBVOL_NAME_MAX, BTRFS_SUBVOL_QGROUP_INHERIT,
};
use crate::qgroup::{QgroupId, QgroupInherit};
use crate::search::{SearchBatch, SearchKey};

pub trait BtrfsBackend {
    /// Directorio abierto sobre el montaje o subvolumen; se cierra al soltarlo.
    type Dir;

    fn open_dir(&self, path: &Path) -> Result<Self::Dir>;

    /// `create == false` destruye el grupo.
    fn qgroup_create(&self, dir: &Self::Dir, id: QgroupId, create: bool) -> Result<()>;

    /// `assign == false` quita la relación.
    fn qgroup_assign(
        &self,
        dir: &Self::Dir,
        child: QgroupId,
        parent: QgroupId,
        assign: bool,
    ) -> Result<()>;

    fn qgroup_limit(&self, dir: &Self::Dir, id: QgroupId, max_exclusive: u64) -> Result<()>;

    /// Una sola llamada a TREE_SEARCH.
    fn tree_search(&self, dir: &Self::Dir, key: &SearchKey) -> Result<SearchBatch>;

    fn subvol_create(
        &self,
        dir: &Self::Dir,
        name: &OsStr,
        inherit: Option<&QgroupInherit>,
    ) -> Result<()>;

    fn snap_create(
        &self,
        dst: &Self::Dir,
        src: &Self::Dir,
        name: &OsStr,
        inherit: &QgroupInherit,
    ) -> Result<()>;

    fn sync(&self, dir: &Self::Dir) -> Result<()>;
}

/// Valida y copia el nombre del subvolumen al buffer de vol_args_v2.
pub fn copy_subvol_name(name: &OsStr, dst: &mut [u8; BTRFS_SUBVOL_NAME_MAX + 1]) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&0) || bytes.contains(&b'/') {
        return Err(QgroupError::Kernel(EINVAL));
    }
    // El NUL final es obligatorio.
    if bytes.len() > BTRFS_SUBVOL_NAME_MAX {
        return Err(QgroupError::Kernel(ENAMETOOLONG));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()] = 0;
    Ok(())
}

/// Arma `btrfs_ioctl_vol_args_v2`. `words` es el payload ya serializado de
/// `inherit` y debe seguir vivo hasta que vuelva el ioctl; `src` solo va en
/// snapshots.
fn vol_args(
    name: &OsStr,
    inherit: Option<(&QgroupInherit, &[u64])>,
    src: Option<RawFd>,
) -> Result<Box<VolArgsV2>> {
    let mut args = Box::new(VolArgsV2::default());
    copy_subvol_name(name, &mut args.name)?;

    if let Some(fd) = src {
        args.fd = fd as i64;
    }
    if let Some((inherit, words)) = inherit {
        args.flags |= BTRFS_SUBVOL_QGROUP_INHERIT;
        args.size = inherit.byte_len() as u64;
        args.qgroup_inherit = words.as_ptr() as u64;
    }
    Ok(args)
}

// -----------------------------------------------------------------------------
// Backend real
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct IoctlBackend;

impl IoctlBackend {
    pub fn new() -> Self {
        Self
    }
}

fn check(op: &str, res: nix::Result<libc::c_int>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(errno) => {
            warn!(op, errno = errno as i32, "ioctl falló: {errno}");
            Err(errno.into())
        }
    }
}

impl BtrfsBackend for IoctlBackend {
    type Dir = Dir;

    fn open_dir(&self, path: &Path) -> Result<Dir> {
        debug!(path = %path.display(), "abriendo directorio");
        Dir::open(
            path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| {
            warn!(path = %path.display(), errno = errno as i32, "no se pudo abrir el directorio");
            QgroupError::from(errno)
        })
    }

    fn qgroup_create(&self, dir: &Dir, id: QgroupId, create: bool) -> Result<()> {
        let args = QgroupCreateArgs {
            create: create as u64,
            qgroupid: id.raw(),
        };
        let op = if create { "qgroup create" } else { "qgroup destroy" };
        debug!(%id, "{op}");
        // SAFETY: args vive durante la llamada y tiene el layout del kernel.
        check(op, unsafe { ioctl::btrfs_qgroup_create(dir.as_raw_fd(), &args) })
    }

    fn qgroup_assign(&self, dir: &Dir, child: QgroupId, parent: QgroupId, assign: bool) -> Result<()> {
        let args = QgroupAssignArgs {
            assign: assign as u64,
            src: child.raw(),
            dst: parent.raw(),
        };
        debug!(%child, %parent, assign, "qgroup assign");
        // SAFETY: args vive durante la llamada y tiene el layout del kernel.
        check("qgroup assign", unsafe {
            ioctl::btrfs_qgroup_assign(dir.as_raw_fd(), &args)
        })
    }

    fn qgroup_limit(&self, dir: &Dir, id: QgroupId, max_exclusive: u64) -> Result<()> {
        let mut args = QgroupLimitArgs {
            qgroupid: id.raw(),
            lim: QgroupLimit {
                flags: BTRFS_QGROUP_LIMIT_MAX_EXCL,
                max_excl: max_exclusive,
                ..QgroupLimit::default()
            },
        };
        debug!(%id, max_exclusive, "qgroup limit");
        // SAFETY: args vive durante la llamada y tiene el layout del kernel.
        check("qgroup limit", unsafe {
            ioctl::btrfs_qgroup_limit(dir.as_raw_fd(), &mut args)
        })
    }

    fn tree_search(&self, dir: &Dir, key: &SearchKey) -> Result<SearchBatch> {
        let mut args = Box::new(IoctlSearchArgs::default());
        args.key = key.into();

        // Búsqueda de solo lectura: se reintenta si una señal la interrumpe.
        loop {
            // SAFETY: args es un btrfs_ioctl_search_args completo en el heap.
            match unsafe { ioctl::btrfs_tree_search(dir.as_raw_fd(), &mut *args) } {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!(errno = errno as i32, tree = key.tree_id, "no se pudieron buscar items de qgroup");
                    return Err(errno.into());
                }
            }
        }

        Ok(SearchBatch {
            nr_items: args.key.nr_items,
            buf: args.buf.to_vec(),
        })
    }

    fn subvol_create(&self, dir: &Dir, name: &OsStr, inherit: Option<&QgroupInherit>) -> Result<()> {
        // El payload tiene que vivir hasta que vuelva el ioctl.
        let words = inherit.map(QgroupInherit::to_words).transpose()?;
        let payload = inherit.zip(words.as_deref());
        let args = vol_args(name, payload, None)?;

        debug!(name = ?name, inherit = ?inherit.map(QgroupInherit::ids), "subvol create");
        // SAFETY: args y el payload siguen vivos durante la llamada.
        check("subvol create", unsafe {
            ioctl::btrfs_subvol_create_v2(dir.as_raw_fd(), &*args)
        })
    }

    fn snap_create(&self, dst: &Dir, src: &Dir, name: &OsStr, inherit: &QgroupInherit) -> Result<()> {
        let words = inherit.to_words()?;
        let args = vol_args(name, Some((inherit, words.as_slice())), Some(src.as_raw_fd()))?;

        debug!(name = ?name, inherit = ?inherit.ids(), "snapshot create");
        // SAFETY: args, words y el fd de origen siguen vivos durante la llamada.
        check("snap create", unsafe {
            ioctl::btrfs_snap_create_v2(dst.as_raw_fd(), &*args)
        })
    }

    fn sync(&self, dir: &Dir) -> Result<()> {
        // SAFETY: BTRFS_IOC_SYNC no lleva argumentos.
        check("sync", unsafe { ioctl::btrfs_sync(dir.as_raw_fd()) })
    }
}
