// src/admin.rs
//
// Operaciones que modifican cuotas. Los directorios y payloads se sueltan al
// salir de cada función, también en los caminos de error. Las fallas las
// registra el backend.
use std::ffi::OsStr;
use std::path::Path;

use tracing::info;

use crate::backend::BtrfsBackend;
use crate::error::Result;
use crate::qgroup::{QgroupId, QgroupInherit};

pub fn create_qgroup<B: BtrfsBackend + ?Sized>(backend: &B, dir: &B::Dir, id: QgroupId) -> Result<()> {
    info!(%id, "creando qgroup");
    backend.qgroup_create(dir, id, true)
}

pub fn destroy_qgroup<B: BtrfsBackend + ?Sized>(backend: &B, dir: &B::Dir, id: QgroupId) -> Result<()> {
    info!(%id, "destruyendo qgroup");
    backend.qgroup_create(dir, id, false)
}

/// Cuelga `child` de `parent`. El kernel valida los niveles.
pub fn assign<B: BtrfsBackend + ?Sized>(
    backend: &B,
    dir: &B::Dir,
    child: QgroupId,
    parent: QgroupId,
) -> Result<()> {
    info!(%child, %parent, "asignando qgroup");
    backend.qgroup_assign(dir, child, parent, true)
}

pub fn unassign<B: BtrfsBackend + ?Sized>(
    backend: &B,
    dir: &B::Dir,
    child: QgroupId,
    parent: QgroupId,
) -> Result<()> {
    info!(%child, %parent, "quitando asignación de qgroup");
    backend.qgroup_assign(dir, child, parent, false)
}

/// Límite de bytes exclusivos. 0 se pasa tal cual al kernel.
pub fn set_limit<B: BtrfsBackend + ?Sized>(
    backend: &B,
    dir: &B::Dir,
    id: QgroupId,
    max_exclusive: u64,
) -> Result<()> {
    info!(%id, max_exclusive, "fijando límite de qgroup");
    backend.qgroup_limit(dir, id, max_exclusive)
}

pub fn sync<B: BtrfsBackend + ?Sized>(backend: &B, dir: &B::Dir) -> Result<()> {
    backend.sync(dir)
}

/// Crea `parent_dir/name`; si hay `inherit`, el subvolumen nuevo entra a ese
/// qgroup al nacer.
pub fn create_subvolume<B: BtrfsBackend + ?Sized>(
    backend: &B,
    parent_dir: &Path,
    name: &OsStr,
    inherit: Option<QgroupId>,
) -> Result<()> {
    let dir = backend.open_dir(parent_dir)?;
    let payload = inherit.map(QgroupInherit::single).transpose()?;

    info!(dst = %parent_dir.display(), name = ?name, ?inherit, "creando subvolumen");
    backend.subvol_create(&dir, name, payload.as_ref())
}

/// Snapshot de `src_dir` en `dst_dir/name`, heredando en `inherit`.
pub fn snapshot<B: BtrfsBackend + ?Sized>(
    backend: &B,
    src_dir: &Path,
    dst_dir: &Path,
    name: &OsStr,
    inherit: QgroupId,
) -> Result<()> {
    let src = backend.open_dir(src_dir)?;
    let dst = backend.open_dir(dst_dir)?;
    let payload = QgroupInherit::single(inherit)?;

    info!(
        src = %src_dir.display(),
        dst = %dst_dir.display(),
        name = ?name,
        %inherit,
        "creando snapshot"
    );
    backend.snap_create(&dst, &src, name, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QgroupError;
    use crate::mock::{MockBackend, MockOp};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Clone, Default)]
    struct LevelCounts {
        info: Arc<AtomicUsize>,
        warn: Arc<AtomicUsize>,
    }

    impl<S: Subscriber> Layer<S> for LevelCounts {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let level = *event.metadata().level();
            if level == Level::INFO {
                self.info.fetch_add(1, Ordering::SeqCst);
            } else if level == Level::WARN {
                self.warn.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn qid(level: u16, sub: u64) -> QgroupId {
        QgroupId::new(level, sub)
    }

    #[test]
    fn create_assign_limit_pass_through() {
        let mock = MockBackend::new();
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();

        create_qgroup(&mock, &dir, qid(1, 100)).unwrap();
        create_qgroup(&mock, &dir, qid(2, 100)).unwrap();
        assign(&mock, &dir, qid(1, 100), qid(2, 100)).unwrap();
        set_limit(&mock, &dir, qid(1, 100), 10 << 20).unwrap();

        assert!(mock.has_relation(qid(1, 100), qid(2, 100)));
        assert_eq!(mock.qgroup(qid(1, 100)).unwrap().limit, 10 << 20);

        unassign(&mock, &dir, qid(1, 100), qid(2, 100)).unwrap();
        assert!(!mock.has_relation(qid(1, 100), qid(2, 100)));
    }

    #[test]
    fn destroying_missing_group_surfaces_kernel_error() {
        let mock = MockBackend::new();
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        assert_eq!(
            destroy_qgroup(&mock, &dir, qid(1, 9)),
            Err(QgroupError::Kernel(libc::ENOENT))
        );
    }

    #[test]
    fn assign_does_not_validate_levels_locally() {
        let mock = MockBackend::new()
            .with_qgroup(qid(2, 1), 0, 0)
            .with_qgroup(qid(1, 1), 0, 0);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        // El rechazo viene del backend, no de esta capa.
        assert_eq!(
            assign(&mock, &dir, qid(2, 1), qid(1, 1)),
            Err(QgroupError::Kernel(libc::EINVAL))
        );
    }

    #[test]
    fn subvolume_without_inherit_sends_no_payload() {
        let mock = MockBackend::new();
        create_subvolume(&mock, Path::new("/mnt/snap"), OsStr::new("subv"), None).unwrap();

        let created = mock.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].inherit, None);
        assert_eq!(created[0].parent, Path::new("/mnt/snap"));
        assert_eq!(mock.open_dirs(), 0);
    }

    #[test]
    fn subvolume_open_failure_issues_nothing() {
        let mock = MockBackend::new().with_missing_dir("/mnt/nope");
        let err = create_subvolume(&mock, Path::new("/mnt/nope"), OsStr::new("s"), Some(qid(1, 1)));
        assert_eq!(err, Err(QgroupError::Kernel(libc::ENOENT)));
        assert!(mock.created().is_empty());
        assert_eq!(mock.open_dirs(), 0);
    }

    #[test]
    fn snapshot_closes_source_when_destination_missing() {
        let mock = MockBackend::new()
            .with_qgroup(qid(1, 100), 0, 0)
            .with_missing_dir("/mnt/gone");
        let err = snapshot(
            &mock,
            Path::new("/mnt/src"),
            Path::new("/mnt/gone"),
            OsStr::new("snap"),
            qid(1, 100),
        );
        assert_eq!(err, Err(QgroupError::Kernel(libc::ENOENT)));
        assert_eq!(mock.open_dirs(), 0);
        assert!(mock.created().is_empty());
    }

    #[test]
    fn snapshot_failure_still_releases_both_dirs() {
        let mock = MockBackend::new().with_qgroup(qid(1, 100), 0, 0);
        mock.fail_on(MockOp::SnapCreate, libc::EDQUOT);
        let err = snapshot(
            &mock,
            Path::new("/mnt/src"),
            Path::new("/mnt"),
            OsStr::new("snap"),
            qid(1, 100),
        );
        assert_eq!(err, Err(QgroupError::Kernel(libc::EDQUOT)));
        assert_eq!(mock.open_dirs(), 0);

        let created = mock.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].snapshot_of.as_deref(), Some(Path::new("/mnt/src")));
        assert_eq!(created[0].subvol_id, None);
        assert_eq!(
            created[0].inherit.as_ref().map(|i| (i.num_qgroups(), i.ids().to_vec())),
            Some((1, vec![qid(1, 100)]))
        );
    }

    #[test]
    fn sync_is_forwarded() {
        let mock = MockBackend::new();
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        sync(&mock, &dir).unwrap();
        assert_eq!(mock.syncs(), 1);
    }

    #[test]
    fn failures_are_not_logged_twice() {
        let counts = LevelCounts::default();
        let subscriber = tracing_subscriber::registry().with(counts.clone());

        let mock = MockBackend::new();
        mock.fail_on(MockOp::Create, libc::EPERM);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();

        let res = tracing::subscriber::with_default(subscriber, || {
            create_qgroup(&mock, &dir, qid(1, 100))
        });
        assert_eq!(res, Err(QgroupError::Kernel(libc::EPERM)));
        assert_eq!(counts.info.load(Ordering::SeqCst), 1);
        // El aviso lo emite el backend, no esta capa.
        assert_eq!(counts.warn.load(Ordering::SeqCst), 0);
    }
}
