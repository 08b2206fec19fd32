// src/repository.rs
//
// Lectura del árbol de cuotas: estadísticas de un qgroup y jerarquía de
// relaciones, construida recursivamente a partir de TREE_SEARCH.
use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::backend::BtrfsBackend;
use crate::error::{QgroupError, Result};
use crate::ioctl::{BTRFS_QGROUP_INFO_KEY, BTRFS_QGROUP_LIMIT_KEY, BTRFS_QGROUP_RELATION_KEY};
use crate::qgroup::{Direction, Qgroup, QgroupId, QGROUP_LEVEL_SHIFT, QGROUP_SUBVOL_MASK};
use crate::search::{self, payload_u64, SearchKey, Walk};

/// Profundidad máxima de la jerarquía antes de declarar los datos corruptos.
pub const MAX_HIERARCHY_DEPTH: usize = 64;

// Posición del campo dentro de btrfs_qgroup_info_item / btrfs_qgroup_limit_item
const INFO_EXCL_FIELD: usize = 3;
const LIMIT_MAX_EXCL_FIELD: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    Child,
    Parent,
}

impl Direction {
    pub fn relation(self) -> Relation {
        match self {
            Direction::Up => Relation::Parent,
            Direction::Down => Relation::Child,
        }
    }
}

/// Un registro de relación no dice el sentido: el id menor es el hijo.
pub fn classify_relation(owner: QgroupId, other: QgroupId) -> Option<Relation> {
    match other.cmp(&owner) {
        Ordering::Less => Some(Relation::Child),
        Ordering::Greater => Some(Relation::Parent),
        Ordering::Equal => None,
    }
}

pub struct QgroupRepository<'a, B: BtrfsBackend + ?Sized> {
    backend: &'a B,
    dir: &'a B::Dir,
}

impl<'a, B: BtrfsBackend + ?Sized> QgroupRepository<'a, B> {
    pub fn new(backend: &'a B, dir: &'a B::Dir) -> Self {
        Self { backend, dir }
    }

    /// Uso exclusivo y límite de `id`, sin relaciones.
    pub fn load_qgroup(&self, id: QgroupId) -> Result<Qgroup> {
        let mut qg = Qgroup::new(id);

        // info item
        let key = SearchKey::quota(BTRFS_QGROUP_INFO_KEY).offsets(id.raw(), id.raw());
        let found = search::walk(self.backend, self.dir, &key, |header, payload| {
            if header.item_type != BTRFS_QGROUP_INFO_KEY {
                return Err(QgroupError::Malformed(format!(
                    "se esperaba info de qgroup, llegó tipo {}",
                    header.item_type
                )));
            }
            qg.used = payload_u64(payload, INFO_EXCL_FIELD)?;
            Ok(Walk::Stop)
        })?;
        if found.is_empty() {
            warn!(%id, "qgroup no encontrado");
            return Err(QgroupError::NotFound(id));
        }

        // limit item; si no existe el grupo queda sin límite
        let key = SearchKey::quota(BTRFS_QGROUP_LIMIT_KEY).offsets(id.raw(), id.raw());
        search::walk(self.backend, self.dir, &key, |header, payload| {
            if header.item_type != BTRFS_QGROUP_LIMIT_KEY {
                return Err(QgroupError::Malformed(format!(
                    "se esperaba límite de qgroup, llegó tipo {}",
                    header.item_type
                )));
            }
            qg.limit = payload_u64(payload, LIMIT_MAX_EXCL_FIELD)?;
            Ok(Walk::Stop)
        })?;

        debug!(%id, used = qg.used, limit = qg.limit, "qgroup cargado");
        Ok(qg)
    }

    /// Carga `id` y, recursivamente, sus padres (`Up`) o hijos (`Down`).
    /// Cualquier error descarta todo lo construido.
    pub fn load_hierarchy(&self, id: QgroupId, direction: Direction) -> Result<Qgroup> {
        self.load_recursive(id, direction, 0)
    }

    // Los ids crecen (Up) o bajan (Down) estrictamente a lo largo de un camino,
    // así que no hay ciclos; solo hace falta acotar la profundidad.
    fn load_recursive(&self, id: QgroupId, direction: Direction, depth: usize) -> Result<Qgroup> {
        if depth >= MAX_HIERARCHY_DEPTH {
            return Err(QgroupError::Malformed(format!(
                "jerarquía de qgroups con más de {MAX_HIERARCHY_DEPTH} niveles bajo {id}"
            )));
        }

        let mut qg = self.load_qgroup(id)?;
        for other in self.related_ids(id, direction)? {
            let node = self.load_recursive(other, direction, depth + 1).map_err(|e| {
                debug!(from = %id, to = %other, "recursión falló: {e}");
                e
            })?;
            qg.insert_relation(direction, node)?;
        }

        Ok(qg)
    }

    /// Ids relacionados con `id` en el sentido pedido.
    fn related_ids(&self, id: QgroupId, direction: Direction) -> Result<Vec<QgroupId>> {
        let raw = id.raw();
        let range = match direction {
            Direction::Down => raw.checked_sub(1).map(|max| (0, max)),
            Direction::Up => raw.checked_add(1).map(|min| (min, u64::MAX)),
        };
        let mut ids = Vec::new();
        let Some((min, max)) = range else {
            return Ok(ids);
        };

        let key = SearchKey::quota(BTRFS_QGROUP_RELATION_KEY)
            .objectids(raw, raw)
            .offsets(min, max);
        let wanted = direction.relation();

        search::walk(self.backend, self.dir, &key, |header, _| {
            let other = QgroupId::from_raw(header.offset);
            if classify_relation(id, other) == Some(wanted) {
                ids.try_reserve(1)?;
                ids.push(other);
            }
            Ok(Walk::Continue)
        })?;

        Ok(ids)
    }

    /// Todos los qgroups de un nivel (o de todos), con uso y límite.
    pub fn list_qgroups(&self, level: Option<u16>) -> Result<Vec<Qgroup>> {
        let (min, max) = match level {
            Some(level) => {
                let min = (level as u64) << QGROUP_LEVEL_SHIFT;
                (min, min | QGROUP_SUBVOL_MASK)
            }
            None => (0, u64::MAX),
        };

        let mut groups: Vec<Qgroup> = Vec::new();
        let key = SearchKey::quota(BTRFS_QGROUP_INFO_KEY).offsets(min, max);
        search::walk(self.backend, self.dir, &key, |header, payload| {
            let mut qg = Qgroup::new(QgroupId::from_raw(header.offset));
            qg.used = payload_u64(payload, INFO_EXCL_FIELD)?;
            groups.try_reserve(1)?;
            groups.push(qg);
            Ok(Walk::Continue)
        })?;

        if groups.is_empty() {
            return Ok(groups);
        }

        let key = SearchKey::quota(BTRFS_QGROUP_LIMIT_KEY).offsets(min, max);
        search::walk(self.backend, self.dir, &key, |header, payload| {
            let id = QgroupId::from_raw(header.offset);
            if let Ok(pos) = groups.binary_search_by_key(&id, |q| q.id) {
                groups[pos].limit = payload_u64(payload, LIMIT_MAX_EXCL_FIELD)?;
            }
            Ok(Walk::Continue)
        })?;

        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockOp};
    use crate::search::SearchHeader;
    use proptest::prelude::*;
    use std::path::Path;

    fn qid(level: u16, sub: u64) -> QgroupId {
        QgroupId::new(level, sub)
    }

    #[test]
    fn equal_ids_are_not_related() {
        assert_eq!(classify_relation(qid(1, 1), qid(1, 1)), None);
    }

    proptest! {
        #[test]
        fn smaller_raw_id_is_always_the_child(a in any::<u64>(), b in any::<u64>()) {
            prop_assume!(a < b);
            let (a, b) = (QgroupId::from_raw(a), QgroupId::from_raw(b));
            prop_assert_eq!(classify_relation(b, a), Some(Relation::Child));
            prop_assert_eq!(classify_relation(a, b), Some(Relation::Parent));
        }
    }

    #[test]
    fn load_qgroup_reads_exclusive_and_max_exclusive() {
        let mock = MockBackend::new().with_qgroup(qid(1, 100), 4096, 10 << 20);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let qg = QgroupRepository::new(&mock, &dir).load_qgroup(qid(1, 100)).unwrap();
        assert_eq!(qg.used, 4096);
        assert_eq!(qg.limit, 10 << 20);
        assert!(qg.parents.is_empty() && qg.children.is_empty());
    }

    #[test]
    fn missing_limit_item_means_unlimited() {
        let mock = MockBackend::new()
            .with_qgroup(qid(0, 256), 1, 99)
            .without_limit_item(qid(0, 256));
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let qg = QgroupRepository::new(&mock, &dir).load_qgroup(qid(0, 256)).unwrap();
        assert!(qg.is_unlimited());
    }

    #[test]
    fn missing_info_is_not_found_not_kernel_error() {
        let mock = MockBackend::new().with_qgroup(qid(0, 256), 0, 0);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let err = QgroupRepository::new(&mock, &dir)
            .load_qgroup(qid(0, 257))
            .unwrap_err();
        assert_eq!(err, QgroupError::NotFound(qid(0, 257)));
    }

    #[test]
    fn search_failure_keeps_errno() {
        let mock = MockBackend::new().with_qgroup(qid(0, 256), 0, 0);
        mock.fail_on(MockOp::Search, libc::EPERM);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let err = QgroupRepository::new(&mock, &dir)
            .load_qgroup(qid(0, 256))
            .unwrap_err();
        assert_eq!(err, QgroupError::Kernel(libc::EPERM));
    }

    #[test]
    fn short_info_payload_is_malformed() {
        let header = SearchHeader {
            transid: 1,
            objectid: 0,
            offset: qid(0, 300).raw(),
            item_type: BTRFS_QGROUP_INFO_KEY,
            len: 0,
        };
        let mock = MockBackend::new().with_raw_record(header, vec![0u8; 16]);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let err = QgroupRepository::new(&mock, &dir)
            .load_qgroup(qid(0, 300))
            .unwrap_err();
        assert!(matches!(err, QgroupError::Malformed(_)));
    }

    #[test]
    fn upward_load_fills_only_parents() {
        let mock = MockBackend::new()
            .with_qgroup(qid(0, 256), 10, 0)
            .with_qgroup(qid(1, 100), 10, 0)
            .with_qgroup(qid(1, 200), 10, 0)
            .with_qgroup(qid(2, 100), 10, 0)
            .with_relation(qid(0, 256), qid(1, 100))
            .with_relation(qid(0, 256), qid(1, 200))
            .with_relation(qid(1, 100), qid(2, 100));
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();

        let leaf = QgroupRepository::new(&mock, &dir)
            .load_hierarchy(qid(0, 256), Direction::Up)
            .unwrap();
        assert!(leaf.children.is_empty());
        let parents: Vec<QgroupId> = leaf.parents.iter().map(|p| p.id).collect();
        assert_eq!(parents, vec![qid(1, 100), qid(1, 200)]);
        assert_eq!(leaf.parents[0].parents[0].id, qid(2, 100));
        assert!(leaf.parents[0].children.is_empty());
        assert!(leaf.parents[1].parents.is_empty());
    }

    #[test]
    fn relation_to_vanished_group_fails_whole_load() {
        let mock = MockBackend::new()
            .with_qgroup(qid(2, 1), 0, 0)
            .with_qgroup(qid(1, 1), 0, 0)
            .with_relation(qid(1, 1), qid(2, 1))
            // 0/5 no tiene info item
            .with_relation(qid(0, 5), qid(1, 1));
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let err = QgroupRepository::new(&mock, &dir)
            .load_hierarchy(qid(2, 1), Direction::Down)
            .unwrap_err();
        assert_eq!(err, QgroupError::NotFound(qid(0, 5)));
    }

    fn chain(levels: u16) -> MockBackend {
        let mut mock = MockBackend::new();
        for level in 0..levels {
            mock = mock.with_qgroup(qid(level, 1), 0, 0);
            if level > 0 {
                mock = mock.with_relation(qid(level - 1, 1), qid(level, 1));
            }
        }
        mock
    }

    #[test]
    fn depth_bound_is_inclusive_of_the_last_level() {
        let levels = MAX_HIERARCHY_DEPTH as u16;
        let mock = chain(levels);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let repo = QgroupRepository::new(&mock, &dir);

        let mut node = repo.load_hierarchy(qid(0, 1), Direction::Up).unwrap();
        for _ in 1..levels {
            assert_eq!(node.parents.len(), 1);
            node = node.parents.remove(0);
        }
        assert_eq!(node.id, qid(levels - 1, 1));
        assert!(node.parents.is_empty());

        let mock = chain(levels + 1);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let err = QgroupRepository::new(&mock, &dir)
            .load_hierarchy(qid(0, 1), Direction::Up)
            .unwrap_err();
        assert!(matches!(err, QgroupError::Malformed(_)));
    }

    #[test]
    fn runaway_chain_is_malformed() {
        let depth = MAX_HIERARCHY_DEPTH as u16 + 2;
        let mut mock = MockBackend::new();
        for level in 0..depth {
            mock = mock.with_qgroup(qid(level, 1), 0, 0);
            if level > 0 {
                mock = mock.with_relation(qid(level - 1, 1), qid(level, 1));
            }
        }
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let err = QgroupRepository::new(&mock, &dir)
            .load_hierarchy(qid(0, 1), Direction::Up)
            .unwrap_err();
        assert!(matches!(err, QgroupError::Malformed(_)));
    }

    #[test]
    fn list_by_level_joins_limits() {
        let mock = MockBackend::new()
            .with_qgroup(qid(0, 256), 1, 0)
            .with_qgroup(qid(1, 100), 2, 77)
            .with_qgroup(qid(1, 101), 3, 0)
            .with_qgroup(qid(2, 100), 4, 0);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        let repo = QgroupRepository::new(&mock, &dir);

        let level1 = repo.list_qgroups(Some(1)).unwrap();
        let ids: Vec<QgroupId> = level1.iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![qid(1, 100), qid(1, 101)]);
        assert_eq!(level1[0].limit, 77);
        assert_eq!(level1[1].used, 3);

        assert_eq!(repo.list_qgroups(None).unwrap().len(), 4);
        assert!(repo.list_qgroups(Some(3)).unwrap().is_empty());
    }
}
