// src/mock.rs
//
// Backend simulado: un árbol de cuotas en memoria que responde TREE_SEARCH con
// el mismo formato de buffer que el kernel. Sirve para las pruebas y para
// correr las herramientas sin un btrfs real.
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use libc::{EBUSY, EEXIST, EINVAL, ENOENT};

use crate::backend::{copy_subvol_name, BtrfsBackend};
use crate::error::{QgroupError, Result};
use crate::ioctl::{
    BTRFS_QGROUP_INFO_KEY, BTRFS_QGROUP_LIMIT_KEY, BTRFS_QGROUP_LIMIT_MAX_EXCL,
    BTRFS_QGROUP_RELATION_KEY, BTRFS_QUOTA_TREE_OBJECTID, BTRFS_SEARCH_ARGS_BUFSIZE,
    BTRFS_SUBVOL_NAME_MAX, SEARCH_HEADER_SIZE,
};
use crate::qgroup::{QgroupId, QgroupInherit};
use crate::search::{SearchBatch, SearchHeader, SearchKey};

/// Primer id de subvolumen que reparte btrfs.
pub const FIRST_FREE_OBJECTID: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    OpenDir,
    Create,
    Destroy,
    Assign,
    Limit,
    Search,
    SubvolCreate,
    SnapCreate,
    Sync,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MockQgroup {
    pub used: u64,
    pub limit: u64,
    pub has_limit_item: bool,
}

/// Un subvolumen o snapshot pedido al backend, haya salido bien o no.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedSubvol {
    pub parent: PathBuf,
    pub name: OsString,
    /// Payload tal como se decodifica del formato del kernel.
    pub inherit: Option<QgroupInherit>,
    pub snapshot_of: Option<PathBuf>,
    /// `None` si la creación falló.
    pub subvol_id: Option<u64>,
}

#[derive(Default)]
struct MockState {
    qgroups: BTreeMap<u64, MockQgroup>,
    // (hijo, padre)
    relations: BTreeSet<(u64, u64)>,
    extra: Vec<(SearchHeader, Vec<u8>)>,
    created: Vec<CreatedSubvol>,
    failures: HashMap<MockOp, i32>,
    missing_dirs: BTreeSet<PathBuf>,
    next_subvol: u64,
    batch_limit: Option<u32>,
    search_calls: usize,
    syncs: usize,
}

/// Directorio abierto en el backend simulado.
#[derive(Debug)]
pub struct MockDir {
    path: PathBuf,
    open: Rc<Cell<usize>>,
}

impl MockDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MockDir {
    fn drop(&mut self) {
        self.open.set(self.open.get() - 1);
    }
}

pub struct MockBackend {
    state: RefCell<MockState>,
    open: Rc<Cell<usize>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(MockState {
                next_subvol: FIRST_FREE_OBJECTID,
                ..MockState::default()
            }),
            open: Rc::new(Cell::new(0)),
        }
    }

    // --------- Preparación del escenario ---------

    pub fn with_qgroup(self, id: QgroupId, used: u64, limit: u64) -> Self {
        self.state.borrow_mut().qgroups.insert(
            id.raw(),
            MockQgroup {
                used,
                limit,
                has_limit_item: true,
            },
        );
        self
    }

    pub fn with_relation(self, child: QgroupId, parent: QgroupId) -> Self {
        self.state
            .borrow_mut()
            .relations
            .insert((child.raw(), parent.raw()));
        self
    }

    /// Registro crudo extra en el árbol de cuotas, para simular datos raros.
    pub fn with_raw_record(self, header: SearchHeader, payload: Vec<u8>) -> Self {
        self.state.borrow_mut().extra.push((header, payload));
        self
    }

    pub fn without_limit_item(self, id: QgroupId) -> Self {
        if let Some(qg) = self.state.borrow_mut().qgroups.get_mut(&id.raw()) {
            qg.has_limit_item = false;
        }
        self
    }

    pub fn with_missing_dir(self, path: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().missing_dirs.insert(path.into());
        self
    }

    /// Máximo de registros por llamada a TREE_SEARCH, para forzar varios lotes.
    pub fn with_batch_limit(self, items: u32) -> Self {
        self.state.borrow_mut().batch_limit = Some(items);
        self
    }

    /// Toda llamada a `op` falla con `errno`.
    pub fn fail_on(&self, op: MockOp, errno: i32) {
        self.state.borrow_mut().failures.insert(op, errno);
    }

    pub fn clear_failures(&self) {
        self.state.borrow_mut().failures.clear();
    }

    // --------- Inspección ---------

    pub fn open_dirs(&self) -> usize {
        self.open.get()
    }

    pub fn search_calls(&self) -> usize {
        self.state.borrow().search_calls
    }

    pub fn syncs(&self) -> usize {
        self.state.borrow().syncs
    }

    pub fn created(&self) -> Vec<CreatedSubvol> {
        self.state.borrow().created.clone()
    }

    pub fn qgroup(&self, id: QgroupId) -> Option<MockQgroup> {
        self.state.borrow().qgroups.get(&id.raw()).copied()
    }

    pub fn has_relation(&self, child: QgroupId, parent: QgroupId) -> bool {
        self.state
            .borrow()
            .relations
            .contains(&(child.raw(), parent.raw()))
    }

    fn check_failure(&self, op: MockOp) -> Result<()> {
        match self.state.borrow().failures.get(&op) {
            Some(&errno) => Err(QgroupError::Kernel(errno)),
            None => Ok(()),
        }
    }

    /// Crea el qgroup 0/<id> del subvolumen nuevo y lo cuelga de los heredados.
    fn create_subvol_entry(
        &self,
        parent: &Path,
        name: &OsStr,
        inherit: Option<&QgroupInherit>,
        snapshot_of: Option<&Path>,
        fail: Option<i32>,
    ) -> Result<()> {
        let mut buf = [0u8; BTRFS_SUBVOL_NAME_MAX + 1];
        copy_subvol_name(name, &mut buf)?;

        // El payload se decodifica desde bytes, igual que lo leería el kernel.
        let decoded = match inherit {
            Some(inherit) => Some(QgroupInherit::from_bytes(&inherit.to_bytes()?)?),
            None => None,
        };

        let mut state = self.state.borrow_mut();
        let mut record = CreatedSubvol {
            parent: parent.to_path_buf(),
            name: name.to_os_string(),
            inherit: decoded.clone(),
            snapshot_of: snapshot_of.map(Path::to_path_buf),
            subvol_id: None,
        };

        if let Some(errno) = fail {
            state.created.push(record);
            return Err(QgroupError::Kernel(errno));
        }

        let targets: Vec<QgroupId> = decoded.map(|d| d.ids().to_vec()).unwrap_or_default();
        if targets.iter().any(|t| !state.qgroups.contains_key(&t.raw())) {
            state.created.push(record);
            return Err(QgroupError::Kernel(ENOENT));
        }

        let subvol = state.next_subvol;
        state.next_subvol += 1;
        let leaf = QgroupId::new(0, subvol);
        state.qgroups.insert(
            leaf.raw(),
            MockQgroup {
                has_limit_item: true,
                ..MockQgroup::default()
            },
        );
        for target in targets {
            state.relations.insert((leaf.raw(), target.raw()));
        }

        record.subvol_id = Some(subvol);
        state.created.push(record);
        Ok(())
    }

    /// Todos los items del árbol de cuotas, ordenados como en el B-tree.
    fn items(&self) -> Vec<(SearchHeader, Vec<u8>)> {
        let state = self.state.borrow();
        let mut items = Vec::new();

        for (&id, qg) in &state.qgroups {
            let info = [1, qg.used, qg.used, qg.used, qg.used];
            items.push((item(0, BTRFS_QGROUP_INFO_KEY, id), words(&info)));
            if qg.has_limit_item {
                let flags = if qg.limit == 0 { 0 } else { BTRFS_QGROUP_LIMIT_MAX_EXCL };
                let limit = [flags, 0, qg.limit, 0, 0];
                items.push((item(0, BTRFS_QGROUP_LIMIT_KEY, id), words(&limit)));
            }
        }
        // El kernel guarda la relación en ambos sentidos.
        for &(child, parent) in &state.relations {
            items.push((item(child, BTRFS_QGROUP_RELATION_KEY, parent), Vec::new()));
            items.push((item(parent, BTRFS_QGROUP_RELATION_KEY, child), Vec::new()));
        }
        items.extend(state.extra.iter().cloned());

        items.sort_by_key(|(h, _)| (h.objectid, h.item_type, h.offset));
        items
    }
}

fn item(objectid: u64, item_type: u32, offset: u64) -> SearchHeader {
    SearchHeader {
        transid: 1,
        objectid,
        offset,
        item_type,
        len: 0,
    }
}

fn words(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

impl BtrfsBackend for MockBackend {
    type Dir = MockDir;

    fn open_dir(&self, path: &Path) -> Result<MockDir> {
        self.check_failure(MockOp::OpenDir)?;
        if self.state.borrow().missing_dirs.contains(path) {
            return Err(QgroupError::Kernel(ENOENT));
        }
        self.open.set(self.open.get() + 1);
        Ok(MockDir {
            path: path.to_path_buf(),
            open: Rc::clone(&self.open),
        })
    }

    fn qgroup_create(&self, _dir: &MockDir, id: QgroupId, create: bool) -> Result<()> {
        self.check_failure(if create { MockOp::Create } else { MockOp::Destroy })?;
        let mut state = self.state.borrow_mut();
        let raw = id.raw();

        if create {
            if state.qgroups.contains_key(&raw) {
                return Err(QgroupError::Kernel(EEXIST));
            }
            state.qgroups.insert(
                raw,
                MockQgroup {
                    has_limit_item: true,
                    ..MockQgroup::default()
                },
            );
            return Ok(());
        }

        if !state.qgroups.contains_key(&raw) {
            return Err(QgroupError::Kernel(ENOENT));
        }
        if state.relations.iter().any(|&(c, p)| c == raw || p == raw) {
            return Err(QgroupError::Kernel(EBUSY));
        }
        state.qgroups.remove(&raw);
        Ok(())
    }

    fn qgroup_assign(
        &self,
        _dir: &MockDir,
        child: QgroupId,
        parent: QgroupId,
        assign: bool,
    ) -> Result<()> {
        self.check_failure(MockOp::Assign)?;
        let mut state = self.state.borrow_mut();
        let pair = (child.raw(), parent.raw());

        if !assign {
            return if state.relations.remove(&pair) {
                Ok(())
            } else {
                Err(QgroupError::Kernel(ENOENT))
            };
        }

        if child.level() >= parent.level() {
            return Err(QgroupError::Kernel(EINVAL));
        }
        if !state.qgroups.contains_key(&pair.0) || !state.qgroups.contains_key(&pair.1) {
            return Err(QgroupError::Kernel(ENOENT));
        }
        if !state.relations.insert(pair) {
            return Err(QgroupError::Kernel(EEXIST));
        }
        Ok(())
    }

    fn qgroup_limit(&self, _dir: &MockDir, id: QgroupId, max_exclusive: u64) -> Result<()> {
        self.check_failure(MockOp::Limit)?;
        let mut state = self.state.borrow_mut();
        let qg = state
            .qgroups
            .get_mut(&id.raw())
            .ok_or(QgroupError::Kernel(ENOENT))?;
        qg.limit = max_exclusive;
        qg.has_limit_item = true;
        Ok(())
    }

    fn tree_search(&self, _dir: &MockDir, key: &SearchKey) -> Result<SearchBatch> {
        self.check_failure(MockOp::Search)?;
        self.state.borrow_mut().search_calls += 1;

        if key.tree_id != BTRFS_QUOTA_TREE_OBJECTID {
            return Err(QgroupError::Kernel(ENOENT));
        }

        let min = (key.min_objectid, key.min_type, key.min_offset);
        let max = (key.max_objectid, key.max_type, key.max_offset);
        let limit = self
            .state
            .borrow()
            .batch_limit
            .map_or(key.nr_items, |l| l.min(key.nr_items));

        let mut batch = SearchBatch::default();
        if min > max {
            return Ok(batch);
        }

        for (mut header, payload) in self.items() {
            let k = (header.objectid, header.item_type, header.offset);
            if k < min || k > max {
                continue;
            }
            if !(key.min_transid..=key.max_transid).contains(&header.transid) {
                continue;
            }
            if batch.nr_items >= limit
                || batch.buf.len() + SEARCH_HEADER_SIZE + payload.len() > BTRFS_SEARCH_ARGS_BUFSIZE
            {
                break;
            }
            header.len = payload.len() as u32;
            header.encode_into(&mut batch.buf);
            batch.buf.extend_from_slice(&payload);
            batch.nr_items += 1;
        }
        Ok(batch)
    }

    fn subvol_create(
        &self,
        dir: &MockDir,
        name: &OsStr,
        inherit: Option<&QgroupInherit>,
    ) -> Result<()> {
        let fail = self.state.borrow().failures.get(&MockOp::SubvolCreate).copied();
        self.create_subvol_entry(dir.path(), name, inherit, None, fail)
    }

    fn snap_create(
        &self,
        dst: &MockDir,
        src: &MockDir,
        name: &OsStr,
        inherit: &QgroupInherit,
    ) -> Result<()> {
        let fail = self.state.borrow().failures.get(&MockOp::SnapCreate).copied();
        self.create_subvol_entry(dst.path(), name, Some(inherit), Some(src.path()), fail)
    }

    fn sync(&self, _dir: &MockDir) -> Result<()> {
        self.check_failure(MockOp::Sync)?;
        self.state.borrow_mut().syncs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search;

    #[test]
    fn dirs_are_counted_until_dropped() {
        let mock = MockBackend::new();
        let a = mock.open_dir(Path::new("/mnt")).unwrap();
        let b = mock.open_dir(Path::new("/mnt/src")).unwrap();
        assert_eq!(mock.open_dirs(), 2);
        assert_eq!(b.path(), Path::new("/mnt/src"));
        drop(a);
        assert_eq!(mock.open_dirs(), 1);
        drop(b);
        assert_eq!(mock.open_dirs(), 0);
    }

    #[test]
    fn search_returns_lexicographic_slice() {
        let mock = MockBackend::new()
            .with_qgroup(QgroupId::new(0, 5), 10, 0)
            .with_qgroup(QgroupId::new(0, 6), 20, 0);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();

        let key = SearchKey::quota(BTRFS_QGROUP_INFO_KEY);
        let batch = mock.tree_search(&dir, &key).unwrap();
        assert_eq!(batch.nr_items, 2);
        let recs = search::tree_search(&mock, &dir, &key, 16).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].header.offset, QgroupId::new(0, 6).raw());
        assert_eq!(search::payload_u64(&recs[1].payload, 3).unwrap(), 20);
    }

    #[test]
    fn assign_enforces_levels_like_the_kernel() {
        let mock = MockBackend::new()
            .with_qgroup(QgroupId::new(1, 1), 0, 0)
            .with_qgroup(QgroupId::new(1, 2), 0, 0);
        let dir = mock.open_dir(Path::new("/mnt")).unwrap();
        assert_eq!(
            mock.qgroup_assign(&dir, QgroupId::new(1, 1), QgroupId::new(1, 2), true),
            Err(QgroupError::Kernel(EINVAL))
        );
    }
}
