// src/qgroup.rs
use std::fmt;
use std::mem;
use std::str::FromStr;

use crate::error::{QgroupError, Result};

// -----------------------------------------------------------------------------
// Identificador de qgroup: level << 48 | subvolumen
// -----------------------------------------------------------------------------

pub const QGROUP_LEVEL_SHIFT: u32 = 48;
pub const QGROUP_SUBVOL_MASK: u64 = (1 << QGROUP_LEVEL_SHIFT) - 1;

/// Identificador crudo de un qgroup. El orden numérico pone siempre los
/// niveles altos por encima de los bajos.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QgroupId(u64);

impl QgroupId {
    pub const fn new(level: u16, subvol: u64) -> Self {
        Self(((level as u64) << QGROUP_LEVEL_SHIFT) | (subvol & QGROUP_SUBVOL_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn level(self) -> u16 {
        (self.0 >> QGROUP_LEVEL_SHIFT) as u16
    }

    pub const fn subvol(self) -> u64 {
        self.0 & QGROUP_SUBVOL_MASK
    }

    /// Nivel 0 = subvolumen hoja.
    pub const fn is_leaf(self) -> bool {
        self.level() == 0
    }
}

impl fmt::Display for QgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.level(), self.subvol())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseQgroupIdError(String);

impl fmt::Display for ParseQgroupIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id de qgroup inválido {:?} (se espera nivel/id)", self.0)
    }
}

impl std::error::Error for ParseQgroupIdError {}

impl FromStr for QgroupId {
    type Err = ParseQgroupIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || ParseQgroupIdError(s.to_string());
        let s = s.trim();

        match s.split_once('/') {
            Some((level, subvol)) => {
                let level: u16 = level.parse().map_err(|_| err())?;
                let subvol: u64 = subvol.parse().map_err(|_| err())?;
                if subvol > QGROUP_SUBVOL_MASK {
                    return Err(err());
                }
                Ok(QgroupId::new(level, subvol))
            }
            // Sin barra: id de subvolumen en nivel 0
            None => {
                let subvol: u64 = s.parse().map_err(|_| err())?;
                if subvol > QGROUP_SUBVOL_MASK {
                    return Err(err());
                }
                Ok(QgroupId::new(0, subvol))
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Nodo de la jerarquía en memoria
// -----------------------------------------------------------------------------

/// Sentido del recorrido de relaciones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Hacia los padres (ids mayores).
    Up,
    /// Hacia los hijos (ids menores).
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qgroup {
    pub id: QgroupId,
    /// Bytes exclusivos cargados al grupo.
    pub used: u64,
    /// 0 = sin límite.
    pub limit: u64,
    pub parents: Vec<Qgroup>,
    pub children: Vec<Qgroup>,
}

impl Qgroup {
    pub fn new(id: QgroupId) -> Self {
        Self {
            id,
            used: 0,
            limit: 0,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Relaciones cargadas en el sentido dado.
    pub fn relations(&self, direction: Direction) -> &[Qgroup] {
        match direction {
            Direction::Up => &self.parents,
            Direction::Down => &self.children,
        }
    }

    pub(crate) fn relations_mut(&mut self, direction: Direction) -> &mut Vec<Qgroup> {
        match direction {
            Direction::Up => &mut self.parents,
            Direction::Down => &mut self.children,
        }
    }

    /// Inserta manteniendo el orden por id; ignora duplicados.
    pub(crate) fn insert_relation(&mut self, direction: Direction, node: Qgroup) -> Result<()> {
        let list = self.relations_mut(direction);
        match list.binary_search_by_key(&node.id, |q| q.id) {
            Ok(_) => Ok(()),
            Err(pos) => {
                list.try_reserve(1)?;
                list.insert(pos, node);
                Ok(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Payload btrfs_qgroup_inherit
// -----------------------------------------------------------------------------

/// Palabras de cabecera: flags, num_qgroups, num_ref_copies, num_excl_copies
/// y los cinco campos de btrfs_qgroup_limit.
pub const INHERIT_HEADER_WORDS: usize = 9;
pub const INHERIT_HEADER_SIZE: usize = INHERIT_HEADER_WORDS * mem::size_of::<u64>();

/// Lista de qgroups a heredar por un subvolumen o snapshot nuevo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QgroupInherit {
    ids: Vec<QgroupId>,
}

impl QgroupInherit {
    pub fn new(ids: &[QgroupId]) -> Result<Self> {
        let mut v = Vec::new();
        v.try_reserve_exact(ids.len())?;
        v.extend_from_slice(ids);
        Ok(Self { ids: v })
    }

    pub fn single(id: QgroupId) -> Result<Self> {
        Self::new(&[id])
    }

    pub fn ids(&self) -> &[QgroupId] {
        &self.ids
    }

    pub fn num_qgroups(&self) -> u64 {
        self.ids.len() as u64
    }

    /// Tamaño en bytes que se le reporta al kernel (`size` en vol_args_v2).
    pub fn byte_len(&self) -> usize {
        INHERIT_HEADER_SIZE + self.ids.len() * mem::size_of::<u64>()
    }

    /// Serializa a palabras u64 alineadas, listas para pasar por puntero.
    pub fn to_words(&self) -> Result<Vec<u64>> {
        let mut words = Vec::new();
        words.try_reserve_exact(INHERIT_HEADER_WORDS + self.ids.len())?;
        words.resize(INHERIT_HEADER_WORDS, 0);
        words[1] = self.num_qgroups();
        words.extend(self.ids.iter().map(|id| id.raw()));
        Ok(words)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let words = self.to_words()?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(self.byte_len())?;
        for w in words {
            bytes.extend_from_slice(&w.to_ne_bytes());
        }
        Ok(bytes)
    }

    /// Decodifica un payload en formato del kernel.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INHERIT_HEADER_SIZE {
            return Err(QgroupError::Malformed(format!(
                "payload inherit de {} bytes, cabecera requiere {}",
                bytes.len(),
                INHERIT_HEADER_SIZE
            )));
        }

        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_ne_bytes(w)
        };

        let count = word(1) as usize;
        let expected = count
            .checked_mul(mem::size_of::<u64>())
            .and_then(|n| n.checked_add(INHERIT_HEADER_SIZE))
            .ok_or_else(|| QgroupError::Malformed(format!("num_qgroups {count} desborda")))?;
        if bytes.len() < expected {
            return Err(QgroupError::Malformed(format!(
                "payload inherit declara {count} qgroups pero solo trae {} bytes",
                bytes.len()
            )));
        }

        let mut ids = Vec::new();
        ids.try_reserve_exact(count)?;
        for i in 0..count {
            ids.push(QgroupId::from_raw(word(INHERIT_HEADER_WORDS + i)));
        }
        Ok(Self { ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn id_splits_level_and_subvol() {
        let id = QgroupId::new(2, 100);
        assert_eq!(id.raw(), 0x0002_0000_0000_0064);
        assert_eq!(id.level(), 2);
        assert_eq!(id.subvol(), 100);
        assert!(!id.is_leaf());
        assert!(QgroupId::new(0, 256).is_leaf());
        assert_eq!(id.to_string(), "2/100");
    }

    #[test]
    fn id_parses_both_forms() {
        assert_eq!("1/100".parse::<QgroupId>().unwrap(), QgroupId::new(1, 100));
        assert_eq!("257".parse::<QgroupId>().unwrap(), QgroupId::new(0, 257));
        assert!("1/".parse::<QgroupId>().is_err());
        assert!("x/3".parse::<QgroupId>().is_err());
        assert!("70000/1".parse::<QgroupId>().is_err());
        assert!(format!("0/{}", 1u64 << 48).parse::<QgroupId>().is_err());
    }

    #[test]
    fn higher_level_sorts_above_any_lower_level() {
        assert!(QgroupId::new(1, 0) > QgroupId::new(0, QGROUP_SUBVOL_MASK));
    }

    #[test]
    fn relations_stay_sorted_without_duplicates() {
        let mut qg = Qgroup::new(QgroupId::new(2, 1));
        for sub in [7, 3, 7, 5] {
            qg.insert_relation(Direction::Down, Qgroup::new(QgroupId::new(1, sub)))
                .unwrap();
        }
        let subs: Vec<u64> = qg.children.iter().map(|c| c.id.subvol()).collect();
        assert_eq!(subs, vec![3, 5, 7]);
        assert!(qg.parents.is_empty());
        assert_eq!(qg.relations(Direction::Down).len(), 3);
        assert!(qg.relations(Direction::Up).is_empty());
    }

    #[test]
    fn inherit_layout_matches_kernel_header() {
        let inherit = QgroupInherit::single(QgroupId::new(1, 100)).unwrap();
        assert_eq!(inherit.byte_len(), 72 + 8);
        let words = inherit.to_words().unwrap();
        assert_eq!(words.len(), 10);
        assert_eq!(words[0], 0);
        assert_eq!(words[1], 1);
        assert_eq!(words[9], QgroupId::new(1, 100).raw());
    }

    #[test]
    fn inherit_rejects_short_payload() {
        let inherit = QgroupInherit::new(&[QgroupId::new(0, 1), QgroupId::new(0, 2)]).unwrap();
        let bytes = inherit.to_bytes().unwrap();
        assert!(matches!(
            QgroupInherit::from_bytes(&bytes[..bytes.len() - 1]),
            Err(QgroupError::Malformed(_))
        ));
        assert!(matches!(
            QgroupInherit::from_bytes(&bytes[..10]),
            Err(QgroupError::Malformed(_))
        ));
    }

    proptest! {
        #[test]
        fn inherit_round_trips(raw in proptest::collection::vec(any::<u64>(), 0..32)) {
            let ids: Vec<QgroupId> = raw.iter().copied().map(QgroupId::from_raw).collect();
            let inherit = QgroupInherit::new(&ids).unwrap();
            let bytes = inherit.to_bytes().unwrap();
            prop_assert_eq!(bytes.len(), inherit.byte_len());
            let decoded = QgroupInherit::from_bytes(&bytes).unwrap();
            prop_assert_eq!(decoded.num_qgroups(), ids.len() as u64);
            prop_assert_eq!(decoded.ids(), &ids[..]);
        }

        #[test]
        fn display_parse_round_trips(level in any::<u16>(), subvol in 0..=QGROUP_SUBVOL_MASK) {
            let id = QgroupId::new(level, subvol);
            prop_assert_eq!(id.to_string().parse::<QgroupId>().unwrap(), id);
        }
    }
}
