// src/search.rs
//
// Recorrido del ioctl genérico TREE_SEARCH: pide lotes acotados al kernel,
// camina el buffer de registros de largo variable y filtra por rango de llave.
use tracing::{debug, trace};

use crate::backend::BtrfsBackend;
use crate::error::{QgroupError, Result};
use crate::ioctl::{IoctlSearchKey, BTRFS_QUOTA_TREE_OBJECTID, SEARCH_HEADER_SIZE};

/// Registros pedidos por llamada al kernel.
pub const SEARCH_BATCH_ITEMS: u32 = 4096;

/// Rango de llaves a buscar. Cada campo es un intervalo cerrado.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub nr_items: u32,
}

impl SearchKey {
    /// Items de un tipo en el árbol de cuotas, con objectid 0 (info/limit).
    pub fn quota(item_type: u32) -> Self {
        Self {
            tree_id: BTRFS_QUOTA_TREE_OBJECTID,
            min_objectid: 0,
            max_objectid: 0,
            min_type: item_type,
            max_type: item_type,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            nr_items: SEARCH_BATCH_ITEMS,
        }
    }

    pub fn objectids(mut self, min: u64, max: u64) -> Self {
        self.min_objectid = min;
        self.max_objectid = max;
        self
    }

    pub fn offsets(mut self, min: u64, max: u64) -> Self {
        self.min_offset = min;
        self.max_offset = max;
        self
    }

    /// Algún campo con min > max: no puede haber resultados.
    pub fn is_empty(&self) -> bool {
        self.min_objectid > self.max_objectid
            || self.min_type > self.max_type
            || self.min_offset > self.max_offset
            || self.min_transid > self.max_transid
    }

    /// El kernel busca por orden lexicográfico (objectid, type, offset) y
    /// puede devolver llaves fuera de la caja pedida campo por campo.
    pub fn contains(&self, header: &SearchHeader) -> bool {
        (self.min_objectid..=self.max_objectid).contains(&header.objectid)
            && (self.min_type..=self.max_type).contains(&header.item_type)
            && (self.min_offset..=self.max_offset).contains(&header.offset)
    }

    /// Cursor para el siguiente lote: justo después de `last`, o `None` si ya
    /// se pasó el máximo.
    fn advance_past(&self, last: &SearchHeader) -> Result<Option<SearchKey>> {
        let (offset, carry) = last.offset.overflowing_add(1);
        let (item_type, carry) = last.item_type.overflowing_add(carry as u32);
        let (objectid, overflow) = last.objectid.overflowing_add(carry as u64);
        if overflow {
            return Ok(None);
        }

        let next = (objectid, item_type, offset);
        if next > (self.max_objectid, self.max_type, self.max_offset) {
            return Ok(None);
        }
        if next <= (self.min_objectid, self.min_type, self.min_offset) {
            return Err(QgroupError::Malformed(format!(
                "la búsqueda no avanza: último registro {}/{}/{}",
                last.objectid, last.item_type, last.offset
            )));
        }

        let mut cursor = *self;
        cursor.min_objectid = objectid;
        cursor.min_type = item_type;
        cursor.min_offset = offset;
        Ok(Some(cursor))
    }
}

impl From<&SearchKey> for IoctlSearchKey {
    fn from(key: &SearchKey) -> Self {
        IoctlSearchKey {
            tree_id: key.tree_id,
            min_objectid: key.min_objectid,
            max_objectid: key.max_objectid,
            min_offset: key.min_offset,
            max_offset: key.max_offset,
            min_transid: key.min_transid,
            max_transid: key.max_transid,
            min_type: key.min_type,
            max_type: key.max_type,
            nr_items: key.nr_items,
            ..IoctlSearchKey::default()
        }
    }
}

/// Cabecera decodificada de un registro.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

impl SearchHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEARCH_HEADER_SIZE {
            return Err(QgroupError::Malformed(format!(
                "cabecera de búsqueda truncada ({} bytes)",
                bytes.len()
            )));
        }
        Ok(Self {
            transid: read_u64(bytes, 0),
            objectid: read_u64(bytes, 8),
            offset: read_u64(bytes, 16),
            item_type: read_u32(bytes, 24),
            len: read_u32(bytes, 28),
        })
    }

    /// Escribe la cabecera tal como la deja el kernel en `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.transid.to_ne_bytes());
        buf.extend_from_slice(&self.objectid.to_ne_bytes());
        buf.extend_from_slice(&self.offset.to_ne_bytes());
        buf.extend_from_slice(&self.item_type.to_ne_bytes());
        buf.extend_from_slice(&self.len.to_ne_bytes());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRecord {
    pub header: SearchHeader,
    pub payload: Vec<u8>,
}

/// Respuesta cruda de una sola llamada.
#[derive(Clone, Debug, Default)]
pub struct SearchBatch {
    pub nr_items: u32,
    pub buf: Vec<u8>,
}

impl SearchBatch {
    /// Registros en orden: cabecera y luego `len` bytes de payload.
    pub fn records(&self) -> Records<'_> {
        Records {
            buf: &self.buf,
            off: 0,
            remaining: self.nr_items,
        }
    }
}

pub struct Records<'a> {
    buf: &'a [u8],
    off: usize,
    remaining: u32,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(SearchHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let header = match self.buf.get(self.off..).map(SearchHeader::decode) {
            Some(Ok(h)) => h,
            Some(Err(e)) => return Some(Err(e)),
            None => {
                self.remaining = 0;
                return Some(Err(QgroupError::Malformed(
                    "registro fuera del buffer de búsqueda".into(),
                )));
            }
        };

        let start = self.off + SEARCH_HEADER_SIZE;
        let end = start + header.len as usize;
        match self.buf.get(start..end) {
            Some(payload) => {
                self.off = end;
                Some(Ok((header, payload)))
            }
            None => {
                self.remaining = 0;
                Some(Err(QgroupError::Malformed(format!(
                    "payload de {} bytes excede el buffer de búsqueda",
                    header.len
                ))))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Walk {
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Ningún registro válido.
    Empty,
    /// Cantidad de registros entregados al visitante.
    Visited(usize),
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        matches!(self, SearchOutcome::Empty)
    }
}

/// Recorre todos los registros de `key`, llamando a `visit` con la cabecera y
/// el payload de cada uno que cae dentro del rango pedido.
///
/// Pide lotes de [`SEARCH_BATCH_ITEMS`]; tras un lote no vacío sigue desde la
/// llave siguiente a la última devuelta. Un lote con cero registros termina.
pub fn walk<B, F>(backend: &B, dir: &B::Dir, key: &SearchKey, mut visit: F) -> Result<SearchOutcome>
where
    B: BtrfsBackend + ?Sized,
    F: FnMut(&SearchHeader, &[u8]) -> Result<Walk>,
{
    if key.is_empty() {
        trace!(?key, "rango vacío, no se consulta al kernel");
        return Ok(SearchOutcome::Empty);
    }

    let mut cursor = *key;
    cursor.nr_items = SEARCH_BATCH_ITEMS;
    let mut visited = 0usize;
    let mut batches = 0usize;

    loop {
        let batch = backend.tree_search(dir, &cursor)?;
        batches += 1;
        if batch.nr_items == 0 {
            break;
        }

        let mut last = None;
        for record in batch.records() {
            let (header, payload) = record?;
            last = Some(header);

            if !key.contains(&header) {
                trace!(?header, "registro fuera de rango, se omite");
                continue;
            }

            visited += 1;
            if visit(&header, payload)? == Walk::Stop {
                return Ok(outcome(visited));
            }
        }

        match last {
            Some(last) => match cursor.advance_past(&last)? {
                Some(next) => cursor = next,
                None => break,
            },
            None => break,
        }
    }

    debug!(tree = key.tree_id, visited, batches, "búsqueda terminada");
    Ok(outcome(visited))
}

fn outcome(visited: usize) -> SearchOutcome {
    if visited == 0 {
        SearchOutcome::Empty
    } else {
        SearchOutcome::Visited(visited)
    }
}

/// Junta hasta `max_items` registros válidos de `key`.
pub fn tree_search<B>(
    backend: &B,
    dir: &B::Dir,
    key: &SearchKey,
    max_items: usize,
) -> Result<Vec<SearchRecord>>
where
    B: BtrfsBackend + ?Sized,
{
    let mut records = Vec::new();
    if max_items == 0 {
        return Ok(records);
    }

    walk(backend, dir, key, |header, payload| {
        let mut copy = Vec::new();
        copy.try_reserve_exact(payload.len())?;
        copy.extend_from_slice(payload);
        records.try_reserve(1)?;
        records.push(SearchRecord {
            header: *header,
            payload: copy,
        });
        if records.len() >= max_items {
            Ok(Walk::Stop)
        } else {
            Ok(Walk::Continue)
        }
    })?;

    Ok(records)
}

/// Lee el u64 número `index` de un payload de item.
pub fn payload_u64(payload: &[u8], index: usize) -> Result<u64> {
    let start = index * 8;
    if payload.len() < start + 8 {
        return Err(QgroupError::Malformed(format!(
            "payload de {} bytes, se esperaba el campo {}",
            payload.len(),
            index
        )));
    }
    Ok(read_u64(payload, start))
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(w)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(w)
}
