// src/demo.rs
//
// Flujo del demo de squota: arma un wrapper con límite, saca un snapshot y
// crea subvolúmenes que heredan en él, y luego relee la jerarquía.
use thiserror::Error;
use tracing::info;

use crate::admin;
use crate::backend::BtrfsBackend;
use crate::config::DemoConfig;
use crate::error::QgroupError;
use crate::qgroup::{Direction, Qgroup};
use crate::repository::QgroupRepository;

/// Niveles que se listan al final; `None` = todos.
pub const DEMO_LEVELS: [Option<u16>; 5] = [Some(0), Some(1), Some(2), Some(3), None];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{step} falló: {source}")]
pub struct DemoError {
    pub step: &'static str,
    #[source]
    pub source: QgroupError,
}

impl DemoError {
    pub fn errno(&self) -> i32 {
        self.source.as_errno()
    }
}

trait Step<T> {
    fn step(self, step: &'static str) -> Result<T, DemoError>;
}

impl<T> Step<T> for Result<T, QgroupError> {
    fn step(self, step: &'static str) -> Result<T, DemoError> {
        self.map_err(|source| DemoError { step, source })
    }
}

#[derive(Debug)]
pub struct DemoReport {
    /// Jerarquía bajo el grupo padre, cargada hacia abajo.
    pub hierarchy: Qgroup,
    pub levels: Vec<(Option<u16>, Vec<Qgroup>)>,
}

pub fn run_demo<B: BtrfsBackend + ?Sized>(backend: &B, cfg: &DemoConfig) -> Result<DemoReport, DemoError> {
    let dir = backend.open_dir(&cfg.mount).step("abrir montaje")?;

    // Paso 1: wrapper y padre, con relación y límite
    admin::create_qgroup(backend, &dir, cfg.wrapper).step("crear wrapper")?;
    admin::create_qgroup(backend, &dir, cfg.parent).step("crear padre")?;
    admin::assign(backend, &dir, cfg.wrapper, cfg.parent).step("asignar wrapper")?;
    admin::set_limit(backend, &dir, cfg.wrapper, cfg.limit).step("limitar wrapper")?;

    // Paso 2: snapshot con herencia explícita
    admin::snapshot(backend, &cfg.snap_src, &cfg.mount, &cfg.snap_name, cfg.wrapper)
        .step("snapshot")?;

    // Paso 3: subvolumen con herencia explícita
    admin::create_subvolume(backend, &cfg.mount, &cfg.subvol_name, Some(cfg.wrapper))
        .step("crear subvolumen")?;

    // Paso 4: subvolumen anidado dentro del snapshot, herencia automática
    admin::create_subvolume(backend, &cfg.snap_dir(), &cfg.subvol_name, None)
        .step("crear subvolumen anidado")?;

    // Paso 5: releer todo
    let repo = QgroupRepository::new(backend, &dir);
    let hierarchy = repo
        .load_hierarchy(cfg.parent, Direction::Down)
        .step("leer jerarquía")?;

    let mut levels = Vec::with_capacity(DEMO_LEVELS.len());
    for level in DEMO_LEVELS {
        let groups = repo.list_qgroups(level).step("listar qgroups")?;
        levels.push((level, groups));
    }

    info!(root = %hierarchy.id, "demo terminado");
    Ok(DemoReport { hierarchy, levels })
}
