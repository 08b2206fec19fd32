// src/config.rs
//
// Rutas y parámetros del demo de squota, armados desde los argumentos en
// lugar de constantes globales.
use std::env::VarError;
use std::ffi::OsString;
use std::path::PathBuf;

use thiserror::Error;

use crate::qgroup::QgroupId;

pub const DEMO_USAGE: &str = "Uso: squota-demo <montaje-btrfs> [subvolumen-origen]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{}", DEMO_USAGE)]
    Usage,
    #[error("valor inválido para {key}: {value:?} (se esperan bytes)")]
    InvalidLimit { key: &'static str, value: String },
    #[error("{0} contiene bytes que no son UTF-8")]
    NotUnicode(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoConfig {
    /// Raíz del btrfs con squota habilitado.
    pub mount: PathBuf,
    /// Subvolumen del que se saca el snapshot.
    pub snap_src: PathBuf,
    pub snap_name: OsString,
    pub subvol_name: OsString,
    /// Grupo que heredan el snapshot y el subvolumen.
    pub wrapper: QgroupId,
    /// Grupo de nivel 2 que contiene al wrapper.
    pub parent: QgroupId,
    /// Límite exclusivo del wrapper, en bytes.
    pub limit: u64,
}

impl DemoConfig {
    pub const LIMIT_ENV: &'static str = "SQUOTA_LIMIT_BYTES";

    pub fn new(mount: impl Into<PathBuf>) -> Self {
        let mount = mount.into();
        Self {
            snap_src: mount.join("src"),
            mount,
            snap_name: OsString::from("snap"),
            subvol_name: OsString::from("subv"),
            wrapper: QgroupId::new(1, 100),
            parent: QgroupId::new(2, 100),
            limit: 10 * (1 << 20),
        }
    }

    /// Argumentos posicionales sin el nombre del binario.
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut args = args.into_iter();
        let mount = args.next().map(PathBuf::from).ok_or(ConfigError::Usage)?;
        let mut cfg = Self::new(mount);

        if let Some(src) = args.next() {
            cfg.snap_src = PathBuf::from(src);
        }
        if args.next().is_some() {
            return Err(ConfigError::Usage);
        }
        Ok(cfg)
    }

    /// Aplica el valor de `SQUOTA_LIMIT_BYTES`, tal como lo devuelve `env::var`.
    pub fn with_limit_var(mut self, var: Result<String, VarError>) -> Result<Self, ConfigError> {
        match var {
            Ok(value) => {
                self.limit = value.trim().parse().map_err(|_| ConfigError::InvalidLimit {
                    key: Self::LIMIT_ENV,
                    value,
                })?;
                Ok(self)
            }
            Err(VarError::NotPresent) => Ok(self),
            Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(Self::LIMIT_ENV)),
        }
    }

    /// Destino del snapshot: `<mount>/<snap_name>`.
    pub fn snap_dir(&self) -> PathBuf {
        self.mount.join(&self.snap_name)
    }
}
