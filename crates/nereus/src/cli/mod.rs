//! CLI command implementations.

mod display;

pub mod blast;
pub mod diff;
pub mod import;
pub mod index;
pub mod rollup;

use std::path::Path;

use nereus::{Nereus, NereusConfig, TenantId};
use serde::Serialize;

/// Everything a command needs: the opened engine, the tenant and the
/// output mode.
pub struct Context {
    pub nereus: Nereus,
    pub tenant: TenantId,
    pub json: bool,
}

impl Context {
    /// Load configuration and open the database in `data_dir`.
    pub fn open(
        data_dir: &Path,
        config: Option<&Path>,
        tenant: &str,
        json: bool,
    ) -> Result<Self, nereus::Error> {
        let config = match config {
            Some(path) => NereusConfig::load(path)?,
            None => NereusConfig::load_or_default(data_dir)?,
        };
        Ok(Self {
            nereus: Nereus::open(data_dir, config)?,
            tenant: TenantId::from(tenant),
            json,
        })
    }

    /// Print `value` as pretty JSON when `--json` was given, otherwise run
    /// the human-readable printer.
    pub fn emit<T: Serialize>(
        &self,
        value: &T,
        human: impl FnOnce(&T),
    ) -> Result<(), nereus::Error> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}
