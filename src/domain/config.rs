//! Loading the static, file-configured domain list.
//!
//! Kept intentionally separate from [`crate::config`]: this file reloads on
//! `SIGHUP` while the rest of server configuration does not (spec §3,
//! "Configuration is static (file-loaded at startup and on SIGHUP)").

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::Domain;

#[derive(Debug, Deserialize)]
struct DomainsFile {
    #[serde(default)]
    domains: Vec<Domain>,
}

pub fn load_domains(path: &Path) -> Result<Vec<Domain>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read domains config: {}", path.display()))?;
    load_domains_str(&content)
}

pub fn load_domains_str(content: &str) -> Result<Vec<Domain>> {
    let file: DomainsFile =
        toml::from_str(content).context("failed to parse domains config as TOML")?;
    Ok(file.domains)
}
