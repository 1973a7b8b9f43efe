//! Daemon configuration
//!
//! Read from a TOML file when one is given, otherwise built from defaults.
//! `QDMA_SOCKET` and `QDMA_POLL_MODE` override the file, `QDMA_RUN_DIR`
//! moves the default socket directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use log::{debug, error};
use qdma_core::DeviceConfig;
use serde::Deserialize;

pub const RUN_DIR_DEFAULT: &str = "/run/qdma";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    #[default]
    Pf,
    Vf,
}

impl Function {
    pub fn is_vf(self) -> bool {
        self == Function::Vf
    }
}

/// One device exposed by the software engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceEntry {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
    pub config_bar: u8,
    pub user_bar: u8,
    pub qsets_max: u32,
    pub card_mem_size: usize,
}

impl Default for DeviceEntry {
    fn default() -> Self {
        let conf = DeviceConfig::default();
        DeviceEntry {
            bus: 0x01,
            dev: 0,
            func: 0,
            config_bar: conf.config_bar,
            user_bar: conf.user_bar,
            qsets_max: conf.qsets_max,
            card_mem_size: conf.card_mem_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub function: Function,
    /// Directory holding the control socket
    pub run_dir: PathBuf,
    /// Explicit socket path; `<run_dir>/<family>.sock` otherwise
    pub socket: Option<PathBuf>,
    pub poll_mode: bool,
    pub prefetch: bool,
    pub indirect_interrupts: bool,
    #[serde(rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            function: Function::Pf,
            run_dir: PathBuf::from(RUN_DIR_DEFAULT),
            socket: None,
            poll_mode: false,
            prefetch: false,
            indirect_interrupts: false,
            devices: vec![DeviceEntry::default()],
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(text).context("invalid configuration")?;
        if config.devices.is_empty() {
            bail!("no [[device]] configured");
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&text).map_err(|e| {
            error!("{}: {:#}", path.display(), e);
            e
        })?;
        debug!("loaded {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(dir) = var("QDMA_RUN_DIR") {
            self.run_dir = PathBuf::from(dir);
        }
        if let Some(socket) = var("QDMA_SOCKET") {
            self.socket = Some(PathBuf::from(socket));
        }
        if let Some(poll) = var("QDMA_POLL_MODE") {
            self.poll_mode = match poll.trim() {
                "1" | "y" | "yes" | "true" => true,
                "0" | "n" | "no" | "false" => false,
                other => bail!("QDMA_POLL_MODE={}: expected 0 or 1", other),
            };
        }
        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.socket {
            Some(path) => path.clone(),
            None => self
                .run_dir
                .join(format!("{}.sock", qdma_nl::family_name(self.function.is_vf()))),
        }
    }

    /// Engine open parameters for every configured device.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .map(|d| DeviceConfig {
                pci_bus: d.bus,
                pci_dev: d.dev,
                pci_func: d.func,
                config_bar: d.config_bar,
                user_bar: d.user_bar,
                qsets_max: d.qsets_max,
                vf: self.function.is_vf(),
                poll_mode: self.poll_mode,
                indirect_interrupts: self.indirect_interrupts,
                prefetch: self.prefetch,
                card_mem_size: d.card_mem_size,
                ..DeviceConfig::default()
            })
            .collect()
    }
}
