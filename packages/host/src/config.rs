//! Runtime and module configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::host_function::HostFunction;

/// Default maximum memory pages (64 KiB per page), 1 GiB in total.
const DEFAULT_MAX_MEMORY_PAGES: u32 = 16_384;

/// Minimum severity of emitted log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogSeverity {
    /// The directive used when `RUST_LOG` is not set.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogSeverity::Debug => "debug",
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warn",
            LogSeverity::Error => "error",
        }
    }
}

/// Engine-wide settings shared by every module of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub log_severity: LogSeverity,
    /// Emit DWARF debug info in compiled code.
    pub debug_info: bool,
    /// Upper bound on each instance's linear memory, in 64 KiB pages.
    pub max_memory_pages: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_severity: LogSeverity::Info,
            debug_info: false,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn with_log_severity(mut self, severity: LogSeverity) -> Self {
        self.log_severity = severity;
        self
    }

    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }

    pub(crate) fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * 64 * 1024
    }
}

/// A host directory exposed to the guest's WASI filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    pub host_dir: PathBuf,
    /// Mount point inside the guest; `/` when unset.
    #[serde(default)]
    pub guest_dir: Option<String>,
}

impl FsConfig {
    pub fn new(host_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_dir: host_dir.into(),
            guest_dir: None,
        }
    }

    pub fn with_guest_dir(mut self, dir: impl Into<String>) -> Self {
        self.guest_dir = Some(dir.into());
        self
    }

    pub fn guest_dir(&self) -> &str {
        self.guest_dir.as_deref().unwrap_or("/")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiConfig {
    pub inherit_stdio: bool,
    pub preopen: Option<FsConfig>,
}

/// A guest binary plus the optional SHA-256 hex digest it must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wasm {
    pub binary: Vec<u8>,
    pub hash: Option<String>,
}

impl Wasm {
    pub fn new(binary: impl Into<Vec<u8>>) -> Self {
        Self {
            binary: binary.into(),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// Everything needed to instantiate one guest module.
#[derive(Debug)]
pub struct ModuleConfig {
    /// Import module name the host functions are registered under. Also
    /// identifies the module in logs.
    pub namespace: String,
    pub wasm: Wasm,
    pub host_functions: Vec<Arc<HostFunction>>,
    pub wasi: WasiConfig,
}

impl ModuleConfig {
    pub fn new(namespace: impl Into<String>, wasm: Wasm) -> Self {
        Self {
            namespace: namespace.into(),
            wasm,
            host_functions: Vec::new(),
            wasi: WasiConfig::default(),
        }
    }

    pub fn with_host_function(mut self, function: HostFunction) -> Self {
        self.host_functions.push(Arc::new(function));
        self
    }

    pub fn with_wasi(mut self, wasi: WasiConfig) -> Self {
        self.wasi = wasi;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.log_severity, LogSeverity::Info);
        assert!(!config.debug_info);
        assert_eq!(config.max_memory_pages, 16_384);
    }

    #[test]
    fn runtime_config_from_partial_json() {
        let config = RuntimeConfig::from_json(r#"{"log_severity":"debug"}"#).unwrap();
        assert_eq!(config.log_severity, LogSeverity::Debug);
        assert_eq!(config.max_memory_pages, 16_384);
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = RuntimeConfig::from_json(r#"{"log_severity":"loud"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn fs_guest_dir_defaults_to_root() {
        let fs = FsConfig::new("/tmp/data");
        assert_eq!(fs.guest_dir(), "/");
        assert_eq!(fs.with_guest_dir("/data").guest_dir(), "/data");
    }

    #[test]
    fn severity_maps_to_filter_directives() {
        assert_eq!(LogSeverity::Warning.as_filter(), "warn");
        assert_eq!(LogSeverity::Debug.as_filter(), "debug");
    }
}
