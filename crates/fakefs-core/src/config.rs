// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Host operating system whose filesystem semantics are emulated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFlavor {
    #[default]
    Linux,
    MacOs,
    Windows,
}

impl OsFlavor {
    pub fn is_windows(self) -> bool {
        matches!(self, OsFlavor::Windows)
    }

    pub fn is_macos(self) -> bool {
        matches!(self, OsFlavor::MacOs)
    }

    pub fn is_linux(self) -> bool {
        matches!(self, OsFlavor::Linux)
    }
}

/// Case sensitivity for name lookup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseSensitivity {
    Sensitive,
    /// Lookups ignore case; stored names keep the case they were created with
    InsensitivePreserving,
}

/// Identity used for permission checks and as owner of new entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub uid: u32,
    pub gid: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self { uid: 1000, gid: 1000 }
    }
}

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub os_flavor: OsFlavor,
    pub path_separator: char,
    pub alt_path_separator: Option<char>,
    pub case_sensitivity: CaseSensitivity,
    /// Drive letters and UNC prefixes are recognized
    pub drive_support: bool,
    /// Capacity of the root mount, unlimited when absent
    pub total_size: Option<u64>,
    pub security: SecurityPolicy,
    pub umask: u32,
    /// Stat time fields read as fractional seconds rather than whole seconds
    pub stat_float_times: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self::for_flavor(OsFlavor::Linux)
    }
}

impl FsConfig {
    /// Flavor defaults: separator, case handling and drive support.
    pub fn for_flavor(os_flavor: OsFlavor) -> Self {
        let (path_separator, alt_path_separator, case_sensitivity, drive_support) = match os_flavor
        {
            OsFlavor::Linux => ('/', None, CaseSensitivity::Sensitive, false),
            OsFlavor::MacOs => ('/', None, CaseSensitivity::InsensitivePreserving, false),
            OsFlavor::Windows => ('\\', Some('/'), CaseSensitivity::InsensitivePreserving, true),
        };
        Self {
            os_flavor,
            path_separator,
            alt_path_separator,
            case_sensitivity,
            drive_support,
            total_size: None,
            security: SecurityPolicy::default(),
            umask: 0o022,
            stat_float_times: true,
        }
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = security;
        self
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitivity == CaseSensitivity::Sensitive
    }

    pub fn from_json_str(json: &str) -> FsResult<Self> {
        let config: FsConfig = serde_json::from_str(json)
            .map_err(|e| FsError::invalid("<config>", format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file from the host filesystem.
    pub fn from_json_file(path: &Path) -> FsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FsError::invalid(path.display().to_string(), format!("cannot read config: {}", e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> FsResult<()> {
        if Some(self.path_separator) == self.alt_path_separator {
            return Err(FsError::invalid(
                "<config>",
                "alternative separator must differ from the separator",
            ));
        }
        if self.umask & !0o777 != 0 {
            return Err(FsError::invalid("<config>", "umask must only hold permission bits"));
        }
        Ok(())
    }
}
