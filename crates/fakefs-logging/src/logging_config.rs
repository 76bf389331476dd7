// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging configuration types

use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::LogFormat;

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level", default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Output format
    #[serde(rename = "log-format", default, skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,
}

impl LoggingConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid logging configuration")
    }

    /// The configured level, `default` when unset.
    pub fn level_or(&self, default: Level) -> anyhow::Result<Level> {
        match &self.level {
            Some(level) => Level::from_str(level).map_err(|_| anyhow!("invalid log level: {level}")),
            None => Ok(default),
        }
    }

    /// Installs the global subscriber described by this configuration.
    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        crate::init(component, self.level_or(Level::INFO)?, self.format.unwrap_or_default())
    }
}
