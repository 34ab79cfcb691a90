/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Session configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `RDMA_PINGPONG_*` environment variables, then command-line flags (applied
//! by the binary). [`PingPongConfig::validate`] runs before any resource is
//! acquired.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::connection::RoleKind;
use crate::error::PingPongError;
use crate::memory_region::RegionMode;
use crate::transfer::DEFAULT_BUSY_WAIT_TIMEOUT;
use crate::transfer::DEFAULT_COMPLETION_TIMEOUT;
use crate::transfer::MAX_ITERATIONS;
use crate::transfer::TransferOptions;
use crate::transport::DEFAULT_MAX_INLINE_DATA;
use crate::transport::QueueCapacity;
use crate::window::FileWindowMapper;

pub const DEFAULT_SIZE: usize = 16;
pub const DEFAULT_ITERATIONS: usize = 16;
pub const DEFAULT_PORT: u16 = 12345;
pub const LOOPBACK_HOST: &str = "localhost";

pub const ENV_SIZE: &str = "RDMA_PINGPONG_SIZE";
pub const ENV_ITERATIONS: &str = "RDMA_PINGPONG_ITERATIONS";
pub const ENV_PORT: &str = "RDMA_PINGPONG_PORT";
pub const ENV_REMOTE: &str = "RDMA_PINGPONG_REMOTE";
pub const ENV_BUSY_WAIT: &str = "RDMA_PINGPONG_BUSY_WAIT";
pub const ENV_ALWAYS_OVERWRITE: &str = "RDMA_PINGPONG_ALWAYS_OVERWRITE";
pub const ENV_COPY_THROUGH: &str = "RDMA_PINGPONG_COPY_THROUGH";
pub const ENV_PEER_DIRECT: &str = "RDMA_PINGPONG_PEER_DIRECT";
pub const ENV_WINDOW: &str = "RDMA_PINGPONG_WINDOW";
pub const ENV_MAX_INLINE: &str = "RDMA_PINGPONG_MAX_INLINE";
pub const ENV_COMPLETION_TIMEOUT: &str = "RDMA_PINGPONG_COMPLETION_TIMEOUT";
pub const ENV_BUSY_WAIT_TIMEOUT: &str = "RDMA_PINGPONG_BUSY_WAIT_TIMEOUT";

/// Everything a session needs to know up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingPongConfig {
    /// `size` - Bytes exchanged per half-cycle.
    pub size: usize,
    /// `iterations` - Number of full cycles.
    pub iterations: usize,
    /// `port` - Service port.
    pub port: u16,
    /// `remote` - Host to connect to; absent for the responder.
    pub remote: Option<String>,
    /// `busy_wait` - Spin on buffer contents before each receive completion.
    pub busy_wait: bool,
    /// `always_overwrite` - Stamp the pattern before every send.
    pub always_overwrite: bool,
    /// `copy_through` - Copy between the external window and a host buffer.
    pub copy_through: bool,
    /// `peer_direct` - Register the external window itself.
    pub peer_direct: bool,
    /// `window_path` - File or device node backing the external window.
    pub window_path: Option<PathBuf>,
    /// `max_inline_data` - Upper bound on the inline send size.
    pub max_inline_data: u32,
    #[serde(with = "humantime_str")]
    pub completion_timeout: Duration,
    #[serde(with = "humantime_str")]
    pub busy_wait_timeout: Duration,
}

impl Default for PingPongConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            iterations: DEFAULT_ITERATIONS,
            port: DEFAULT_PORT,
            remote: None,
            busy_wait: false,
            always_overwrite: true,
            copy_through: false,
            peer_direct: false,
            window_path: None,
            max_inline_data: DEFAULT_MAX_INLINE_DATA,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            busy_wait_timeout: DEFAULT_BUSY_WAIT_TIMEOUT,
        }
    }
}

impl fmt::Display for PingPongConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PingPongConfig {{ role: {}, size: {}, iterations: {}, port: {}, remote: {}, busy_wait: {}, always_overwrite: {}, copy_through: {}, peer_direct: {}, window: {}, max_inline_data: {}, completion_timeout: {}, busy_wait_timeout: {} }}",
            self.role_kind(),
            self.size,
            self.iterations,
            self.port,
            self.remote.as_deref().unwrap_or("-"),
            self.busy_wait,
            self.always_overwrite,
            self.copy_through,
            self.peer_direct,
            self.window_path
                .as_deref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
            self.max_inline_data,
            humantime::format_duration(self.completion_timeout),
            humantime::format_duration(self.busy_wait_timeout),
        )
    }
}

impl PingPongConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Overlays the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Overlays values from `lookup`. Unparsable values are logged and
    /// leave the field unchanged.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &'static str| lookup(name).map(|v| (name, v));

        if let Some((name, v)) = get(ENV_SIZE) {
            set_parsed(name, &v, &mut self.size, |s| s.parse().ok());
        }
        if let Some((name, v)) = get(ENV_ITERATIONS) {
            set_parsed(name, &v, &mut self.iterations, |s| s.parse().ok());
        }
        if let Some((name, v)) = get(ENV_PORT) {
            set_parsed(name, &v, &mut self.port, |s| s.parse().ok());
        }
        if let Some((_, v)) = get(ENV_REMOTE) {
            self.remote = Some(v);
        }
        if let Some((name, v)) = get(ENV_BUSY_WAIT) {
            set_parsed(name, &v, &mut self.busy_wait, parse_bool);
        }
        if let Some((name, v)) = get(ENV_ALWAYS_OVERWRITE) {
            set_parsed(name, &v, &mut self.always_overwrite, parse_bool);
        }
        if let Some((name, v)) = get(ENV_COPY_THROUGH) {
            set_parsed(name, &v, &mut self.copy_through, parse_bool);
        }
        if let Some((name, v)) = get(ENV_PEER_DIRECT) {
            set_parsed(name, &v, &mut self.peer_direct, parse_bool);
        }
        if let Some((_, v)) = get(ENV_WINDOW) {
            self.window_path = Some(PathBuf::from(v));
        }
        if let Some((name, v)) = get(ENV_MAX_INLINE) {
            set_parsed(name, &v, &mut self.max_inline_data, |s| s.parse().ok());
        }
        if let Some((name, v)) = get(ENV_COMPLETION_TIMEOUT) {
            set_parsed(name, &v, &mut self.completion_timeout, |s| {
                humantime::parse_duration(s).ok()
            });
        }
        if let Some((name, v)) = get(ENV_BUSY_WAIT_TIMEOUT) {
            set_parsed(name, &v, &mut self.busy_wait_timeout, |s| {
                humantime::parse_duration(s).ok()
            });
        }
    }

    /// Rejects inconsistent settings before anything is acquired.
    pub fn validate(&self) -> Result<(), PingPongError> {
        if self.size == 0 {
            return Err(PingPongError::BadArgs("size must be non-zero".into()));
        }
        if u32::try_from(self.size).is_err() {
            return Err(PingPongError::BadArgs(format!(
                "size {} exceeds the largest single transfer ({})",
                self.size,
                u32::MAX
            )));
        }
        if self.iterations == 0 {
            return Err(PingPongError::BadArgs("iterations must be non-zero".into()));
        }
        if self.iterations > MAX_ITERATIONS {
            return Err(PingPongError::BadArgs(format!(
                "{} iterations overflow the pattern counter (at most {})",
                self.iterations, MAX_ITERATIONS
            )));
        }

        if self.copy_through && self.peer_direct {
            return Err(PingPongError::BadArgs(
                "copy-through and peer-direct are mutually exclusive".into(),
            ));
        }
        if (self.copy_through || self.peer_direct) && self.window_path.is_none() {
            return Err(PingPongError::BadArgs(
                "copy-through and peer-direct need a window path".into(),
            ));
        }
        if matches!(self.remote.as_deref(), Some(r) if r.trim().is_empty()) {
            return Err(PingPongError::BadArgs("remote host name is empty".into()));
        }
        Ok(())
    }

    /// Responder and initiator configurations for running both sides in one
    /// process. A window-backed run needs a distinct window for the
    /// initiator; one shared mapping would let each side read its own stamp.
    pub fn loopback_pair(
        &self,
        initiator_window: Option<PathBuf>,
    ) -> Result<(PingPongConfig, PingPongConfig), PingPongError> {
        let window_path = if self.copy_through || self.peer_direct {
            match initiator_window {
                Some(path) if Some(&path) != self.window_path.as_ref() => Some(path),
                _ => {
                    return Err(PingPongError::BadArgs(
                        "a loopback run needs a separate initiator window".into(),
                    ));
                }
            }
        } else {
            self.window_path.clone()
        };
        let responder = PingPongConfig {
            remote: None,
            ..self.clone()
        };
        let initiator = PingPongConfig {
            remote: Some(LOOPBACK_HOST.to_string()),
            window_path,
            ..self.clone()
        };
        Ok((responder, initiator))
    }

    /// A remote host makes this side the initiator.
    pub fn role_kind(&self) -> RoleKind {
        match self.remote {
            Some(_) => RoleKind::Initiator,
            None => RoleKind::Responder,
        }
    }

    pub fn region_mode(&self) -> RegionMode {
        if self.peer_direct {
            RegionMode::ExternalMapped
        } else {
            RegionMode::Owned
        }
    }

    pub fn queue_capacity(&self) -> QueueCapacity {
        QueueCapacity::for_chunk(self.size, self.max_inline_data)
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            busy_wait: self.busy_wait,
            always_overwrite: self.always_overwrite,
            completion_timeout: self.completion_timeout,
            busy_wait_timeout: self.busy_wait_timeout,
        }
    }

    /// The file-backed mapper for the configured window, if any.
    pub fn window_mapper(&self) -> Option<FileWindowMapper> {
        self.window_path.as_ref().map(FileWindowMapper::new)
    }
}

fn set_parsed<T>(name: &str, raw: &str, slot: &mut T, parse: impl Fn(&str) -> Option<T>) {
    match parse(raw.trim()) {
        Some(value) => *slot = value,
        None => tracing::error!("ignoring {}: cannot parse {:?}", name, raw),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

mod humantime_str {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
