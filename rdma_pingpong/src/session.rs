/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One ping-pong session, end to end.
//!
//! Control flow: the connection manager produces a connected endpoint, the
//! memory region is registered against it during the handshake, the
//! transfer engine runs the exchange over both, and the metrics collector
//! turns the timestamp series into a [`Summary`]. The region and the
//! connection are released on every exit path.

use std::fmt;
use std::time::Instant;

use crate::config::PingPongConfig;
use crate::connection::ConnectionManager;
use crate::connection::EndpointState;
use crate::connection::Initiator;
use crate::connection::Responder;
use crate::connection::Role;
use crate::connection::RoleKind;
use crate::error::PingPongError;
use crate::memory_region::MemoryRegion;
use crate::metrics::Summary;
use crate::metrics::summarize;
use crate::metrics::total_bytes;
use crate::report::Report;
use crate::report::Units;
use crate::transfer::CancelToken;
use crate::transfer::TransferEngine;
use crate::transfer::TransferSession;
use crate::transfer::prepare_endpoint;
use crate::transport::Endpoint;
use crate::transport::Fabric;
use crate::window::WindowMapper;

/// Outcome of a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub role: RoleKind,
    pub device: Option<String>,
    pub summary: Summary,
    /// Final `(cval, sval)`.
    pub pattern: (u32, u32),
    pub latencies: Vec<Instant>,
    /// First byte seen after each receive completion.
    pub received: Vec<u8>,
    /// Connection states visited, in order.
    pub states: Vec<EndpointState>,
}

impl SessionReport {
    pub fn display(&self, units: Units) -> impl fmt::Display + '_ {
        DisplayReport {
            report: self,
            units,
        }
    }
}

struct DisplayReport<'a> {
    report: &'a SessionReport,
    units: Units,
}

impl fmt::Display for DisplayReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.report;
        writeln!(
            f,
            "{} on {}: cval={} sval={}",
            r.role,
            r.device.as_deref().unwrap_or("unknown device"),
            r.pattern.0,
            r.pattern.1
        )?;
        write!(f, "{}", Report::new(&r.summary, self.units))
    }
}

/// A configured session over fabric `F`.
pub struct Session<F: Fabric> {
    fabric: F,
    config: PingPongConfig,
    mapper: Option<Box<dyn WindowMapper>>,
    cancel: CancelToken,
}

impl<F: Fabric> Session<F> {
    /// Validates `config`; nothing is acquired yet.
    pub fn new(fabric: F, config: PingPongConfig) -> Result<Self, PingPongError> {
        config.validate()?;
        let mapper = config
            .window_mapper()
            .map(|m| Box::new(m) as Box<dyn WindowMapper>);
        Ok(Self {
            fabric,
            config,
            mapper,
            cancel: CancelToken::new(),
        })
    }

    /// Replaces the window mapper derived from the configured path.
    pub fn with_mapper(mut self, mapper: impl WindowMapper + 'static) -> Self {
        self.mapper = Some(Box::new(mapper));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PingPongConfig {
        &self.config
    }

    /// Runs the session in the role implied by the configuration.
    pub fn run(self) -> Result<SessionReport, PingPongError> {
        match self.config.remote.clone() {
            Some(remote) => self.run_as(Initiator::new(remote)),
            None => self.run_as(Responder),
        }
    }

    fn run_as<R: Role>(self, role: R) -> Result<SessionReport, PingPongError> {
        let Session {
            fabric,
            config,
            mapper,
            cancel,
        } = self;
        let kind = role.kind();
        let receives_first = role.receives_first();
        let caps = config.queue_capacity();
        let mode = config.region_mode();
        tracing::info!("starting {} session: {}", kind, config);

        // Locals drop in reverse order: window, then region, then connection.
        let mut manager = ConnectionManager::new(fabric, role, config.port, caps);
        let mut region = MemoryRegion::acquire(config.size, mode, mapper.as_deref())?;
        let window = if config.copy_through {
            let mapper = mapper.as_deref().ok_or_else(|| {
                PingPongError::Mapping(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "copy-through needs an external window",
                ))
            })?;
            Some(mapper.map(config.size).map_err(PingPongError::Mapping)?)
        } else {
            None
        };

        manager.connect(|endpoint| {
            prepare_endpoint(endpoint, &mut region, mode.access_flags(), receives_first)
        })?;

        let mut session = TransferSession::new(config.iterations);
        let state = manager.state();
        let endpoint = manager
            .endpoint_mut()
            .ok_or(PingPongError::InvalidState {
                from: state,
                to: EndpointState::Connected,
            })?;
        let device = endpoint.device_name();
        let mut engine = TransferEngine::new(
            endpoint,
            &region,
            &caps,
            config.transfer_options(),
            !receives_first,
        )
        .with_cancel(cancel);
        if let Some(window) = window.as_deref() {
            engine = engine.with_window(window);
        }
        engine.run(&mut session)?;

        drop(window);
        region.release();
        manager.close();

        let now = Instant::now();
        let (start, end) = session.span().unwrap_or((now, now));
        let bytes = total_bytes(config.size, config.iterations).ok_or_else(|| {
            PingPongError::BadArgs(format!(
                "{} iterations of {} bytes overflow the byte count",
                config.iterations, config.size
            ))
        })?;
        let summary = summarize(start, end, bytes, &session.latencies);
        tracing::info!(
            "{} finished {} iterations: {}",
            kind,
            config.iterations,
            Report::new(&summary, Units::Si)
        );

        Ok(SessionReport {
            role: kind,
            device,
            summary,
            pattern: (session.cval, session.sval),
            latencies: session.latencies,
            received: session.received,
            states: manager.visited().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackFabric;

    #[test]
    fn test_bad_config_fails_before_acquisition() {
        let config = PingPongConfig {
            copy_through: true,
            peer_direct: true,
            window_path: Some("/nonexistent".into()),
            ..PingPongConfig::default()
        };
        let err = Session::new(LoopbackFabric::new(), config)
            .err()
            .unwrap();
        assert!(matches!(err, PingPongError::BadArgs(_)));
    }

    #[test]
    fn test_missing_window_is_mapping_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = PingPongConfig {
            peer_direct: true,
            window_path: Some(dir.path().join("absent")),
            ..PingPongConfig::default()
        };
        let err = Session::new(LoopbackFabric::new(), config)
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(err, PingPongError::Mapping(_)));
        assert!(err.exit_status().is_setup());
    }
}
