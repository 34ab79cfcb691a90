/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Connection manager
//!
//! Drives one endpoint through
//!
//! ```text
//! Unbound -> Resolved -> Listening   (responder) -> Connected -> Closed
//!                     -> Handshaking (initiator) ->
//! ```
//!
//! The role-specific steps live behind the [`Role`] trait ([`Initiator`]
//! and [`Responder`]); [`ConnectionManager`] only sequences them, records
//! every state it visits and guarantees teardown.

use std::fmt;

use crate::error::PingPongError;
use crate::transport::AddressHint;
use crate::transport::Endpoint;
use crate::transport::Fabric;
use crate::transport::Listener;
use crate::transport::QueueCapacity;
use crate::transport::TransportError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Unbound,
    Resolved,
    Listening,
    Handshaking,
    Connected,
    Closed,
}

impl EndpointState {
    /// Whether `self -> to` is a legal transition. Any live state may be
    /// closed; nothing leaves `Closed`.
    pub fn can_transition_to(self, to: EndpointState) -> bool {
        use EndpointState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Unbound, Resolved)
            | (Resolved, Listening)
            | (Resolved, Handshaking)
            | (Listening, Connected)
            | (Handshaking, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Initiator,
    Responder,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleKind::Initiator => write!(f, "initiator"),
            RoleKind::Responder => write!(f, "responder"),
        }
    }
}

/// Transport objects held while a connection is being set up and used.
pub struct Link<F: Fabric> {
    pub listener: Option<F::Listener>,
    pub endpoint: Option<F::Endpoint>,
}

impl<F: Fabric> Default for Link<F> {
    fn default() -> Self {
        Self {
            listener: None,
            endpoint: None,
        }
    }
}

/// The role-specific half of connection setup.
pub trait Role {
    fn kind(&self) -> RoleKind;

    /// What to resolve for this role.
    fn address_hint(&self, port: u16) -> AddressHint<'_>;

    /// The state entered once `create` succeeds.
    fn pending_state(&self) -> EndpointState;

    /// Whether this role's first half-cycle is a receive.
    fn receives_first(&self) -> bool;

    fn create<F: Fabric>(
        &self,
        fabric: &F,
        info: F::AddrInfo,
        caps: &QueueCapacity,
    ) -> Result<Link<F>, TransportError>;

    /// Completes the handshake. `prepare` runs on the data endpoint after it
    /// exists and before the peer can send to it.
    fn handshake<F, T, P>(&self, link: &mut Link<F>, prepare: P) -> Result<T, PingPongError>
    where
        F: Fabric,
        P: FnOnce(&mut F::Endpoint) -> Result<T, PingPongError>;
}

/// The active side: resolves the remote service and connects to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiator {
    pub remote: String,
}

impl Initiator {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }
}

impl Role for Initiator {
    fn kind(&self) -> RoleKind {
        RoleKind::Initiator
    }

    fn address_hint(&self, port: u16) -> AddressHint<'_> {
        AddressHint::Active {
            host: &self.remote,
            port,
        }
    }

    fn pending_state(&self) -> EndpointState {
        EndpointState::Handshaking
    }

    fn receives_first(&self) -> bool {
        false
    }

    fn create<F: Fabric>(
        &self,
        fabric: &F,
        info: F::AddrInfo,
        caps: &QueueCapacity,
    ) -> Result<Link<F>, TransportError> {
        Ok(Link {
            listener: None,
            endpoint: Some(fabric.create_endpoint(info, caps)?),
        })
    }

    fn handshake<F, T, P>(&self, link: &mut Link<F>, prepare: P) -> Result<T, PingPongError>
    where
        F: Fabric,
        P: FnOnce(&mut F::Endpoint) -> Result<T, PingPongError>,
    {
        let endpoint = link
            .endpoint
            .as_mut()
            .ok_or(PingPongError::InvalidState {
                from: EndpointState::Resolved,
                to: EndpointState::Connected,
            })?;
        let prepared = prepare(endpoint)?;
        endpoint.connect().map_err(PingPongError::Connect)?;
        tracing::info!(
            "established a connection to {} on {}",
            self.remote,
            endpoint.device_name().as_deref().unwrap_or("unknown device")
        );
        Ok(prepared)
    }
}

/// The passive side: listens on the service port and accepts one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Responder;

impl Role for Responder {
    fn kind(&self) -> RoleKind {
        RoleKind::Responder
    }

    fn address_hint(&self, port: u16) -> AddressHint<'_> {
        AddressHint::Passive { port }
    }

    fn pending_state(&self) -> EndpointState {
        EndpointState::Listening
    }

    fn receives_first(&self) -> bool {
        true
    }

    fn create<F: Fabric>(
        &self,
        fabric: &F,
        info: F::AddrInfo,
        caps: &QueueCapacity,
    ) -> Result<Link<F>, TransportError> {
        let mut listener = fabric.create_listener(info, caps)?;
        listener.listen()?;
        Ok(Link {
            listener: Some(listener),
            endpoint: None,
        })
    }

    fn handshake<F, T, P>(&self, link: &mut Link<F>, prepare: P) -> Result<T, PingPongError>
    where
        F: Fabric,
        P: FnOnce(&mut F::Endpoint) -> Result<T, PingPongError>,
    {
        let listener = link
            .listener
            .as_mut()
            .ok_or(PingPongError::InvalidState {
                from: EndpointState::Resolved,
                to: EndpointState::Connected,
            })?;
        let endpoint = listener.get_request().map_err(PingPongError::Accept)?;
        let endpoint = link.endpoint.insert(endpoint);
        let prepared = prepare(endpoint)?;
        endpoint.accept().map_err(PingPongError::Accept)?;
        tracing::info!(
            "accepted a connection on {}",
            endpoint.device_name().as_deref().unwrap_or("unknown device")
        );
        Ok(prepared)
    }
}

/// Sequences connection setup for one role and owns the resulting
/// transport objects until [`ConnectionManager::close`].
pub struct ConnectionManager<F: Fabric, R: Role> {
    fabric: F,
    role: R,
    port: u16,
    caps: QueueCapacity,
    state: EndpointState,
    visited: Vec<EndpointState>,
    info: Option<F::AddrInfo>,
    link: Link<F>,
}

impl<F: Fabric, R: Role> fmt::Debug for ConnectionManager<F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("role", &self.role.kind())
            .field("port", &self.port)
            .field("state", &self.state)
            .field("visited", &self.visited)
            .finish()
    }
}

impl<F: Fabric, R: Role> ConnectionManager<F, R> {
    pub fn new(fabric: F, role: R, port: u16, caps: QueueCapacity) -> Self {
        Self {
            fabric,
            role,
            port,
            caps,
            state: EndpointState::Unbound,
            visited: vec![EndpointState::Unbound],
            info: None,
            link: Link::default(),
        }
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn visited(&self) -> &[EndpointState] {
        &self.visited
    }

    pub fn caps(&self) -> &QueueCapacity {
        &self.caps
    }

    fn check(&self, to: EndpointState) -> Result<(), PingPongError> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(PingPongError::InvalidState {
                from: self.state,
                to,
            })
        }
    }

    fn enter(&mut self, to: EndpointState) {
        tracing::debug!("{} endpoint {} -> {}", self.role.kind(), self.state, to);
        self.state = to;
        self.visited.push(to);
    }

    /// `Unbound -> Resolved`.
    pub fn resolve(&mut self) -> Result<(), PingPongError> {
        self.check(EndpointState::Resolved)?;
        let hint = self.role.address_hint(self.port);
        let info = self
            .fabric
            .resolve(&hint)
            .map_err(PingPongError::Resolution)?;
        tracing::debug!("resolved {}", hint);
        self.info = Some(info);
        self.enter(EndpointState::Resolved);
        Ok(())
    }

    /// `Resolved -> Listening | Handshaking`.
    pub fn create(&mut self) -> Result<(), PingPongError> {
        let to = self.role.pending_state();
        self.check(to)?;
        let info = self.info.take().ok_or(PingPongError::InvalidState {
            from: self.state,
            to,
        })?;
        self.link = self
            .role
            .create(&self.fabric, info, &self.caps)
            .map_err(PingPongError::EndpointCreation)?;
        self.enter(to);
        Ok(())
    }

    /// `Listening | Handshaking -> Connected`, running `prepare` on the data
    /// endpoint before the handshake completes.
    pub fn establish<T, P>(&mut self, prepare: P) -> Result<T, PingPongError>
    where
        P: FnOnce(&mut F::Endpoint) -> Result<T, PingPongError>,
    {
        self.check(EndpointState::Connected)?;
        let prepared = self.role.handshake(&mut self.link, prepare)?;
        self.enter(EndpointState::Connected);
        Ok(prepared)
    }

    /// Runs the whole setup path.
    pub fn connect<T, P>(&mut self, prepare: P) -> Result<T, PingPongError>
    where
        P: FnOnce(&mut F::Endpoint) -> Result<T, PingPongError>,
    {
        self.resolve()?;
        self.create()?;
        self.establish(prepare)
    }

    /// The data endpoint, once one exists.
    pub fn endpoint_mut(&mut self) -> Option<&mut F::Endpoint> {
        self.link.endpoint.as_mut()
    }

    /// Disconnects and releases every transport object. Safe to call in any
    /// state and more than once.
    pub fn close(&mut self) {
        if self.state == EndpointState::Closed {
            return;
        }
        if self.state == EndpointState::Connected {
            if let Some(endpoint) = self.link.endpoint.as_mut() {
                if let Err(e) = endpoint.disconnect() {
                    tracing::warn!("{} disconnect failed: {}", self.role.kind(), e);
                }
            }
        }
        self.link.endpoint = None;
        self.link.listener = None;
        self.info = None;
        self.enter(EndpointState::Closed);
    }
}

impl<F: Fabric, R: Role> Drop for ConnectionManager<F, R> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::ExitStatus;
    use crate::loopback::LoopbackFabric;
    use crate::transport::DEFAULT_MAX_INLINE_DATA;

    fn caps() -> QueueCapacity {
        QueueCapacity::for_chunk(16, DEFAULT_MAX_INLINE_DATA)
    }

    #[test]
    fn test_transition_table() {
        use EndpointState::*;
        assert!(Unbound.can_transition_to(Resolved));
        assert!(Resolved.can_transition_to(Listening));
        assert!(Handshaking.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(Unbound.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Unbound));
        assert!(!Unbound.can_transition_to(Connected));
        assert!(!Listening.can_transition_to(Handshaking));
    }

    #[test]
    fn test_role_exclusivity() {
        let fabric = LoopbackFabric::new();
        let server_fabric = fabric.clone();
        let server = thread::spawn(move || {
            let mut mgr = ConnectionManager::new(server_fabric, Responder, 4000, caps());
            mgr.connect(|_| Ok(())).unwrap();
            mgr.close();
            mgr.visited().to_vec()
        });

        let mut mgr = ConnectionManager::new(fabric, Initiator::new("localhost"), 4000, caps());
        assert_eq!(mgr.role().kind(), RoleKind::Initiator);
        mgr.connect(|_| Ok(())).unwrap();
        assert_eq!(mgr.state(), EndpointState::Connected);
        mgr.close();

        use EndpointState::*;
        assert_eq!(
            mgr.visited(),
            &[Unbound, Resolved, Handshaking, Connected, Closed]
        );
        assert_eq!(
            server.join().unwrap(),
            vec![Unbound, Resolved, Listening, Connected, Closed]
        );
    }

    #[test]
    fn test_out_of_order_steps_are_rejected() {
        let mut mgr = ConnectionManager::new(
            LoopbackFabric::new(),
            Initiator::new("localhost"),
            1,
            caps(),
        );
        let err = mgr.establish(|_| Ok(())).unwrap_err();
        assert!(matches!(
            err,
            PingPongError::InvalidState {
                from: EndpointState::Unbound,
                to: EndpointState::Connected
            }
        ));
        mgr.resolve().unwrap();
        assert!(matches!(
            mgr.resolve().unwrap_err(),
            PingPongError::InvalidState { .. }
        ));
        assert!(mgr.establish(|_| Ok(())).is_err());
    }

    #[test]
    fn test_resolution_failure() {
        let mut mgr = ConnectionManager::new(
            LoopbackFabric::new(),
            Initiator::new("nowhere.invalid"),
            1,
            caps(),
        );
        let err = mgr.connect(|_| Ok(())).unwrap_err();
        assert!(matches!(err, PingPongError::Resolution(_)));
        assert_eq!(err.exit_status(), ExitStatus::NoConnection);
        assert_eq!(mgr.state(), EndpointState::Unbound);
        assert!(mgr.endpoint_mut().is_none());
    }

    #[test]
    fn test_connect_refused() {
        let fabric = LoopbackFabric::new().with_connect_timeout(Duration::from_millis(20));
        let mut mgr = ConnectionManager::new(fabric, Initiator::new("localhost"), 2, caps());
        let err = mgr.connect(|_| Ok(())).unwrap_err();
        assert!(matches!(err, PingPongError::Connect(_)));
        assert_eq!(mgr.state(), EndpointState::Handshaking);
        mgr.close();
        assert_eq!(mgr.state(), EndpointState::Closed);
    }

    #[test]
    fn test_accept_times_out_without_peer() {
        let fabric = LoopbackFabric::new().with_connect_timeout(Duration::from_millis(20));
        let mut mgr = ConnectionManager::new(fabric, Responder, 3, caps());
        let err = mgr.connect(|_| Ok(())).unwrap_err();
        assert!(matches!(err, PingPongError::Accept(_)));
        assert!(!mgr.visited().contains(&EndpointState::Handshaking));
    }

    #[test]
    fn test_prepare_failure_aborts_handshake() {
        let fabric = LoopbackFabric::new().with_connect_timeout(Duration::from_millis(20));
        let mut mgr = ConnectionManager::new(fabric, Initiator::new("localhost"), 5, caps());
        let err = mgr
            .connect(|_| -> Result<(), PingPongError> {
                Err(PingPongError::Allocation { size: 16 })
            })
            .unwrap_err();
        assert!(matches!(err, PingPongError::Allocation { .. }));
        assert_eq!(mgr.state(), EndpointState::Handshaking);
    }

    #[test]
    fn test_zero_depth_queues_fail_endpoint_creation() {
        let empty = QueueCapacity {
            max_send_wr: 0,
            max_recv_wr: 0,
            ..caps()
        };
        let mut initiator =
            ConnectionManager::new(LoopbackFabric::new(), Initiator::new("localhost"), 7, empty);
        let err = initiator.connect(|_| Ok(())).unwrap_err();
        assert!(matches!(err, PingPongError::EndpointCreation(_)), "{}", err);
        assert_eq!(err.exit_status(), ExitStatus::NoConnection);
        assert_eq!(initiator.state(), EndpointState::Resolved);
        assert!(initiator.endpoint_mut().is_none());

        let mut responder = ConnectionManager::new(LoopbackFabric::new(), Responder, 7, empty);
        let err = responder.connect(|_| Ok(())).unwrap_err();
        assert!(matches!(err, PingPongError::EndpointCreation(_)), "{}", err);
        responder.close();
        assert_eq!(responder.state(), EndpointState::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut mgr = ConnectionManager::new(LoopbackFabric::new(), Responder, 6, caps());
        mgr.resolve().unwrap();
        mgr.create().unwrap();
        mgr.close();
        mgr.close();
        assert_eq!(
            mgr.visited().iter().filter(|s| **s == EndpointState::Closed).count(),
            1
        );
        assert!(matches!(
            mgr.resolve().unwrap_err(),
            PingPongError::InvalidState {
                from: EndpointState::Closed,
                ..
            }
        ));
    }
}
