/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Transfer engine
//!
//! Runs the ping-pong exchange over a connected endpoint and a registered
//! [`MemoryRegion`]. Each of the `N` cycles has two halves: in half 0 the
//! initiator sends the pattern value `cval`, in half 1 the responder sends
//! `sval`. The pair starts at `(cval, sval) = (1, 0)` and advances as
//! `sval = cval + 1` after half 0 and `cval = sval + 1` after half 1.
//!
//! Sender half: stamp (when always-overwrite is on), fence, post the send,
//! wait for its completion, re-post the receive for the next inbound half.
//!
//! Receiver half: optionally spin until the buffer holds the expected
//! pattern, then wait for the receive completion.
//!
//! Both waits are bounded by [`TransferOptions`] and honor a
//! [`CancelToken`]. Every half is timestamped as soon as its completion
//! is confirmed, before any re-post or window copy.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::error::PingPongError;
use crate::memory_region::MemoryRegion;
use crate::memory_region::stamp_window;
use crate::transport::AccessFlags;
use crate::transport::Completion;
use crate::transport::Endpoint;
use crate::transport::PollTarget;
use crate::transport::QueueCapacity;
use crate::transport::TransportError;
use crate::window::MappedWindow;

pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUSY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Spins between cooperative yields while polling.
const SPINS_PER_YIELD: u32 = 1024;

/// The largest cycle count whose final pattern value `2N + 1` fits a `u32`.
pub const MAX_ITERATIONS: usize = ((u32::MAX - 1) / 2) as usize;

/// Timestamps reserved up front; longer runs grow the series as they go.
const PREALLOCATED_HALVES: usize = 1 << 20;

/// A shared cancellation flag, checked at every wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Knobs for the exchange loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Detect arrival by polling buffer contents before the completion.
    pub busy_wait: bool,
    /// Stamp the pattern into the buffer before every send.
    pub always_overwrite: bool,
    pub completion_timeout: Duration,
    pub busy_wait_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            busy_wait: false,
            always_overwrite: true,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            busy_wait_timeout: DEFAULT_BUSY_WAIT_TIMEOUT,
        }
    }
}

impl fmt::Display for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransferOptions {{ busy_wait: {}, always_overwrite: {}, completion_timeout: {}, busy_wait_timeout: {} }}",
            self.busy_wait,
            self.always_overwrite,
            humantime::format_duration(self.completion_timeout),
            humantime::format_duration(self.busy_wait_timeout),
        )
    }
}

/// Progress and measurements of one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSession {
    pub iterations: usize,
    pub cval: u32,
    pub sval: u32,
    /// One timestamp per completed half, at index `2 * i + half`.
    pub latencies: Vec<Instant>,
    /// First buffer byte after each receive completion.
    pub received: Vec<u8>,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
}

impl TransferSession {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            cval: 1,
            sval: 0,
            latencies: Vec::with_capacity(iterations.saturating_mul(2).min(PREALLOCATED_HALVES)),
            received: Vec::with_capacity(iterations.min(PREALLOCATED_HALVES)),
            start: None,
            end: None,
        }
    }

    /// Whether all `2N` halves were timestamped.
    pub fn is_complete(&self) -> bool {
        self.end.is_some() && Some(self.latencies.len()) == self.iterations.checked_mul(2)
    }

    /// `(start, end)` of a finished run.
    pub fn span(&self) -> Option<(Instant, Instant)> {
        self.start.zip(self.end)
    }
}

/// Registers `region` against `endpoint` and, for a role that receives
/// first, posts the initial receive. Used as the connection handshake's
/// prepare step.
pub fn prepare_endpoint<E: Endpoint>(
    endpoint: &mut E,
    region: &mut MemoryRegion<E::Key>,
    access: AccessFlags,
    receives_first: bool,
) -> Result<(), PingPongError> {
    region.register(endpoint, access)?;
    if receives_first {
        let key = region.key().ok_or_else(unregistered)?;
        endpoint
            .post_recv(region.sge(), key)
            .map_err(PingPongError::ReceivePost)?;
        tracing::debug!("pre-posted the first receive");
    }
    Ok(())
}

fn unregistered() -> PingPongError {
    PingPongError::Registration(TransportError::new(
        "ibv_reg_mr",
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "buffer is not registered"),
    ))
}

/// Drives the exchange for one side.
pub struct TransferEngine<'a, E: Endpoint> {
    endpoint: &'a mut E,
    region: &'a MemoryRegion<E::Key>,
    window: Option<&'a dyn MappedWindow>,
    options: TransferOptions,
    sends_first: bool,
    inline: bool,
    cancel: CancelToken,
}

impl<'a, E: Endpoint> TransferEngine<'a, E> {
    pub fn new(
        endpoint: &'a mut E,
        region: &'a MemoryRegion<E::Key>,
        caps: &QueueCapacity,
        options: TransferOptions,
        sends_first: bool,
    ) -> Self {
        let inline = region.len() <= caps.max_inline_data as usize;
        Self {
            endpoint,
            region,
            window: None,
            options,
            sends_first,
            inline,
            cancel: CancelToken::new(),
        }
    }

    /// Copy-through mode: data moves between `window` and the buffer.
    pub fn with_window(mut self, window: &'a dyn MappedWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    /// Runs every cycle of `session`.
    pub fn run(&mut self, session: &mut TransferSession) -> Result<(), PingPongError> {
        if session.iterations > MAX_ITERATIONS {
            return Err(PingPongError::BadArgs(format!(
                "{} iterations overflow the pattern counter (at most {})",
                session.iterations, MAX_ITERATIONS
            )));
        }
        session.start = Some(Instant::now());
        for i in 0..session.iterations {
            tracing::debug!("iteration {}: cval={} sval={}", i, session.cval, session.sval);
            self.half_cycle(session, 0, session.cval)?;
            session.sval = session.cval + 1;
            self.half_cycle(session, 1, session.sval)?;
            session.cval = session.sval + 1;
        }
        session.end = Some(Instant::now());
        Ok(())
    }

    fn half_cycle(
        &mut self,
        session: &mut TransferSession,
        half: usize,
        value: u32,
    ) -> Result<(), PingPongError> {
        let sending = (half == 0) == self.sends_first;
        let completed = if sending {
            self.send(value)?
        } else {
            let (byte, completed) = self.receive(value)?;
            session.received.push(byte);
            completed
        };
        session.latencies.push(completed);
        Ok(())
    }

    /// Returns when the send completed.
    fn send(&mut self, value: u32) -> Result<Instant, PingPongError> {
        let region = self.region;
        match self.window {
            Some(window) => {
                if self.options.always_overwrite {
                    stamp_window(window, value);
                }
                region.copy_from_window(window);
            }
            None if self.options.always_overwrite => region.stamp(value),
            None => {}
        }
        std::sync::atomic::fence(Ordering::SeqCst);

        let key = region.key().ok_or_else(unregistered)?;
        self.endpoint
            .post_send(region.sge(), key, self.inline)
            .map_err(PingPongError::SendPost)?;
        let wc = self.wait_for_completion(PollTarget::Send)?;
        if !wc.is_valid() {
            return Err(PingPongError::SendCompletion(wc.to_string()));
        }
        let completed = Instant::now();
        self.endpoint
            .post_recv(region.sge(), key)
            .map_err(PingPongError::ReceivePost)?;
        Ok(completed)
    }

    /// Returns the first received byte and when the receive completed.
    fn receive(&mut self, value: u32) -> Result<(u8, Instant), PingPongError> {
        let region = self.region;
        if self.options.busy_wait {
            self.busy_wait(value)?;
        }
        let wc = self.wait_for_completion(PollTarget::Recv)?;
        if !wc.is_valid() {
            return Err(PingPongError::ReceiveCompletion(wc.to_string()));
        }
        let completed = Instant::now();
        if let Some(window) = self.window {
            region.copy_to_window(window);
        }
        Ok((region.first_byte().unwrap_or_default(), completed))
    }

    /// Spins until every buffer byte equals the pattern for `value`.
    fn busy_wait(&self, value: u32) -> Result<(), PingPongError> {
        let started = Instant::now();
        let mut spins = 0u32;
        while !self.region.holds(value) {
            if self.cancel.is_cancelled() {
                return Err(PingPongError::Cancelled("busy-wait"));
            }
            if started.elapsed() >= self.options.busy_wait_timeout {
                tracing::error!("buffer never held pattern {}", value);
                return Err(PingPongError::Timeout {
                    operation: "busy-wait",
                    after: self.options.busy_wait_timeout,
                });
            }
            spin(&mut spins);
        }
        Ok(())
    }

    /// Polls `target` until a completion arrives, the timeout expires or
    /// the session is cancelled.
    fn wait_for_completion(&mut self, target: PollTarget) -> Result<Completion, PingPongError> {
        let operation = match target {
            PollTarget::Send => "send completion",
            PollTarget::Recv => "receive completion",
        };
        let started = Instant::now();
        let mut spins = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PingPongError::Cancelled(operation));
            }
            match self.endpoint.poll(target) {
                Ok(Some(wc)) => {
                    tracing::debug!("{}: {}", operation, wc);
                    return Ok(wc);
                }
                Ok(None) => {
                    if started.elapsed() >= self.options.completion_timeout {
                        tracing::error!("timed out while waiting on {}", operation);
                        return Err(PingPongError::Timeout {
                            operation,
                            after: self.options.completion_timeout,
                        });
                    }
                    spin(&mut spins);
                }
                Err(e) => {
                    tracing::error!("polling {} failed: {}", operation, e);
                    return Err(match target {
                        PollTarget::Send => PingPongError::SendCompletion(e.to_string()),
                        PollTarget::Recv => PingPongError::ReceiveCompletion(e.to_string()),
                    });
                }
            }
        }
    }
}

fn spin(spins: &mut u32) {
    *spins = spins.wrapping_add(1);
    if *spins % SPINS_PER_YIELD == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU8;
    use std::thread;

    use super::*;
    use crate::connection::ConnectionManager;
    use crate::connection::EndpointState;
    use crate::connection::Initiator;
    use crate::connection::Responder;
    use crate::connection::Role;
    use crate::error::ExitStatus;
    use crate::loopback::LoopbackFabric;
    use crate::loopback::LoopbackKey;
    use crate::memory_region::RegionMode;
    use crate::transport::DEFAULT_MAX_INLINE_DATA;

    type Region = MemoryRegion<LoopbackKey>;

    fn caps(size: usize) -> QueueCapacity {
        QueueCapacity::for_chunk(size, DEFAULT_MAX_INLINE_DATA)
    }

    fn setup<R: Role>(
        fabric: LoopbackFabric,
        role: R,
        port: u16,
        size: usize,
    ) -> (ConnectionManager<LoopbackFabric, R>, Region) {
        let receives_first = role.receives_first();
        let mut region = Region::acquire(size, RegionMode::Owned, None).unwrap();
        let mut mgr = ConnectionManager::new(fabric, role, port, caps(size));
        mgr.connect(|ep| {
            prepare_endpoint(ep, &mut region, AccessFlags::LOCAL_WRITE, receives_first)
        })
        .unwrap();
        (mgr, region)
    }

    fn run_side<R: Role>(
        fabric: LoopbackFabric,
        role: R,
        port: u16,
        size: usize,
        iterations: usize,
        options: TransferOptions,
    ) -> Result<TransferSession, PingPongError> {
        let sends_first = !role.receives_first();
        let (mut mgr, region) = setup(fabric, role, port, size);
        let caps = *mgr.caps();
        let mut session = TransferSession::new(iterations);
        let endpoint = mgr.endpoint_mut().unwrap();
        TransferEngine::new(endpoint, &region, &caps, options, sends_first).run(&mut session)?;
        Ok(session)
    }

    #[test]
    fn test_session_pattern_start() {
        let session = TransferSession::new(4);
        assert_eq!((session.cval, session.sval), (1, 0));
        assert!(session.latencies.capacity() >= 8);
        assert!(!session.is_complete());
    }

    #[test]
    fn test_oversized_session_is_rejected_before_transfer() {
        let mut session = TransferSession::new(1 << 62);
        assert!(session.latencies.capacity() <= PREALLOCATED_HALVES);
        assert!(!session.is_complete());

        let fabric = LoopbackFabric::new();
        let info = crate::transport::Fabric::resolve(
            &fabric,
            &crate::transport::AddressHint::Active {
                host: "localhost",
                port: 1,
            },
        )
        .unwrap();
        let mut ep = crate::transport::Fabric::create_endpoint(&fabric, info, &caps(16)).unwrap();
        let region = Region::acquire(16, RegionMode::Owned, None).unwrap();
        let err = TransferEngine::new(&mut ep, &region, &caps(16), TransferOptions::default(), true)
            .run(&mut session)
            .unwrap_err();
        assert!(matches!(err, PingPongError::BadArgs(_)));
        assert!(session.start.is_none());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.flag().store(true, Ordering::SeqCst);
        assert!(clone.is_cancelled());
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_ping_pong_sixteen_by_sixteen() {
        let fabric = LoopbackFabric::new();
        let server_fabric = fabric.clone();
        let server = thread::spawn(move || {
            run_side(server_fabric, Responder, 10, 16, 16, TransferOptions::default())
        });
        let client = run_side(
            fabric,
            Initiator::new("localhost"),
            10,
            16,
            16,
            TransferOptions::default(),
        )
        .unwrap();
        let server = server.join().unwrap().unwrap();

        for session in [&client, &server] {
            assert!(session.is_complete());
            assert_eq!(session.latencies.len(), 32);
            assert_eq!((session.cval, session.sval), (33, 32));
            assert!(session.latencies.windows(2).all(|w| w[0] <= w[1]));
        }
        let odd: Vec<u8> = (0..16).map(|i| 2 * i + 1).collect();
        let even: Vec<u8> = (0..16).map(|i| 2 * i + 2).collect();
        assert_eq!(server.received, odd);
        assert_eq!(client.received, even);
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_busy_wait_detects_arrival() {
        let options = TransferOptions {
            busy_wait: true,
            ..TransferOptions::default()
        };
        let fabric = LoopbackFabric::new();
        let server_fabric = fabric.clone();
        let server =
            thread::spawn(move || run_side(server_fabric, Responder, 11, 64, 8, options));
        let client = run_side(fabric, Initiator::new("localhost"), 11, 64, 8, options).unwrap();
        let server = server.join().unwrap().unwrap();
        assert_eq!(client.latencies.len(), 16);
        assert_eq!(server.received.len(), 8);
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_silent_peer_times_out() {
        let options = TransferOptions {
            completion_timeout: Duration::from_millis(50),
            ..TransferOptions::default()
        };
        let fabric = LoopbackFabric::new();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let client_fabric = fabric.clone();
        let client = thread::spawn(move || {
            // Connects, then never sends.
            let _side = setup(client_fabric, Initiator::new("localhost"), 12, 16);
            done_rx.recv().ok();
        });

        let err = run_side(fabric, Responder, 12, 16, 1, options).unwrap_err();
        done_tx.send(()).unwrap();
        client.join().unwrap();
        assert!(matches!(
            err,
            PingPongError::Timeout {
                operation: "receive completion",
                ..
            }
        ));
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_busy_wait_without_overwrite_times_out() {
        let options = TransferOptions {
            busy_wait: true,
            always_overwrite: false,
            busy_wait_timeout: Duration::from_millis(50),
            ..TransferOptions::default()
        };
        let fabric = LoopbackFabric::new();
        let server_fabric = fabric.clone();
        let server =
            thread::spawn(move || run_side(server_fabric, Responder, 13, 16, 1, options));
        // The initiator sends its untouched zeroed buffer and then waits for a
        // reply that never comes.
        let client = run_side(
            fabric,
            Initiator::new("localhost"),
            13,
            16,
            1,
            TransferOptions {
                completion_timeout: Duration::from_millis(200),
                ..options
            },
        );
        let server = server.join().unwrap();
        assert!(matches!(
            server.unwrap_err(),
            PingPongError::Timeout {
                operation: "busy-wait",
                ..
            }
        ));
        assert!(client.is_err());
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_cancel_interrupts_wait() {
        let fabric = LoopbackFabric::new();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let client_fabric = fabric.clone();
        let client = thread::spawn(move || {
            let _side = setup(client_fabric, Initiator::new("localhost"), 14, 16);
            done_rx.recv().ok();
        });

        let (mut mgr, region) = setup(fabric, Responder, 14, 16);
        let caps = *mgr.caps();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut session = TransferSession::new(4);
        let err = TransferEngine::new(
            mgr.endpoint_mut().unwrap(),
            &region,
            &caps,
            TransferOptions::default(),
            false,
        )
        .with_cancel(cancel)
        .run(&mut session)
        .unwrap_err();
        done_tx.send(()).unwrap();
        client.join().unwrap();

        assert!(matches!(err, PingPongError::Cancelled("receive completion")));
        assert!(session.latencies.is_empty());
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_send_to_departed_peer_fails_completion() {
        let fabric = LoopbackFabric::new();
        let (left_tx, left_rx) = std::sync::mpsc::channel::<()>();
        let server_fabric = fabric.clone();
        let server = thread::spawn(move || {
            let (mut mgr, mut region) = setup(server_fabric, Responder, 16, 16);
            region.release();
            mgr.close();
            left_tx.send(()).unwrap();
        });

        let (mut mgr, mut region) = setup(fabric, Initiator::new("localhost"), 16, 16);
        left_rx.recv().unwrap();
        server.join().unwrap();
        let caps = *mgr.caps();
        let mut session = TransferSession::new(2);
        let err = TransferEngine::new(
            mgr.endpoint_mut().unwrap(),
            &region,
            &caps,
            TransferOptions::default(),
            true,
        )
        .run(&mut session)
        .unwrap_err();
        match &err {
            PingPongError::SendCompletion(wc) => assert!(wc.contains("status 12"), "{}", wc),
            other => panic!("unexpected error {}", other),
        }
        assert_eq!(err.exit_status(), ExitStatus::RunProblem);
        assert!(session.latencies.is_empty());

        region.release();
        mgr.close();
        assert!(region.is_released());
        assert!(region.key().is_none());
        assert_eq!(mgr.state(), EndpointState::Closed);
        assert!(mgr.endpoint_mut().is_none());
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_posts_on_disconnected_endpoint_fail() {
        let fabric = LoopbackFabric::new();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let server_fabric = fabric.clone();
        let server = thread::spawn(move || {
            let _side = setup(server_fabric, Responder, 17, 16);
            done_rx.recv().ok();
        });

        let (mut mgr, region) = setup(fabric, Initiator::new("localhost"), 17, 16);
        let caps = *mgr.caps();
        let endpoint = mgr.endpoint_mut().unwrap();
        endpoint.disconnect().unwrap();

        let mut session = TransferSession::new(1);
        let err = TransferEngine::new(endpoint, &region, &caps, TransferOptions::default(), true)
            .run(&mut session)
            .unwrap_err();
        assert!(matches!(err, PingPongError::SendPost(_)), "{}", err);
        assert_eq!(err.exit_status(), ExitStatus::RunProblem);

        let mut other = Region::acquire(16, RegionMode::Owned, None).unwrap();
        let err = prepare_endpoint(endpoint, &mut other, AccessFlags::LOCAL_WRITE, true)
            .unwrap_err();
        assert!(matches!(err, PingPongError::ReceivePost(_)), "{}", err);
        assert_eq!(err.exit_status(), ExitStatus::RunProblem);

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    /// A window that takes `delay` to hand out its mapping.
    #[derive(Debug)]
    struct SlowWindow {
        cells: Box<[AtomicU8]>,
        delay: Duration,
    }

    impl MappedWindow for SlowWindow {
        fn as_ptr(&self) -> *mut u8 {
            thread::sleep(self.delay);
            self.cells.as_ptr() as *mut u8
        }

        fn len(&self) -> usize {
            self.cells.len()
        }
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_receive_is_stamped_before_window_copy() {
        let delay = Duration::from_millis(50);
        let fabric = LoopbackFabric::new();
        let server_fabric = fabric.clone();
        let server = thread::spawn(move || {
            run_side(server_fabric, Responder, 15, 16, 1, TransferOptions::default())
        });

        let (mut mgr, region) = setup(fabric, Initiator::new("localhost"), 15, 16);
        let caps = *mgr.caps();
        let window = SlowWindow {
            cells: (0..16).map(|_| AtomicU8::new(0)).collect(),
            delay,
        };
        let mut session = TransferSession::new(1);
        TransferEngine::new(
            mgr.endpoint_mut().unwrap(),
            &region,
            &caps,
            TransferOptions::default(),
            true,
        )
        .with_window(&window)
        .run(&mut session)
        .unwrap();
        server.join().unwrap().unwrap();

        let (_, end) = session.span().unwrap();
        assert_eq!(session.latencies.len(), 2);
        assert!(end.duration_since(session.latencies[1]) >= delay);
        assert!(window.cells.iter().all(|c| c.load(Ordering::Relaxed) == 2));
    }

    #[test]
    fn test_inline_follows_negotiated_bound() {
        let fabric = LoopbackFabric::new();
        let info = crate::transport::Fabric::resolve(
            &fabric,
            &crate::transport::AddressHint::Active {
                host: "localhost",
                port: 1,
            },
        )
        .unwrap();
        let mut ep = crate::transport::Fabric::create_endpoint(&fabric, info, &caps(16)).unwrap();
        let small = Region::acquire(16, RegionMode::Owned, None).unwrap();
        let large = Region::acquire(4096, RegionMode::Owned, None).unwrap();
        let options = TransferOptions::default();
        assert!(TransferEngine::new(&mut ep, &small, &caps(16), options, true).is_inline());
        assert!(!TransferEngine::new(&mut ep, &large, &caps(4096), options, true).is_inline());
    }
}
