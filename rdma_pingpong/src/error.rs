/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Failure taxonomy for a ping-pong session.
//!
//! Every setup or transfer step aborts the session on failure. Each variant
//! names the step that failed; transport-originated variants carry the
//! [`TransportError`] (primitive name plus OS error) as their source, so the
//! one-line diagnostic reads `"<step> failed: <primitive>: <cause>"`.

use std::fmt;
use std::time::Duration;

use crate::connection::EndpointState;
use crate::transport::TransportError;

/// Errors surfaced by a ping-pong session.
#[derive(thiserror::Error, Debug)]
pub enum PingPongError {
    #[error("invalid configuration: {0}")]
    BadArgs(String),

    #[error("no usable RDMA device found")]
    NoDevice,

    #[error("address resolution failed: {0}")]
    Resolution(#[source] TransportError),

    #[error("endpoint creation failed: {0}")]
    EndpointCreation(#[source] TransportError),

    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    #[error("accept failed: {0}")]
    Accept(#[source] TransportError),

    #[error("buffer allocation of {size} bytes failed")]
    Allocation { size: usize },

    #[error("mapping external window failed: {0}")]
    Mapping(#[source] std::io::Error),

    #[error("memory registration failed: {0}")]
    Registration(#[source] TransportError),

    #[error("posting send failed: {0}")]
    SendPost(#[source] TransportError),

    #[error("send completion failed: {0}")]
    SendCompletion(String),

    #[error("posting receive failed: {0}")]
    ReceivePost(#[source] TransportError),

    #[error("receive completion failed: {0}")]
    ReceiveCompletion(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("session cancelled while waiting on {0}")]
    Cancelled(&'static str),

    #[error("illegal endpoint transition {from:?} -> {to:?}")]
    InvalidState {
        from: EndpointState,
        to: EndpointState,
    },
}

impl PingPongError {
    /// The process exit status for this failure.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            PingPongError::BadArgs(_) => ExitStatus::BadArgs,
            PingPongError::NoDevice => ExitStatus::NoRdmaDevice,
            PingPongError::Resolution(_)
            | PingPongError::EndpointCreation(_)
            | PingPongError::Connect(_)
            | PingPongError::Accept(_) => ExitStatus::NoConnection,
            PingPongError::Allocation { .. } | PingPongError::Mapping(_) => ExitStatus::NoBuffer,
            PingPongError::Registration(_) => ExitStatus::NoMemoryRegion,
            PingPongError::SendPost(_)
            | PingPongError::SendCompletion(_)
            | PingPongError::ReceivePost(_)
            | PingPongError::ReceiveCompletion(_)
            | PingPongError::Timeout { .. }
            | PingPongError::Cancelled(_)
            | PingPongError::InvalidState { .. } => ExitStatus::RunProblem,
        }
    }
}

/// Process exit statuses. The numeric values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    NoRdmaDevice = 1,
    BadArgs = 2,
    NoBuffer = 4,
    NoMemoryRegion = 5,
    NoConnection = 6,
    RunProblem = 7,
}

impl ExitStatus {
    /// True for failures that happened before the transfer loop started.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            ExitStatus::NoRdmaDevice
                | ExitStatus::BadArgs
                | ExitStatus::NoBuffer
                | ExitStatus::NoMemoryRegion
                | ExitStatus::NoConnection
        )
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitStatus::Success => "SUCCESS",
            ExitStatus::NoRdmaDevice => "NO_RDMA_DEV",
            ExitStatus::BadArgs => "BAD_ARGS",
            ExitStatus::NoBuffer => "NO_BUFFER",
            ExitStatus::NoMemoryRegion => "NO_MR",
            ExitStatus::NoConnection => "NO_CONNECTION",
            ExitStatus::RunProblem => "RUN_PROBLEM",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}
