/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

// sections of code adapted from https://github.com/jonhoo/rust-ibverbs
// Copyright (c) 2016 Jon Gjengset under MIT License (MIT)

//! Raw bindings to `librdmacm` and the subset of `libibverbs` used by the
//! ping-pong engine.
//!
//! The connection-manager entry points (`rdma_getaddrinfo`,
//! `rdma_create_ep`, `rdma_listen`, ...) are generated by bindgen from the
//! system headers. The data-path helpers that rdma-core only provides as
//! `static inline` functions are re-exported by a small C shim under the
//! `rdmacm_` prefix.

mod inner {
    #![allow(non_upper_case_globals)]
    #![allow(non_camel_case_types)]
    #![allow(non_snake_case)]
    #![allow(unused_attributes)]
    #![allow(dead_code)]
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

    #[allow(clippy::len_without_is_empty)]
    impl ibv_wc {
        /// Returns the 64 bit value that was associated with the corresponding Work Request.
        pub fn wr_id(&self) -> u64 {
            self.wr_id
        }

        /// Returns the number of bytes transferred.
        pub fn len(&self) -> usize {
            self.byte_len as usize
        }

        /// Check if this work request completed successfully.
        ///
        /// A successful work completion (`IBV_WC_SUCCESS`) means that the corresponding Work Request
        /// (and all of the unsignaled Work Requests that were posted previous to it) ended, and the
        /// memory buffers that this Work Request refers to are ready to be (re)used.
        pub fn is_valid(&self) -> bool {
            self.status == ibv_wc_status::IBV_WC_SUCCESS
        }

        /// Returns the work completion status and vendor error syndrome (`vendor_err`) if the work
        /// request did not complete successfully.
        ///
        /// The statuses seen most often by a ping-pong over RC are
        /// `IBV_WC_RETRY_EXC_ERR` (the peer stopped acknowledging),
        /// `IBV_WC_RNR_RETRY_EXC_ERR` (the peer never posted a receive) and
        /// `IBV_WC_WR_FLUSH_ERR` (the QP moved to the error state, usually
        /// during teardown).
        pub fn error(&self) -> Option<(ibv_wc_status::Type, u32)> {
            match self.status {
                ibv_wc_status::IBV_WC_SUCCESS => None,
                status => Some((status, self.vendor_err)),
            }
        }
    }
}

pub use inner::*;
