/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use proc_macro::TokenStream;
use quote::quote;
use syn::Expr;
use syn::ItemFn;
use syn::Lit;
use syn::MetaNameValue;
use syn::parse_macro_input;

/// A test macro for blocking tests that adds a configurable timeout.
///
/// The test body runs on its own thread; the harness thread waits for it
/// with `recv_timeout` and panics once the budget is spent, so a wait that
/// never returns fails the test instead of hanging the suite.
///
/// # Examples
///
/// ```rust
/// # use timed_test::timed_test;
/// #[timed_test(timeout_secs = 5)]
/// fn my_test() {
///     // Test that should complete within 5 seconds
///     std::thread::sleep(std::time::Duration::from_secs(2));
/// }
/// ```
#[proc_macro_attribute]
pub fn timed_test(attr: TokenStream, input: TokenStream) -> TokenStream {
    let attr = parse_macro_input!(attr as MetaNameValue);
    let input_fn = parse_macro_input!(input as ItemFn);

    if !attr.path.is_ident("timeout_secs") {
        return TokenStream::from(
            syn::Error::new_spanned(attr.path, "only timeout_secs allowed as argument")
                .to_compile_error(),
        );
    }
    let timeout_secs = match attr.value {
        Expr::Lit(ref lit) => match &lit.lit {
            Lit::Int(val) => match val.base10_parse::<u64>() {
                Ok(secs) => secs,
                Err(err) => return TokenStream::from(err.to_compile_error()),
            },
            _ => {
                return TokenStream::from(
                    syn::Error::new_spanned(
                        attr.value,
                        "unexpected value for timeout_secs, please pass an integer literal",
                    )
                    .to_compile_error(),
                );
            }
        },
        _ => {
            return TokenStream::from(
                syn::Error::new_spanned(
                    attr.value,
                    "unexpected value for timeout_secs, please pass an integer literal",
                )
                .to_compile_error(),
            );
        }
    };

    let fn_block = &input_fn.block;
    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let sig = &input_fn.sig;
    let fn_name = &sig.ident;
    let output = &sig.output;

    if sig.asyncness.is_some() {
        return TokenStream::from(
            syn::Error::new_spanned(sig, "timed_test expects a blocking (non-async) test function")
                .to_compile_error(),
        );
    }
    if !sig.inputs.is_empty() {
        return TokenStream::from(
            syn::Error::new_spanned(&sig.inputs, "test function must not take arguments")
                .to_compile_error(),
        );
    }

    let output = quote! {
        #[test]
        #(#fn_attrs)*
        #fn_vis fn #fn_name() #output {
            use std::sync::mpsc::{channel, RecvTimeoutError};
            use std::thread;
            use std::time::Duration;

            let (result_tx, result_rx) = channel();

            // Run the body on a separate thread so the timeout below fires
            // even when the body is stuck in a blocking wait.
            thread::Builder::new()
                .name(stringify!(#fn_name).to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                        move || #output #fn_block,
                    ));
                    let _ = result_tx.send(result);
                })
                .expect("failed to spawn test thread");

            match result_rx.recv_timeout(Duration::from_secs(#timeout_secs)) {
                Ok(result) => match result {
                    Ok(test_result) => test_result,
                    Err(panic) => std::panic::resume_unwind(panic),
                },
                Err(RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {} seconds", #timeout_secs);
                },
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("test thread panicked without sending result");
                }
            }
        }
    };

    output.into()
}
