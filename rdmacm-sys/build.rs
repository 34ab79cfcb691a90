/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::env;
use std::path::PathBuf;

fn main() {
    // Tell cargo to look for shared libraries in the specified directory
    println!("cargo:rustc-link-search=/usr/lib");
    println!("cargo:rustc-link-search=/usr/lib64");

    // Link against the connection manager and verbs libraries
    println!("cargo:rustc-link-lib=rdmacm");
    println!("cargo:rustc-link-lib=ibverbs");

    // Tell cargo to invalidate the built crate whenever the wrapper or shim changes
    println!("cargo:rerun-if-changed=src/wrapper.h");
    println!("cargo:rerun-if-changed=src/rdmacm_shim.c");

    // The data-path helpers are static inline in the rdma-core headers,
    // so compile a shim that gives them linkable symbols.
    cc::Build::new()
        .file("src/rdmacm_shim.c")
        .include("src")
        .warnings(true)
        .compile("rdmacm_shim");

    let bindings = bindgen::Builder::default()
        .header("src/wrapper.h")
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        // Allow the specified functions, types, and variables
        .allowlist_function("rdma_.*")
        .allowlist_function("rdmacm_.*")
        .allowlist_function("ibv_get_device_list")
        .allowlist_function("ibv_free_device_list")
        .allowlist_function("ibv_get_device_name")
        .allowlist_function("ibv_get_device_guid")
        .allowlist_function("ibv_open_device")
        .allowlist_function("ibv_close_device")
        .allowlist_function("ibv_query_device")
        .allowlist_function("ibv_port_state_str")
        .allowlist_function("ibv_dereg_mr")
        .allowlist_function("ibv_wc_status_str")
        .allowlist_type("rdma_.*")
        .allowlist_type("ibv_.*")
        .allowlist_var("RAI_.*")
        .allowlist_var("IBV_.*")
        // Apply the same enum treatment as the verbs bindings
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_send_flags")
        .constified_enum_module("ibv_port_state")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("rdma_port_space")
        .derive_default(true)
        .prepend_enum_name(false)
        .generate()
        .expect("Unable to generate bindings");

    // Write the bindings to the $OUT_DIR/bindings.rs file
    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");

    println!("cargo:rustc-cfg=cargo");
    println!("cargo:rustc-check-cfg=cfg(cargo)");
}
