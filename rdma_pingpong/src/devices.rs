/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local RDMA device discovery.

use std::ffi::CStr;
use std::fmt;

use crate::error::PingPongError;

/// An RDMA device and its ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaDevice {
    /// `name` - The name of the RDMA device (e.g., "mlx5_0").
    pub name: String,
    /// `node_guid` - Node GUID in host byte order.
    pub node_guid: u64,
    /// `fw_ver` - Firmware version of the device.
    pub fw_ver: String,
    /// `ports` - Ports that could be queried.
    pub ports: Vec<RdmaPort>,
}

impl RdmaDevice {
    /// A device is usable when at least one of its ports is active.
    pub fn is_usable(&self) -> bool {
        self.ports.iter().any(|p| p.active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaPort {
    pub port_num: u8,
    pub state: String,
    pub active: bool,
    pub link_layer: String,
}

impl fmt::Display for RdmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "\tNode GUID: 0x{:016x}", self.node_guid)?;
        writeln!(f, "\tFirmware version: {}", self.fw_ver)?;
        writeln!(f, "\tNumber of ports: {}", self.ports.len())?;
        for port in &self.ports {
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

impl fmt::Display for RdmaPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tPort {}:", self.port_num)?;
        writeln!(f, "\t\tState: {}", self.state)?;
        writeln!(f, "\t\tLink layer: {}", self.link_layer)
    }
}

fn link_layer_str(link_layer: u8) -> String {
    match link_layer {
        1 => "InfiniBand".to_string(),
        2 => "Ethernet".to_string(),
        _ => "Unknown".to_string(),
    }
}

fn port_state_str(state: rdmacm_sys::ibv_port_state::Type) -> String {
    // SAFETY: returns a pointer to a static string.
    unsafe {
        let c_str = rdmacm_sys::ibv_port_state_str(state);
        if c_str.is_null() {
            return "Unknown".to_string();
        }
        CStr::from_ptr(c_str).to_string_lossy().into_owned()
    }
}

/// Lists every RDMA device on this host.
pub fn get_all_devices() -> Vec<RdmaDevice> {
    let mut devices = Vec::new();

    // SAFETY: We are calling several C functions from libibverbs.
    unsafe {
        let mut num_devices = 0;
        let device_list = rdmacm_sys::ibv_get_device_list(&mut num_devices);
        if device_list.is_null() {
            tracing::debug!(
                "ibv_get_device_list failed: {}",
                std::io::Error::last_os_error()
            );
            return devices;
        }

        for i in 0..num_devices.max(0) as usize {
            let device = *device_list.add(i);
            if device.is_null() {
                continue;
            }
            let name = CStr::from_ptr(rdmacm_sys::ibv_get_device_name(device))
                .to_string_lossy()
                .into_owned();
            let node_guid = u64::from_be(rdmacm_sys::ibv_get_device_guid(device));

            let context = rdmacm_sys::ibv_open_device(device);
            if context.is_null() {
                devices.push(RdmaDevice {
                    name,
                    node_guid,
                    fw_ver: String::new(),
                    ports: Vec::new(),
                });
                continue;
            }

            let mut device_attr = rdmacm_sys::ibv_device_attr::default();
            let mut rdma_device = RdmaDevice {
                name,
                node_guid,
                fw_ver: String::new(),
                ports: Vec::new(),
            };
            if rdmacm_sys::ibv_query_device(context, &mut device_attr) == 0 {
                rdma_device.fw_ver = CStr::from_ptr(device_attr.fw_ver.as_ptr())
                    .to_string_lossy()
                    .into_owned();
                for port_num in 1..=device_attr.phys_port_cnt {
                    let mut port_attr = rdmacm_sys::ibv_port_attr::default();
                    if rdmacm_sys::rdmacm_query_port(context, port_num, &mut port_attr) != 0 {
                        continue;
                    }
                    rdma_device.ports.push(RdmaPort {
                        port_num,
                        state: port_state_str(port_attr.state),
                        active: port_attr.state == rdmacm_sys::ibv_port_state::IBV_PORT_ACTIVE,
                        link_layer: link_layer_str(port_attr.link_layer),
                    });
                }
            }
            rdmacm_sys::ibv_close_device(context);
            devices.push(rdma_device);
        }

        rdmacm_sys::ibv_free_device_list(device_list);
    }

    devices
}

/// The first device with an active port.
pub fn first_usable_device() -> Result<RdmaDevice, PingPongError> {
    get_all_devices()
        .into_iter()
        .find(RdmaDevice::is_usable)
        .ok_or(PingPongError::NoDevice)
}
