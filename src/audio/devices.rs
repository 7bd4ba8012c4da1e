use std::{sync::Arc, time::Duration};

use cpal::{
    traits::{DeviceTrait, HostTrait},
    Device,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
    time::interval,
};

/// Pseudo-id resolving to the host's default output device.
pub const DEFAULT_DEVICE_ID: &str = "default";

// ── OutputDevice info ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDevice {
    /// Stable handle passed back to `open`. cpal exposes no persistent ids,
    /// so this is the device name.
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Source of output devices. The engine only ever talks to this trait, so
/// tests and headless hosts can run without audio hardware.
pub trait DeviceEnumerator: Send + Sync {
    fn output_devices(&self) -> Vec<OutputDevice>;

    /// Open a device by id; [`DEFAULT_DEVICE_ID`] means the host default.
    fn open(&self, id: &str) -> Option<Device>;
}

/// Output devices of cpal's default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl DeviceEnumerator for CpalDevices {
    fn output_devices(&self) -> Vec<OutputDevice> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        host.output_devices()
            .map(|devs| {
                devs.filter_map(|d| {
                    d.name().ok().map(|name| {
                        let is_default = default_name.as_deref() == Some(name.as_str());
                        OutputDevice {
                            id: name.clone(),
                            name,
                            is_default,
                        }
                    })
                })
                .collect()
            })
            .unwrap_or_else(|e| {
                log::warn!("Cannot enumerate output devices: {e}");
                Vec::new()
            })
    }

    fn open(&self, id: &str) -> Option<Device> {
        let host = cpal::default_host();
        if id == DEFAULT_DEVICE_ID {
            return host.default_output_device();
        }
        host.output_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// First device whose name contains `pattern`, ignoring case.
pub fn find_by_name_substring<'a>(devices: &'a [OutputDevice], pattern: &str) -> Option<&'a OutputDevice> {
    let needle = pattern.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    devices
        .iter()
        .find(|d| d.name.to_lowercase().contains(&needle))
}

/// Virtual audio cable to inject into, trying `patterns` in order.
pub fn find_virtual_cable<'a, S: AsRef<str>>(
    devices: &'a [OutputDevice],
    patterns: &[S],
) -> Option<&'a OutputDevice> {
    patterns
        .iter()
        .find_map(|p| find_by_name_substring(devices, p.as_ref()))
}

// ── DeviceWatcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "devices", rename_all = "snake_case")]
pub enum DeviceEvent {
    DevicesChanged(Vec<OutputDevice>),
}

/// Whether two polls differ in membership, naming or default flag. Order is
/// ignored; hosts do not enumerate in a stable order.
pub fn device_list_changed(previous: &[OutputDevice], current: &[OutputDevice]) -> bool {
    if previous.len() != current.len() {
        return true;
    }
    current.iter().any(|d| !previous.contains(d))
}

/// Polls an enumerator and reports hot-plug changes. Polling stops when the
/// watcher is dropped.
pub struct DeviceWatcher {
    task: JoinHandle<()>,
}

impl DeviceWatcher {
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        devices: Arc<dyn DeviceEnumerator>,
        period: Duration,
    ) -> (Self, UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut known = devices.output_devices();
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;

                let current = devices.output_devices();
                if device_list_changed(&known, &current) {
                    log::info!("Output devices changed ({} present)", current.len());
                    if tx.send(DeviceEvent::DevicesChanged(current.clone())).is_err() {
                        break;
                    }
                    known = current;
                }
            }
        });
        (Self { task }, rx)
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
