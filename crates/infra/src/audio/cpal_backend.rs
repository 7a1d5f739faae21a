//! CPAL output device discovery
//!
//! Devices are identified by their CPAL name, which is stable enough across
//! runs to be stored in the config file.

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info, warn};

use ballad_core::domain::audio::{
    AudioEnumerator, AudioError, ChannelCount, DeviceId, DeviceInfo, DeviceType, Result, SampleRate,
};

/// Display name of a CPAL device
pub(crate) fn device_name(device: &cpal::Device) -> String {
    #[allow(deprecated)]
    let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
    name
}

/// Output devices offering at least one input configuration are duplex
///
/// Output-only devices may still answer the input query with an empty list.
fn device_type_from_inputs<I: Iterator, E>(input_configs: std::result::Result<I, E>) -> DeviceType {
    match input_configs {
        Ok(mut configs) => {
            if configs.next().is_some() {
                DeviceType::Duplex
            } else {
                DeviceType::Output
            }
        }
        Err(_) => DeviceType::Output,
    }
}

/// Describe an output device from its default configuration
fn describe(device: &cpal::Device) -> DeviceInfo {
    let name = device_name(device);
    let default_config = device.default_output_config().ok();

    let device_type = device_type_from_inputs(device.supported_input_configs());

    DeviceInfo {
        id: DeviceId::new(name.clone()),
        name,
        device_type,
        default_sample_rate: default_config
            .as_ref()
            .map(|config| SampleRate::from_hz(config.sample_rate())),
        default_channels: default_config
            .as_ref()
            .map(|config| ChannelCount::from_count(config.channels())),
    }
}

/// Output device enumerator over the default CPAL host
pub struct CpalEnumerator {
    host: cpal::Host,
}

impl Default for CpalEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalEnumerator {
    pub fn new() -> Self {
        let host = cpal::default_host();
        info!("Using audio host: {:?}", host.id());
        Self { host }
    }

    pub fn host(&self) -> &cpal::Host {
        &self.host
    }

    /// Resolve an output device; an empty id selects the host default
    pub fn find_output(&self, id: &str) -> Result<cpal::Device> {
        if id.is_empty() {
            return self
                .host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
        }

        self.host
            .output_devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?
            .find(|d| device_name(d) == id)
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
    }
}

impl AudioEnumerator for CpalEnumerator {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self
            .host
            .output_devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        let mut found = Vec::new();
        for device in devices {
            if device.default_output_config().is_err() {
                warn!(device = %device_name(&device), "Skipping output device without a default config");
                continue;
            }
            let info = describe(&device);
            debug!(device = %info.name, "Found output device");
            found.push(info);
        }

        info!("Found {} output devices", found.len());
        Ok(found)
    }

    fn default_output_device(&self) -> Result<DeviceInfo> {
        self.find_output("").map(|device| describe(&device))
    }
}

impl std::fmt::Debug for CpalEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalEnumerator")
            .field("host", &self.host.id())
            .finish()
    }
}
