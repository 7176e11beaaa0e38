//! Snapshot of host audio APIs and their devices, plus device selection.
//!
//! A catalog is taken fresh from the driver each time a stream is opened;
//! descriptors carry no identity across driver restarts.

use std::fmt;

use super::error::{AudioError, Result};

/// Name fragments that identify virtual loopback devices.
pub const LOOPBACK_MARKERS: &[&str] = &[
    "BlackHole",
    "Loopback",
    "Monitor of",
    ".monitor",
    "Stereo Mix",
];

/// Stream direction a device must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// How a label is matched against the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Exact name, then substring, then the host default.
    Direct,
    /// Any loopback-marker device first, then as `Direct`.
    Loopback,
}

/// One device as reported by the driver at enumeration time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub host_api: String,
    pub name: String,
    /// Position within its host API's device list.
    pub index: usize,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub default_sample_rate: u32,
}

impl DeviceDescriptor {
    pub fn supports(&self, direction: Direction) -> bool {
        self.channels(direction) > 0
    }

    pub fn channels(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Input => self.max_input_channels,
            Direction::Output => self.max_output_channels,
        }
    }

    pub fn is_loopback(&self) -> bool {
        LOOPBACK_MARKERS.iter().any(|m| self.name.contains(m))
    }
}

/// A host audio API (ALSA, CoreAudio, WASAPI, ...) and its devices.
#[derive(Debug, Clone, Default)]
pub struct HostApi {
    pub name: String,
    pub devices: Vec<DeviceDescriptor>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

impl HostApi {
    fn default_device(&self, direction: Direction) -> Option<&DeviceDescriptor> {
        let name = match direction {
            Direction::Input => self.default_input.as_deref()?,
            Direction::Output => self.default_output.as_deref()?,
        };
        self.devices
            .iter()
            .find(|d| d.name == name && d.supports(direction))
    }
}

/// Ordered enumeration result.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    pub apis: Vec<HostApi>,
    /// Name of the host API the platform treats as default.
    pub default_host: Option<String>,
}

impl DeviceCatalog {
    pub fn new(apis: Vec<HostApi>, default_host: Option<String>) -> Self {
        Self { apis, default_host }
    }

    /// All devices in enumeration order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.apis.iter().flat_map(|api| api.devices.iter())
    }

    /// Pick a device for `label` in strict precedence order:
    /// loopback marker (loopback policy only), exact name, substring,
    /// host default. Only devices with channels in `direction` qualify.
    pub fn select(
        &self,
        label: &str,
        policy: SelectionPolicy,
        direction: Direction,
    ) -> Result<DeviceDescriptor> {
        // 1. 回环设备优先（仅回环策略）
        if policy == SelectionPolicy::Loopback {
            if let Some(dev) = self
                .devices()
                .find(|d| d.supports(direction) && d.is_loopback())
            {
                log::info!("Selected loopback device '{}' ({})", dev.name, dev.host_api);
                return Ok(dev.clone());
            }
        }

        // 2. 精确匹配，其次子串匹配
        if !label.is_empty() {
            if let Some(dev) = self
                .devices()
                .find(|d| d.supports(direction) && d.name == label)
            {
                return Ok(dev.clone());
            }
            if let Some(dev) = self
                .devices()
                .find(|d| d.supports(direction) && d.name.contains(label))
            {
                log::info!("Found partial match device: {}", dev.name);
                return Ok(dev.clone());
            }
        }

        // 3. 回落到主机默认设备
        if let Some(dev) = self.default_device(direction) {
            if !label.is_empty() {
                log::warn!(
                    "No {} device matches '{}', falling back to default '{}'",
                    direction,
                    label,
                    dev.name
                );
            }
            return Ok(dev.clone());
        }

        Err(AudioError::not_found(label, direction))
    }

    fn default_device(&self, direction: Direction) -> Option<&DeviceDescriptor> {
        let preferred = self
            .default_host
            .as_deref()
            .and_then(|name| self.apis.iter().find(|api| api.name == name));

        preferred
            .into_iter()
            .chain(self.apis.iter())
            .find_map(|api| api.default_device(direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, inputs: u16, outputs: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            host_api: "ALSA".into(),
            name: name.into(),
            index: 0,
            max_input_channels: inputs,
            max_output_channels: outputs,
            default_sample_rate: 48000,
        }
    }

    fn catalog(devices: Vec<DeviceDescriptor>, default_input: Option<&str>) -> DeviceCatalog {
        let devices = devices
            .into_iter()
            .enumerate()
            .map(|(index, d)| DeviceDescriptor { index, ..d })
            .collect();
        DeviceCatalog::new(
            vec![HostApi {
                name: "ALSA".into(),
                devices,
                default_input: default_input.map(String::from),
                default_output: None,
            }],
            Some("ALSA".into()),
        )
    }

    #[test]
    fn direct_prefers_exact_over_substring() {
        let cat = catalog(
            vec![
                device("USB Mic Pro", 1, 0),
                device("USB Mic", 1, 0),
                device("BlackHole 2ch", 2, 2),
            ],
            None,
        );
        let dev = cat.select("USB Mic", SelectionPolicy::Direct, Direction::Input).unwrap();
        assert_eq!(dev.name, "USB Mic");
    }

    #[test]
    fn loopback_marker_beats_exact_match() {
        let cat = catalog(
            vec![
                device("USB Mic", 1, 0),
                device("USB Mic Pro", 1, 0),
                device("BlackHole 2ch", 2, 2),
            ],
            None,
        );
        let dev = cat
            .select("USB Mic", SelectionPolicy::Loopback, Direction::Input)
            .unwrap();
        assert_eq!(dev.name, "BlackHole 2ch");
    }

    #[test]
    fn substring_is_case_sensitive_and_first_wins() {
        let cat = catalog(
            vec![
                device("built-in microphone", 1, 0),
                device("External Microphone", 1, 0),
                device("Microphone Array", 2, 0),
            ],
            None,
        );
        let dev = cat
            .select("Microphone", SelectionPolicy::Direct, Direction::Input)
            .unwrap();
        assert_eq!(dev.name, "External Microphone");
    }

    #[test]
    fn capability_filters_candidates() {
        let cat = catalog(vec![device("Speakers", 0, 2), device("Speakers Mic", 1, 0)], None);
        let dev = cat
            .select("Speakers", SelectionPolicy::Direct, Direction::Input)
            .unwrap();
        assert_eq!(dev.name, "Speakers Mic");
    }

    #[test]
    fn empty_label_uses_default() {
        let cat = catalog(
            vec![device("hw:0", 2, 0), device("default", 2, 2)],
            Some("default"),
        );
        let dev = cat.select("", SelectionPolicy::Direct, Direction::Input).unwrap();
        assert_eq!(dev.name, "default");
    }

    #[test]
    fn unmatched_label_falls_back_to_default() {
        let cat = catalog(vec![device("pulse", 2, 2)], Some("pulse"));
        let dev = cat
            .select("Nonexistent", SelectionPolicy::Direct, Direction::Input)
            .unwrap();
        assert_eq!(dev.name, "pulse");
    }

    #[test]
    fn no_capable_device_is_not_found() {
        let cat = catalog(vec![device("Speakers", 0, 2)], None);
        let err = cat
            .select("Speakers", SelectionPolicy::Direct, Direction::Input)
            .unwrap_err();
        assert!(matches!(
            err,
            AudioError::DeviceNotFound { direction: Direction::Input, .. }
        ));
    }

    #[test]
    fn loopback_marker_needs_capability() {
        let cat = catalog(
            vec![device("Monitor of Speakers", 0, 2), device("Mic", 1, 0)],
            None,
        );
        let dev = cat.select("Mic", SelectionPolicy::Loopback, Direction::Input).unwrap();
        assert_eq!(dev.name, "Mic");
    }

    #[test]
    fn default_host_is_searched_first() {
        let mut cat = catalog(vec![device("default", 2, 0)], Some("default"));
        cat.apis.insert(
            0,
            HostApi {
                name: "JACK".into(),
                devices: vec![device("system", 2, 0)],
                default_input: Some("system".into()),
                default_output: None,
            },
        );
        let dev = cat.select("", SelectionPolicy::Direct, Direction::Input).unwrap();
        assert_eq!(dev.name, "default");
    }
}
