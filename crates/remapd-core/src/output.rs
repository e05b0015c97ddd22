// Remapd Virtual Output Device
// Capability mirroring and uinput device emission

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AttributeSet, Device, InputEvent, Key, RelativeAxisType, SwitchType, UinputAbsSetup,
};

/// Error types for uinput operations
#[derive(Debug, thiserror::Error)]
pub enum UInputError {
    #[error("failed to create virtual device: {0}")]
    DeviceCreation(String),

    #[error("failed to write event: {0}")]
    WriteError(String),
}

/// Capability sets a virtual device must advertise to stand in for a
/// physical device: everything the physical device declares, plus every
/// output code the group's remap rules can synthesize.
pub struct MirroredCaps {
    keys: AttributeSet<Key>,
    relative_axes: AttributeSet<RelativeAxisType>,
    absolute_axes: Vec<UinputAbsSetup>,
    switches: AttributeSet<SwitchType>,
}

impl MirroredCaps {
    /// Mirror a physical device's capabilities, extended with `extra_keys`
    pub fn mirror(device: &Device, extra_keys: impl IntoIterator<Item = Key>) -> Self {
        let mut keys = AttributeSet::new();
        if let Some(supported) = device.supported_keys() {
            for key in supported.iter() {
                keys.insert(key);
            }
        }
        for key in extra_keys {
            keys.insert(key);
        }

        let mut relative_axes = AttributeSet::new();
        if let Some(axes) = device.supported_relative_axes() {
            for axis in axes.iter() {
                relative_axes.insert(axis);
            }
        }

        // Absolute axes carry per-axis range metadata that must be copied
        // verbatim, or tablet coordinates come out scaled wrong.
        let mut absolute_axes = Vec::new();
        if let Some(axes) = device.supported_absolute_axes() {
            if let Ok(state) = device.get_abs_state() {
                for axis in axes.iter() {
                    let info = state[axis.0 as usize];
                    absolute_axes.push(UinputAbsSetup::new(
                        axis,
                        AbsInfo::new(
                            info.value,
                            info.minimum,
                            info.maximum,
                            info.fuzz,
                            info.flat,
                            info.resolution,
                        ),
                    ));
                }
            }
        }

        let mut switches = AttributeSet::new();
        if let Some(supported) = device.supported_switches() {
            for switch in supported.iter() {
                switches.insert(switch);
            }
        }

        Self {
            keys,
            relative_axes,
            absolute_axes,
            switches,
        }
    }

    /// Whether a key code will be advertised
    pub fn supports_key(&self, key: Key) -> bool {
        self.keys.contains(key)
    }

    /// Number of advertised key codes
    pub fn key_count(&self) -> usize {
        self.keys.iter().count()
    }

    #[cfg(test)]
    fn empty() -> Self {
        Self {
            keys: AttributeSet::new(),
            relative_axes: AttributeSet::new(),
            absolute_axes: Vec::new(),
            switches: AttributeSet::new(),
        }
    }

    #[cfg(test)]
    fn with_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        let mut caps = Self::empty();
        for key in keys {
            caps.keys.insert(key);
        }
        caps
    }
}

/// Kernel-visible synthetic input device paired with one grabbed
/// physical device. Dropping it releases the device node.
pub struct VirtualOutput {
    device: VirtualDevice,
}

impl VirtualOutput {
    /// Create a uinput device advertising the mirrored capabilities
    pub fn create(name: &str, caps: &MirroredCaps) -> Result<Self, UInputError> {
        let mut builder = VirtualDeviceBuilder::new()
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?
            .name(name)
            .with_keys(&caps.keys)
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?
            .with_relative_axes(&caps.relative_axes)
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?
            .with_switches(&caps.switches)
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?;

        for setup in &caps.absolute_axes {
            builder = builder
                .with_absolute_axis(setup)
                .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?;
        }

        let device = builder
            .build()
            .map_err(|e: std::io::Error| UInputError::DeviceCreation(e.to_string()))?;

        log::debug!("virtual device '{name}' created");
        Ok(Self { device })
    }

    /// Write a batch of events. SYN markers are part of the batch; the
    /// engine appends them, this wrapper adds nothing.
    pub fn emit(&mut self, events: &[InputEvent]) -> Result<(), UInputError> {
        self.device
            .emit(events)
            .map_err(|e: std::io::Error| UInputError::WriteError(e.to_string()))
    }
}
