// Remapd Device Session
// One grabbed physical device with its engine and virtual output

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use evdev::{Device, InputEvent};

use crate::engine::RemapEngine;
use crate::mapping::MappingTable;
use crate::output::{MirroredCaps, UInputError, VirtualOutput};

/// Session-scoped errors. All are recoverable from the multiplexer's
/// viewpoint: the session is skipped or torn down, siblings are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no device group at index {0}")]
    UnknownGroup(usize),

    #[error("device unavailable at {path}: {source}")]
    DeviceUnavailable {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot grab {path}: {source}")]
    Grab {
        path: String,
        source: std::io::Error,
    },

    #[error("virtual device for {path}: {source}")]
    VirtualDevice { path: String, source: UInputError },

    #[error("read failed on {path}: {source}")]
    Disconnected {
        path: String,
        source: std::io::Error,
    },

    #[error("emit failed for {path}: {source}")]
    Emit { path: String, source: UInputError },
}

/// One exclusively grabbed physical device, its remap engine, and the
/// paired virtual output. The unit of failure and restart.
pub struct DeviceSession {
    group: usize,
    path: String,
    name: String,
    input: Device,
    engine: RemapEngine,
    output: VirtualOutput,
    grabbed: bool,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("group", &self.group)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("grabbed", &self.grabbed)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Establish a session: open the device, mirror its capabilities into
    /// a new virtual device, then grab exclusively.
    ///
    /// Construction is all-or-nothing. If the grab fails, the virtual
    /// device is dropped on the way out and nothing is leaked.
    pub fn establish(
        table: Arc<MappingTable>,
        group: usize,
        path: PathBuf,
    ) -> Result<Self, SessionError> {
        let group_config = table.group(group).ok_or(SessionError::UnknownGroup(group))?;

        let mut input =
            Device::open(&path).map_err(|source| SessionError::DeviceUnavailable {
                path: path.display().to_string(),
                source,
            })?;
        let path = path.display().to_string();
        let name = input.name().unwrap_or("Unknown").to_string();

        let caps = MirroredCaps::mirror(&input, group_config.synthesized_codes());
        let output = VirtualOutput::create(group_config.output_name(), &caps)
            .map_err(|source| SessionError::VirtualDevice {
                path: path.clone(),
                source,
            })?;

        // Clear any stale grab left by a crashed predecessor, then take
        // exclusive ownership of the event stream.
        let _ = input.ungrab();
        input.grab().map_err(|source| SessionError::Grab {
            path: path.clone(),
            source,
        })?;

        log::info!("registered: {name}, {path}");
        Ok(Self {
            group,
            path,
            name,
            input,
            engine: RemapEngine::new(table, group),
            output,
            grabbed: true,
        })
    }

    /// Index of the device group this session serves
    pub fn group(&self) -> usize {
        self.group
    }

    /// Device node path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Kernel-reported device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw fd for the multiplexer's readiness wait
    pub fn raw_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    /// Number of source codes the engine currently tracks as held
    pub fn held_count(&self) -> usize {
        self.engine.held_count()
    }

    /// Drain all pending events from the physical device, translating and
    /// emitting each. Errors signal the caller to tear this session down.
    pub fn service(&mut self) -> Result<(), SessionError> {
        let events: Vec<InputEvent> = self
            .input
            .fetch_events()
            .map_err(|source| SessionError::Disconnected {
                path: self.path.clone(),
                source,
            })?
            .collect();

        for event in events {
            let emission = self.engine.translate(event);
            if emission.is_empty() {
                continue;
            }
            self.output
                .emit(&emission)
                .map_err(|source| SessionError::Emit {
                    path: self.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Idempotent teardown: release still-held synthetic keys, then the
    /// grab. Both are best-effort; a vanished device cannot be ungrabbed.
    pub fn teardown(&mut self) {
        let release = self.engine.release_held();
        if !release.is_empty() {
            let _ = self.output.emit(&release);
        }
        if self.grabbed {
            let _ = self.input.ungrab();
            self.grabbed = false;
            log::info!("unregistered: {}, {}", self.name, self.path);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        // Runs on every exit path, including panic unwinding, so the grab
        // and the virtual device are never leaked.
        self.teardown();
    }
}
