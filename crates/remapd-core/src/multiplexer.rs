// Remapd Multiplexer
// Single-threaded readiness loop over sessions and the hotplug monitor

use std::collections::HashSet;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::discovery;
use crate::mapping::MappingTable;
use crate::session::DeviceSession;

/// Poll timeout. Doubles as the fallback rediscovery tick, so a missed
/// uevent cannot strand a configured device.
const POLL_TIMEOUT_MS: i32 = 1000;

/// Errors that terminate the multiplexer. Session failures never do;
/// they tear down a single session and the loop continues.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level event loop: owns all device sessions, waits for readiness
/// across their fds plus the udev hotplug monitor, and dispatches reads.
///
/// Single logical thread of control. Translation runs to completion
/// between readiness waits, so per-device event ordering is strict
/// without any locking.
pub struct Multiplexer {
    table: Arc<MappingTable>,
    sessions: Vec<DeviceSession>,
    monitor: udev::MonitorSocket,
    running: Arc<AtomicBool>,
}

impl Multiplexer {
    /// Create the multiplexer and its udev hotplug monitor
    pub fn new(
        table: Arc<MappingTable>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, MultiplexerError> {
        let monitor = udev::MonitorBuilder::new()?
            .match_subsystem("input")?
            .listen()?;

        // The monitor fd is read inside the poll loop; it must not block.
        unsafe {
            let fd = monitor.as_raw_fd();
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        Ok(Self {
            table,
            sessions: Vec::new(),
            monitor,
            running,
        })
    }

    /// Number of active sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run until the shutdown flag clears, then tear down every session
    pub fn run(&mut self) -> Result<(), MultiplexerError> {
        self.rediscover();
        if self.sessions.is_empty() {
            log::info!("no configured devices detected at startup, waiting for hotplug");
        }

        while self.running.load(Ordering::SeqCst) {
            let mut fds = self.poll_fds();
            let rc = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };

            if rc < 0 {
                let err = std::io::Error::last_os_error();
                // EINTR just means a signal arrived; the loop condition
                // picks up the shutdown flag.
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                self.shutdown();
                return Err(MultiplexerError::Io(err));
            }

            // Service every readable session, collecting failures for
            // teardown. A failed read on one session leaves siblings alone.
            let mut failed = Vec::new();
            for (i, fd) in fds.iter().take(self.sessions.len()).enumerate() {
                if fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                    continue;
                }
                if let Err(e) = self.sessions[i].service() {
                    log::warn!("session failed: {e}");
                    failed.push(i);
                }
            }
            for i in failed.into_iter().rev() {
                let mut session = self.sessions.swap_remove(i);
                session.teardown();
            }

            let hotplugged = self.drain_monitor(&fds);
            if hotplugged || rc == 0 {
                self.rediscover();
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Readiness set: one entry per session, the monitor fd last
    fn poll_fds(&self) -> Vec<libc::pollfd> {
        self.sessions
            .iter()
            .map(DeviceSession::raw_fd)
            .chain(std::iter::once(self.monitor.as_raw_fd()))
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect()
    }

    /// Drain queued uevents; true if any input device was added
    fn drain_monitor(&mut self, fds: &[libc::pollfd]) -> bool {
        let monitor_slot = &fds[fds.len() - 1];
        if monitor_slot.revents & libc::POLLIN == 0 {
            return false;
        }

        let mut added = false;
        for event in self.monitor.iter() {
            if event.event_type() != udev::EventType::Add {
                continue;
            }
            if let Some(devnode) = event.devnode() {
                let path = devnode.to_string_lossy();
                if path.contains("/dev/input/event") {
                    log::debug!("hotplug add: {path}");
                    added = true;
                }
            }
        }
        added
    }

    /// Attempt session creation for every configured group without an
    /// active session. This is the sole retry path for devices that were
    /// missing, failed to grab, or were re-plugged.
    fn rediscover(&mut self) {
        let claimed: HashSet<String> = self
            .sessions
            .iter()
            .map(|s| s.path().to_string())
            .collect();
        let active: HashSet<usize> = self.sessions.iter().map(DeviceSession::group).collect();

        for (index, group) in self.table.groups().iter().enumerate() {
            if active.contains(&index) {
                continue;
            }
            let Some(path) = discovery::find_match(group.selector(), &claimed) else {
                continue;
            };
            match DeviceSession::establish(self.table.clone(), index, path) {
                Ok(session) => self.sessions.push(session),
                Err(e) => log::warn!("session not created for group {index}: {e}"),
            }
        }
    }

    /// Tear down every session so grabs and virtual devices are released
    /// before the process exits
    fn shutdown(&mut self) {
        for mut session in self.sessions.drain(..) {
            session.teardown();
        }
    }
}
