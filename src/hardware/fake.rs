use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::{EdgeCallback, Hardware, HardwareError};

// In-memory hardware used with --disable-hw and by tests
#[derive(Default)]
struct FakeState {
    channels: HashMap<u8, bool>,
    failing_channels: HashSet<u8>,
    failing_lines: HashSet<u8>,
    lines: HashMap<u8, bool>,
    writes: Vec<(u8, bool)>,
    callbacks: HashMap<u8, EdgeCallback>,
    watched_order: Vec<u8>,
    next_emulated: usize,
}

pub struct FakeHardware {
    state: Mutex<FakeState>,
    output_log: Option<PathBuf>,
}

impl std::fmt::Debug for FakeHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHardware")
            .field("output_log", &self.output_log)
            .finish_non_exhaustive()
    }
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            output_log: None,
        }
    }

    /// Every successful write is also recorded as `<line>: ON|OFF` in `path`,
    /// which lets black-box tests observe output activity.
    pub fn with_output_log(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            output_log: Some(path.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // a panicking test thread must not hide the recorded state from others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_channel(&self, channel: u8, level: bool) {
        self.lock().channels.insert(channel, level);
    }

    pub fn fail_channel(&self, channel: u8, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_channels.insert(channel);
        } else {
            state.failing_channels.remove(&channel);
        }
    }

    pub fn fail_line(&self, line: u8, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_lines.insert(line);
        } else {
            state.failing_lines.remove(&line);
        }
    }

    pub fn line_level(&self, line: u8) -> Option<bool> {
        self.lock().lines.get(&line).copied()
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.lock().writes.clone()
    }

    pub fn is_watched(&self, line: u8) -> bool {
        self.lock().callbacks.contains_key(&line)
    }

    /// Fires the edge callback registered for `line`, as an interrupt would.
    /// Returns false when nothing watches that line.
    pub fn trigger_edge(&self, line: u8, level: bool) -> bool {
        // take the callback out so it does not run under our lock
        let callback = self.lock().callbacks.remove(&line);
        match callback {
            Some(mut callback) => {
                callback(level);
                self.lock().callbacks.entry(line).or_insert(callback);
                true
            }
            None => {
                warn!("No edge callback registered for emulated GPIO{}", line);
                false
            }
        }
    }

    /// Emulates a press on the next watched GPIO input, round-robin: a rising
    /// edge immediately followed by a falling one.
    pub fn emulate_next_activation(&self) -> Option<u8> {
        let line = {
            let mut state = self.lock();
            if state.watched_order.is_empty() {
                return None;
            }
            let idx = state.next_emulated % state.watched_order.len();
            state.next_emulated += 1;
            state.watched_order[idx]
        };
        info!("Emulating activation of GPIO{}", line);
        self.trigger_edge(line, true);
        self.trigger_edge(line, false);
        Some(line)
    }
}

impl Hardware for FakeHardware {
    fn read_channel(&self, channel: u8) -> Result<bool, HardwareError> {
        let state = self.lock();
        if state.failing_channels.contains(&channel) {
            return Err(HardwareError::Read {
                channel,
                reason: "injected failure".to_string(),
            });
        }
        Ok(state.channels.get(&channel).copied().unwrap_or(false))
    }

    fn write_line(&self, line: u8, level: bool) -> Result<(), HardwareError> {
        {
            let mut state = self.lock();
            if state.failing_lines.contains(&line) {
                return Err(HardwareError::Write {
                    line,
                    reason: "injected failure".to_string(),
                });
            }
            state.lines.insert(line, level);
            state.writes.push((line, level));
        }
        debug!("Fake GPIO{} driven {}", line, if level { "high" } else { "low" });

        if let Some(path) = &self.output_log {
            let content = format!("{}: {}", line, if level { "ON" } else { "OFF" });
            if let Err(e) = std::fs::write(path, content) {
                warn!("Unable to write output log {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    fn watch_edges(&self, line: u8, callback: EdgeCallback) -> Result<(), HardwareError> {
        let mut state = self.lock();
        if state.callbacks.insert(line, callback).is_none() {
            state.watched_order.push(line);
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = self.lock();
        state.callbacks.clear();
        state.watched_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn injected_read_failure_is_reported_per_channel() {
        let hw = FakeHardware::new();
        hw.set_channel(1, true);
        hw.fail_channel(2, true);

        assert!(hw.read_channel(1).unwrap());
        assert!(matches!(
            hw.read_channel(2),
            Err(HardwareError::Read { channel: 2, .. })
        ));
        assert!(!hw.read_channel(3).unwrap());
    }

    #[test]
    fn failed_write_leaves_line_untouched() {
        let hw = FakeHardware::new();
        hw.write_line(17, true).unwrap();
        hw.fail_line(17, true);

        assert!(hw.write_line(17, false).is_err());
        assert_eq!(hw.line_level(17), Some(true));
        assert_eq!(hw.writes(), vec![(17, true)]);
    }

    #[test]
    fn emulated_activation_cycles_through_watched_lines() {
        let hw = FakeHardware::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for line in [5, 6] {
            let hits = hits.clone();
            hw.watch_edges(
                line,
                Box::new(move |level| {
                    if level {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        }

        assert_eq!(hw.emulate_next_activation(), Some(5));
        assert_eq!(hw.emulate_next_activation(), Some(6));
        assert_eq!(hw.emulate_next_activation(), Some(5));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn output_log_records_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs");
        let hw = FakeHardware::with_output_log(&path);

        hw.write_line(20, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "20: ON");
        hw.write_line(20, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "20: OFF");
    }
}
