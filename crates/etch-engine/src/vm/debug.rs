//! Debug coordination between the debug server and the running VM.
//!
//! Condvar ping-pong: the VM thread blocks while paused, the server thread
//! blocks while the VM runs. The pre-instruction hook is a single atomic load
//! when the debugger is inactive.

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Stepping mode, set by the debugger and checked by the VM at each
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Only break at breakpoints
    Continue,
    /// Break on any new source line
    StepIn,
    /// Break when call depth <= the step-start depth and the line changed
    StepOver { target_depth: usize },
    /// Break when call depth < the step-start depth
    StepOut { target_depth: usize },
}

/// Why execution paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    Breakpoint,
    Step,
    Entry,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Breakpoint => "breakpoint",
            PauseReason::Step => "step",
            PauseReason::Entry => "entry",
        }
    }
}

/// Snapshot of the pause point, read by the server while the VM is parked.
#[derive(Debug, Clone)]
pub struct PauseInfo {
    pub reason: PauseReason,
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub function: String,
    pub depth: usize,
}

/// Execution phase shared between the two threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugPhase {
    Running,
    Paused,
    Terminated,
}

/// Shared debugger state.
pub struct DebugState {
    /// Fast check; false = near-zero overhead in the dispatch loop
    pub active: AtomicBool,
    /// Breakpoints keyed by (file, line)
    breakpoints: RwLock<FxHashSet<(String, u32)>>,
    step_mode: Mutex<StepMode>,
    /// (file, line) of the last pause, for new-line detection
    last_stop: Mutex<(String, u32)>,
    pause_info: Mutex<Option<PauseInfo>>,
    phase: Mutex<DebugPhase>,
    phase_changed: Condvar,
    /// Break before the first instruction
    pub break_at_entry: AtomicBool,
}

impl Default for DebugState {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugState {
    pub fn new() -> Self {
        DebugState {
            active: AtomicBool::new(false),
            breakpoints: RwLock::new(FxHashSet::default()),
            step_mode: Mutex::new(StepMode::Continue),
            last_stop: Mutex::new((String::new(), 0)),
            pause_info: Mutex::new(None),
            phase: Mutex::new(DebugPhase::Running),
            phase_changed: Condvar::new(),
            break_at_entry: AtomicBool::new(false),
        }
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn set_breakpoints(&self, file: &str, lines: &[u32]) {
        let mut bps = self.breakpoints.write();
        bps.retain(|(f, _)| f != file);
        for &line in lines {
            bps.insert((file.to_string(), line));
        }
    }

    pub fn clear_breakpoints(&self) {
        self.breakpoints.write().clear();
    }

    /// Called by the VM before each instruction. Returns the pause reason if
    /// execution should stop here.
    pub fn should_break(&self, file: &str, line: u32, depth: usize) -> Option<PauseReason> {
        if line == 0 {
            return None;
        }
        if self.break_at_entry.swap(false, Ordering::SeqCst) {
            return Some(PauseReason::Entry);
        }
        let (last_file, last_line) = {
            let guard = self.last_stop.lock().unwrap();
            guard.clone()
        };
        let new_line = line != last_line || file != last_file;

        if new_line && self.breakpoints.read().contains(&(file.to_string(), line)) {
            return Some(PauseReason::Breakpoint);
        }
        let mode = *self.step_mode.lock().unwrap();
        match mode {
            StepMode::Continue => None,
            StepMode::StepIn => new_line.then_some(PauseReason::Step),
            StepMode::StepOver { target_depth } => {
                (depth <= target_depth && new_line).then_some(PauseReason::Step)
            }
            StepMode::StepOut { target_depth } => {
                (depth < target_depth).then_some(PauseReason::Step)
            }
        }
    }

    /// Park the VM thread at a pause point until the server resumes it.
    pub fn pause(&self, info: PauseInfo) {
        {
            let mut last = self.last_stop.lock().unwrap();
            *last = (info.file.clone(), info.line);
        }
        *self.pause_info.lock().unwrap() = Some(info);
        let mut phase = self.phase.lock().unwrap();
        *phase = DebugPhase::Paused;
        self.phase_changed.notify_all();
        while *phase == DebugPhase::Paused {
            phase = self.phase_changed.wait(phase).unwrap();
        }
    }

    /// Server side: wait until the VM pauses or terminates. Returns the pause
    /// snapshot, or None on termination/timeout.
    pub fn wait_for_pause(&self, timeout: std::time::Duration) -> Option<PauseInfo> {
        let mut phase = self.phase.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *phase == DebugPhase::Running {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .phase_changed
                .wait_timeout(phase, deadline - now)
                .unwrap();
            phase = guard;
            if result.timed_out() && *phase == DebugPhase::Running {
                return None;
            }
        }
        if *phase == DebugPhase::Terminated {
            return None;
        }
        self.pause_info.lock().unwrap().clone()
    }

    /// Server side: resume the VM with a new step mode.
    pub fn resume(&self, mode: StepMode) {
        *self.step_mode.lock().unwrap() = mode;
        let mut phase = self.phase.lock().unwrap();
        if *phase == DebugPhase::Paused {
            *phase = DebugPhase::Running;
            self.phase_changed.notify_all();
        }
    }

    /// VM side: execution finished; release any waiting server.
    pub fn terminate(&self) {
        let mut phase = self.phase.lock().unwrap();
        *phase = DebugPhase::Terminated;
        self.phase_changed.notify_all();
    }

    /// Server side: detach — turn the hook off and let the VM run free.
    pub fn disconnect(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.resume(StepMode::Continue);
    }

    pub fn is_paused(&self) -> bool {
        *self.phase.lock().unwrap() == DebugPhase::Paused
    }

    pub fn is_terminated(&self) -> bool {
        *self.phase.lock().unwrap() == DebugPhase::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_hit_on_new_line() {
        let state = DebugState::new();
        state.set_breakpoints("main.etch", &[4]);
        assert_eq!(
            state.should_break("main.etch", 4, 1),
            Some(PauseReason::Breakpoint)
        );
        assert_eq!(state.should_break("main.etch", 3, 1), None);
        assert_eq!(state.should_break("other.etch", 4, 1), None);
    }

    #[test]
    fn test_step_over_depth_and_line() {
        let state = DebugState::new();
        *state.step_mode.lock().unwrap() = StepMode::StepOver { target_depth: 2 };
        *state.last_stop.lock().unwrap() = ("main.etch".to_string(), 10);
        // Deeper frame: no break.
        assert_eq!(state.should_break("main.etch", 11, 3), None);
        // Same line: no break.
        assert_eq!(state.should_break("main.etch", 10, 2), None);
        // Same depth, new line: break.
        assert_eq!(state.should_break("main.etch", 11, 2), Some(PauseReason::Step));
    }

    #[test]
    fn test_step_out_breaks_on_shallower_depth() {
        let state = DebugState::new();
        *state.step_mode.lock().unwrap() = StepMode::StepOut { target_depth: 2 };
        assert_eq!(state.should_break("m.etch", 5, 2), None);
        assert_eq!(state.should_break("m.etch", 5, 1), Some(PauseReason::Step));
    }

    #[test]
    fn test_entry_break_fires_once() {
        let state = DebugState::new();
        state.break_at_entry.store(true, Ordering::SeqCst);
        assert_eq!(state.should_break("m.etch", 1, 1), Some(PauseReason::Entry));
        assert_eq!(state.should_break("m.etch", 1, 1), None);
    }
}
