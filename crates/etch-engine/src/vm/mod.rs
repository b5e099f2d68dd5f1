//! The register VM: dispatch loop, cooperative scheduler, reference-counted
//! heap with incremental cycle collection, builtins, and the debug hook.

pub mod builtins;
pub mod dap;
pub mod debug;
pub mod gc;
pub mod heap;
pub mod interp;
pub mod marshal;
pub mod task;
pub mod value;

pub use heap::{GcStats, Heap, HeapData};
pub use marshal::{from_c, to_c, CValue};
pub use value::Value;

use crate::ast::ORIGIN_NONE;
use crate::bytecode::{BytecodeProgram, DebugRecord};
use crate::ffi::CffiRegistry;
use debug::DebugState;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use task::Task;

/// Call depth limit.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Instructions between deadline checks while a frame budget is active.
const GC_CHECK_INTERVAL: u64 = 64;

/// Default adaptive collection interval (operations) when no frame budget is
/// in effect.
pub const DEFAULT_GC_CYCLE_INTERVAL: u64 = 1000;

/// A runtime error with source attribution.
#[derive(Debug, Clone, PartialEq)]
pub struct VmError {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub origin: Option<String>,
}

impl VmError {
    pub fn bare(message: impl Into<String>) -> Self {
        VmError {
            message: message.into(),
            file: String::new(),
            line: 0,
            col: 0,
            origin: None,
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{}:{}: ", self.file, self.line, self.col)?;
        }
        write!(f, "runtime error: {}", self.message)?;
        if let Some(origin) = &self.origin {
            write!(f, " (in {origin})")?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

/// Host callback registered through the embedding layer.
pub type HostFn = Box<dyn FnMut(&[CValue]) -> Result<CValue, String>>;

/// Per-instruction callback; non-zero return cancels execution.
pub type StepCallback = Box<dyn FnMut(&StepInfo) -> i32>;

/// Snapshot handed to the instruction-step callback.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub pc: usize,
    pub depth: usize,
    pub instruction_count: u64,
    pub function: String,
}

/// Where `print` output goes.
#[derive(Clone)]
pub enum OutputSink {
    Stdout,
    Buffer(Rc<RefCell<String>>),
}

impl OutputSink {
    pub fn write(&self, text: &str) {
        match self {
            OutputSink::Stdout => print!("{text}"),
            OutputSink::Buffer(buf) => buf.borrow_mut().push_str(text),
        }
    }
}

/// The virtual machine for one context (or one comptime sandbox).
pub struct Vm {
    pub program: Rc<BytecodeProgram>,
    pub heap: Heap,
    pub globals: Vec<Value>,
    global_index: FxHashMap<String, usize>,
    overridden: Vec<bool>,

    pub(crate) tasks: Vec<Task>,
    run_queue: VecDeque<u32>,
    current: u32,
    entry_task: u32,

    rng: StdRng,
    pub instruction_count: u64,
    ops_since_gc: u64,
    pub gc_cycle_interval: u64,

    /// Per-frame GC time allowance in microseconds; 0 = adaptive only
    pub frame_budget_us: u64,
    frame_gc_spent_us: u64,

    pub debug: Option<Arc<DebugState>>,
    pub host_fns: Rc<RefCell<FxHashMap<String, HostFn>>>,
    pub cffi: Option<Rc<CffiRegistry>>,
    pub step_callback: Option<StepCallback>,
    pub out: OutputSink,

    /// `inject` calls observed during a comptime run
    pub inject_log: Vec<(String, String, CValue)>,

    pending_error: Option<VmError>,
    /// Set when an unwind drained a task's frames; execution is over
    pub(crate) fatal: bool,
    globals_ran: bool,
    next_task_id: u32,
}

impl Vm {
    pub fn new(program: Rc<BytecodeProgram>) -> Self {
        let global_index = program
            .globals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();
        let globals = program
            .globals
            .iter()
            .map(|g| match &g.initial {
                crate::bytecode::InitialValue::Nil => Value::Nil,
                crate::bytecode::InitialValue::Bool(b) => Value::Bool(*b),
                crate::bytecode::InitialValue::Int(i) => Value::Int(*i),
                crate::bytecode::InitialValue::Float(f) => Value::Float(*f),
                crate::bytecode::InitialValue::Str(s) => Value::str(s),
            })
            .collect::<Vec<_>>();
        let overridden = vec![false; globals.len()];
        let mut heap = Heap::new();
        heap.set_destructors(&program.destructors);

        Vm {
            program,
            heap,
            globals,
            global_index,
            overridden,
            tasks: Vec::new(),
            run_queue: VecDeque::new(),
            current: 0,
            entry_task: 0,
            rng: StdRng::seed_from_u64(0x45746368),
            instruction_count: 0,
            ops_since_gc: 0,
            gc_cycle_interval: DEFAULT_GC_CYCLE_INTERVAL,
            frame_budget_us: 0,
            frame_gc_spent_us: 0,
            debug: None,
            host_fns: Rc::new(RefCell::new(FxHashMap::default())),
            cffi: None,
            step_callback: None,
            out: OutputSink::Stdout,
            inject_log: Vec::new(),
            pending_error: None,
            fatal: false,
            globals_ran: false,
            next_task_id: 0,
        }
    }

    /// A sandboxed sub-session over the same bytecode: fresh heap, fresh
    /// globals, no host functions, buffered output.
    pub fn sandbox(program: Rc<BytecodeProgram>, out: Rc<RefCell<String>>) -> Self {
        let mut vm = Vm::new(program);
        vm.out = OutputSink::Buffer(out);
        vm
    }

    // ========================================================================
    // Globals & overrides
    // ========================================================================

    /// Install a host override for a global before `execute`. The synthetic
    /// `<global>` initializer skips overridden slots.
    pub fn override_global(&mut self, name: &str, value: Value) -> bool {
        match self.global_index.get(name) {
            Some(&slot) => {
                self.heap.retain(&value);
                let old = std::mem::replace(&mut self.globals[slot], value);
                self.heap.release(&old);
                self.overridden[slot] = true;
                true
            }
            None => {
                self.heap.release(&value);
                false
            }
        }
    }

    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.global_index.get(name).map(|&slot| &self.globals[slot])
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> bool {
        match self.global_index.get(name) {
            Some(&slot) => {
                self.heap.retain(&value);
                let old = std::mem::replace(&mut self.globals[slot], value);
                self.heap.release(&old);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_overridden(&self, slot: usize) -> bool {
        self.overridden.get(slot).copied().unwrap_or(false)
    }

    // ========================================================================
    // Execution entry points
    // ========================================================================

    /// Run `<global>` (once) then `main`.
    pub fn execute(&mut self) -> Result<Value, VmError> {
        self.run_globals()?;
        let main_idx = self
            .program
            .find_function("main")
            .ok_or_else(|| VmError::bare("no 'main' function"))?;
        self.run_function(main_idx, Vec::new())
    }

    /// Call an arbitrary function by mangled key (or unambiguous plain name).
    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value, VmError> {
        self.run_globals()?;
        let idx = self
            .program
            .find_function(name)
            .ok_or_else(|| VmError::bare(format!("unknown function '{name}'")))?;
        self.run_function(idx, args)
    }

    fn run_globals(&mut self) -> Result<(), VmError> {
        if self.globals_ran {
            return Ok(());
        }
        self.globals_ran = true;
        if let Some(idx) = self.program.find_function("<global>") {
            self.run_function(idx, Vec::new())?;
        }
        Ok(())
    }

    // ========================================================================
    // Frame budgeting
    // ========================================================================

    /// Reset the per-frame GC budget. A budget of 0 disables time-bounded
    /// collection (adaptive-only).
    pub fn begin_frame(&mut self, budget_us: u64) {
        self.frame_budget_us = budget_us;
        self.frame_gc_spent_us = 0;
        self.heap.stats.gc_time_us = 0;
    }

    /// Whether the dirty set has outgrown the high-water mark.
    pub fn heap_needs_collection(&self) -> bool {
        gc::needs_gc_frame(&self.heap)
    }

    pub fn gc_stats(&mut self) -> GcStats {
        self.heap.refresh_stats();
        self.heap.stats
    }

    /// Run cycle collection to completion (used at shutdown and by tests).
    pub fn collect_garbage(&mut self) -> u64 {
        gc::collect_all(&mut self.heap)
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.frame_budget_us > 0 {
            if self.ops_since_gc < GC_CHECK_INTERVAL {
                return;
            }
            self.ops_since_gc = 0;
            if self.frame_gc_spent_us >= self.frame_budget_us || self.heap.dirty.is_empty() {
                return;
            }
            let allowance = self.frame_budget_us - self.frame_gc_spent_us;
            let start = Instant::now();
            let deadline = start + std::time::Duration::from_micros(allowance);
            gc::collect_cycles(&mut self.heap, Some(deadline));
            let spent = start.elapsed().as_micros() as u64;
            self.frame_gc_spent_us += spent;
            self.heap.stats.gc_time_us = self.frame_gc_spent_us.min(self.frame_budget_us);
            self.heap.stats.total_gc_time_us += spent;
        } else {
            if self.ops_since_gc < self.gc_cycle_interval {
                return;
            }
            self.ops_since_gc = 0;
            if self.heap.dirty.is_empty() {
                return;
            }
            let start = Instant::now();
            gc::collect_all(&mut self.heap);
            let spent = start.elapsed().as_micros() as u64;
            self.heap.stats.gc_time_us += spent;
            self.heap.stats.total_gc_time_us += spent;
        }
    }

    // ========================================================================
    // Inspection (embedding ABI)
    // ========================================================================

    pub fn current_pc(&self) -> usize {
        self.tasks
            .get(self.current as usize)
            .map(|t| t.pc)
            .unwrap_or(0)
    }

    pub fn call_depth(&self) -> usize {
        self.tasks
            .get(self.current as usize)
            .map(|t| t.depth())
            .unwrap_or(0)
    }

    pub fn current_function_name(&self) -> String {
        self.tasks
            .get(self.current as usize)
            .and_then(|t| t.frames.last())
            .and_then(|f| self.program.functions.get(f.func as usize))
            .map(|f| f.name.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the current frame's register window.
    pub fn registers(&self) -> Vec<Value> {
        self.tasks
            .get(self.current as usize)
            .and_then(|t| t.frames.last())
            .map(|f| f.regs.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Internals shared with the interpreter
    // ========================================================================

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub(crate) fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn cur(&self) -> &Task {
        &self.tasks[self.current as usize]
    }

    pub(crate) fn cur_mut(&mut self) -> &mut Task {
        let cur = self.current as usize;
        &mut self.tasks[cur]
    }

    pub(crate) fn alloc_task(&mut self) -> u32 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.push(Task::new(id));
        id
    }

    pub(crate) fn queue_task(&mut self, id: u32) {
        self.run_queue.push_back(id);
    }

    pub(crate) fn unqueue_task(&mut self, id: u32) {
        self.run_queue.retain(|&t| t != id);
    }

    pub(crate) fn pop_ready_task(&mut self) -> Option<u32> {
        while let Some(id) = self.run_queue.pop_front() {
            if self.tasks[id as usize].state == task::TaskState::Ready {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn set_current(&mut self, id: u32) {
        self.current = id;
    }

    pub(crate) fn current_id(&self) -> u32 {
        self.current
    }

    pub(crate) fn entry_id(&self) -> u32 {
        self.entry_task
    }

    pub(crate) fn set_entry(&mut self, id: u32) {
        self.entry_task = id;
    }

    pub(crate) fn bump_ops(&mut self) {
        self.instruction_count += 1;
        self.ops_since_gc += 1;
    }

    pub(crate) fn take_pending_error(&mut self) -> Option<VmError> {
        self.pending_error.take()
    }

    pub(crate) fn set_pending_error(&mut self, err: VmError) {
        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        }
    }

    pub(crate) fn has_pending_error(&self) -> bool {
        self.pending_error.is_some()
    }

    /// Build a runtime error attributed to the given debug record.
    pub(crate) fn error_at(&self, rec: &DebugRecord, message: impl Into<String>) -> VmError {
        VmError {
            message: message.into(),
            file: self.program.file_name(rec.file).to_string(),
            line: rec.line,
            col: rec.col,
            origin: if rec.origin != ORIGIN_NONE {
                self.program.origin_name(rec.origin).map(|s| s.to_string())
            } else {
                None
            },
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Release task roots and globals so heap accounting balances, then
        // collect remaining cycles.
        let mut roots: Vec<Value> = Vec::new();
        for task in &mut self.tasks {
            for frame in &mut task.frames {
                roots.append(&mut frame.regs);
            }
            if let Some(v) = task.result.take() {
                roots.push(v);
            }
            if let Some(v) = task.wake_value.take() {
                roots.push(v);
            }
        }
        for g in std::mem::take(&mut self.globals) {
            roots.push(g);
        }
        for v in &roots {
            self.heap.release(v);
        }
        while let Some((_, v)) = self.heap.finalize_queue.pop_front() {
            self.heap.release(&v);
        }
        gc::collect_all(&mut self.heap);
    }
}
