//! Instruction dispatch and cooperative scheduling.
//!
//! A tight match on opcode; the PC is advanced before dispatch. Returns run
//! the frame's defer stack in reverse before completing; unwinds (runtime
//! errors, host cancellation) run every pending defer frame by frame.

use super::debug::PauseInfo;
use super::heap::{ChannelState, HeapData};
use super::marshal;
use super::task::{Frame, FrameExit, TaskState};
use super::value::Value;
use super::{StepInfo, Vm, VmError, MAX_CALL_DEPTH};
use crate::bytecode::{match_tag, unpack_call, DebugRecord, FuncKind, Instr, Opcode};
use rand::Rng;
use std::sync::atomic::Ordering;

impl Vm {
    /// Run one function to completion on a fresh task and return its value.
    pub(crate) fn run_function(
        &mut self,
        func_idx: usize,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let info = &self.program.functions[func_idx];
        if info.kind != FuncKind::Native {
            return Err(VmError::bare(format!(
                "'{}' is not directly callable",
                info.name
            )));
        }
        let size = (info.param_count as usize + 1).max(info.max_register as usize + 1);
        let start_pc = info.start_pc as usize;

        let tid = self.alloc_task();
        let mut frame = Frame::new(func_idx as u32, size, usize::MAX, 0);
        for (i, arg) in args.into_iter().enumerate() {
            if i < size {
                frame.regs[i] = arg;
            } else {
                self.heap.release(&arg);
            }
        }
        {
            let task = &mut self.tasks[tid as usize];
            task.frames.push(frame);
            task.pc = start_pc;
            task.state = TaskState::Running;
        }
        self.set_entry(tid);
        self.set_current(tid);
        self.fatal = false;
        self.run_loop()
    }

    fn run_loop(&mut self) -> Result<Value, VmError> {
        loop {
            if self.fatal {
                if let Some(dbg) = &self.debug {
                    dbg.terminate();
                }
                return Err(self
                    .take_pending_error()
                    .unwrap_or_else(|| VmError::bare("execution failed")));
            }
            {
                let entry = self.entry_id() as usize;
                if self.tasks[entry].state == TaskState::Done {
                    let result = self.tasks[entry].result.take().unwrap_or(Value::Nil);
                    if let Some(dbg) = &self.debug {
                        dbg.terminate();
                    }
                    return Ok(result);
                }
            }

            let task = self.cur();
            let pc = task.pc;
            if pc >= self.program.code.len() {
                return Err(VmError::bare(format!("pc {pc} out of range")));
            }
            let instr = self.program.code[pc];
            let rec = self.program.debug[pc];

            // Pre-instruction debug hook.
            if let Some(dbg) = self.debug.clone() {
                if dbg.active.load(Ordering::SeqCst) {
                    let file = self.program.file_name(rec.file).to_string();
                    let depth = self.call_depth();
                    if let Some(reason) = dbg.should_break(&file, rec.line, depth) {
                        let info = PauseInfo {
                            reason,
                            file,
                            line: rec.line,
                            col: rec.col,
                            function: self.current_function_name(),
                            depth,
                        };
                        dbg.pause(info);
                    }
                }
            }

            // Host step callback; non-zero cancels after this instruction.
            let mut cancel = false;
            if self.step_callback.is_some() {
                let info = StepInfo {
                    pc,
                    depth: self.call_depth(),
                    instruction_count: self.instruction_count,
                    function: self.current_function_name(),
                };
                if let Some(cb) = self.step_callback.as_mut() {
                    cancel = cb(&info) != 0;
                }
            }

            self.bump_ops();
            self.maybe_collect();

            self.cur_mut().pc = pc + 1;
            if let Err(e) = self.dispatch(instr, rec) {
                self.raise(e);
                continue;
            }
            if cancel {
                self.raise(self.error_at(&rec, "execution cancelled by host"));
                continue;
            }
            self.drain_finalizers();
        }
    }

    // ========================================================================
    // Register access
    // ========================================================================

    fn reg(&self, r: u8) -> Value {
        self.cur().frame().regs[r as usize].clone()
    }

    /// Install an owned value (ownership transfer).
    fn install(&mut self, r: u8, owned: Value) {
        let cur = self.current_id() as usize;
        let slot = &mut self.tasks[cur].frames.last_mut().expect("frame").regs[r as usize];
        let old = std::mem::replace(slot, owned);
        self.heap.release(&old);
    }

    /// Install a borrowed value (retains first).
    fn set_reg(&mut self, r: u8, v: Value) {
        self.heap.retain(&v);
        self.install(r, v);
    }

    /// Take a value out of a register, leaving nil. The caller now owns it.
    fn take_reg(&mut self, r: u8) -> Value {
        let cur = self.current_id() as usize;
        let slot = &mut self.tasks[cur].frames.last_mut().expect("frame").regs[r as usize];
        std::mem::replace(slot, Value::Nil)
    }

    fn int_at(&self, r: u8, rec: &DebugRecord) -> Result<i64, VmError> {
        let v = &self.cur().frame().regs[r as usize];
        v.as_int()
            .ok_or_else(|| self.error_at(rec, format!("expected int, got {}", v.type_name())))
    }

    fn float_at(&self, r: u8, rec: &DebugRecord) -> Result<f64, VmError> {
        let v = &self.cur().frame().regs[r as usize];
        match v {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(self.error_at(rec, format!("expected float, got {}", v.type_name()))),
        }
    }

    fn bool_at(&self, r: u8, rec: &DebugRecord) -> Result<bool, VmError> {
        let v = &self.cur().frame().regs[r as usize];
        v.as_bool()
            .ok_or_else(|| self.error_at(rec, format!("expected bool, got {}", v.type_name())))
    }

    fn str_at(&self, r: u8, rec: &DebugRecord) -> Result<std::rc::Rc<str>, VmError> {
        let v = &self.cur().frame().regs[r as usize];
        match v {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(self.error_at(rec, format!("expected string, got {}", v.type_name()))),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self, instr: Instr, rec: DebugRecord) -> Result<(), VmError> {
        let a = instr.a;
        let b = instr.b;
        let c = instr.c();
        let wide = instr.wide;

        match instr.op {
            Opcode::Nop => {}
            Opcode::Move => {
                let v = self.reg(b);
                self.set_reg(a, v);
            }
            Opcode::LoadNil => self.install(a, Value::Nil),
            Opcode::LoadTrue => self.install(a, Value::Bool(true)),
            Opcode::LoadFalse => self.install(a, Value::Bool(false)),
            Opcode::LoadInt => self.install(a, Value::Int(wide as i32 as i64)),
            Opcode::LoadConstInt => {
                let v = self.program.ints[wide as usize];
                self.install(a, Value::Int(v));
            }
            Opcode::LoadFloat => {
                let v = self.program.floats[wide as usize];
                self.install(a, Value::Float(v));
            }
            Opcode::LoadStr => {
                let s = self.program.strings[wide as usize].clone();
                self.install(a, Value::str(s));
            }
            Opcode::LoadChar => {
                let ch = char::from_u32(wide)
                    .ok_or_else(|| self.error_at(&rec, "invalid character literal"))?;
                self.install(a, Value::Char(ch));
            }
            Opcode::LoadGlobal => {
                let v = self.globals[wide as usize].clone();
                self.set_reg(a, v);
            }
            Opcode::StoreGlobal => {
                let v = self.reg(a);
                self.heap.retain(&v);
                let old = std::mem::replace(&mut self.globals[wide as usize], v);
                self.heap.release(&old);
            }
            Opcode::InitGlobal => {
                if !self.is_overridden(wide as usize) {
                    let v = self.reg(a);
                    self.heap.retain(&v);
                    let old = std::mem::replace(&mut self.globals[wide as usize], v);
                    self.heap.release(&old);
                }
            }

            // ===== Integer arithmetic =====
            Opcode::IAdd => {
                let (x, y) = (self.int_at(b, &rec)?, self.int_at(c, &rec)?);
                let v = x
                    .checked_add(y)
                    .ok_or_else(|| self.error_at(&rec, "integer overflow in '+'"))?;
                self.install(a, Value::Int(v));
            }
            Opcode::ISub => {
                let (x, y) = (self.int_at(b, &rec)?, self.int_at(c, &rec)?);
                let v = x
                    .checked_sub(y)
                    .ok_or_else(|| self.error_at(&rec, "integer overflow in '-'"))?;
                self.install(a, Value::Int(v));
            }
            Opcode::IMul => {
                let (x, y) = (self.int_at(b, &rec)?, self.int_at(c, &rec)?);
                let v = x
                    .checked_mul(y)
                    .ok_or_else(|| self.error_at(&rec, "integer overflow in '*'"))?;
                self.install(a, Value::Int(v));
            }
            Opcode::IDiv => {
                let (x, y) = (self.int_at(b, &rec)?, self.int_at(c, &rec)?);
                if y == 0 {
                    return Err(self.error_at(&rec, "division by zero"));
                }
                let v = x
                    .checked_div(y)
                    .ok_or_else(|| self.error_at(&rec, "integer overflow in '/'"))?;
                self.install(a, Value::Int(v));
            }
            Opcode::IMod => {
                let (x, y) = (self.int_at(b, &rec)?, self.int_at(c, &rec)?);
                if y == 0 {
                    return Err(self.error_at(&rec, "division by zero"));
                }
                let v = x
                    .checked_rem(y)
                    .ok_or_else(|| self.error_at(&rec, "integer overflow in '%'"))?;
                self.install(a, Value::Int(v));
            }
            Opcode::INeg => {
                let x = self.int_at(b, &rec)?;
                let v = x
                    .checked_neg()
                    .ok_or_else(|| self.error_at(&rec, "integer overflow in '-'"))?;
                self.install(a, Value::Int(v));
            }

            // ===== Float arithmetic =====
            Opcode::FAdd => {
                let v = self.float_at(b, &rec)? + self.float_at(c, &rec)?;
                self.install(a, Value::Float(v));
            }
            Opcode::FSub => {
                let v = self.float_at(b, &rec)? - self.float_at(c, &rec)?;
                self.install(a, Value::Float(v));
            }
            Opcode::FMul => {
                let v = self.float_at(b, &rec)? * self.float_at(c, &rec)?;
                self.install(a, Value::Float(v));
            }
            Opcode::FDiv => {
                let v = self.float_at(b, &rec)? / self.float_at(c, &rec)?;
                self.install(a, Value::Float(v));
            }
            Opcode::FMod => {
                let v = self.float_at(b, &rec)? % self.float_at(c, &rec)?;
                self.install(a, Value::Float(v));
            }
            Opcode::FNeg => {
                let v = -self.float_at(b, &rec)?;
                self.install(a, Value::Float(v));
            }

            // ===== Comparisons =====
            Opcode::IEq => self.int_cmp(a, b, c, &rec, |x, y| x == y)?,
            Opcode::INe => self.int_cmp(a, b, c, &rec, |x, y| x != y)?,
            Opcode::ILt => self.int_cmp(a, b, c, &rec, |x, y| x < y)?,
            Opcode::ILe => self.int_cmp(a, b, c, &rec, |x, y| x <= y)?,
            Opcode::IGt => self.int_cmp(a, b, c, &rec, |x, y| x > y)?,
            Opcode::IGe => self.int_cmp(a, b, c, &rec, |x, y| x >= y)?,
            Opcode::FEq => self.float_cmp(a, b, c, &rec, |x, y| x == y)?,
            Opcode::FNe => self.float_cmp(a, b, c, &rec, |x, y| x != y)?,
            Opcode::FLt => self.float_cmp(a, b, c, &rec, |x, y| x < y)?,
            Opcode::FLe => self.float_cmp(a, b, c, &rec, |x, y| x <= y)?,
            Opcode::FGt => self.float_cmp(a, b, c, &rec, |x, y| x > y)?,
            Opcode::FGe => self.float_cmp(a, b, c, &rec, |x, y| x >= y)?,
            Opcode::SEq => {
                let (x, y) = (self.str_at(b, &rec)?, self.str_at(c, &rec)?);
                self.install(a, Value::Bool(x == y));
            }
            Opcode::SNe => {
                let (x, y) = (self.str_at(b, &rec)?, self.str_at(c, &rec)?);
                self.install(a, Value::Bool(x != y));
            }
            Opcode::SLt => {
                let (x, y) = (self.str_at(b, &rec)?, self.str_at(c, &rec)?);
                self.install(a, Value::Bool(x < y));
            }
            Opcode::SConcat => {
                let (x, y) = (self.str_at(b, &rec)?, self.str_at(c, &rec)?);
                self.install(a, Value::str(format!("{x}{y}")));
            }
            Opcode::Eq => {
                let (x, y) = (self.reg(b), self.reg(c));
                let eq = self.deep_equals(&x, &y);
                self.install(a, Value::Bool(eq));
            }
            Opcode::Ne => {
                let (x, y) = (self.reg(b), self.reg(c));
                let eq = self.deep_equals(&x, &y);
                self.install(a, Value::Bool(!eq));
            }
            Opcode::Not => {
                let v = self.bool_at(b, &rec)?;
                self.install(a, Value::Bool(!v));
            }
            Opcode::And => {
                let v = self.bool_at(b, &rec)? && self.bool_at(c, &rec)?;
                self.install(a, Value::Bool(v));
            }
            Opcode::Or => {
                let v = self.bool_at(b, &rec)? || self.bool_at(c, &rec)?;
                self.install(a, Value::Bool(v));
            }

            // ===== References =====
            Opcode::NewRef => {
                let inner = self.reg(b);
                let id = self.heap.alloc(HeapData::Cell(inner));
                self.install(a, Value::Ref(id));
            }
            Opcode::Deref => {
                let v = self.reg(b);
                match v {
                    Value::Ref(id) => match self.heap.get(id).filter(|cell| cell.alive) {
                        Some(cell) => match &cell.data {
                            HeapData::Cell(inner) => {
                                let inner = inner.clone();
                                self.set_reg(a, inner);
                            }
                            _ => return Err(self.error_at(&rec, "not a reference cell")),
                        },
                        None => return Err(self.error_at(&rec, "nil dereference")),
                    },
                    Value::Weak(id) => {
                        let inner = match self.heap.get(id).filter(|cell| cell.alive) {
                            Some(cell) => match &cell.data {
                                HeapData::Cell(inner) => inner.clone(),
                                _ => Value::Nil,
                            },
                            None => Value::Nil,
                        };
                        self.set_reg(a, inner);
                    }
                    Value::Nil => return Err(self.error_at(&rec, "nil dereference")),
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot dereference {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::StoreRef => {
                let target = self.reg(a);
                let v = self.reg(b);
                match target {
                    Value::Ref(id) => {
                        if !self.heap.is_alive(id) {
                            return Err(self.error_at(&rec, "nil dereference"));
                        }
                        let is_cell = matches!(
                            self.heap.get(id).map(|c| &c.data),
                            Some(HeapData::Cell(_))
                        );
                        if !is_cell {
                            return Err(self.error_at(&rec, "not a reference cell"));
                        }
                        self.heap.retain(&v);
                        let old = {
                            let cell = self.heap.get_mut(id).expect("cell alive");
                            match &mut cell.data {
                                HeapData::Cell(slot) => std::mem::replace(slot, v),
                                _ => unreachable!("checked above"),
                            }
                        };
                        self.heap.release(&old);
                        self.heap.mark_dirty(id);
                    }
                    Value::Nil => return Err(self.error_at(&rec, "nil dereference")),
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot store through {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::NewWeak => {
                let v = self.reg(b);
                match v {
                    Value::Ref(id) => self.set_reg(a, Value::Weak(id)),
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot take weak handle of {}", other.type_name()),
                        ))
                    }
                }
            }

            // ===== Arrays =====
            Opcode::ArrayMake => {
                let base = b as usize;
                let count = wide as usize;
                let values: Vec<Value> =
                    self.cur().frame().regs[base..base + count].to_vec();
                let id = self.heap.alloc(HeapData::Array(values));
                self.install(a, Value::Array(id));
            }
            Opcode::ArrayGet => {
                let base = self.reg(b);
                let idx = self.int_at(c, &rec)?;
                match base {
                    Value::Array(id) => {
                        let elem = {
                            let items = self.array_ref(id, &rec)?;
                            if idx < 0 || idx as usize >= items.len() {
                                return Err(self.error_at(
                                    &rec,
                                    format!(
                                        "index {} out of bounds for length {}",
                                        idx,
                                        items.len()
                                    ),
                                ));
                            }
                            items[idx as usize].clone()
                        };
                        self.set_reg(a, elem);
                    }
                    Value::Str(s) => {
                        let ch = s.chars().nth(idx.max(0) as usize).ok_or_else(|| {
                            self.error_at(
                                &rec,
                                format!(
                                    "index {} out of bounds for length {}",
                                    idx,
                                    s.chars().count()
                                ),
                            )
                        })?;
                        if idx < 0 {
                            return Err(self
                                .error_at(&rec, format!("index {idx} out of bounds")));
                        }
                        self.install(a, Value::Char(ch));
                    }
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot index {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::ArraySet => {
                let target = self.reg(a);
                let idx = self.int_at(b, &rec)?;
                let v = self.reg(c);
                match target {
                    Value::Array(id) => {
                        let len = self.array_ref(id, &rec)?.len();
                        if idx < 0 || idx as usize >= len {
                            return Err(self.error_at(
                                &rec,
                                format!("index {idx} out of bounds for length {len}"),
                            ));
                        }
                        self.heap.retain(&v);
                        let old = {
                            let cell = self.heap.get_mut(id).expect("array alive");
                            match &mut cell.data {
                                HeapData::Array(items) => {
                                    std::mem::replace(&mut items[idx as usize], v)
                                }
                                _ => unreachable!("checked by array_ref"),
                            }
                        };
                        self.heap.release(&old);
                        self.heap.mark_dirty(id);
                    }
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot index-assign {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::ArrayLen => {
                let v = self.reg(b);
                let len = self.value_len(&v, &rec)?;
                self.install(a, Value::Int(len));
            }
            Opcode::ArraySlice => {
                let base = self.reg(b);
                let lo = self.int_at((wide & 0xFF) as u8, &rec)?;
                let hi = self.int_at(((wide >> 8) & 0xFF) as u8, &rec)?;
                match base {
                    Value::Array(id) => {
                        let items = self.array_ref(id, &rec)?;
                        let len = items.len() as i64;
                        if lo < 0 || hi < lo || hi > len {
                            return Err(self.error_at(
                                &rec,
                                format!("slice [{lo}, {hi}) out of bounds for length {len}"),
                            ));
                        }
                        let slice: Vec<Value> = items[lo as usize..hi as usize].to_vec();
                        let id = self.heap.alloc(HeapData::Array(slice));
                        self.install(a, Value::Array(id));
                    }
                    Value::Str(s) => {
                        let chars: Vec<char> = s.chars().collect();
                        let len = chars.len() as i64;
                        if lo < 0 || hi < lo || hi > len {
                            return Err(self.error_at(
                                &rec,
                                format!("slice [{lo}, {hi}) out of bounds for length {len}"),
                            ));
                        }
                        let sub: String = chars[lo as usize..hi as usize].iter().collect();
                        self.install(a, Value::str(sub));
                    }
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot slice {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::ArrayPush => {
                let target = self.reg(a);
                let v = self.reg(b);
                match target {
                    Value::Array(id) => {
                        self.array_ref(id, &rec)?;
                        self.heap.retain(&v);
                        if let Some(cell) = self.heap.get_mut(id) {
                            if let HeapData::Array(items) = &mut cell.data {
                                items.push(v);
                            }
                        }
                        self.heap.mark_dirty(id);
                    }
                    other => {
                        return Err(self
                            .error_at(&rec, format!("cannot push onto {}", other.type_name())))
                    }
                }
            }
            Opcode::ArrayPop => {
                let target = self.reg(b);
                match target {
                    Value::Array(id) => {
                        self.array_ref(id, &rec)?;
                        let popped = self
                            .heap
                            .get_mut(id)
                            .and_then(|cell| match &mut cell.data {
                                HeapData::Array(items) => items.pop(),
                                _ => None,
                            })
                            .ok_or_else(|| self.error_at(&rec, "pop from empty array"))?;
                        self.heap.mark_dirty(id);
                        // Ownership moves from the array to the register.
                        self.install(a, popped);
                    }
                    other => {
                        return Err(self
                            .error_at(&rec, format!("cannot pop from {}", other.type_name())))
                    }
                }
            }

            // ===== Casts =====
            Opcode::CastIntFloat => {
                let v = self.int_at(b, &rec)?;
                self.install(a, Value::Float(v as f64));
            }
            Opcode::CastFloatInt => {
                let v = self.float_at(b, &rec)?;
                self.install(a, Value::Int(v as i64));
            }
            Opcode::CastCharInt => {
                let v = self.reg(b);
                match v {
                    Value::Char(ch) => self.install(a, Value::Int(ch as i64)),
                    other => {
                        return Err(self
                            .error_at(&rec, format!("expected char, got {}", other.type_name())))
                    }
                }
            }
            Opcode::CastIntChar => {
                let v = self.int_at(b, &rec)?;
                let ch = u32::try_from(v)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error_at(&rec, format!("invalid char code {v}")))?;
                self.install(a, Value::Char(ch));
            }

            // ===== Options & results =====
            Opcode::MakeSome => {
                let v = self.reg(b);
                self.set_reg(a, Value::Some(Box::new(v)));
            }
            Opcode::MakeNone => self.install(a, Value::NoneVal),
            Opcode::MakeOk => {
                let v = self.reg(b);
                self.set_reg(a, Value::Ok(Box::new(v)));
            }
            Opcode::MakeErr => {
                let v = self.reg(b);
                self.set_reg(a, Value::Err(Box::new(v)));
            }
            Opcode::MatchValue => {
                let v = self.reg(b);
                let matched = match wide {
                    match_tag::SOME => matches!(v, Value::Some(_)),
                    match_tag::NONE => matches!(v, Value::NoneVal | Value::Nil),
                    match_tag::OK => matches!(v, Value::Ok(_)),
                    match_tag::ERR => matches!(v, Value::Err(_)),
                    _ => false,
                };
                self.install(a, Value::Bool(matched));
            }
            Opcode::ExtractSome => {
                let v = self.reg(b);
                match v {
                    Value::Some(inner) => self.set_reg(a, *inner),
                    _ => return Err(self.error_at(&rec, "unwrap of none")),
                }
            }
            Opcode::ExtractOk => {
                let v = self.reg(b);
                match v {
                    Value::Ok(inner) => self.set_reg(a, *inner),
                    _ => return Err(self.error_at(&rec, "unwrap of err value")),
                }
            }
            Opcode::ExtractErr => {
                let v = self.reg(b);
                match v {
                    Value::Err(inner) => self.set_reg(a, *inner),
                    _ => return Err(self.error_at(&rec, "expected err value")),
                }
            }

            // ===== Objects, tuples, enums =====
            Opcode::MakeObject => {
                let type_name = self.program.strings[wide as usize].clone();
                let id = self.heap.alloc(HeapData::Object {
                    type_name,
                    fields: Default::default(),
                });
                self.install(a, Value::Object(id));
            }
            Opcode::ObjectGet => {
                let field = self.program.strings[wide as usize].clone();
                let v = self.reg(b);
                match v {
                    Value::Object(id) => {
                        let value = match self.heap.get(id).filter(|cell| cell.alive) {
                            Some(cell) => match &cell.data {
                                HeapData::Object { fields, .. } => {
                                    fields.get(&field).cloned().unwrap_or(Value::Nil)
                                }
                                _ => Value::Nil,
                            },
                            None => return Err(self.error_at(&rec, "nil dereference")),
                        };
                        self.set_reg(a, value);
                    }
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot read field of {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::ObjectSet => {
                let field = self.program.strings[wide as usize].clone();
                let target = self.reg(a);
                let v = self.reg(b);
                match target {
                    Value::Object(id) => {
                        if !self.heap.is_alive(id) {
                            return Err(self.error_at(&rec, "nil dereference"));
                        }
                        self.heap.retain(&v);
                        let old = {
                            let cell = self.heap.get_mut(id).expect("object alive");
                            match &mut cell.data {
                                HeapData::Object { fields, .. } => fields.insert(field, v),
                                _ => None,
                            }
                        };
                        if let Some(old) = old {
                            self.heap.release(&old);
                        }
                        self.heap.mark_dirty(id);
                    }
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot write field of {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::MakeTuple => {
                let base = b as usize;
                let count = wide as usize;
                let values: Vec<Value> =
                    self.cur().frame().regs[base..base + count].to_vec();
                let id = self.heap.alloc(HeapData::Tuple(values));
                self.install(a, Value::Tuple(id));
            }
            Opcode::TupleGet => {
                let v = self.reg(b);
                match v {
                    Value::Tuple(id) => {
                        let elem = match self.heap.get(id).filter(|cell| cell.alive) {
                            Some(cell) => match &cell.data {
                                HeapData::Tuple(items) => {
                                    items.get(wide as usize).cloned().ok_or_else(|| {
                                        self.error_at(&rec, "tuple index out of bounds")
                                    })?
                                }
                                _ => Value::Nil,
                            },
                            None => return Err(self.error_at(&rec, "nil dereference")),
                        };
                        self.set_reg(a, elem);
                    }
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot project {}", other.type_name()),
                        ))
                    }
                }
            }
            Opcode::MakeEnum => {
                let full = self.program.strings[wide as usize].clone();
                let (type_name, variant) = full.split_once('.').unwrap_or((full.as_str(), ""));
                self.install(
                    a,
                    Value::Enum {
                        type_name: type_name.into(),
                        int_val: b as i64,
                        variant: variant.into(),
                    },
                );
            }

            // ===== Control flow & calls =====
            Opcode::Jump => {
                self.cur_mut().pc = wide as usize;
            }
            Opcode::JumpIfFalse => {
                if !self.bool_at(a, &rec)? {
                    self.cur_mut().pc = wide as usize;
                }
            }
            Opcode::Call => {
                let (idx, argc) = unpack_call(wide);
                self.push_call(idx as usize, b, argc, a, &rec)?;
            }
            Opcode::Return => {
                let v = self.take_reg(a);
                self.begin_return(v);
            }
            Opcode::ReturnVoid => {
                self.begin_return(Value::Nil);
            }
            Opcode::Builtin => {
                let (bid, argc) = unpack_call(wide);
                let base = b as usize;
                let args: Vec<Value> =
                    self.cur().frame().regs[base..base + argc as usize].to_vec();
                let result = self.call_builtin(bid, args, &rec)?;
                self.install(a, result);
            }
            Opcode::MakeClosure => {
                let (func, ncap) = unpack_call(wide);
                let base = b as usize;
                let captures: Vec<Value> =
                    self.cur().frame().regs[base..base + ncap as usize].to_vec();
                let id = self.heap.alloc(HeapData::Closure { func, captures });
                self.install(a, Value::Closure(id));
            }
            Opcode::Invoke => {
                let callee = self.reg(b);
                match callee {
                    Value::Closure(id) => {
                        let (func, captures) = match self.heap.get(id).filter(|c| c.alive) {
                            Some(cell) => match &cell.data {
                                HeapData::Closure { func, captures } => {
                                    (*func, captures.clone())
                                }
                                _ => return Err(self.error_at(&rec, "not a closure")),
                            },
                            None => return Err(self.error_at(&rec, "nil dereference")),
                        };
                        let argc = wide as u8;
                        let arg_base = b.wrapping_add(1);
                        self.push_closure_call(func as usize, captures, arg_base, argc, a, &rec)?;
                    }
                    other => {
                        return Err(self
                            .error_at(&rec, format!("cannot invoke {}", other.type_name())))
                    }
                }
            }
            Opcode::DeferPush => {
                self.cur_mut().frame_mut().defers.push(wide);
            }
            Opcode::DeferEnd => {
                if self.cur().frame().exit.is_none() {
                    return Err(self.error_at(&rec, "stray defer end"));
                }
                self.advance_exit();
            }

            // ===== Concurrency =====
            Opcode::Spawn => {
                let (idx, argc) = unpack_call(wide);
                let tid = self.spawn_task(idx as usize, b, argc, &rec)?;
                self.install(a, Value::Coroutine(tid));
            }
            Opcode::YieldVal => {
                let v = self.reg(a);
                self.heap.retain(&v);
                self.do_yield(Some(v))?;
            }
            Opcode::YieldVoid => {
                self.do_yield(None)?;
            }
            Opcode::Resume => {
                let target = self.reg(b);
                match target {
                    Value::Coroutine(tid) => self.do_resume(tid, a, &rec)?,
                    other => {
                        return Err(self
                            .error_at(&rec, format!("cannot resume {}", other.type_name())))
                    }
                }
            }
            Opcode::ChannelNew => {
                let cap = self.int_at(b, &rec)?;
                if cap < 0 {
                    return Err(self.error_at(&rec, "negative channel capacity"));
                }
                let id = self.heap.alloc(HeapData::Channel(ChannelState {
                    capacity: cap as usize,
                    ..Default::default()
                }));
                self.install(a, Value::Channel(id));
            }
            Opcode::ChannelSend => {
                let chan = self.reg(a);
                let v = self.reg(b);
                match chan {
                    Value::Channel(id) => self.channel_send(id, v, &rec)?,
                    other => {
                        return Err(self
                            .error_at(&rec, format!("cannot send into {}", other.type_name())))
                    }
                }
            }
            Opcode::ChannelRecv => {
                let chan = self.reg(b);
                match chan {
                    Value::Channel(id) => self.channel_recv(id, a, &rec)?,
                    other => {
                        return Err(self.error_at(
                            &rec,
                            format!("cannot receive from {}", other.type_name()),
                        ))
                    }
                }
            }

            // ===== External dispatch =====
            Opcode::CallHost => {
                let (name_idx, argc) = unpack_call(wide);
                let name = self.program.strings[name_idx as usize].clone();
                let base = b as usize;
                let args: Vec<Value> =
                    self.cur().frame().regs[base..base + argc as usize].to_vec();
                let cargs: Vec<marshal::CValue> =
                    args.iter().map(|v| marshal::to_c(&self.heap, v)).collect();
                let result = {
                    let host_fns = self.host_fns.clone();
                    let mut map = host_fns.borrow_mut();
                    let f = map.get_mut(&name).ok_or_else(|| {
                        self.error_at(&rec, format!("no host function registered: '{name}'"))
                    })?;
                    f(&cargs)
                };
                match result {
                    Ok(cv) => {
                        let v = marshal::from_c(&mut self.heap, &cv);
                        self.install(a, v);
                    }
                    Err(msg) => {
                        return Err(
                            self.error_at(&rec, format!("host function '{name}' failed: {msg}"))
                        )
                    }
                }
            }
            Opcode::CallCffi => {
                let (idx, argc) = unpack_call(wide);
                let descriptor = self.program.cffi[idx as usize].clone();
                let base = b as usize;
                let args: Vec<Value> =
                    self.cur().frame().regs[base..base + argc as usize].to_vec();
                let registry = self
                    .cffi
                    .clone()
                    .ok_or_else(|| self.error_at(&rec, "no CFFI registry loaded"))?;
                let result = registry
                    .call(&descriptor, &args)
                    .map_err(|e| self.error_at(&rec, e.to_string()))?;
                self.install(a, result);
            }
        }
        Ok(())
    }

    fn int_cmp(
        &mut self,
        a: u8,
        b: u8,
        c: u8,
        rec: &DebugRecord,
        op: impl Fn(i64, i64) -> bool,
    ) -> Result<(), VmError> {
        let (x, y) = (self.int_at(b, rec)?, self.int_at(c, rec)?);
        self.install(a, Value::Bool(op(x, y)));
        Ok(())
    }

    fn float_cmp(
        &mut self,
        a: u8,
        b: u8,
        c: u8,
        rec: &DebugRecord,
        op: impl Fn(f64, f64) -> bool,
    ) -> Result<(), VmError> {
        let (x, y) = (self.float_at(b, rec)?, self.float_at(c, rec)?);
        self.install(a, Value::Bool(op(x, y)));
        Ok(())
    }

    fn array_ref(&self, id: u32, rec: &DebugRecord) -> Result<&Vec<Value>, VmError> {
        match self.heap.get(id).filter(|cell| cell.alive) {
            Some(cell) => match &cell.data {
                HeapData::Array(items) => Ok(items),
                _ => Err(self.error_at(rec, "array type mismatch")),
            },
            None => Err(self.error_at(rec, "nil dereference")),
        }
    }

    fn value_len(&self, v: &Value, rec: &DebugRecord) -> Result<i64, VmError> {
        match v {
            Value::Array(id) => Ok(self.array_ref(*id, rec)?.len() as i64),
            Value::Str(s) => Ok(s.chars().count() as i64),
            Value::Tuple(id) => match self.heap.get(*id).map(|c| &c.data) {
                Some(HeapData::Tuple(items)) => Ok(items.len() as i64),
                _ => Err(self.error_at(rec, "nil dereference")),
            },
            other => Err(self.error_at(rec, format!("no length for {}", other.type_name()))),
        }
    }

    // ========================================================================
    // Calls, returns, unwinding
    // ========================================================================

    fn push_call(
        &mut self,
        func_idx: usize,
        arg_base: u8,
        argc: u8,
        dst: u8,
        rec: &DebugRecord,
    ) -> Result<(), VmError> {
        let info = self
            .program
            .functions
            .get(func_idx)
            .ok_or_else(|| self.error_at(rec, "bad function index"))?
            .clone();
        if info.kind != FuncKind::Native {
            return Err(self.error_at(rec, format!("'{}' is not a bytecode function", info.name)));
        }
        if self.call_depth() >= MAX_CALL_DEPTH {
            return Err(self.error_at(rec, "stack overflow"));
        }
        let size = (info.param_count as usize + 1).max(info.max_register as usize + 1);
        let return_pc = self.cur().pc;
        let mut frame = Frame::new(func_idx as u32, size, return_pc, dst);
        for i in 0..argc as usize {
            let v = self.cur().frame().regs[arg_base as usize + i].clone();
            self.heap.retain(&v);
            frame.regs[i] = v;
        }
        let task = self.cur_mut();
        task.frames.push(frame);
        task.pc = info.start_pc as usize;
        Ok(())
    }

    fn push_closure_call(
        &mut self,
        func_idx: usize,
        captures: Vec<Value>,
        arg_base: u8,
        argc: u8,
        dst: u8,
        rec: &DebugRecord,
    ) -> Result<(), VmError> {
        let info = self
            .program
            .functions
            .get(func_idx)
            .ok_or_else(|| self.error_at(rec, "bad function index"))?
            .clone();
        if self.call_depth() >= MAX_CALL_DEPTH {
            return Err(self.error_at(rec, "stack overflow"));
        }
        let size = (info.param_count as usize + 1).max(info.max_register as usize + 1);
        let return_pc = self.cur().pc;
        let mut frame = Frame::new(func_idx as u32, size, return_pc, dst);
        let ncap = captures.len();
        for (i, cap) in captures.into_iter().enumerate() {
            self.heap.retain(&cap);
            frame.regs[i] = cap;
        }
        for i in 0..argc as usize {
            let v = self.cur().frame().regs[arg_base as usize + i].clone();
            self.heap.retain(&v);
            frame.regs[ncap + i] = v;
        }
        let task = self.cur_mut();
        task.frames.push(frame);
        task.pc = info.start_pc as usize;
        Ok(())
    }

    fn begin_return(&mut self, value: Value) {
        let frame = self.cur_mut().frame_mut();
        frame.exit = Some(FrameExit::Return(value));
        self.advance_exit();
    }

    pub(crate) fn raise(&mut self, err: VmError) {
        self.set_pending_error(err);
        let task = self.cur_mut();
        if task.frames.is_empty() {
            task.state = TaskState::Done;
            self.fatal = true;
            return;
        }
        let frame = task.frame_mut();
        if let Some(FrameExit::Return(v)) = frame.exit.take() {
            frame.exit = Some(FrameExit::Unwind);
            self.heap.release(&v);
        } else {
            frame.exit = Some(FrameExit::Unwind);
        }
        self.advance_exit();
    }

    /// Step the frame's exit machinery: run the next pending defer, or
    /// complete the exit.
    fn advance_exit(&mut self) {
        loop {
            let task = self.cur_mut();
            if task.frames.is_empty() {
                task.state = TaskState::Done;
                self.fatal = true;
                return;
            }
            if let Some(defer_pc) = task.frame_mut().defers.pop() {
                task.pc = defer_pc as usize;
                return;
            }
            let exit = task
                .frame_mut()
                .exit
                .take()
                .expect("advance_exit without exit");
            match exit {
                FrameExit::Return(v) => {
                    self.finish_return(v);
                    return;
                }
                FrameExit::Unwind => {
                    let frame = self.cur_mut().frames.pop().expect("frame");
                    for r in &frame.regs {
                        self.heap.release(r);
                    }
                    let task = self.cur_mut();
                    if task.frames.is_empty() {
                        task.state = TaskState::Done;
                        self.fatal = true;
                        return;
                    }
                    task.frame_mut().exit = Some(FrameExit::Unwind);
                }
            }
        }
    }

    fn finish_return(&mut self, value: Value) {
        let frame = self.cur_mut().frames.pop().expect("frame");
        for r in &frame.regs {
            self.heap.release(r);
        }
        let cur_id = self.current_id();
        if self.cur().frames.is_empty() {
            // Task finished.
            let resumer = {
                let task = self.cur_mut();
                task.state = TaskState::Done;
                task.resumer.take()
            };
            match resumer {
                Some(r) => {
                    self.tasks[r as usize].wake_value = Some(value);
                    self.tasks[r as usize].state = TaskState::Ready;
                    self.activate(r);
                }
                None => {
                    self.cur_mut().result = Some(value);
                    if cur_id != self.entry_id() {
                        self.schedule_next();
                    }
                }
            }
        } else {
            let task = self.cur_mut();
            task.pc = frame.return_pc;
            if frame.discard_result {
                self.heap.release(&value);
            } else {
                self.install(frame.return_reg, value);
            }
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn activate(&mut self, id: u32) {
        self.set_current(id);
        let (wake, dst) = {
            let task = &mut self.tasks[id as usize];
            task.state = TaskState::Running;
            (task.wake_value.take(), task.resume_dst)
        };
        if let Some(v) = wake {
            self.install(dst, v);
        }
    }

    /// Pick the next runnable task. When none exists and the entry task can
    /// no longer run, the context is deadlocked.
    fn schedule_next(&mut self) {
        match self.pop_ready_task() {
            Some(id) => self.activate(id),
            None => {
                let entry = self.entry_id() as usize;
                if self.tasks[entry].state != TaskState::Done {
                    self.set_pending_error(VmError::bare("deadlock: all tasks blocked"));
                    self.fatal = true;
                }
            }
        }
    }

    fn spawn_task(
        &mut self,
        func_idx: usize,
        arg_base: u8,
        argc: u8,
        rec: &DebugRecord,
    ) -> Result<u32, VmError> {
        let info = self
            .program
            .functions
            .get(func_idx)
            .ok_or_else(|| self.error_at(rec, "bad function index"))?
            .clone();
        let size = (info.param_count as usize + 1).max(info.max_register as usize + 1);
        let mut frame = Frame::new(func_idx as u32, size, usize::MAX, 0);
        for i in 0..argc as usize {
            let v = self.cur().frame().regs[arg_base as usize + i].clone();
            self.heap.retain(&v);
            frame.regs[i] = v;
        }
        let tid = self.alloc_task();
        {
            let task = &mut self.tasks[tid as usize];
            task.frames.push(frame);
            task.pc = info.start_pc as usize;
            task.state = TaskState::Ready;
        }
        self.queue_task(tid);
        Ok(tid)
    }

    /// Yield the current task. With a resumer, control returns there carrying
    /// the value; otherwise the task rotates to the back of the run queue.
    fn do_yield(&mut self, value: Option<Value>) -> Result<(), VmError> {
        let resumer = self.cur_mut().resumer.take();
        match resumer {
            Some(r) => {
                let v = value.unwrap_or(Value::Nil);
                self.cur_mut().state = TaskState::Blocked;
                self.tasks[r as usize].wake_value = Some(v);
                self.tasks[r as usize].state = TaskState::Ready;
                self.activate(r);
            }
            None => {
                if let Some(v) = value {
                    // No receiver for the value.
                    self.heap.release(&v);
                }
                if let Some(next) = self.pop_ready_task() {
                    let cur = self.current_id();
                    self.tasks[cur as usize].state = TaskState::Ready;
                    self.queue_task(cur);
                    self.activate(next);
                }
                // Nothing else runnable: the task just keeps going.
            }
        }
        Ok(())
    }

    fn do_resume(&mut self, tid: u32, dst: u8, rec: &DebugRecord) -> Result<(), VmError> {
        if tid as usize >= self.tasks.len() {
            return Err(self.error_at(rec, "resume of unknown coroutine"));
        }
        match self.tasks[tid as usize].state {
            TaskState::Done => {
                let v = self.tasks[tid as usize]
                    .result
                    .clone()
                    .unwrap_or(Value::Nil);
                self.set_reg(dst, v);
            }
            TaskState::Running => {
                return Err(self.error_at(rec, "cannot resume a running coroutine"));
            }
            TaskState::Ready | TaskState::Blocked => {
                self.unqueue_task(tid);
                let cur = self.current_id();
                {
                    let task = &mut self.tasks[cur as usize];
                    task.resume_dst = dst;
                    task.state = TaskState::Blocked;
                }
                self.tasks[tid as usize].resumer = Some(cur);
                self.tasks[tid as usize].state = TaskState::Running;
                self.set_current(tid);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    fn channel_send(&mut self, id: u32, v: Value, rec: &DebugRecord) -> Result<(), VmError> {
        if !self.heap.is_alive(id) {
            return Err(self.error_at(rec, "nil dereference"));
        }
        if !matches!(self.heap.get(id).map(|c| &c.data), Some(HeapData::Channel(_))) {
            return Err(self.error_at(rec, "not a channel"));
        }
        // The channel (or the woken receiver) takes ownership of a copy.
        self.heap.retain(&v);
        let cur = self.current_id();

        enum Outcome {
            Delivered(u32),
            Buffered,
            Blocked,
        }
        let outcome = {
            let cell = self.heap.get_mut(id).expect("channel alive");
            let chan = match &mut cell.data {
                HeapData::Channel(chan) => chan,
                _ => unreachable!("checked above"),
            };
            if let Some(waiter) = chan.recv_wait.pop_front() {
                Outcome::Delivered(waiter)
            } else if chan.capacity == 0 || chan.buf.len() < chan.capacity {
                chan.buf.push_back(v.clone());
                Outcome::Buffered
            } else {
                chan.send_wait.push_back((cur, v.clone()));
                Outcome::Blocked
            }
        };
        match outcome {
            Outcome::Delivered(waiter) => {
                self.heap.mark_dirty(id);
                self.tasks[waiter as usize].wake_value = Some(v);
                self.tasks[waiter as usize].state = TaskState::Ready;
                self.queue_task(waiter);
            }
            Outcome::Buffered => {
                self.heap.mark_dirty(id);
            }
            Outcome::Blocked => {
                self.heap.mark_dirty(id);
                self.cur_mut().state = TaskState::Blocked;
                self.schedule_next();
            }
        }
        Ok(())
    }

    fn channel_recv(&mut self, id: u32, dst: u8, rec: &DebugRecord) -> Result<(), VmError> {
        if !self.heap.is_alive(id) {
            return Err(self.error_at(rec, "nil dereference"));
        }
        if !matches!(self.heap.get(id).map(|c| &c.data), Some(HeapData::Channel(_))) {
            return Err(self.error_at(rec, "not a channel"));
        }
        let cur = self.current_id();

        enum Outcome {
            Got(Value, Option<u32>),
            Blocked,
        }
        let outcome = {
            let cell = self.heap.get_mut(id).expect("channel alive");
            let chan = match &mut cell.data {
                HeapData::Channel(chan) => chan,
                _ => unreachable!("checked above"),
            };
            if let Some(v) = chan.buf.pop_front() {
                // Refill from a blocked sender, preserving FIFO order.
                let woken = chan.send_wait.pop_front().map(|(sender, pending)| {
                    chan.buf.push_back(pending);
                    sender
                });
                Outcome::Got(v, woken)
            } else {
                chan.recv_wait.push_back(cur);
                Outcome::Blocked
            }
        };
        match outcome {
            Outcome::Got(v, woken) => {
                self.heap.mark_dirty(id);
                // Ownership moves from the channel buffer to the register.
                self.install(dst, v);
                if let Some(sender) = woken {
                    self.tasks[sender as usize].state = TaskState::Ready;
                    self.queue_task(sender);
                }
            }
            Outcome::Blocked => {
                let task = &mut self.tasks[cur as usize];
                task.resume_dst = dst;
                task.state = TaskState::Blocked;
                self.schedule_next();
            }
        }
        Ok(())
    }

    // ========================================================================
    // Builtins
    // ========================================================================

    /// Execute a builtin. Arguments are borrowed; the returned value is
    /// owned (id-bearing results have been retained).
    fn call_builtin(
        &mut self,
        bid: u32,
        args: Vec<Value>,
        rec: &DebugRecord,
    ) -> Result<Value, VmError> {
        use super::builtins::id;
        let arity_err =
            |vm: &Vm, n: usize| vm.error_at(rec, format!("builtin arity mismatch: expected {n}"));
        match bid {
            id::PRINT | id::PRINTLN => {
                let mut text = String::new();
                for (i, v) in args.iter().enumerate() {
                    if i > 0 {
                        text.push(' ');
                    }
                    text.push_str(&self.display_value(v));
                }
                if bid == id::PRINTLN {
                    text.push('\n');
                }
                self.out.write(&text);
                Ok(Value::Nil)
            }
            id::LEN => {
                let v = args.first().ok_or_else(|| arity_err(self, 1))?;
                Ok(Value::Int(self.value_len(v, rec)?))
            }
            id::TO_STRING => {
                let v = args.first().ok_or_else(|| arity_err(self, 1))?;
                Ok(Value::str(self.display_value(v)))
            }
            id::PARSE_INT => {
                let v = args.first().ok_or_else(|| arity_err(self, 1))?;
                match v.as_str() {
                    Some(s) => match s.trim().parse::<i64>() {
                        Result::Ok(n) => Ok(Value::Ok(Box::new(Value::Int(n)))),
                        Result::Err(_) => Ok(Value::Err(Box::new(Value::str(format!(
                            "invalid integer: '{s}'"
                        ))))),
                    },
                    None => Err(self.error_at(rec, "parseInt expects a string")),
                }
            }
            id::PARSE_FLOAT => {
                let v = args.first().ok_or_else(|| arity_err(self, 1))?;
                match v.as_str() {
                    Some(s) => match s.trim().parse::<f64>() {
                        Result::Ok(n) => Ok(Value::Ok(Box::new(Value::Float(n)))),
                        Result::Err(_) => Ok(Value::Err(Box::new(Value::str(format!(
                            "invalid float: '{s}'"
                        ))))),
                    },
                    None => Err(self.error_at(rec, "parseFloat expects a string")),
                }
            }
            id::ABS => match args.first() {
                Some(Value::Int(v)) => v
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| self.error_at(rec, "integer overflow in 'abs'")),
                Some(Value::Float(v)) => Ok(Value::Float(v.abs())),
                _ => Err(self.error_at(rec, "abs expects a number")),
            },
            id::MIN | id::MAX => match (args.first(), args.get(1)) {
                (Some(Value::Int(x)), Some(Value::Int(y))) => Ok(Value::Int(if bid == id::MIN {
                    *x.min(y)
                } else {
                    *x.max(y)
                })),
                (Some(Value::Float(x)), Some(Value::Float(y))) => {
                    Ok(Value::Float(if bid == id::MIN {
                        x.min(*y)
                    } else {
                        x.max(*y)
                    }))
                }
                _ => Err(self.error_at(rec, "min/max expect two numbers")),
            },
            id::RAND => {
                let v = self.rng_mut().gen_range(0..i64::MAX);
                Ok(Value::Int(v))
            }
            id::SEED => {
                let v = args
                    .first()
                    .and_then(|v| v.as_int())
                    .ok_or_else(|| self.error_at(rec, "seed expects an int"))?;
                self.seed_rng(v as u64);
                Ok(Value::Nil)
            }
            id::READ_FILE => {
                let v = args.first().ok_or_else(|| arity_err(self, 1))?;
                match v.as_str() {
                    Some(path) => match std::fs::read_to_string(path) {
                        Result::Ok(text) => Ok(Value::Ok(Box::new(Value::str(text)))),
                        Result::Err(e) => {
                            Ok(Value::Err(Box::new(Value::str(format!("{path}: {e}")))))
                        }
                    },
                    None => Err(self.error_at(rec, "readFile expects a string path")),
                }
            }
            id::IS_SOME => Ok(Value::Bool(matches!(args.first(), Some(Value::Some(_))))),
            id::IS_NONE => Ok(Value::Bool(matches!(
                args.first(),
                Some(Value::NoneVal) | Some(Value::Nil)
            ))),
            id::IS_OK => Ok(Value::Bool(matches!(args.first(), Some(Value::Ok(_))))),
            id::IS_ERR => Ok(Value::Bool(matches!(args.first(), Some(Value::Err(_))))),
            id::UNWRAP => match args.first() {
                Some(Value::Some(inner)) | Some(Value::Ok(inner)) => {
                    let v = (**inner).clone();
                    self.heap.retain(&v);
                    Ok(v)
                }
                Some(Value::Err(inner)) => Err(self.error_at(
                    rec,
                    format!("unwrap of err value: {}", self.display_value(inner)),
                )),
                _ => Err(self.error_at(rec, "unwrap of none")),
            },
            id::UNWRAP_ERR => match args.first() {
                Some(Value::Err(inner)) => {
                    let v = (**inner).clone();
                    self.heap.retain(&v);
                    Ok(v)
                }
                _ => Err(self.error_at(rec, "unwrapErr of non-err value")),
            },
            id::PUSH => {
                let arr = args.first().ok_or_else(|| arity_err(self, 2))?;
                let v = args.get(1).ok_or_else(|| arity_err(self, 2))?;
                match arr {
                    Value::Array(aid) => {
                        self.array_ref(*aid, rec)?;
                        self.heap.retain(v);
                        if let Some(cell) = self.heap.get_mut(*aid) {
                            if let HeapData::Array(items) = &mut cell.data {
                                items.push(v.clone());
                            }
                        }
                        self.heap.mark_dirty(*aid);
                        Ok(Value::Nil)
                    }
                    _ => Err(self.error_at(rec, "push expects an array")),
                }
            }
            id::POP => {
                let arr = args.first().ok_or_else(|| arity_err(self, 1))?;
                match arr {
                    Value::Array(aid) => {
                        self.array_ref(*aid, rec)?;
                        let popped = self
                            .heap
                            .get_mut(*aid)
                            .and_then(|cell| match &mut cell.data {
                                HeapData::Array(items) => items.pop(),
                                _ => None,
                            })
                            .ok_or_else(|| self.error_at(rec, "pop from empty array"))?;
                        self.heap.mark_dirty(*aid);
                        Ok(popped)
                    }
                    _ => Err(self.error_at(rec, "pop expects an array")),
                }
            }
            id::INJECT => {
                let name = args
                    .first()
                    .and_then(|v| v.as_str().map(|s| s.to_string()))
                    .ok_or_else(|| self.error_at(rec, "inject expects (name, type, value)"))?;
                let ty = args
                    .get(1)
                    .and_then(|v| v.as_str().map(|s| s.to_string()))
                    .ok_or_else(|| self.error_at(rec, "inject expects (name, type, value)"))?;
                let value = args
                    .get(2)
                    .ok_or_else(|| self.error_at(rec, "inject expects (name, type, value)"))?;
                let snapshot = marshal::to_c(&self.heap, value);
                self.inject_log.push((name, ty, snapshot));
                Ok(Value::Nil)
            }
            id::CHR => {
                let v = args
                    .first()
                    .and_then(|v| v.as_int())
                    .ok_or_else(|| self.error_at(rec, "chr expects an int"))?;
                u32::try_from(v)
                    .ok()
                    .and_then(char::from_u32)
                    .map(Value::Char)
                    .ok_or_else(|| self.error_at(rec, format!("invalid char code {v}")))
            }
            id::ORD => match args.first() {
                Some(Value::Char(ch)) => Ok(Value::Int(*ch as i64)),
                _ => Err(self.error_at(rec, "ord expects a char")),
            },
            _ => Err(self.error_at(rec, format!("unknown builtin id {bid}"))),
        }
    }

    /// Human-readable rendering, following container contents through the
    /// heap.
    pub fn display_value(&self, v: &Value) -> String {
        match v {
            Value::Array(id) => match self.heap.get(*id).map(|c| &c.data) {
                Some(HeapData::Array(items)) => {
                    let parts: Vec<String> =
                        items.iter().map(|i| self.display_value(i)).collect();
                    format!("[{}]", parts.join(", "))
                }
                _ => "[]".to_string(),
            },
            Value::Tuple(id) => match self.heap.get(*id).map(|c| &c.data) {
                Some(HeapData::Tuple(items)) => {
                    let parts: Vec<String> =
                        items.iter().map(|i| self.display_value(i)).collect();
                    format!("({})", parts.join(", "))
                }
                _ => "()".to_string(),
            },
            Value::Object(id) => match self.heap.get(*id).map(|c| &c.data) {
                Some(HeapData::Object { type_name, fields }) => {
                    let mut names: Vec<&String> = fields.keys().collect();
                    names.sort();
                    let parts: Vec<String> = names
                        .iter()
                        .map(|k| format!("{k}: {}", self.display_value(&fields[*k])))
                        .collect();
                    format!("{type_name}{{{}}}", parts.join(", "))
                }
                _ => "nil".to_string(),
            },
            Value::Ref(id) => match self.heap.get(*id).filter(|c| c.alive).map(|c| &c.data) {
                Some(HeapData::Cell(inner)) => format!("ref({})", self.display_value(inner)),
                _ => "nil".to_string(),
            },
            Value::Some(inner) => format!("some({})", self.display_value(inner)),
            Value::Ok(inner) => format!("ok({})", self.display_value(inner)),
            Value::Err(inner) => format!("err({})", self.display_value(inner)),
            other => other.to_string(),
        }
    }

    fn deep_equals(&self, x: &Value, y: &Value) -> bool {
        match (x, y) {
            (Value::Array(a), Value::Array(b)) => {
                match (self.heap.get(*a).map(|c| &c.data), self.heap.get(*b).map(|c| &c.data)) {
                    (Some(HeapData::Array(xs)), Some(HeapData::Array(ys))) => {
                        xs.len() == ys.len()
                            && xs.iter().zip(ys.iter()).all(|(u, v)| self.deep_equals(u, v))
                    }
                    _ => false,
                }
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                match (self.heap.get(*a).map(|c| &c.data), self.heap.get(*b).map(|c| &c.data)) {
                    (Some(HeapData::Tuple(xs)), Some(HeapData::Tuple(ys))) => {
                        xs.len() == ys.len()
                            && xs.iter().zip(ys.iter()).all(|(u, v)| self.deep_equals(u, v))
                    }
                    _ => false,
                }
            }
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Some(a), Value::Some(b)) => self.deep_equals(a, b),
            (Value::Ok(a), Value::Ok(b)) => self.deep_equals(a, b),
            (Value::Err(a), Value::Err(b)) => self.deep_equals(a, b),
            _ => x == y,
        }
    }

    // ========================================================================
    // Finalizers
    // ========================================================================

    /// Pull one queued destructor call and run it as a synthetic frame on the
    /// current task. Runs between instructions only.
    fn drain_finalizers(&mut self) {
        if self.fatal || self.heap.finalize_queue.is_empty() {
            return;
        }
        let cur = self.current_id() as usize;
        let runnable = self.tasks[cur].state == TaskState::Running
            && !self.tasks[cur].frames.is_empty()
            && self.tasks[cur].frame().exit.is_none();
        if !runnable || self.call_depth() >= MAX_CALL_DEPTH {
            return;
        }
        let Some((fn_key, value)) = self.heap.finalize_queue.pop_front() else {
            return;
        };
        let Some(func_idx) = self.program.find_function(&fn_key) else {
            self.heap.release(&value);
            return;
        };
        let info = self.program.functions[func_idx].clone();
        if info.kind != FuncKind::Native {
            self.heap.release(&value);
            return;
        }
        let size = (info.param_count as usize + 1).max(info.max_register as usize + 1);
        let return_pc = self.cur().pc;
        let mut frame = Frame::new(func_idx as u32, size, return_pc, 0);
        frame.discard_result = true;
        // Ownership of the queued value moves into the frame.
        frame.regs[0] = value;
        let task = self.cur_mut();
        task.frames.push(frame);
        task.pc = info.start_pc as usize;
    }
}
