//! The virtual machine: dispatch loop, opcode handlers, scope resolution,
//! the coroutine chain and the embedding surface.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Write};

use regex::Regex;

use crate::bytecode::{disassembler, Code, Emitter, Opcode};
use crate::error::{RillError, RuntimeError};
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::runtime::heap::{CorState, Coroutine, Frame, Heap, MAX_LOCALS};
use crate::runtime::library;
use crate::runtime::strings::Interner;
use crate::runtime::value::{Callback, CorId, MapId, StrId, Sub, Value, VecId};

pub type RunResult<T> = Result<T, RuntimeError>;

/// Map lookup scans linearly below this size.
const MAP_SCAN_LINEAR: usize = 16;
/// Longest string the concat operator may build.
const STR_MAX: usize = crate::lexer::STR_MAX;
/// Call frames per coroutine.
const MAX_FRAMES: usize = 256;
/// Nested container depth rendered by `text` before eliding.
const TEXT_DEPTH: usize = 16;

/// Construction parameters: ordered named source modules, named native
/// callback registrations, and an opaque host value.
pub struct VmConfig {
    pub modules: Vec<(String, String)>,
    pub registry: Vec<(String, Callback)>,
    pub custom: Option<Box<dyn Any>>,
}

impl VmConfig {
    pub fn from_source(source: &str) -> Self {
        Self {
            modules: vec![("main".to_string(), source.to_string())],
            registry: Vec::new(),
            custom: None,
        }
    }

    pub fn module(mut self, name: &str, source: &str) -> Self {
        self.modules.push((name.to_string(), source.to_string()));
        self
    }

    pub fn register(mut self, name: &str, callback: Callback) -> Self {
        self.registry.push((name.to_string(), callback));
        self
    }

    pub fn custom(mut self, custom: Box<dyn Any>) -> Self {
        self.custom = Some(custom);
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            registry: Vec::new(),
            custom: None,
        }
    }
}

/// Where a name resolved, for write-back through the same binding.
enum Place {
    Local(usize),
    Up(usize, usize),
    Scope(MapId),
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) strings: Interner,
    pub(crate) code: Vec<Code>,
    /// Coroutine chain; index 0 is the main routine during a run.
    pub(crate) routines: Vec<CorId>,
    /// The currently executing coroutine (the chain top).
    pub(crate) routine: Option<CorId>,
    pub(crate) scope_core: MapId,
    pub(crate) scope_global: Option<MapId>,
    /// Compiled modules: name and entry instruction.
    pub(crate) modules: Vec<(StrId, usize)>,
    /// Per-run inline cache for fused call sites.
    pub(crate) cfunc_cache: Vec<Value>,
    pub(crate) cfunc_slots: u32,
    /// Ancestor function ids per subroutine entry, for capture snapshots.
    pub(crate) fn_paths: HashMap<u32, Vec<u32>>,
    /// Compiled patterns for the match operator.
    pub(crate) regexes: HashMap<StrId, Regex>,
    /// Function-id counter carried across module compilations.
    next_fn_id: u32,
    custom: Option<Box<dyn Any>>,
    pub(crate) out: Box<dyn Write>,
    last_error: Option<String>,
}

impl Vm {
    /// Create a VM: compile all modules, intern their strings, promote the
    /// interner's young region, assign inline-cache slots and collect once.
    pub fn new(config: VmConfig) -> Result<Vm, RillError> {
        let mut heap = Heap::new();
        let scope_core = heap.alloc_map();

        let mut vm = Vm {
            heap,
            strings: Interner::new(),
            code: Vec::new(),
            routines: Vec::new(),
            routine: None,
            scope_core,
            scope_global: None,
            modules: Vec::new(),
            cfunc_cache: Vec::new(),
            cfunc_slots: 0,
            fn_paths: HashMap::new(),
            regexes: HashMap::new(),
            next_fn_id: 0,
            custom: config.custom,
            out: Box::new(io::stdout()),
            last_error: None,
        };

        library::install(&mut vm)?;

        for (name, callback) in &config.registry {
            let key = Value::Str(vm.strings.intern(name));
            vm.map_set(vm.scope_core, key, Value::Callback(*callback))?;
        }

        for (name, source) in &config.modules {
            let name_id = vm.strings.intern(name);
            let entry = vm.code.len();
            vm.compile_source(source)?;
            vm.modules.push((name_id, entry));
        }

        let mut slots = 0u32;
        for cell in vm.code.iter_mut() {
            if cell.op == Opcode::Cfunc {
                cell.cache = slots;
                slots += 1;
            }
        }
        vm.cfunc_slots = slots;

        vm.strings.promote();
        vm.collect();
        Ok(vm)
    }

    /// Single anonymous module, no registrations.
    pub fn from_source(source: &str) -> Result<Vm, RillError> {
        Vm::new(VmConfig::from_source(source))
    }

    fn compile_source(&mut self, source: &str) -> Result<(), RillError> {
        let tokens = Scanner::new(source).scan_tokens()?;
        let mut parser = Parser::new(tokens, &mut self.strings);
        parser.next_fn_id = self.next_fn_id;
        let nodes = parser.parse()?;
        self.next_fn_id = parser.next_fn_id;

        let mut emitter = Emitter::new(&mut self.code, &mut self.heap, &mut self.fn_paths);
        emitter.emit_module(&nodes)?;
        Ok(())
    }

    /// Execute modules by index, in order, on a fresh runtime state.
    pub fn run(&mut self, modules: &[usize]) -> Result<(), RillError> {
        self.last_error = None;
        self.cfunc_cache = vec![Value::Nil; self.cfunc_slots as usize];

        let main = self.heap.alloc_cor();
        self.heap.cor_mut(main).state = CorState::Running;
        self.routines.push(main);
        self.routine = Some(main);
        self.scope_global = Some(self.heap.alloc_map());

        let result = self.exec_modules(modules);
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        self.reset();
        result.map_err(RillError::from)
    }

    /// Execute the first module.
    pub fn run_main(&mut self) -> Result<(), RillError> {
        self.run(&[0])
    }

    fn exec_modules(&mut self, modules: &[usize]) -> RunResult<()> {
        for &index in modules {
            let Some(&(_, entry)) = self.modules.get(index) else {
                return Err(RuntimeError::new(format!("invalid module {}", index)));
            };
            self.cor_mut().ip = entry;
            while self.tick()? {}
        }
        Ok(())
    }

    /// Drop per-run state and collect.
    fn reset(&mut self) {
        self.scope_global = None;
        self.routines.clear();
        self.routine = None;
        self.cfunc_cache.clear();
        self.collect();
    }

    /// The last run's failure message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Render the compiled bytecode.
    pub fn disassemble(&self) -> String {
        disassembler::disassemble(&self.code, &self.strings)
    }

    // ===== Current routine =====

    pub(crate) fn routine_id(&self) -> CorId {
        self.routine.expect("no active routine")
    }

    pub(crate) fn cor(&self) -> &Coroutine {
        self.heap.cor(self.routine_id())
    }

    pub(crate) fn cor_mut(&mut self) -> &mut Coroutine {
        self.heap.cor_mut(self.routine_id())
    }

    // ===== Operand stack =====

    /// Depth of the current subframe (values above the top mark).
    pub fn depth(&self) -> usize {
        let cor = self.cor();
        let base = cor.marks.last().copied().unwrap_or(0);
        cor.stack.len() - base
    }

    pub fn push(&mut self, value: Value) {
        self.cor_mut().stack.push(value);
    }

    pub fn pop(&mut self) -> RunResult<Value> {
        self.cor_mut()
            .stack
            .pop()
            .ok_or_else(|| RuntimeError::internal("stack underflow"))
    }

    pub fn top(&self) -> RunResult<Value> {
        self.cor()
            .stack
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::internal("stack underflow"))
    }

    /// Subframe value by index from the current mark.
    pub fn item(&self, index: usize) -> RunResult<Value> {
        let cor = self.cor();
        let base = cor.marks.last().copied().unwrap_or(0);
        cor.stack
            .get(base + index)
            .copied()
            .ok_or_else(|| RuntimeError::internal("subframe index out of range"))
    }

    /// Subframe value: `index >= 0` from the subframe base, negative from
    /// the stack top.
    pub fn pick(&self, index: i64) -> RunResult<Value> {
        if index >= 0 {
            self.item(index as usize)
        } else {
            let cor = self.cor();
            let at = cor.stack.len() as i64 + index;
            cor.stack
                .get(at.max(0) as usize)
                .copied()
                .ok_or_else(|| RuntimeError::internal("stack index out of range"))
        }
    }

    fn opush(&mut self, value: Value) {
        self.cor_mut().other.push(value);
    }

    fn opop(&mut self) -> RunResult<Value> {
        self.cor_mut()
            .other
            .pop()
            .ok_or_else(|| RuntimeError::internal("shunt stack underflow"))
    }

    fn otop(&self) -> RunResult<Value> {
        self.cor()
            .other
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::internal("shunt stack underflow"))
    }

    pub(crate) fn pop_float(&mut self) -> RunResult<f64> {
        match self.pop()? {
            Value::Float(f) => Ok(f),
            Value::Int(n) => Ok(n as f64),
            other => Err(RuntimeError::type_error(format!(
                "expected number, found {}",
                other.type_name()
            ))),
        }
    }

    // ===== Dispatch =====

    /// Fetch, advance, execute one instruction. Ok(false) on STOP.
    pub(crate) fn tick(&mut self) -> RunResult<bool> {
        let ip = self.cor().ip;
        let cell = *self
            .code
            .get(ip)
            .ok_or_else(|| RuntimeError::internal("instruction pointer out of range"))?;
        self.cor_mut().ip = ip + 1;

        match cell.op {
            Opcode::Stop => return Ok(false),
            Opcode::Jmp => self.op_jmp(cell.item)?,
            Opcode::Jfalse => {
                if !self.truth(self.top()?) {
                    self.op_jmp(cell.item)?;
                }
            }
            Opcode::Jtrue => {
                if self.truth(self.top()?) {
                    self.op_jmp(cell.item)?;
                }
            }
            Opcode::And => {
                if self.truth(self.top()?) {
                    self.pop()?;
                } else {
                    self.op_jmp(cell.item)?;
                }
            }
            Opcode::Or => {
                if self.truth(self.top()?) {
                    self.op_jmp(cell.item)?;
                } else {
                    self.pop()?;
                }
            }
            Opcode::Return => self.op_return()?,
            Opcode::Call => {
                let func = self.pop()?;
                self.call_value(func)?;
            }
            Opcode::For => self.op_for(cell.item)?,
            Opcode::Loop => self.op_loop(cell.item)?,
            Opcode::Unloop => self.op_unloop()?,
            Opcode::Break => self.op_break()?,
            Opcode::Continue => self.op_continue()?,

            Opcode::Mark => self.op_mark(),
            Opcode::Limit => self.limit(literal_int(cell.item))?,
            Opcode::Clean => self.op_clean(),
            Opcode::Copy => {
                let value = self.top()?;
                self.push(value);
            }
            Opcode::Shunt => {
                let value = self.pop()?;
                self.opush(value);
            }
            Opcode::Shift => {
                let value = self.opop()?;
                self.push(value);
            }
            Opcode::Drop => {
                self.pop()?;
            }

            Opcode::Lit => self.op_lit(cell.item)?,
            Opcode::Find => {
                let key = self.pop_name()?;
                self.op_find(key)?;
            }
            Opcode::Get => {
                let key = self.pop()?;
                let src = self.pop()?;
                let value = self.get_value(src, key)?;
                self.push(value);
            }
            Opcode::Set => self.op_set(cell.item)?,
            Opcode::Assign => self.op_assign(cell.item)?,
            Opcode::Pid => self.op_pid(cell.item)?,
            Opcode::Global => {
                let global = self
                    .scope_global
                    .ok_or_else(|| RuntimeError::internal("no global scope"))?;
                self.push(Value::Map(global));
            }

            Opcode::Add => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.arith_add(a, b)?;
                self.push(value);
            }
            Opcode::Sub => {
                let b = self.pop()?;
                let negated = self.negate(b)?;
                let a = self.pop()?;
                let value = self.arith_add(a, negated)?;
                self.push(value);
            }
            Opcode::Mul => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.arith_mul(a, b)?;
                self.push(value);
            }
            Opcode::Div => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.arith_div(a, b)?;
                self.push(value);
            }
            Opcode::Mod => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.arith_mod(a, b)?;
                self.push(value);
            }
            Opcode::Neg => {
                let a = self.pop()?;
                let value = self.negate(a)?;
                self.push(value);
            }
            Opcode::Not => {
                let a = self.pop()?;
                let value = !self.truth(a);
                self.push(Value::Bool(value));
            }
            Opcode::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.value_eq(a, b)?;
                self.push(Value::Bool(value));
            }
            Opcode::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = !self.value_eq(a, b)?;
                self.push(Value::Bool(value));
            }
            Opcode::Lt => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.value_lt(a, b)?;
                self.push(Value::Bool(value));
            }
            Opcode::Gt => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = !self.value_lt(a, b)? && !self.value_eq(a, b)?;
                self.push(Value::Bool(value));
            }
            Opcode::Lte => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = self.value_lt(a, b)? || self.value_eq(a, b)?;
                self.push(Value::Bool(value));
            }
            Opcode::Gte => {
                let b = self.pop()?;
                let a = self.pop()?;
                let value = !self.value_lt(a, b)?;
                self.push(Value::Bool(value));
            }
            Opcode::Concat => self.op_concat()?,
            Opcode::Count => {
                let a = self.pop()?;
                let n = self.count(a)?;
                self.push(Value::Int(n));
            }
            Opcode::Match => self.op_match()?,
            Opcode::Unpack => self.op_unpack()?,

            Opcode::Vector => {
                let id = self.heap.alloc_vector();
                self.opush(Value::Vector(id));
            }
            Opcode::Vpush => self.op_vpush()?,
            Opcode::Map => self.op_map(),
            Opcode::Unmap => self.op_unmap()?,
            Opcode::MetaSet => self.op_meta_set()?,
            Opcode::MetaGet => self.op_meta_get()?,

            Opcode::Coroutine => self.op_coroutine()?,
            Opcode::Resume => self.op_resume()?,
            Opcode::Yield => self.op_yield()?,

            Opcode::Fname => {
                let Value::Str(key) = cell.item else {
                    return Err(RuntimeError::internal("fname literal is not a name"));
                };
                self.op_find(key)?;
            }
            Opcode::Gname => {
                let src = self.pop()?;
                let value = self.get_value(src, cell.item)?;
                self.push(value);
            }
            Opcode::Cfunc => self.op_cfunc(cell)?,
            Opcode::Assignl => {
                let value = if self.depth() > 0 {
                    self.item(0)?
                } else {
                    Value::Nil
                };
                self.assign(cell.item, value)?;
            }
            Opcode::Assignp => {
                let value = self.pop()?;
                self.assign(cell.item, value)?;
            }
            Opcode::Addl => {
                let a = self.pop()?;
                let value = self.arith_add(a, cell.item)?;
                self.push(value);
            }
            Opcode::Mull => {
                let a = self.pop()?;
                let value = self.arith_mul(a, cell.item)?;
                self.push(value);
            }
            Opcode::Copies => {
                let value = self.top()?;
                for _ in 0..literal_int(cell.item) {
                    self.push(value);
                }
            }
            Opcode::Update => self.op_update(cell.item)?,
        }

        Ok(true)
    }

    // ===== Control =====

    fn op_jmp(&mut self, item: Value) -> RunResult<()> {
        let target = item
            .as_int()
            .ok_or_else(|| RuntimeError::internal("jump target is not an index"))?;
        self.cor_mut().ip = target as usize;
        Ok(())
    }

    pub(crate) fn op_mark(&mut self) {
        let depth = self.cor().stack.len();
        self.cor_mut().marks.push(depth);
    }

    /// Pop a mark and truncate or nil-pad the subframe to `count` values;
    /// a negative count leaves the values in place.
    pub(crate) fn limit(&mut self, count: i64) -> RunResult<()> {
        let cor = self.cor_mut();
        let base = cor
            .marks
            .pop()
            .ok_or_else(|| RuntimeError::internal("mark stack underflow"))?;
        if count >= 0 {
            let want = base + count as usize;
            if want < cor.stack.len() {
                cor.stack.truncate(want);
            } else {
                cor.stack.resize(want, Value::Nil);
            }
        }
        Ok(())
    }

    fn op_clean(&mut self) {
        let depth = self.depth();
        let cor = self.cor_mut();
        let keep = cor.stack.len() - depth;
        cor.stack.truncate(keep);
    }

    fn arrive(&mut self, ip: usize) -> RunResult<()> {
        let cor = self.cor_mut();
        if cor.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::new("call stack overflow"));
        }
        let frame = Frame {
            loops: cor.loops.len(),
            marks: cor.marks.len(),
            ip: cor.ip,
            map: cor.map,
            locals: Vec::new(),
            path: Vec::new(),
            captures: None,
        };
        cor.map = Value::Nil;
        cor.frames.push(frame);
        cor.ip = ip;
        Ok(())
    }

    fn depart(&mut self) -> RunResult<()> {
        let cor = self.cor_mut();
        let frame = cor
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::internal("call stack underflow"))?;
        cor.ip = frame.ip;
        cor.marks.truncate(frame.marks);
        cor.loops.truncate(frame.loops);
        cor.map = frame.map;
        Ok(())
    }

    pub(crate) fn call_value(&mut self, func: Value) -> RunResult<()> {
        match func {
            Value::Callback(callback) => callback(self),
            Value::Subroutine(sub) => {
                let args = self.depth();
                self.arrive(sub.entry as usize)?;
                let cor = self.cor_mut();
                if let Some(frame) = cor.frames.last_mut() {
                    frame.captures = sub.captures;
                }
                // the subroutine sees its arguments as item(0..argc-1)
                let base = cor.stack.len() - args;
                cor.marks.push(base);
                Ok(())
            }
            other => Err(RuntimeError::type_error(format!(
                "invalid function: {}",
                other.type_name()
            ))),
        }
    }

    fn op_return(&mut self) -> RunResult<()> {
        // results above the subframe mark migrate to the caller when the
        // marks stack is truncated
        self.depart()?;
        if self.cor().ip == 0 {
            // a coroutine's outermost frame restores the sentinel ip 0
            self.cor_mut().state = CorState::Dead;
            self.op_yield()?;
        }
        Ok(())
    }

    // ===== Loops =====

    fn op_loop(&mut self, item: Value) -> RunResult<()> {
        let marks = self.cor().marks.len();
        let stack = self.cor().stack.len();
        let cor = self.cor_mut();
        cor.loops.push(marks);
        cor.loops.push(stack);
        cor.loops.push(literal_int(item) as usize);
        cor.loops.push(0);
        Ok(())
    }

    fn op_unloop(&mut self) -> RunResult<()> {
        let cor = self.cor_mut();
        if cor.loops.len() < 4 {
            return Err(RuntimeError::internal("loop stack underflow"));
        }
        cor.loops.pop();
        cor.loops.pop();
        cor.loops.pop();
        let marks = cor.loops.pop().unwrap_or(0);
        if marks != cor.marks.len() {
            return Err(RuntimeError::internal("mark stack mismatch (unloop)"));
        }
        Ok(())
    }

    fn loop_cells(&self) -> RunResult<(usize, usize, usize, usize)> {
        let loops = &self.cor().loops;
        if loops.len() < 4 {
            return Err(RuntimeError::new("loop control outside loop"));
        }
        let len = loops.len();
        Ok((loops[len - 4], loops[len - 3], loops[len - 2], loops[len - 1]))
    }

    fn op_break(&mut self) -> RunResult<()> {
        let (marks, stack, end, _) = self.loop_cells()?;
        let cor = self.cor_mut();
        cor.ip = end;
        cor.marks.truncate(marks);
        cor.stack.truncate(stack);
        Ok(())
    }

    fn op_continue(&mut self) -> RunResult<()> {
        let (marks, stack, end, _) = self.loop_cells()?;
        let cor = self.cor_mut();
        // the instruction before the loop end is the backedge jump
        cor.ip = end - 1;
        cor.marks.truncate(marks);
        cor.stack.truncate(stack);
        Ok(())
    }

    fn op_for(&mut self, item: Value) -> RunResult<()> {
        let Value::Vector(vars_id) = item else {
            return Err(RuntimeError::internal("for literal is not a name vector"));
        };
        let names: Vec<StrId> = self
            .heap
            .vector(vars_id)
            .items
            .iter()
            .filter_map(|v| match v {
                Value::Str(id) => Some(*id),
                _ => None,
            })
            .collect();

        let (_, _, end, step) = self.loop_cells()?;
        let iter = self.top()?;

        match iter {
            Value::Int(limit) => {
                if step as i64 >= limit {
                    self.cor_mut().ip = end;
                } else {
                    let mut names = names.iter();
                    if names.len() > 1 {
                        let key = *names.next().unwrap_or(&StrId(0));
                        self.assign(Value::Str(key), Value::Int(step as i64))?;
                    }
                    if let Some(&name) = names.next() {
                        self.assign(Value::Str(name), Value::Int(step as i64))?;
                    }
                }
            }
            Value::Vector(id) => {
                if step >= self.heap.vector(id).items.len() {
                    self.cor_mut().ip = end;
                } else {
                    let value = self.heap.vector(id).items[step];
                    let mut names = names.iter();
                    if names.len() > 1 {
                        let key = *names.next().unwrap_or(&StrId(0));
                        self.assign(Value::Str(key), Value::Int(step as i64))?;
                    }
                    if let Some(&name) = names.next() {
                        self.assign(Value::Str(name), value)?;
                    }
                }
            }
            Value::Map(id) => {
                if step >= self.heap.map(id).keys.len() {
                    self.cor_mut().ip = end;
                } else {
                    let key = self.heap.map(id).keys[step];
                    let value = self.heap.map(id).vals[step];
                    let mut names = names.iter();
                    if names.len() > 1 {
                        let name = *names.next().unwrap_or(&StrId(0));
                        self.assign(Value::Str(name), key)?;
                    }
                    if let Some(&name) = names.next() {
                        self.assign(Value::Str(name), value)?;
                    }
                }
            }
            Value::Subroutine(_) | Value::Callback(_) => {
                // generator protocol: called with the 0-based step, returns
                // (value[, key]) or nil to terminate
                let rets = self.call_method(iter, &[Value::Int(step as i64)], 2)?;
                if rets[0].is_nil() {
                    self.cor_mut().ip = end;
                } else if names.len() > 1 {
                    self.assign(Value::Str(names[0]), rets[1])?;
                    self.assign(Value::Str(names[1]), rets[0])?;
                } else if let Some(&name) = names.first() {
                    self.assign(Value::Str(name), rets[0])?;
                }
            }
            Value::Coroutine(cor_id) => {
                self.op_mark();
                self.push(iter);
                self.push(Value::Int(step as i64));
                self.op_resume()?;
                while self.routine == Some(cor_id) {
                    if !self.tick()? {
                        break;
                    }
                }
                let finished = self.depth() == 0 || self.item(0)?.is_nil();
                if finished {
                    self.cor_mut().ip = end;
                } else {
                    let mut index = 0usize;
                    let mut names = names.iter();
                    if names.len() > 1 {
                        let name = *names.next().unwrap_or(&StrId(0));
                        let value = self.item_or_nil(index);
                        index += 1;
                        self.assign(Value::Str(name), value)?;
                    }
                    if let Some(&name) = names.next() {
                        let value = self.item_or_nil(index);
                        self.assign(Value::Str(name), value)?;
                    }
                }
                self.limit(0)?;
            }
            other => {
                return Err(RuntimeError::type_error(format!(
                    "cannot iterate {}",
                    other.type_name()
                )));
            }
        }

        let cor = self.cor_mut();
        let len = cor.loops.len();
        cor.loops[len - 1] = step + 1;
        Ok(())
    }

    fn item_or_nil(&self, index: usize) -> Value {
        if self.depth() > index {
            self.item(index).unwrap_or(Value::Nil)
        } else {
            Value::Nil
        }
    }

    // ===== Coroutines =====

    pub(crate) fn op_coroutine(&mut self) -> RunResult<()> {
        if self.depth() == 0 {
            return Err(RuntimeError::type_error("coroutine missing subroutine"));
        }
        let Value::Subroutine(sub) = self.item(0)? else {
            return Err(RuntimeError::type_error("coroutine missing subroutine"));
        };

        let new_cor = self.heap.alloc_cor();
        self.routines.push(new_cor);
        self.routine = Some(new_cor);

        self.heap.cor_mut(new_cor).state = CorState::Running;
        self.arrive(sub.entry as usize)?;
        if let Some(frame) = self.heap.cor_mut(new_cor).frames.last_mut() {
            frame.captures = sub.captures;
        }
        self.op_mark();
        self.heap.cor_mut(new_cor).state = CorState::Suspended;

        self.routines.pop();
        let prev = *self
            .routines
            .last()
            .ok_or_else(|| RuntimeError::internal("routine chain underflow"))?;
        self.routine = Some(prev);

        self.op_clean();
        self.push(Value::Coroutine(new_cor));
        Ok(())
    }

    pub(crate) fn op_resume(&mut self) -> RunResult<()> {
        if self.depth() == 0 {
            return Err(RuntimeError::type_error("resume missing coroutine"));
        }
        let Value::Coroutine(target) = self.item(0)? else {
            return Err(RuntimeError::type_error("resume missing coroutine"));
        };

        let items = self.depth();
        let caller = self.routine_id();

        if self.heap.cor(target).state == CorState::Dead {
            let cor = self.heap.cor_mut(caller);
            let keep = cor.stack.len() - items;
            cor.stack.truncate(keep);
            cor.stack.push(Value::Nil);
            return Ok(());
        }

        // transfer the arguments, dropping the coroutine itself
        let mut moved = {
            let cor = self.heap.cor_mut(caller);
            let at = cor.stack.len() - items;
            cor.stack.split_off(at)
        };
        moved.remove(0);

        self.heap.cor_mut(target).state = CorState::Running;
        self.routines.push(target);
        self.routine = Some(target);
        self.heap.cor_mut(target).stack.extend(moved);
        Ok(())
    }

    pub(crate) fn op_yield(&mut self) -> RunResult<()> {
        if self.routines.len() < 2 {
            return Err(RuntimeError::new("yield outside coroutine"));
        }
        let items = self.depth();
        let yielder = self.routine_id();

        let moved = {
            let cor = self.heap.cor_mut(yielder);
            let at = cor.stack.len() - items;
            cor.stack.split_off(at)
        };

        {
            let cor = self.heap.cor_mut(yielder);
            if cor.state != CorState::Dead {
                cor.state = CorState::Suspended;
            }
        }

        self.routines.pop();
        let next = *self
            .routines
            .last()
            .ok_or_else(|| RuntimeError::internal("routine chain underflow"))?;
        self.routine = Some(next);
        self.heap.cor_mut(next).stack.extend(moved);
        Ok(())
    }

    /// Run `func` to completion on the current coroutine, returning `rets`
    /// results. Used by meta-method dispatch and the generator protocol;
    /// re-enters the dispatch loop for subroutines.
    pub(crate) fn call_method(
        &mut self,
        func: Value,
        args: &[Value],
        rets: usize,
    ) -> RunResult<Vec<Value>> {
        if !func.is_callable() {
            return Err(RuntimeError::type_error("invalid method"));
        }

        let home = self.routine_id();
        let frames = self.cor().frames.len();

        self.op_mark();
        for arg in args {
            self.push(*arg);
        }
        self.call_value(func)?;

        if matches!(func, Value::Subroutine(_)) {
            loop {
                if !self.tick()? {
                    break;
                }
                if self.routine != Some(home) {
                    continue;
                }
                if self.cor().frames.len() > frames {
                    continue;
                }
                break;
            }
        }

        let mut out = vec![Value::Nil; rets];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.item_or_nil(i);
        }
        self.limit(0)?;
        Ok(out)
    }

    // ===== Binding =====

    fn pop_name(&mut self) -> RunResult<StrId> {
        match self.pop()? {
            Value::Str(id) => Ok(id),
            other => Err(RuntimeError::type_error(format!(
                "name is not a string: {}",
                other.type_name()
            ))),
        }
    }

    fn local_slot(&self, key: StrId) -> Option<usize> {
        let frame = self.cor().frames.last()?;
        frame.locals.iter().position(|(name, _)| *name == key)
    }

    /// Search older frames for a lexical ancestor holding `key`. Only
    /// frames whose function id appears in the current frame's ancestor
    /// path qualify; recursive calls of the current function are skipped.
    fn uplocal(&self, key: StrId) -> Option<(usize, usize)> {
        let cor = self.cor();
        if cor.frames.len() < 2 {
            return None;
        }
        let pids = &cor.frames.last()?.path;
        if pids.len() < 2 {
            return None;
        }

        let mut index = cor.frames.len() - 1;
        while index > 0 {
            index -= 1;
            let uframe = &cor.frames[index];
            let Some(&pid) = uframe.path.first() else {
                continue;
            };
            if pids[1..].contains(&pid) {
                if let Some(slot) = uframe.locals.iter().position(|(name, _)| *name == key) {
                    return Some((index, slot));
                }
            }
        }
        None
    }

    /// Resolve a name through the full scope chain: locals, lexical
    /// ancestors, capture snapshot, globals, core.
    fn find_place(&mut self, key: StrId) -> RunResult<Option<(Place, Value)>> {
        if let Some(slot) = self.local_slot(key) {
            let value = self.cor().frames.last().map(|f| f.locals[slot].1);
            return Ok(value.map(|v| (Place::Local(slot), v)));
        }
        if let Some((frame, slot)) = self.uplocal(key) {
            let value = self.cor().frames[frame].locals[slot].1;
            return Ok(Some((Place::Up(frame, slot), value)));
        }
        if let Some(captures) = self.cor().frames.last().and_then(|f| f.captures) {
            if let Some(value) = self.map_get(captures, Value::Str(key))? {
                return Ok(Some((Place::Scope(captures), value)));
            }
        }
        if let Some(global) = self.scope_global {
            if let Some(value) = self.map_get(global, Value::Str(key))? {
                return Ok(Some((Place::Scope(global), value)));
            }
        }
        if let Some(value) = self.map_get(self.scope_core, Value::Str(key))? {
            return Ok(Some((Place::Scope(self.scope_core), value)));
        }
        Ok(None)
    }

    fn write_place(&mut self, place: Place, key: StrId, value: Value) -> RunResult<()> {
        match place {
            Place::Local(slot) => {
                if let Some(frame) = self.cor_mut().frames.last_mut() {
                    frame.locals[slot].1 = value;
                }
                Ok(())
            }
            Place::Up(frame, slot) => {
                self.cor_mut().frames[frame].locals[slot].1 = value;
                Ok(())
            }
            Place::Scope(map) => self.map_set(map, Value::Str(key), value),
        }
    }

    fn op_find(&mut self, key: StrId) -> RunResult<()> {
        let Some((_, value)) = self.find_place(key)? else {
            return Err(RuntimeError::unknown_name(self.strings.get(key)));
        };
        self.push(value);
        Ok(())
    }

    fn op_cfunc(&mut self, cell: Code) -> RunResult<()> {
        let slot = cell.cache as usize;
        let cached = self.cfunc_cache.get(slot).copied().unwrap_or(Value::Nil);
        if cached.is_callable() {
            return self.call_value(cached);
        }

        let Value::Str(key) = cell.item else {
            return Err(RuntimeError::internal("cfunc literal is not a name"));
        };
        let Some((_, value)) = self.find_place(key)? else {
            return Err(RuntimeError::unknown_name(self.strings.get(key)));
        };
        if let Some(entry) = self.cfunc_cache.get_mut(slot) {
            *entry = value;
        }
        self.call_value(value)
    }

    fn op_update(&mut self, item: Value) -> RunResult<()> {
        let Value::Str(key) = item else {
            return Err(RuntimeError::internal("update literal is not a name"));
        };
        let Some((place, value)) = self.find_place(key)? else {
            return Err(RuntimeError::unknown_name(self.strings.get(key)));
        };
        self.push(value);
        // execute the fused operation that follows
        self.tick()?;
        let updated = self.pop()?;
        self.write_place(place, key, updated)
    }

    /// Bind `key` to `val`: pending map literal first, then frame locals,
    /// then the global scope.
    pub(crate) fn assign(&mut self, key: Value, value: Value) -> RunResult<()> {
        let pending = match self.cor().map {
            Value::Map(id) => Some(id),
            _ => None,
        };

        if pending.is_none() && !self.cor().frames.is_empty() {
            let Value::Str(name) = key else {
                return Err(RuntimeError::internal("local name is not a string"));
            };
            if let Some(slot) = self.local_slot(name) {
                if let Some(frame) = self.cor_mut().frames.last_mut() {
                    frame.locals[slot].1 = value;
                }
                return Ok(());
            }
            let frame = self
                .cor_mut()
                .frames
                .last_mut()
                .ok_or_else(|| RuntimeError::internal("no frame for local"))?;
            if frame.locals.len() >= MAX_LOCALS {
                return Err(RuntimeError::new(format!(
                    "max {} locals per frame",
                    MAX_LOCALS
                )));
            }
            frame.locals.push((name, value));
            return Ok(());
        }

        let target = match pending {
            Some(map) => map,
            None => self
                .scope_global
                .ok_or_else(|| RuntimeError::internal("no global scope"))?,
        };
        self.map_set(target, key, value)
    }

    fn op_assign(&mut self, item: Value) -> RunResult<()> {
        let key = self.pop()?;
        let index = literal_int(item) as usize;
        let value = if self.depth() > index {
            self.item(index)?
        } else {
            Value::Nil
        };
        self.assign(key, value)
    }

    fn op_set(&mut self, item: Value) -> RunResult<()> {
        let key = self.pop()?;
        let dst = self.pop()?;
        let index = literal_int(item) as usize;
        let value = if self.depth() > index {
            self.item(index)?
        } else {
            Value::Nil
        };
        self.set_value(dst, key, value)
    }

    fn op_pid(&mut self, item: Value) -> RunResult<()> {
        let id = literal_int(item) as u32;
        let frame = self
            .cor_mut()
            .frames
            .last_mut()
            .ok_or_else(|| RuntimeError::internal("pid outside frame"))?;
        frame.path.push(id);
        Ok(())
    }

    fn op_lit(&mut self, item: Value) -> RunResult<()> {
        let value = match item {
            // a function literal with lexical ancestors snapshots their
            // live locals so it can escape its defining call
            Value::Subroutine(sub) if sub.captures.is_none() => {
                match self.snapshot_captures(sub.entry)? {
                    Some(captures) => Value::Subroutine(Sub {
                        entry: sub.entry,
                        captures: Some(captures),
                    }),
                    None => item,
                }
            }
            _ => item,
        };
        self.push(value);
        Ok(())
    }

    fn snapshot_captures(&mut self, entry: u32) -> RunResult<Option<MapId>> {
        let Some(ancestors) = self.fn_paths.get(&entry) else {
            return Ok(None);
        };
        if ancestors.is_empty() || self.routine.is_none() || self.cor().frames.is_empty() {
            return Ok(None);
        }
        let ancestors = ancestors.clone();

        // outermost first, so nearer frames overwrite
        let mut sources: Vec<(Option<MapId>, Vec<(StrId, Value)>)> = Vec::new();
        for frame in &self.cor().frames {
            let Some(&pid) = frame.path.first() else {
                continue;
            };
            if !ancestors.contains(&pid) {
                continue;
            }
            sources.push((frame.captures, frame.locals.clone()));
        }
        if sources.is_empty() {
            return Ok(None);
        }

        let map = self.heap.alloc_map();
        for (captures, locals) in sources {
            if let Some(from) = captures {
                let len = self.heap.map(from).keys.len();
                for i in 0..len {
                    let key = self.heap.map(from).keys[i];
                    let value = self.heap.map(from).vals[i];
                    self.map_set(map, key, value)?;
                }
            }
            for (name, value) in locals {
                self.map_set(map, Value::Str(name), value)?;
            }
        }
        Ok(Some(map))
    }

    // ===== Containers =====

    /// Lower bound of `key` in the map's sorted key vector. Probes read
    /// through `get` because a meta `<` may re-enter the interpreter.
    fn map_lower_bound(&mut self, map: MapId, key: Value) -> RunResult<usize> {
        let size = self.heap.map(map).keys.len();
        if size < MAP_SCAN_LINEAR {
            let mut i = 0;
            while i < size {
                let probe = self.heap.map(map).keys.get(i).copied().unwrap_or(Value::Nil);
                if !self.value_lt(probe, key)? {
                    break;
                }
                i += 1;
            }
            return Ok(i);
        }

        let mut lower = 0usize;
        let mut upper = size;
        while lower < upper {
            let mid = (lower + upper) / 2;
            let probe = self
                .heap
                .map(map)
                .keys
                .get(mid)
                .copied()
                .unwrap_or(Value::Nil);
            if self.value_lt(probe, key)? {
                lower = mid + 1;
            } else {
                upper = mid;
            }
        }
        Ok(lower)
    }

    pub(crate) fn map_get(&mut self, map: MapId, key: Value) -> RunResult<Option<Value>> {
        let i = self.map_lower_bound(map, key)?;
        let entry = self.heap.map(map).keys.get(i).copied();
        match entry {
            Some(probe) if self.value_eq(probe, key)? => {
                Ok(self.heap.map(map).vals.get(i).copied())
            }
            _ => Ok(None),
        }
    }

    /// Set a key; assigning nil deletes.
    pub(crate) fn map_set(&mut self, map: MapId, key: Value, value: Value) -> RunResult<()> {
        if value.is_nil() {
            return self.map_del(map, key);
        }
        let i = self.map_lower_bound(map, key)?;
        let entry = self.heap.map(map).keys.get(i).copied();
        let found = match entry {
            Some(probe) => self.value_eq(probe, key)?,
            None => false,
        };
        let slot = self.heap.map_mut(map);
        if found {
            slot.vals[i] = value;
        } else {
            slot.keys.insert(i, key);
            slot.vals.insert(i, value);
        }
        Ok(())
    }

    pub(crate) fn map_del(&mut self, map: MapId, key: Value) -> RunResult<()> {
        let i = self.map_lower_bound(map, key)?;
        let entry = self.heap.map(map).keys.get(i).copied();
        if let Some(probe) = entry {
            if self.value_eq(probe, key)? {
                let slot = self.heap.map_mut(map);
                slot.keys.remove(i);
                slot.vals.remove(i);
            }
        }
        Ok(())
    }

    fn vector_cell_index(&self, vec: VecId, index: i64) -> RunResult<usize> {
        let len = self.heap.vector(vec).items.len() as i64;
        let at = if index < 0 { len + index } else { index };
        if at < 0 || at >= len {
            return Err(RuntimeError::new(format!(
                "vector index {} out of bounds (length {})",
                index, len
            )));
        }
        Ok(at as usize)
    }

    pub(crate) fn get_value(&mut self, src: Value, key: Value) -> RunResult<Value> {
        match src {
            Value::Vector(id) => {
                if let Value::Int(index) = key {
                    let at = self.vector_cell_index(id, index)?;
                    return Ok(self.heap.vector(id).items[at]);
                }
                if let Value::Str(name) = key {
                    let meta = self.heap.vector(id).meta;
                    if !meta.is_nil() {
                        let name = self.strings.get(name).to_string();
                        return Ok(self.meta_lookup(meta, &name)?.unwrap_or(Value::Nil));
                    }
                }
                Err(self.get_error(src, key))
            }
            Value::Map(id) => {
                let mut value = self.map_get(id, key)?.unwrap_or(Value::Nil);
                if value.is_nil() {
                    let meta = self.heap.map(id).meta;
                    if !meta.is_nil() {
                        if let Value::Str(name) = key {
                            let name = self.strings.get(name).to_string();
                            value = self.meta_lookup(meta, &name)?.unwrap_or(Value::Nil);
                        }
                    }
                }
                Ok(value)
            }
            _ => Err(self.get_error(src, key)),
        }
    }

    fn get_error(&self, src: Value, key: Value) -> RuntimeError {
        RuntimeError::type_error(format!(
            "cannot get {} from {}",
            key.type_name(),
            src.type_name()
        ))
    }

    pub(crate) fn set_value(&mut self, dst: Value, key: Value, value: Value) -> RunResult<()> {
        match (dst, key) {
            (Value::Vector(id), Value::Int(index))
                if index as usize == self.heap.vector(id).items.len() && index >= 0 =>
            {
                self.heap.vector_mut(id).items.push(value);
                Ok(())
            }
            (Value::Vector(id), Value::Int(index)) => {
                let at = self.vector_cell_index(id, index)?;
                self.heap.vector_mut(id).items[at] = value;
                Ok(())
            }
            (Value::Map(id), key) => self.map_set(id, key, value),
            _ => Err(RuntimeError::type_error(format!(
                "cannot set {} in {}",
                key.type_name(),
                dst.type_name()
            ))),
        }
    }

    fn op_vpush(&mut self) -> RunResult<()> {
        let Value::Vector(target) = self.otop()? else {
            return Err(RuntimeError::internal("vpush target missing"));
        };
        for i in 0..self.depth() {
            let value = self.item(i)?;
            self.heap.vector_mut(target).items.push(value);
        }
        self.op_clean();
        Ok(())
    }

    fn op_unpack(&mut self) -> RunResult<()> {
        let Value::Vector(id) = self.pop()? else {
            return Err(RuntimeError::type_error("unpack expects a vector"));
        };
        for i in 0..self.heap.vector(id).items.len() {
            let value = self.heap.vector(id).items[i];
            self.push(value);
        }
        Ok(())
    }

    fn op_map(&mut self) {
        let previous = self.cor().map;
        self.opush(previous);
        let id = self.heap.alloc_map();
        self.cor_mut().map = Value::Map(id);
    }

    fn op_unmap(&mut self) -> RunResult<()> {
        let pending = self.cor().map;
        self.push(pending);
        let previous = self.opop()?;
        self.cor_mut().map = previous;
        Ok(())
    }

    pub(crate) fn op_meta_set(&mut self) -> RunResult<()> {
        let meta = self.pop()?;
        let target = self.pop()?;
        match target {
            Value::Vector(id) => {
                self.heap.vector_mut(id).meta = meta;
                Ok(())
            }
            Value::Map(id) => {
                self.heap.map_mut(id).meta = meta;
                Ok(())
            }
            Value::Userdata(id) => {
                self.heap.data_mut(id).meta = meta;
                Ok(())
            }
            other => Err(RuntimeError::type_error(format!(
                "cannot set meta on {}",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn op_meta_get(&mut self) -> RunResult<()> {
        let target = self.pop()?;
        let meta = match target {
            Value::Vector(id) => self.heap.vector(id).meta,
            Value::Map(id) => self.heap.map(id).meta,
            Value::Userdata(id) => self.heap.data(id).meta,
            _ => Value::Nil,
        };
        self.push(meta);
        Ok(())
    }

    // ===== Meta dispatch =====

    /// Resolve an operator handler through a container's meta value: a map
    /// meta is looked up by name; a callable meta is called with the name
    /// and may decline by returning nil.
    pub(crate) fn meta_lookup(&mut self, meta: Value, name: &str) -> RunResult<Option<Value>> {
        match meta {
            Value::Map(id) => {
                let key = Value::Str(self.strings.intern(name));
                self.map_get(id, key)
            }
            Value::Subroutine(_) | Value::Callback(_) => {
                let key = Value::Str(self.strings.intern(name));
                let rets = self.call_method(meta, &[key], 1)?;
                Ok((!rets[0].is_nil()).then_some(rets[0]))
            }
            _ => Ok(None),
        }
    }

    fn meta_of(&self, value: Value) -> Value {
        match value {
            Value::Vector(id) => self.heap.vector(id).meta,
            Value::Map(id) => self.heap.map(id).meta,
            Value::Userdata(id) => self.heap.data(id).meta,
            _ => Value::Nil,
        }
    }

    fn meta_binary(&mut self, name: &str, a: Value, b: Value) -> RunResult<Value> {
        let meta = self.meta_of(a);
        if !meta.is_nil() {
            if let Some(handler) = self.meta_lookup(meta, name)? {
                let rets = self.call_method(handler, &[a, b], 1)?;
                return Ok(rets[0]);
            }
        }
        Err(RuntimeError::type_error(format!(
            "cannot apply '{}' to {} and {}",
            name,
            a.type_name(),
            b.type_name()
        )))
    }

    // ===== Arithmetic =====

    pub(crate) fn arith_add(&mut self, a: Value, b: Value) -> RunResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(y))),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Int((x as f64 + y) as i64)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + y as f64)),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
            _ => self.meta_binary("+", a, b),
        }
    }

    fn arith_mul(&mut self, a: Value, b: Value) -> RunResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_mul(y))),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Int((x as f64 * y) as i64)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x * y as f64)),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
            _ => self.meta_binary("*", a, b),
        }
    }

    fn arith_div(&mut self, a: Value, b: Value) -> RunResult<Value> {
        match (a, b) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeError::new("division by zero")),
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_div(y))),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Int((x as f64 / y) as i64)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x / y as f64)),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x / y)),
            _ => self.meta_binary("/", a, b),
        }
    }

    fn arith_mod(&mut self, a: Value, b: Value) -> RunResult<Value> {
        match (a, b) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeError::new("modulo by zero")),
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(y))),
            _ => Err(RuntimeError::type_error(format!(
                "cannot apply '%' to {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn negate(&self, value: Value) -> RunResult<Value> {
        match value {
            Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            Value::Float(n) => Ok(Value::Float(-n)),
            other => Err(RuntimeError::type_error(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        }
    }

    fn op_concat(&mut self) -> RunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let left = self.text(a)?;
        let right = self.text(b)?;
        if left.len() + right.len() > STR_MAX {
            return Err(RuntimeError::new(format!(
                "concat max length exceeded ({} bytes)",
                STR_MAX
            )));
        }
        let id = self.strings.intern(&format!("{}{}", left, right));
        self.push(Value::Str(id));
        Ok(())
    }

    fn op_match(&mut self) -> RunResult<()> {
        let Value::Str(pattern) = self.pop()? else {
            return Err(RuntimeError::type_error("match pattern is not a string"));
        };
        let Value::Str(subject) = self.pop()? else {
            return Err(RuntimeError::type_error("match subject is not a string"));
        };

        if !self.regexes.contains_key(&pattern) {
            let source = self.strings.get(pattern).to_string();
            let regex = Regex::new(&source)
                .map_err(|e| RuntimeError::new(format!("invalid pattern: {}", e)))?;
            self.regexes.insert(pattern, regex);
        }

        let groups: Vec<String> = match self.regexes.get(&pattern) {
            Some(regex) => {
                let text = self.strings.get(subject);
                regex
                    .captures(text)
                    .map(|caps| {
                        caps.iter()
                            .flatten()
                            .map(|m| m.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };

        for group in groups {
            let id = self.strings.intern(&group);
            self.push(Value::Str(id));
        }
        Ok(())
    }

    // ===== Value semantics =====

    pub fn truth(&self, value: Value) -> bool {
        match value {
            Value::Nil => false,
            Value::Int(n) => n != 0,
            Value::Float(n) => n > f64::EPSILON || n < -f64::EPSILON,
            Value::Str(id) => !self.strings.get(id).is_empty(),
            Value::Bool(b) => b,
            Value::Vector(id) => !self.heap.vector(id).items.is_empty(),
            Value::Map(id) => !self.heap.map(id).keys.is_empty(),
            Value::Subroutine(_)
            | Value::Coroutine(_)
            | Value::Callback(_)
            | Value::Userdata(_) => true,
        }
    }

    pub fn value_eq(&mut self, a: Value, b: Value) -> RunResult<bool> {
        if a.type_rank() != b.type_rank() {
            return Ok(false);
        }
        match (a, b) {
            (Value::Nil, Value::Nil) => Ok(true),
            (Value::Int(x), Value::Int(y)) => Ok(x == y),
            (Value::Float(x), Value::Float(y)) => Ok((x - y).abs() < f64::EPSILON * 10.0),
            (Value::Str(x), Value::Str(y)) => Ok(x == y),
            (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
            (Value::Vector(x), Value::Vector(y)) => {
                let meta = self.heap.vector(x).meta;
                if let Some(handler) = self.meta_lookup(meta, "==")? {
                    let rets = self.call_method(handler, &[a, b], 1)?;
                    return Ok(self.truth(rets[0]));
                }
                if x == y {
                    return Ok(true);
                }
                let (xl, yl) = (
                    self.heap.vector(x).items.len(),
                    self.heap.vector(y).items.len(),
                );
                if xl != yl {
                    return Ok(false);
                }
                for i in 0..xl {
                    let xe = self.heap.vector(x).items.get(i).copied();
                    let ye = self.heap.vector(y).items.get(i).copied();
                    match (xe, ye) {
                        (Some(xe), Some(ye)) if self.value_eq(xe, ye)? => {}
                        _ => return Ok(false),
                    }
                }
                Ok(true)
            }
            (Value::Map(x), Value::Map(y)) => {
                let meta = self.heap.map(x).meta;
                if let Some(handler) = self.meta_lookup(meta, "==")? {
                    let rets = self.call_method(handler, &[a, b], 1)?;
                    return Ok(self.truth(rets[0]));
                }
                if x == y {
                    return Ok(true);
                }
                let (xl, yl) = (self.heap.map(x).keys.len(), self.heap.map(y).keys.len());
                if xl != yl {
                    return Ok(false);
                }
                for i in 0..xl {
                    let (xk, xv) = (
                        self.heap.map(x).keys.get(i).copied(),
                        self.heap.map(x).vals.get(i).copied(),
                    );
                    let (yk, yv) = (
                        self.heap.map(y).keys.get(i).copied(),
                        self.heap.map(y).vals.get(i).copied(),
                    );
                    match (xk, xv, yk, yv) {
                        (Some(xk), Some(xv), Some(yk), Some(yv))
                            if self.value_eq(xk, yk)? && self.value_eq(xv, yv)? => {}
                        _ => return Ok(false),
                    }
                }
                Ok(true)
            }
            (Value::Subroutine(x), Value::Subroutine(y)) => Ok(x.entry == y.entry),
            (Value::Coroutine(x), Value::Coroutine(y)) => Ok(x == y),
            (Value::Callback(x), Value::Callback(y)) => Ok(x as usize == y as usize),
            (Value::Userdata(x), Value::Userdata(y)) => {
                let meta = self.heap.data(x).meta;
                if let Some(handler) = self.meta_lookup(meta, "==")? {
                    let rets = self.call_method(handler, &[a, b], 1)?;
                    return Ok(self.truth(rets[0]));
                }
                Ok(x == y)
            }
            _ => Ok(false),
        }
    }

    /// Total order on values: type rank first, then type-specific. Strings
    /// order by bytes, containers by size (or their meta `<`).
    pub fn value_lt(&mut self, a: Value, b: Value) -> RunResult<bool> {
        let (ra, rb) = (a.type_rank(), b.type_rank());
        if ra != rb {
            return Ok(ra < rb);
        }
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(x < y),
            (Value::Float(x), Value::Float(y)) => Ok(x < y),
            (Value::Str(x), Value::Str(y)) => {
                Ok(x != y && self.strings.get(x) < self.strings.get(y))
            }
            (Value::Vector(x), Value::Vector(y)) => {
                let meta = self.heap.vector(x).meta;
                if let Some(handler) = self.meta_lookup(meta, "<")? {
                    let rets = self.call_method(handler, &[a, b], 1)?;
                    return Ok(self.truth(rets[0]));
                }
                Ok(self.heap.vector(x).items.len() < self.heap.vector(y).items.len())
            }
            (Value::Map(x), Value::Map(y)) => {
                let meta = self.heap.map(x).meta;
                if let Some(handler) = self.meta_lookup(meta, "<")? {
                    let rets = self.call_method(handler, &[a, b], 1)?;
                    return Ok(self.truth(rets[0]));
                }
                Ok(self.heap.map(x).keys.len() < self.heap.map(y).keys.len())
            }
            (Value::Userdata(x), Value::Userdata(_)) => {
                let meta = self.heap.data(x).meta;
                if let Some(handler) = self.meta_lookup(meta, "<")? {
                    let rets = self.call_method(handler, &[a, b], 1)?;
                    return Ok(self.truth(rets[0]));
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// The `#` count of a value.
    pub fn count(&mut self, value: Value) -> RunResult<i64> {
        match value {
            Value::Int(n) => Ok(n),
            Value::Float(n) => Ok(n.floor() as i64),
            Value::Str(id) => Ok(self.strings.get(id).len() as i64),
            Value::Vector(id) => Ok(self.heap.vector(id).items.len() as i64),
            Value::Map(id) => Ok(self.heap.map(id).keys.len() as i64),
            Value::Userdata(id) => {
                let meta = self.heap.data(id).meta;
                if let Some(handler) = self.meta_lookup(meta, "#")? {
                    let rets = self.call_method(handler, &[value], 1)?;
                    let Value::Int(n) = rets[0] else {
                        return Err(RuntimeError::type_error(
                            "meta method # should return an integer",
                        ));
                    };
                    return Ok(n);
                }
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    /// Render a value as text, dispatching a meta `$` where present.
    pub fn text(&mut self, value: Value) -> RunResult<String> {
        self.text_depth(value, 0)
    }

    fn text_depth(&mut self, value: Value, depth: usize) -> RunResult<String> {
        if depth > TEXT_DEPTH {
            return Ok("...".to_string());
        }
        match value {
            Value::Nil => Ok("nil".to_string()),
            Value::Int(n) => Ok(n.to_string()),
            Value::Float(n) => Ok(format!("{:.6}", n)),
            Value::Str(id) => Ok(self.strings.get(id).to_string()),
            Value::Bool(b) => Ok(if b { "true" } else { "false" }.to_string()),
            Value::Subroutine(sub) => Ok(format!("subroutine({})", sub.entry)),
            Value::Coroutine(_) => Ok("coroutine".to_string()),
            Value::Callback(_) => Ok("callback".to_string()),
            Value::Userdata(id) => {
                let meta = self.heap.data(id).meta;
                if let Some(text) = self.meta_text(meta, value)? {
                    return Ok(text);
                }
                Ok("userdata".to_string())
            }
            Value::Vector(id) => {
                let meta = self.heap.vector(id).meta;
                if let Some(text) = self.meta_text(meta, value)? {
                    return Ok(text);
                }
                let len = self.heap.vector(id).items.len();
                let mut parts = Vec::with_capacity(len);
                for i in 0..len {
                    let item = self.heap.vector(id).items.get(i).copied().unwrap_or(Value::Nil);
                    parts.push(self.text_depth(item, depth + 1)?);
                }
                Ok(format!("[{}]", parts.join(", ")))
            }
            Value::Map(id) => {
                let meta = self.heap.map(id).meta;
                if let Some(text) = self.meta_text(meta, value)? {
                    return Ok(text);
                }
                let len = self.heap.map(id).keys.len();
                let mut parts = Vec::with_capacity(len);
                for i in 0..len {
                    let key = self.heap.map(id).keys.get(i).copied().unwrap_or(Value::Nil);
                    let val = self.heap.map(id).vals.get(i).copied().unwrap_or(Value::Nil);
                    parts.push(format!(
                        "{} = {}",
                        self.text_depth(key, depth + 1)?,
                        self.text_depth(val, depth + 1)?
                    ));
                }
                Ok(format!("{{{}}}", parts.join(", ")))
            }
        }
    }

    fn meta_text(&mut self, meta: Value, value: Value) -> RunResult<Option<String>> {
        if meta.is_nil() {
            return Ok(None);
        }
        let Some(handler) = self.meta_lookup(meta, "$")? else {
            return Ok(None);
        };
        let rets = self.call_method(handler, &[value], 1)?;
        let Value::Str(id) = rets[0] else {
            return Err(RuntimeError::type_error("$ should return a string"));
        };
        Ok(Some(self.strings.get(id).to_string()))
    }

    // ===== Host surface =====

    pub fn make_vector(&mut self) -> Value {
        Value::Vector(self.heap.alloc_vector())
    }

    pub fn make_map(&mut self) -> Value {
        Value::Map(self.heap.alloc_map())
    }

    pub fn make_userdata(&mut self, data: Box<dyn Any>) -> Value {
        Value::Userdata(self.heap.alloc_data(data))
    }

    pub fn make_string(&mut self, text: &str) -> Value {
        Value::Str(self.strings.intern(text))
    }

    pub fn custom(&self) -> Option<&dyn Any> {
        self.custom.as_deref()
    }

    pub fn custom_mut(&mut self) -> Option<&mut dyn Any> {
        self.custom.as_deref_mut()
    }

    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }
}

fn literal_int(item: Value) -> i64 {
    item.as_int().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared sink so tests can assert on the print transcript.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_capture(source: &str) -> Result<String, RillError> {
        let buf = SharedBuf::default();
        let mut vm = Vm::from_source(source)?;
        vm.set_output(Box::new(buf.clone()));
        vm.run(&[0])?;
        let bytes = buf.0.lock().unwrap().clone();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn run_source(source: &str) -> Result<(), RillError> {
        Vm::from_source(source)?.run(&[0])
    }

    // ===== End-to-end scenarios =====

    #[test]
    fn integer_range_iteration() {
        let out = run_capture("sum = 0 for i in 10 sum = sum + i end print(sum)").unwrap();
        assert_eq!(out, "45\n");
    }

    #[test]
    fn vector_iteration() {
        let out = run_capture("sum = 0 for v in [1, 2, 3] sum = sum + v end print(sum)").unwrap();
        assert_eq!(out, "6\n");
    }

    #[test]
    fn coroutine_driven_for_loop() {
        let source = r#"
            function iter() for i in 3 lib.yield(i) end end
            cor = lib.coroutine(iter)
            a = []
            for i in cor a[#a] = i end
            print(a)
        "#;
        assert_eq!(run_capture(source).unwrap(), "[0, 1, 2]\n");
    }

    #[test]
    fn meta_equality_dispatch() {
        let source = r#"
            objA = [1, 2, 3]
            objB = [1, 2, 4]
            m = {"==" = function(a, b) return a[0] == b[0] and a[1] == b[1] end}
            lib.setmeta(objA, m)
            lib.setmeta(objB, m)
            print(objA == objB)
        "#;
        assert_eq!(run_capture(source).unwrap(), "true\n");
    }

    #[test]
    fn continue_skips_an_iteration() {
        let source = r#"
            i = 10
            while i > 0
                i = i - 1
                if i == 5 continue end
                lib.assert(i != 5)
            end
        "#;
        assert!(run_source(source).is_ok());
    }

    #[test]
    fn library_functions_are_first_class() {
        let out = run_capture("min = lib.min print(min(2, 1, 3))").unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn escaping_function_captures_lexically() {
        let source = r#"
            function make(x) return function() return x end end
            f = make(7)
            print(f())
        "#;
        assert_eq!(run_capture(source).unwrap(), "7\n");
    }

    // ===== Boundary behaviors =====

    #[test]
    fn zero_range_runs_no_iterations() {
        let out = run_capture("n = 0 for i in 0 n = n + 1 end print(n)").unwrap();
        assert_eq!(out, "0\n");
    }

    #[test]
    fn or_short_circuits_without_evaluating_rhs() {
        // the right operand would be an unknown-name error if evaluated
        let out = run_capture("x = true or missing() print(x)").unwrap();
        assert_eq!(out, "true\n");
        let out = run_capture("x = false or 7 print(x)").unwrap();
        assert_eq!(out, "7\n");
    }

    #[test]
    fn and_keeps_the_deciding_value() {
        let out = run_capture("print(nil and 1, 2 and 3)").unwrap();
        assert_eq!(out, "nil\t3\n");
    }

    #[test]
    fn nil_assignment_deletes_map_keys() {
        let source = r#"
            m = {a = 1, b = 2}
            m.a = nil
            for k, v in m lib.assert(k != "a") end
            print(#m, m["a"])
        "#;
        assert_eq!(run_capture(source).unwrap(), "1\tnil\n");
    }

    // ===== Round-trip laws =====

    #[test]
    fn vector_literal_indexing_round_trips() {
        let source = r#"
            v = [10, 20, 30]
            lib.assert(v[0] == 10)
            lib.assert(v[1] == 20)
            lib.assert(v[2] == 30)
        "#;
        assert!(run_source(source).is_ok());
    }

    #[test]
    fn map_iteration_rebuilds_an_equal_map() {
        let source = r#"
            m = {a = 1, b = 2, c = 3}
            m2 = {}
            for k, v in m m2[k] = v end
            lib.assert(m == m2)
        "#;
        assert!(run_source(source).is_ok());
    }

    // ===== Language surface =====

    #[test]
    fn multi_returns_reconcile_with_targets() {
        let source = r#"
            function pair() return 1, 2 end
            a, b = pair()
            lib.assert(a == 1)
            lib.assert(b == 2)
            c, d = 9
            lib.assert(c == 9)
            lib.assert(d == nil)
        "#;
        assert!(run_source(source).is_ok());
    }

    #[test]
    fn string_interpolation() {
        let out = run_capture("x = 5 print(\"val $x and $(x + 1)\")").unwrap();
        assert_eq!(out, "val 5 and 6\n");
    }

    #[test]
    fn long_strings_are_plain_literals() {
        let out = run_capture("print([[no $interp here]])").unwrap();
        assert_eq!(out, "no $interp here\n");
    }

    #[test]
    fn method_calls_pass_the_receiver() {
        let source = r#"
            m = {get = function(self, k) return self[k] end, x = 42}
            print(m:get("x"))
        "#;
        assert_eq!(run_capture(source).unwrap(), "42\n");
    }

    #[test]
    fn count_modifier() {
        let out = run_capture("print(#[1, 2, 3], #\"abc\", #{a = 1})").unwrap();
        assert_eq!(out, "3\t3\t1\n");
    }

    #[test]
    fn unpack_spreads_vector_elements() {
        let out = run_capture("t = [1, 2, 3] print(t...)").unwrap();
        assert_eq!(out, "1\t2\t3\n");
    }

    #[test]
    fn vector_append_position() {
        let out = run_capture("v = [] v[#v] = 1 v[#v] = 2 print(v)").unwrap();
        assert_eq!(out, "[1, 2]\n");
    }

    #[test]
    fn if_is_an_expression() {
        let out = run_capture("x = if true 1 else 2 end print(x)").unwrap();
        assert_eq!(out, "1\n");
        let out = run_capture("x = if false 1 else 2 end print(x)").unwrap();
        assert_eq!(out, "2\n");
    }

    #[test]
    fn break_leaves_the_loop() {
        let out = run_capture("n = 0 for i in 10 if i == 3 break end n = n + 1 end print(n)")
            .unwrap();
        assert_eq!(out, "3\n");
    }

    #[test]
    fn generator_protocol_receives_step() {
        let source = r#"
            function gen(step) if step < 3 return step * 10 end end
            a = []
            for v in gen a[#a] = v end
            print(a)
        "#;
        assert_eq!(run_capture(source).unwrap(), "[0, 10, 20]\n");
    }

    #[test]
    fn match_operator_pushes_captures() {
        let out = run_capture("r = \"hello\" ~ \"l+\" print(r)").unwrap();
        assert_eq!(out, "ll\n");
    }

    #[test]
    fn recursive_functions_resolve_themselves() {
        let source = r#"
            function fib(n) if n < 2 return n end return fib(n - 1) + fib(n - 2) end
            print(fib(10))
        "#;
        assert_eq!(run_capture(source).unwrap(), "55\n");
    }

    #[test]
    fn global_map_reference() {
        let out = run_capture(
            "function set() global.x = 1 end set() print(x, global.x)",
        )
        .unwrap();
        assert_eq!(out, "1\t1\n");
    }

    #[test]
    fn resume_yield_transfer_values() {
        // a chained call is limited to one result, so take a bare reference
        // to resume for multi-value reception
        let source = r#"
            function chatty(greeting)
                reply = lib.yield(greeting, "first")
                lib.yield(reply)
            end
            resume = lib.resume
            cor = lib.coroutine(chatty)
            a, b = resume(cor, "hi")
            c = resume(cor, "back")
            print(a, b, c)
        "#;
        assert_eq!(run_capture(source).unwrap(), "hi\tfirst\tback\n");
    }

    #[test]
    fn resuming_a_dead_coroutine_yields_nil() {
        let source = r#"
            function quick() return 1 end
            cor = lib.coroutine(quick)
            lib.resume(cor)
            print(lib.resume(cor))
        "#;
        assert_eq!(run_capture(source).unwrap(), "nil\n");
    }

    #[test]
    fn sorting_uses_the_value_order() {
        let out = run_capture("print(lib.sort([3, 1, 2]))").unwrap();
        assert_eq!(out, "[1, 2, 3]\n");
    }

    // ===== Host interface =====

    fn cb_double(vm: &mut Vm) -> RunResult<()> {
        let n = vm.to_int(vm.item(0)?)?;
        while vm.depth() > 0 {
            vm.pop()?;
        }
        vm.push(Value::Int(n * 2));
        Ok(())
    }

    #[test]
    fn registered_callbacks_are_reachable() {
        let buf = SharedBuf::default();
        let config = VmConfig::from_source("print(double(21))").register("double", cb_double);
        let mut vm = Vm::new(config).unwrap();
        vm.set_output(Box::new(buf.clone()));
        vm.run(&[0]).unwrap();
        let bytes = buf.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8_lossy(&bytes), "42\n");
    }

    #[test]
    fn modules_share_one_run_state() {
        let buf = SharedBuf::default();
        let config = VmConfig::default()
            .module("a", "x = 41")
            .module("b", "print(x + 1)");
        let mut vm = Vm::new(config).unwrap();
        vm.set_output(Box::new(buf.clone()));
        vm.run(&[0, 1]).unwrap();
        let bytes = buf.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8_lossy(&bytes), "42\n");
    }

    #[test]
    fn each_run_starts_fresh() {
        let source = "counter = (global.counter or 0) + 1 print(counter)";
        let buf = SharedBuf::default();
        let mut vm = Vm::from_source(source).unwrap();
        vm.set_output(Box::new(buf.clone()));
        vm.run(&[0]).unwrap();
        vm.run(&[0]).unwrap();
        let bytes = buf.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8_lossy(&bytes), "1\n1\n");
    }

    #[test]
    fn run_reports_failures() {
        let mut vm = Vm::from_source("boom()").unwrap();
        assert!(vm.run(&[0]).is_err());
        assert!(vm.last_error().unwrap().contains("unknown name"));
    }

    #[test]
    fn assertions_abort_the_run() {
        assert!(run_source("lib.assert(false)").is_err());
        assert!(run_source("lib.assert(true)").is_ok());
    }

    #[test]
    fn type_errors_abort_the_run() {
        assert!(run_source("x = 1 + true").is_err());
        assert!(run_source("x = 1 / 0").is_err());
    }

    #[test]
    fn compile_errors_fail_creation() {
        assert!(Vm::from_source("while").is_err());
        assert!(Vm::from_source("x = ]").is_err());
    }

    // ===== Collector =====

    #[test]
    fn collect_reclaims_everything_after_a_run() {
        let source = r#"
            junk = [1, {a = [2]}, "run-time-$(1)"]
            junk = nil
            lib.collect()
        "#;
        let mut vm = Vm::from_source(source).unwrap();
        let baseline = vm.heap.extant();
        vm.run(&[0]).unwrap();
        assert_eq!(vm.heap.extant(), baseline);
    }

    #[test]
    fn collect_keeps_reachable_objects() {
        let source = r#"
            keep = [1, 2, 3]
            lib.collect()
            print(keep)
        "#;
        assert_eq!(run_capture(source).unwrap(), "[1, 2, 3]\n");
    }

    // ===== Peephole fusions =====

    #[test]
    fn update_fusion_for_named_increment() {
        let vm = Vm::from_source("i = 0 i = i + 1").unwrap();
        assert!(vm.code.iter().any(|c| c.op == Opcode::Update));
        assert!(vm.code.iter().any(|c| c.op == Opcode::Addl));
    }

    #[test]
    fn literal_assignment_fuses_to_assignp() {
        let vm = Vm::from_source("x = 1").unwrap();
        assert!(vm.code.iter().any(|c| c.op == Opcode::Assignp));
    }

    #[test]
    fn calls_fuse_to_inline_cached_cfunc() {
        let vm = Vm::from_source("print(1)").unwrap();
        assert!(vm.code.iter().any(|c| c.op == Opcode::Cfunc));
    }

    #[test]
    fn literal_negation_folds() {
        let vm = Vm::from_source("x = -5").unwrap();
        assert!(vm
            .code
            .iter()
            .any(|c| c.op == Opcode::Lit && matches!(c.item, Value::Int(-5))));
        assert!(!vm.code.iter().any(|c| c.op == Opcode::Neg));
    }

    #[test]
    fn disassembly_is_renderable() {
        let vm = Vm::from_source("x = 1 print(x)").unwrap();
        let listing = vm.disassemble();
        assert!(listing.contains("assignp"));
        assert!(listing.contains("stop"));
    }

    // ===== Structural invariants =====

    /// Attach a scratch routine so stack operations work outside a run.
    fn with_routine(vm: &mut Vm) {
        let cor = vm.heap.alloc_cor();
        vm.routines.push(cor);
        vm.routine = Some(cor);
    }

    #[test]
    fn limit_truncates_and_pads() {
        let mut vm = Vm::from_source("").unwrap();
        with_routine(&mut vm);

        vm.op_mark();
        vm.push(Value::Int(1));
        vm.push(Value::Int(2));
        vm.push(Value::Int(3));
        vm.limit(2).unwrap();
        assert_eq!(vm.cor().stack.len(), 2);

        vm.op_mark();
        vm.limit(4).unwrap();
        assert_eq!(vm.cor().stack.len(), 6);
        assert!(vm.top().unwrap().is_nil());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn map_mutations_keep_keys_sorted(
                ops in proptest::collection::vec((any::<i8>(), any::<bool>()), 0..64),
            ) {
                let mut vm = Vm::from_source("").unwrap();
                let map = vm.heap.alloc_map();
                for (key, insert) in ops {
                    let value = if insert { Value::Int(1) } else { Value::Nil };
                    vm.map_set(map, Value::Int(key as i64), value).unwrap();

                    let slot = vm.heap.map(map);
                    prop_assert_eq!(slot.keys.len(), slot.vals.len());
                    for pair in slot.keys.windows(2) {
                        let a = pair[0].as_int().unwrap_or(0);
                        let b = pair[1].as_int().unwrap_or(0);
                        prop_assert!(a < b);
                    }
                    for val in &slot.vals {
                        prop_assert!(!val.is_nil());
                    }
                }
            }

            #[test]
            fn limit_reconciles_subframe_depth(pushes in 0usize..12, want in 0i64..8) {
                let mut vm = Vm::from_source("").unwrap();
                with_routine(&mut vm);
                let before = vm.cor().stack.len();
                vm.op_mark();
                for i in 0..pushes {
                    vm.push(Value::Int(i as i64));
                }
                vm.limit(want).unwrap();
                prop_assert_eq!(vm.cor().stack.len(), before + want as usize);
            }
        }
    }
}
