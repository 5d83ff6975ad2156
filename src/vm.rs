//! The register VM.
//!
//! One `LuaVM` owns the global table and drives execution. Every Lua call
//! runs in a `Frame` whose register file is heap-allocated and
//! reference-counted, so open up-value cells can alias registers directly.
//! Lua-to-Lua calls never recurse into the host stack: `CALL` pushes a
//! frame, `RETURN` pops one, and the dispatch loop keeps going. Host and
//! metamethod calls run synchronously in line.
//!
//! Coroutines are cooperative and single-threaded. Each one owns its frame
//! stack; `coroutine.yield` unwinds the dispatch loop with a dedicated token
//! that the nearest `resume` boundary catches, leaving the frame stack
//! intact for re-entry.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use log::trace;

use crate::chunk::{load_chunk, FunctionProto};
use crate::error::{LuaError, LuaResult};
use crate::metamethod::Metamethod;
use crate::opcode::{decode_floating_byte, Instruction, OpCode};
use crate::table::Table;
use crate::value::{
    CFunction, Closure, ClosureHandle, CoroutineHandle, LuaString, RegisterFile, StringHandle,
    TableHandle, UpvalueHandle, UpvalueState, Value,
};

/// `SETLIST` addresses the array part in blocks of this many fields.
pub const FIELDS_PER_FLUSH: usize = 50;

/// Bound on `__index`/`__newindex` chains, against metatable loops.
const MAX_TAG_LOOP: usize = 100;

/// VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum call-frame depth per coroutine.
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 200,
        }
    }
}

/// Status of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Not yet started, or stopped at a yield.
    Suspended,

    /// Currently being executed (or resuming one of its children).
    Running,

    /// Returned or failed; cannot be resumed again.
    Dead,
}

impl CoroutineStatus {
    /// The status name `coroutine.status` reports.
    pub fn name(&self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// Where the next resume's arguments land inside a suspended coroutine.
enum ResumeDest {
    /// Results of the suspended `CALL`: write at `reg`, `expected` results.
    Register {
        reg: usize,
        expected: Option<usize>,
    },

    /// The suspended instruction was a `TAILCALL`: the arguments become the
    /// frame's return values.
    Return,
}

/// A suspendable execution state: the frame stack of one cooperative thread.
/// The main chunk runs on an implicit root coroutine.
pub struct Coroutine {
    /// Function the first resume will invoke.
    entry: Value,

    /// Live call frames, innermost last.
    frames: Vec<Frame>,

    /// Current status.
    status: CoroutineStatus,

    /// Set while suspended inside a host call.
    resume_dest: Option<ResumeDest>,

    /// Whether the entry function has been invoked yet.
    started: bool,
}

impl Coroutine {
    /// Wrap a function value into a fresh suspended coroutine. No execution
    /// happens until the first resume.
    pub fn new(entry: Value) -> Coroutine {
        Coroutine {
            entry,
            frames: Vec::new(),
            status: CoroutineStatus::Suspended,
            resume_dest: None,
            started: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> CoroutineStatus {
        self.status
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("status", &self.status)
            .field("frames", &self.frames.len())
            .finish()
    }
}

/// What a `resume` produced.
#[derive(Debug)]
pub enum ResumeResult {
    /// The coroutine hit a `yield`; these are the yielded values.
    Yielded(Vec<Value>),

    /// The coroutine's entry function returned; these are its results.
    Returned(Vec<Value>),
}

/// One activation record.
struct Frame {
    /// The closure being executed.
    closure: ClosureHandle,

    /// Register file, sized to the prototype's `max_stack_size` (it may
    /// grow past that for open-ended result lists).
    regs: RegisterFile,

    /// Program counter into `closure.proto.code`.
    pc: usize,

    /// Watermark above which registers are unused; consumed by the `B = 0`
    /// / `C = 0` open-ended operand forms.
    top: usize,

    /// Arguments beyond the named parameters, for `VARARG`.
    varargs: Vec<Value>,

    /// Open up-value cells into this frame's registers, by register index.
    open_upvalues: Vec<(usize, UpvalueHandle)>,

    /// Caller register where results land.
    ret_dest: usize,

    /// Fixed result count, or `None` for "all results".
    expected: Option<usize>,

    /// When set, returning from this frame ends the enclosing dispatch loop
    /// and hands the results to native code instead of a caller frame.
    boundary: bool,
}

/// The virtual machine: a loaded chunk plus the mutable world it runs in.
pub struct LuaVM {
    chunk: Rc<FunctionProto>,
    globals: TableHandle,
    config: VmConfig,
    /// Interned metamethod name strings, indexed by `Metamethod` order.
    metamethod_names: Vec<StringHandle>,
    /// The single library-wide string metatable, if the host installed one.
    string_metatable: Option<TableHandle>,
    /// Sink for `print`. Defaults to stdout; embedders may redirect it.
    output: Box<dyn Write>,
}

impl std::fmt::Debug for LuaVM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaVM")
            .field("chunk", &self.chunk)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LuaVM {
    /// Construct a VM from a binary chunk, with default configuration and
    /// the standard globals installed.
    pub fn load(bytes: &[u8]) -> LuaResult<LuaVM> {
        Self::load_with_config(bytes, VmConfig::default())
    }

    /// Construct a VM from a binary chunk with explicit configuration.
    pub fn load_with_config(bytes: &[u8], config: VmConfig) -> LuaResult<LuaVM> {
        let chunk = load_chunk(bytes)?;
        let metamethod_names = Metamethod::ALL
            .iter()
            .map(|m| Rc::new(LuaString::from_str(m.name())))
            .collect();
        let mut vm = LuaVM {
            chunk,
            globals: Rc::new(RefCell::new(Table::new())),
            config,
            metamethod_names,
            string_metatable: None,
            output: Box::new(io::stdout()),
        };
        crate::stdlib::install(&mut vm)?;
        Ok(vm)
    }

    /// The main prototype of the loaded chunk.
    pub fn chunk(&self) -> Rc<FunctionProto> {
        Rc::clone(&self.chunk)
    }

    /// The global table.
    pub fn globals(&self) -> TableHandle {
        Rc::clone(&self.globals)
    }

    /// Read a global by name (raw access).
    pub fn get_global(&self, name: &str) -> Value {
        self.globals.borrow().raw_get(&Value::string(name))
    }

    /// Write a global by name (raw access).
    pub fn set_global(&mut self, name: &str, value: Value) -> LuaResult<()> {
        self.globals.borrow_mut().raw_set(Value::string(name), value)
    }

    /// Register a host function as a global.
    pub fn register_function(&mut self, name: &str, function: CFunction) -> LuaResult<()> {
        self.set_global(name, Value::Function(function))
    }

    /// Redirect the `print` sink.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// The `print` sink.
    pub(crate) fn output(&mut self) -> &mut dyn Write {
        self.output.as_mut()
    }

    /// The shared string metatable.
    pub fn string_metatable(&self) -> Option<TableHandle> {
        self.string_metatable.clone()
    }

    /// Install the shared string metatable.
    pub fn set_string_metatable(&mut self, metatable: Option<TableHandle>) {
        self.string_metatable = metatable;
    }

    /// Execute the main chunk and return its result tuple.
    pub fn run(&mut self) -> LuaResult<Vec<Value>> {
        self.run_with_args(Vec::new())
    }

    /// Execute the main chunk with arguments (delivered as `...`).
    pub fn run_with_args(&mut self, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        let upvalues = (0..self.chunk.num_upvalues)
            .map(|_| Rc::new(RefCell::new(UpvalueState::Closed(Value::Nil))))
            .collect();
        let main = Rc::new(Closure {
            proto: Rc::clone(&self.chunk),
            upvalues,
        });
        let root = Rc::new(RefCell::new(Coroutine::new(Value::Closure(main))));
        match self.resume_coroutine(&root, args)? {
            ResumeResult::Returned(values) => Ok(values),
            ResumeResult::Yielded(_) => Err(LuaError::Runtime(
                "attempt to yield from outside a coroutine".to_string(),
            )),
        }
    }

    // ----------------------------------------------------------------
    // Coroutine scheduling
    // ----------------------------------------------------------------

    /// Resume a suspended coroutine with `args`. Returns the yielded or
    /// returned values; script errors propagate as `Err` after the
    /// coroutine's frames have been unwound.
    pub(crate) fn resume_coroutine(
        &mut self,
        co: &CoroutineHandle,
        args: Vec<Value>,
    ) -> LuaResult<ResumeResult> {
        match co.borrow().status {
            CoroutineStatus::Suspended => {}
            CoroutineStatus::Running => {
                return Err(LuaError::Runtime(
                    "cannot resume non-suspended coroutine".to_string(),
                ))
            }
            CoroutineStatus::Dead => {
                return Err(LuaError::Runtime(
                    "cannot resume dead coroutine".to_string(),
                ))
            }
        }
        co.borrow_mut().status = CoroutineStatus::Running;

        match self.resume_inner(co, args) {
            Ok(values) => {
                co.borrow_mut().status = CoroutineStatus::Dead;
                Ok(ResumeResult::Returned(values))
            }
            Err(LuaError::Yield(values)) => {
                co.borrow_mut().status = CoroutineStatus::Suspended;
                Ok(ResumeResult::Yielded(values))
            }
            Err(err) => {
                self.unwind_coroutine(co);
                Err(err)
            }
        }
    }

    fn resume_inner(&mut self, co: &CoroutineHandle, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        let started = co.borrow().started;
        if !started {
            co.borrow_mut().started = true;
            let entry = co.borrow().entry.clone();
            match entry {
                Value::Closure(closure) => {
                    self.push_frame(co, closure, args, 0, None, true)?;
                    self.run_until(co, 0)
                }
                // A host-function body runs to completion within one resume.
                Value::Function(f) => self.call_host(co, f, args),
                other => Err(LuaError::type_error(format!(
                    "attempt to call a {} value",
                    other.type_name()
                ))),
            }
        } else {
            let dest = co.borrow_mut().resume_dest.take();
            match dest {
                Some(ResumeDest::Register { reg, expected }) => {
                    self.deliver_results(co, reg, expected, args)?;
                    self.run_until(co, 0)
                }
                Some(ResumeDest::Return) => match self.pop_and_deliver(co, args)? {
                    Some(finished) => Ok(finished),
                    None => self.run_until(co, 0),
                },
                None => Err(LuaError::Runtime(
                    "coroutine has no suspension point".to_string(),
                )),
            }
        }
    }

    /// Close every open up-value of the unwound frames and drop them; used
    /// when an error propagates out of a coroutine.
    fn unwind_coroutine(&mut self, co: &CoroutineHandle) {
        let frames = {
            let mut co_mut = co.borrow_mut();
            co_mut.status = CoroutineStatus::Dead;
            co_mut.resume_dest = None;
            std::mem::take(&mut co_mut.frames)
        };
        for frame in frames {
            for (_, cell) in frame.open_upvalues {
                cell.borrow_mut().close();
            }
        }
    }

    // ----------------------------------------------------------------
    // Dispatch loop
    // ----------------------------------------------------------------

    /// Step until the frame stack returns to `base_depth` through a
    /// boundary frame, producing that frame's return values.
    fn run_until(&mut self, co: &CoroutineHandle, base_depth: usize) -> LuaResult<Vec<Value>> {
        loop {
            if let Some(values) = self.step(co)? {
                debug_assert_eq!(co.borrow().frames.len(), base_depth);
                return Ok(values);
            }
        }
    }

    /// Execute one instruction of the innermost frame. Runtime errors pick
    /// up their `source:line:` position here, at the faulting pc.
    fn step(&mut self, co: &CoroutineHandle) -> LuaResult<Option<Vec<Value>>> {
        let (closure, regs, pc) = {
            let co_ref = co.borrow();
            let frame = co_ref
                .frames
                .last()
                .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
            (Rc::clone(&frame.closure), Rc::clone(&frame.regs), frame.pc)
        };
        let proto = Rc::clone(&closure.proto);
        let word = proto.code.get(pc).copied().ok_or_else(|| {
            LuaError::Runtime("program counter past end of function".to_string())
        })?;
        {
            let mut co_mut = co.borrow_mut();
            if let Some(frame) = co_mut.frames.last_mut() {
                frame.pc = pc + 1;
            }
        }
        let inst = Instruction(word);
        match self.execute(co, &closure, &proto, &regs, inst, pc) {
            Ok(step) => Ok(step),
            Err(err) => Err(err.positioned(&proto.source, proto.line_at(pc))),
        }
    }

    fn execute(
        &mut self,
        co: &CoroutineHandle,
        closure: &ClosureHandle,
        proto: &FunctionProto,
        regs: &RegisterFile,
        inst: Instruction,
        pc: usize,
    ) -> LuaResult<Option<Vec<Value>>> {
        let op = inst.opcode()?;
        trace!("{}:{} pc={} {}", proto.source, proto.line_at(pc), pc, op.name());
        let a = inst.a();
        match op {
            OpCode::Move => {
                set_reg(regs, a, reg(regs, inst.b() as usize));
            }
            OpCode::LoadK => {
                set_reg(regs, a, constant(proto, inst.bx() as usize)?);
            }
            OpCode::LoadBool => {
                set_reg(regs, a, Value::Boolean(inst.b() != 0));
                if inst.c() != 0 {
                    self.jump(co, 1)?;
                }
            }
            OpCode::LoadNil => {
                for i in a..=inst.b() as usize {
                    set_reg(regs, i, Value::Nil);
                }
            }
            OpCode::GetUpval => {
                let cell = upvalue(closure, inst.b() as usize)?;
                let value = cell.borrow().get();
                set_reg(regs, a, value);
            }
            OpCode::SetUpval => {
                let cell = upvalue(closure, inst.b() as usize)?;
                cell.borrow_mut().set(reg(regs, a));
            }
            OpCode::GetGlobal => {
                let key = constant(proto, inst.bx() as usize)?;
                let value = self.index_value(co, Value::Table(self.globals()), key)?;
                set_reg(regs, a, value);
            }
            OpCode::SetGlobal => {
                let key = constant(proto, inst.bx() as usize)?;
                self.newindex_value(co, Value::Table(self.globals()), key, reg(regs, a))?;
            }
            OpCode::GetTable => {
                let key = rk(proto, regs, inst.c())?;
                let value = self.index_value(co, reg(regs, inst.b() as usize), key)?;
                set_reg(regs, a, value);
            }
            OpCode::SetTable => {
                let key = rk(proto, regs, inst.b())?;
                let value = rk(proto, regs, inst.c())?;
                self.newindex_value(co, reg(regs, a), key, value)?;
            }
            OpCode::NewTable => {
                let table = Table::with_capacity(
                    decode_floating_byte(inst.b()),
                    decode_floating_byte(inst.c()),
                );
                set_reg(regs, a, Value::Table(Rc::new(RefCell::new(table))));
            }
            OpCode::SelfOp => {
                let object = reg(regs, inst.b() as usize);
                let key = rk(proto, regs, inst.c())?;
                set_reg(regs, a + 1, object.clone());
                let method = self.index_value(co, object, key)?;
                set_reg(regs, a, method);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let mm = match op {
                    OpCode::Add => Metamethod::Add,
                    OpCode::Sub => Metamethod::Sub,
                    OpCode::Mul => Metamethod::Mul,
                    OpCode::Div => Metamethod::Div,
                    OpCode::Mod => Metamethod::Mod,
                    _ => Metamethod::Pow,
                };
                let lhs = rk(proto, regs, inst.b())?;
                let rhs = rk(proto, regs, inst.c())?;
                let result = self.arith(co, mm, lhs, rhs)?;
                set_reg(regs, a, result);
            }
            OpCode::Unm => {
                let operand = reg(regs, inst.b() as usize);
                let result = match operand.coerce_number() {
                    Some(n) => Value::Number(-n),
                    None => match self.metamethod_of(&operand, Metamethod::Unm) {
                        Some(handler) => first_value(self.call_value(
                            co,
                            handler,
                            vec![operand.clone(), operand],
                        )?),
                        None => {
                            return Err(LuaError::type_error(format!(
                                "attempt to perform arithmetic on a {} value",
                                operand.type_name()
                            )))
                        }
                    },
                };
                set_reg(regs, a, result);
            }
            OpCode::Not => {
                let value = reg(regs, inst.b() as usize);
                set_reg(regs, a, Value::Boolean(!value.truthy()));
            }
            OpCode::Len => {
                let value = reg(regs, inst.b() as usize);
                let length = self.length_of(co, value)?;
                set_reg(regs, a, length);
            }
            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let mut acc = reg(regs, c);
                let mut i = c;
                while i > b {
                    i -= 1;
                    acc = self.concat_pair(co, reg(regs, i), acc)?;
                }
                set_reg(regs, a, acc);
            }
            OpCode::Jmp => {
                // A carries a 1-based close-level hint for broken scopes.
                if a > 0 {
                    self.close_frame_upvalues(co, a - 1)?;
                }
                self.jump(co, inst.sbx())?;
            }
            OpCode::Eq => {
                let lhs = rk(proto, regs, inst.b())?;
                let rhs = rk(proto, regs, inst.c())?;
                let result = self.values_equal(co, &lhs, &rhs)?;
                if result != (a != 0) {
                    self.jump(co, 1)?;
                }
            }
            OpCode::Lt => {
                let lhs = rk(proto, regs, inst.b())?;
                let rhs = rk(proto, regs, inst.c())?;
                let result = self.less_than(co, lhs, rhs)?;
                if result != (a != 0) {
                    self.jump(co, 1)?;
                }
            }
            OpCode::Le => {
                let lhs = rk(proto, regs, inst.b())?;
                let rhs = rk(proto, regs, inst.c())?;
                let result = self.less_equal(co, lhs, rhs)?;
                if result != (a != 0) {
                    self.jump(co, 1)?;
                }
            }
            OpCode::Test => {
                if reg(regs, a).truthy() != (inst.c() != 0) {
                    self.jump(co, 1)?;
                }
            }
            OpCode::TestSet => {
                let value = reg(regs, inst.b() as usize);
                if value.truthy() == (inst.c() != 0) {
                    set_reg(regs, a, value);
                } else {
                    self.jump(co, 1)?;
                }
            }
            OpCode::Call => {
                let func = reg(regs, a);
                let args = self.gather_args(co, regs, a, inst.b())?;
                let expected = match inst.c() {
                    0 => None,
                    c => Some((c - 1) as usize),
                };
                self.call_at(co, func, args, a, expected)?;
            }
            OpCode::TailCall => {
                let func = reg(regs, a);
                let mut args = self.gather_args(co, regs, a, inst.b())?;
                self.close_frame_upvalues(co, 0)?;
                let callee = self.resolve_callable(func, &mut args)?;
                match callee {
                    Value::Closure(target) => {
                        self.replace_frame(co, target, args)?;
                    }
                    Value::Function(f) => match self.call_host(co, f, args) {
                        Ok(values) => return self.pop_and_deliver(co, values),
                        Err(LuaError::Yield(values)) => {
                            co.borrow_mut().resume_dest = Some(ResumeDest::Return);
                            return Err(LuaError::Yield(values));
                        }
                        Err(err) => return Err(err),
                    },
                    other => {
                        return Err(LuaError::type_error(format!(
                            "attempt to call a {} value",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::Return => {
                self.close_frame_upvalues(co, 0)?;
                let b = inst.b();
                let values: Vec<Value> = if b == 0 {
                    let top = self.top_of(co)?;
                    (a..top).map(|i| reg(regs, i)).collect()
                } else {
                    (0..(b as usize - 1)).map(|i| reg(regs, a + i)).collect()
                };
                return self.pop_and_deliver(co, values);
            }
            OpCode::ForPrep => {
                let init = for_number(reg(regs, a), "'for' initial value")?;
                let limit = for_number(reg(regs, a + 1), "'for' limit")?;
                let step = for_number(reg(regs, a + 2), "'for' step")?;
                set_reg(regs, a, Value::Number(init - step));
                set_reg(regs, a + 1, Value::Number(limit));
                set_reg(regs, a + 2, Value::Number(step));
                self.jump(co, inst.sbx())?;
            }
            OpCode::ForLoop => {
                let step = for_number(reg(regs, a + 2), "'for' step")?;
                let limit = for_number(reg(regs, a + 1), "'for' limit")?;
                let counter = for_number(reg(regs, a), "'for' initial value")? + step;
                set_reg(regs, a, Value::Number(counter));
                let continues = if step > 0.0 {
                    counter <= limit
                } else {
                    limit <= counter
                };
                if continues {
                    set_reg(regs, a + 3, Value::Number(counter));
                    self.jump(co, inst.sbx())?;
                }
            }
            OpCode::TForLoop => {
                let func = reg(regs, a);
                let args = vec![reg(regs, a + 1), reg(regs, a + 2)];
                let results = self.call_value(co, func, args)?;
                let count = inst.c() as usize;
                for i in 0..count {
                    set_reg(
                        regs,
                        a + 3 + i,
                        results.get(i).cloned().unwrap_or(Value::Nil),
                    );
                }
                let control = reg(regs, a + 3);
                if control.is_nil() {
                    // Iterator exhausted: step over the loop-back JMP.
                    self.jump(co, 1)?;
                } else {
                    set_reg(regs, a + 2, control);
                }
            }
            OpCode::VarArg => {
                let varargs = {
                    let co_ref = co.borrow();
                    co_ref
                        .frames
                        .last()
                        .map(|f| f.varargs.clone())
                        .unwrap_or_default()
                };
                let b = inst.b();
                if b == 0 {
                    for (i, value) in varargs.iter().enumerate() {
                        set_reg(regs, a + i, value.clone());
                    }
                    self.set_top(co, a + varargs.len())?;
                } else {
                    for i in 0..(b as usize - 1) {
                        set_reg(regs, a + i, varargs.get(i).cloned().unwrap_or(Value::Nil));
                    }
                }
            }
            OpCode::Closure => {
                let bx = inst.bx() as usize;
                let nested = proto
                    .protos
                    .get(bx)
                    .cloned()
                    .ok_or_else(|| LuaError::Runtime("invalid prototype index".to_string()))?;
                let nups = nested.num_upvalues as usize;
                let mut upvalues = Vec::with_capacity(nups);
                for i in 0..nups {
                    let word = proto.code.get(pc + 1 + i).copied().ok_or_else(|| {
                        LuaError::Runtime("truncated upvalue binding".to_string())
                    })?;
                    let binding = Instruction(word);
                    match binding.opcode() {
                        Ok(OpCode::Move) => {
                            upvalues
                                .push(self.find_or_create_upvalue(co, binding.b() as usize)?);
                        }
                        Ok(OpCode::GetUpval) => {
                            upvalues.push(upvalue(closure, binding.b() as usize)?);
                        }
                        _ => {
                            return Err(LuaError::Runtime(
                                "invalid upvalue binding instruction".to_string(),
                            ))
                        }
                    }
                }
                // The binding pseudo-instructions are consumed, not executed.
                self.jump(co, nups as i32)?;
                set_reg(
                    regs,
                    a,
                    Value::Closure(Rc::new(Closure {
                        proto: nested,
                        upvalues,
                    })),
                );
            }
            OpCode::Close => {
                self.close_frame_upvalues(co, a)?;
            }
            OpCode::SetList => {
                let b = inst.b();
                let count = if b == 0 {
                    self.top_of(co)?.saturating_sub(a + 1)
                } else {
                    b as usize
                };
                let block = match inst.c() {
                    0 => {
                        let word = proto.code.get(pc + 1).copied().ok_or_else(|| {
                            LuaError::Runtime("missing SETLIST block index".to_string())
                        })?;
                        self.jump(co, 1)?;
                        word as usize
                    }
                    c => c as usize,
                };
                if block == 0 {
                    return Err(LuaError::Runtime("invalid SETLIST block index".to_string()));
                }
                let table = match reg(regs, a) {
                    Value::Table(t) => t,
                    other => {
                        return Err(LuaError::type_error(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        )))
                    }
                };
                let base = (block - 1) * FIELDS_PER_FLUSH;
                for i in 1..=count {
                    table.borrow_mut().raw_seti(base + i, reg(regs, a + i))?;
                }
            }
        }
        Ok(None)
    }

    // ----------------------------------------------------------------
    // Calls and returns
    // ----------------------------------------------------------------

    /// Collect call arguments per the `B` operand encoding.
    fn gather_args(
        &self,
        co: &CoroutineHandle,
        regs: &RegisterFile,
        a: usize,
        b: u32,
    ) -> LuaResult<Vec<Value>> {
        let count = if b == 0 {
            self.top_of(co)?.saturating_sub(a + 1)
        } else {
            (b - 1) as usize
        };
        Ok((0..count).map(|i| reg(regs, a + 1 + i)).collect())
    }

    /// Dispatch a `CALL`: closures push a frame, host functions run in
    /// place. A yield out of the host call records where the next resume's
    /// arguments belong before unwinding.
    fn call_at(
        &mut self,
        co: &CoroutineHandle,
        func: Value,
        mut args: Vec<Value>,
        dest: usize,
        expected: Option<usize>,
    ) -> LuaResult<()> {
        let callee = self.resolve_callable(func, &mut args)?;
        match callee {
            Value::Closure(closure) => self.push_frame(co, closure, args, dest, expected, false),
            Value::Function(f) => match self.call_host(co, f, args) {
                Ok(values) => self.deliver_results(co, dest, expected, values),
                Err(LuaError::Yield(values)) => {
                    co.borrow_mut().resume_dest = Some(ResumeDest::Register {
                        reg: dest,
                        expected,
                    });
                    Err(LuaError::Yield(values))
                }
                Err(err) => Err(err),
            },
            other => Err(LuaError::type_error(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    /// Call a function value and collect its full result tuple. Used for
    /// metamethods, iterator steps and host-initiated calls; a yield cannot
    /// unwind through here.
    pub(crate) fn call_value(
        &mut self,
        co: &CoroutineHandle,
        func: Value,
        mut args: Vec<Value>,
    ) -> LuaResult<Vec<Value>> {
        let callee = self.resolve_callable(func, &mut args)?;
        match callee {
            Value::Function(f) => match self.call_host(co, f, args) {
                Err(LuaError::Yield(_)) => Err(self.yield_boundary_error(co)),
                other => other,
            },
            Value::Closure(closure) => {
                let depth = co.borrow().frames.len();
                self.push_frame(co, closure, args, 0, None, true)?;
                match self.run_until(co, depth) {
                    Err(LuaError::Yield(_)) => Err(self.yield_boundary_error(co)),
                    other => other,
                }
            }
            other => Err(LuaError::type_error(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    fn yield_boundary_error(&mut self, co: &CoroutineHandle) -> LuaError {
        co.borrow_mut().resume_dest = None;
        LuaError::Runtime("attempt to yield across metamethod/C-call boundary".to_string())
    }

    /// Resolve `func` to something directly callable, routing through
    /// `__call` (which prepends the original value to the arguments).
    fn resolve_callable(&mut self, func: Value, args: &mut Vec<Value>) -> LuaResult<Value> {
        if func.is_function() {
            return Ok(func);
        }
        match self.metamethod_of(&func, Metamethod::Call) {
            Some(handler) if handler.is_function() => {
                args.insert(0, func);
                Ok(handler)
            }
            _ => Err(LuaError::type_error(format!(
                "attempt to call a {} value",
                func.type_name()
            ))),
        }
    }

    fn call_host(
        &mut self,
        co: &CoroutineHandle,
        f: CFunction,
        args: Vec<Value>,
    ) -> LuaResult<Vec<Value>> {
        let mut ctx = ExecutionContext {
            vm: self,
            co: Rc::clone(co),
        };
        f(&mut ctx, args)
    }

    fn make_frame(
        &self,
        closure: ClosureHandle,
        args: Vec<Value>,
        ret_dest: usize,
        expected: Option<usize>,
        boundary: bool,
    ) -> Frame {
        let proto = Rc::clone(&closure.proto);
        let num_params = proto.num_params as usize;
        let max_stack = (proto.max_stack_size as usize).max(num_params);
        let mut registers = vec![Value::Nil; max_stack];
        for (i, arg) in args.iter().take(num_params).enumerate() {
            registers[i] = arg.clone();
        }
        let varargs = if proto.is_vararg && args.len() > num_params {
            args[num_params..].to_vec()
        } else {
            Vec::new()
        };
        Frame {
            closure,
            regs: Rc::new(RefCell::new(registers)),
            pc: 0,
            top: num_params,
            varargs,
            open_upvalues: Vec::new(),
            ret_dest,
            expected,
            boundary,
        }
    }

    fn push_frame(
        &mut self,
        co: &CoroutineHandle,
        closure: ClosureHandle,
        args: Vec<Value>,
        ret_dest: usize,
        expected: Option<usize>,
        boundary: bool,
    ) -> LuaResult<()> {
        if co.borrow().frames.len() >= self.config.max_call_depth {
            return Err(LuaError::StackOverflow);
        }
        let frame = self.make_frame(closure, args, ret_dest, expected, boundary);
        co.borrow_mut().frames.push(frame);
        Ok(())
    }

    /// Swap the innermost frame for a fresh one over `closure`, preserving
    /// the return plumbing. This is what keeps tail recursion at constant
    /// frame depth.
    fn replace_frame(
        &mut self,
        co: &CoroutineHandle,
        closure: ClosureHandle,
        args: Vec<Value>,
    ) -> LuaResult<()> {
        let (ret_dest, expected, boundary) = {
            let co_ref = co.borrow();
            let frame = co_ref
                .frames
                .last()
                .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
            (frame.ret_dest, frame.expected, frame.boundary)
        };
        let frame = self.make_frame(closure, args, ret_dest, expected, boundary);
        let mut co_mut = co.borrow_mut();
        match co_mut.frames.last_mut() {
            Some(slot) => {
                *slot = frame;
                Ok(())
            }
            None => Err(LuaError::Runtime("no active frame".to_string())),
        }
    }

    /// Pop the innermost frame and deliver its results: either to the
    /// caller's registers, or out of the dispatch loop for boundary frames.
    fn pop_and_deliver(
        &mut self,
        co: &CoroutineHandle,
        values: Vec<Value>,
    ) -> LuaResult<Option<Vec<Value>>> {
        let frame = co
            .borrow_mut()
            .frames
            .pop()
            .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
        if frame.boundary {
            return Ok(Some(values));
        }
        self.deliver_results(co, frame.ret_dest, frame.expected, values)?;
        Ok(None)
    }

    /// Write a result tuple into the innermost frame's registers at `dest`.
    fn deliver_results(
        &mut self,
        co: &CoroutineHandle,
        dest: usize,
        expected: Option<usize>,
        values: Vec<Value>,
    ) -> LuaResult<()> {
        let regs = {
            let co_ref = co.borrow();
            let frame = co_ref
                .frames
                .last()
                .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
            Rc::clone(&frame.regs)
        };
        match expected {
            Some(count) => {
                for i in 0..count {
                    set_reg(&regs, dest + i, values.get(i).cloned().unwrap_or(Value::Nil));
                }
            }
            None => {
                for (i, value) in values.iter().enumerate() {
                    set_reg(&regs, dest + i, value.clone());
                }
                self.set_top(co, dest + values.len())?;
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Frame bookkeeping
    // ----------------------------------------------------------------

    fn jump(&mut self, co: &CoroutineHandle, offset: i32) -> LuaResult<()> {
        let mut co_mut = co.borrow_mut();
        let frame = co_mut
            .frames
            .last_mut()
            .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
        let target = frame.pc as i64 + offset as i64;
        if target < 0 {
            return Err(LuaError::Runtime("jump out of bounds".to_string()));
        }
        frame.pc = target as usize;
        Ok(())
    }

    fn top_of(&self, co: &CoroutineHandle) -> LuaResult<usize> {
        co.borrow()
            .frames
            .last()
            .map(|f| f.top)
            .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))
    }

    fn set_top(&mut self, co: &CoroutineHandle, top: usize) -> LuaResult<()> {
        let mut co_mut = co.borrow_mut();
        let frame = co_mut
            .frames
            .last_mut()
            .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
        frame.top = top;
        Ok(())
    }

    /// Share the open cell for register `index`, creating it on first
    /// capture. Closures built at the same point see the same cell.
    fn find_or_create_upvalue(
        &mut self,
        co: &CoroutineHandle,
        index: usize,
    ) -> LuaResult<UpvalueHandle> {
        let mut co_mut = co.borrow_mut();
        let frame = co_mut
            .frames
            .last_mut()
            .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
        if let Some((_, cell)) = frame.open_upvalues.iter().find(|(i, _)| *i == index) {
            return Ok(Rc::clone(cell));
        }
        let cell = Rc::new(RefCell::new(UpvalueState::Open {
            regs: Rc::clone(&frame.regs),
            index,
        }));
        frame.open_upvalues.push((index, Rc::clone(&cell)));
        Ok(cell)
    }

    /// Close every open up-value of the innermost frame whose register
    /// index is `>= from`.
    fn close_frame_upvalues(&mut self, co: &CoroutineHandle, from: usize) -> LuaResult<()> {
        let cells = {
            let mut co_mut = co.borrow_mut();
            let frame = co_mut
                .frames
                .last_mut()
                .ok_or_else(|| LuaError::Runtime("no active frame".to_string()))?;
            let mut closing = Vec::new();
            frame.open_upvalues.retain(|(index, cell)| {
                if *index >= from {
                    closing.push(Rc::clone(cell));
                    false
                } else {
                    true
                }
            });
            closing
        };
        for cell in cells {
            cell.borrow_mut().close();
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Value operations and metamethod dispatch
    // ----------------------------------------------------------------

    /// The metatable attached to a value: tables carry their own, strings
    /// share the library-wide one, everything else has none.
    pub(crate) fn value_metatable(&self, value: &Value) -> Option<TableHandle> {
        match value {
            Value::Table(t) => t.borrow().metatable(),
            Value::String(_) => self.string_metatable.clone(),
            _ => None,
        }
    }

    /// Look up a metamethod on a value. Nil entries count as absent.
    pub(crate) fn metamethod_of(&self, value: &Value, mm: Metamethod) -> Option<Value> {
        let metatable = self.value_metatable(value)?;
        let key = Value::String(Rc::clone(&self.metamethod_names[mm as usize]));
        let entry = metatable.borrow().raw_get(&key);
        if entry.is_nil() {
            None
        } else {
            Some(entry)
        }
    }

    /// Arithmetic with coercion and metamethod fallback: left operand's
    /// handler first, then the right's.
    pub(crate) fn arith(
        &mut self,
        co: &CoroutineHandle,
        mm: Metamethod,
        lhs: Value,
        rhs: Value,
    ) -> LuaResult<Value> {
        if let (Some(x), Some(y)) = (lhs.coerce_number(), rhs.coerce_number()) {
            let n = match mm {
                Metamethod::Add => x + y,
                Metamethod::Sub => x - y,
                Metamethod::Mul => x * y,
                Metamethod::Div => x / y,
                Metamethod::Mod => x - (x / y).floor() * y,
                Metamethod::Pow => x.powf(y),
                _ => {
                    return Err(LuaError::Runtime(format!(
                        "bad arithmetic metamethod {}",
                        mm
                    )))
                }
            };
            return Ok(Value::Number(n));
        }
        let handler = self
            .metamethod_of(&lhs, mm)
            .or_else(|| self.metamethod_of(&rhs, mm));
        match handler {
            Some(handler) => Ok(first_value(self.call_value(co, handler, vec![lhs, rhs])?)),
            None => {
                let offender = if lhs.coerce_number().is_none() {
                    &lhs
                } else {
                    &rhs
                };
                Err(LuaError::type_error(format!(
                    "attempt to perform arithmetic on a {} value",
                    offender.type_name()
                )))
            }
        }
    }

    /// One step of `..`: strings and numbers concatenate natively,
    /// everything else dispatches `__concat` (left operand first).
    fn concat_pair(
        &mut self,
        co: &CoroutineHandle,
        lhs: Value,
        rhs: Value,
    ) -> LuaResult<Value> {
        if let (Some(mut left), Some(right)) = (lhs.coerce_string(), rhs.coerce_string()) {
            left.extend_from_slice(&right);
            return Ok(Value::String(Rc::new(LuaString::from_bytes(left))));
        }
        let handler = self
            .metamethod_of(&lhs, Metamethod::Concat)
            .or_else(|| self.metamethod_of(&rhs, Metamethod::Concat));
        match handler {
            Some(handler) => Ok(first_value(self.call_value(co, handler, vec![lhs, rhs])?)),
            None => {
                let offender = if lhs.coerce_string().is_none() {
                    &lhs
                } else {
                    &rhs
                };
                Err(LuaError::type_error(format!(
                    "attempt to concatenate a {} value",
                    offender.type_name()
                )))
            }
        }
    }

    /// The `#` operator.
    pub(crate) fn length_of(&mut self, co: &CoroutineHandle, value: Value) -> LuaResult<Value> {
        match &value {
            Value::String(s) => Ok(Value::Number(s.len() as f64)),
            Value::Table(t) => match self.metamethod_of(&value, Metamethod::Len) {
                Some(handler) => {
                    Ok(first_value(self.call_value(co, handler, vec![value.clone()])?))
                }
                None => Ok(Value::Number(t.borrow().len() as f64)),
            },
            other => Err(LuaError::type_error(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        }
    }

    /// Equality: raw first; `__eq` only when both operands are tables whose
    /// handlers are the same function.
    pub(crate) fn values_equal(
        &mut self,
        co: &CoroutineHandle,
        lhs: &Value,
        rhs: &Value,
    ) -> LuaResult<bool> {
        if lhs == rhs {
            return Ok(true);
        }
        if let (Value::Table(_), Value::Table(_)) = (lhs, rhs) {
            let left = self.metamethod_of(lhs, Metamethod::Eq);
            let right = self.metamethod_of(rhs, Metamethod::Eq);
            if let (Some(left), Some(right)) = (left, right) {
                if left == right {
                    let results =
                        self.call_value(co, left, vec![lhs.clone(), rhs.clone()])?;
                    return Ok(results.first().map(Value::truthy).unwrap_or(false));
                }
            }
        }
        Ok(false)
    }

    fn order_error(&self, lhs: &Value, rhs: &Value) -> LuaError {
        if lhs.type_name() == rhs.type_name() {
            LuaError::type_error(format!(
                "attempt to compare two {} values",
                lhs.type_name()
            ))
        } else {
            LuaError::type_error(format!(
                "attempt to compare {} with {}",
                lhs.type_name(),
                rhs.type_name()
            ))
        }
    }

    /// `<`: numbers numerically, strings byte-wise, otherwise `__lt` shared
    /// by both operands.
    pub(crate) fn less_than(
        &mut self,
        co: &CoroutineHandle,
        lhs: Value,
        rhs: Value,
    ) -> LuaResult<bool> {
        match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a < b),
            (Value::String(a), Value::String(b)) => Ok(a.as_bytes() < b.as_bytes()),
            _ => {
                let left = self.metamethod_of(&lhs, Metamethod::Lt);
                let right = self.metamethod_of(&rhs, Metamethod::Lt);
                match (left, right) {
                    (Some(left), Some(right)) if left == right => {
                        let results = self.call_value(co, left, vec![lhs, rhs])?;
                        Ok(results.first().map(Value::truthy).unwrap_or(false))
                    }
                    _ => Err(self.order_error(&lhs, &rhs)),
                }
            }
        }
    }

    /// `<=`: as `less_than`, with the `not (b < a)` fallback through `__lt`
    /// when `__le` is absent.
    pub(crate) fn less_equal(
        &mut self,
        co: &CoroutineHandle,
        lhs: Value,
        rhs: Value,
    ) -> LuaResult<bool> {
        match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a <= b),
            (Value::String(a), Value::String(b)) => Ok(a.as_bytes() <= b.as_bytes()),
            _ => {
                let left = self.metamethod_of(&lhs, Metamethod::Le);
                let right = self.metamethod_of(&rhs, Metamethod::Le);
                if let (Some(left), Some(right)) = (left, right) {
                    if left == right {
                        let results = self.call_value(co, left, vec![lhs, rhs])?;
                        return Ok(results.first().map(Value::truthy).unwrap_or(false));
                    }
                    return Err(self.order_error(&lhs, &rhs));
                }
                let left = self.metamethod_of(&lhs, Metamethod::Lt);
                let right = self.metamethod_of(&rhs, Metamethod::Lt);
                match (left, right) {
                    (Some(left), Some(right)) if left == right => {
                        let results = self.call_value(co, left, vec![rhs, lhs])?;
                        Ok(!results.first().map(Value::truthy).unwrap_or(false))
                    }
                    _ => Err(self.order_error(&lhs, &rhs)),
                }
            }
        }
    }

    /// Table read with the full `__index` chain.
    pub(crate) fn index_value(
        &mut self,
        co: &CoroutineHandle,
        base: Value,
        key: Value,
    ) -> LuaResult<Value> {
        let mut target = base;
        for _ in 0..MAX_TAG_LOOP {
            if let Value::Table(t) = &target {
                let raw = t.borrow().raw_get(&key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.metamethod_of(&target, Metamethod::Index) {
                    None => return Ok(Value::Nil),
                    Some(handler) if handler.is_function() => {
                        return Ok(first_value(
                            self.call_value(co, handler, vec![target, key])?,
                        ));
                    }
                    Some(next) => target = next,
                }
            } else {
                match self.metamethod_of(&target, Metamethod::Index) {
                    Some(handler) if handler.is_function() => {
                        return Ok(first_value(
                            self.call_value(co, handler, vec![target, key])?,
                        ));
                    }
                    Some(next) => target = next,
                    None => {
                        return Err(LuaError::type_error(format!(
                            "attempt to index a {} value",
                            target.type_name()
                        )))
                    }
                }
            }
        }
        Err(LuaError::Runtime("'__index' chain too long; possible loop".to_string()))
    }

    /// Table write with the full `__newindex` chain. `__newindex` fires
    /// only when the key is absent from the table itself.
    pub(crate) fn newindex_value(
        &mut self,
        co: &CoroutineHandle,
        base: Value,
        key: Value,
        value: Value,
    ) -> LuaResult<()> {
        let mut target = base;
        for _ in 0..MAX_TAG_LOOP {
            if let Value::Table(t) = &target {
                let existing = t.borrow().raw_get(&key);
                if !existing.is_nil() {
                    return t.borrow_mut().raw_set(key, value);
                }
                match self.metamethod_of(&target, Metamethod::NewIndex) {
                    None => return t.borrow_mut().raw_set(key, value),
                    Some(handler) if handler.is_function() => {
                        self.call_value(co, handler, vec![target, key, value])?;
                        return Ok(());
                    }
                    Some(next) => target = next,
                }
            } else {
                match self.metamethod_of(&target, Metamethod::NewIndex) {
                    Some(handler) if handler.is_function() => {
                        self.call_value(co, handler, vec![target, key, value])?;
                        return Ok(());
                    }
                    Some(next) => target = next,
                    None => {
                        return Err(LuaError::type_error(format!(
                            "attempt to index a {} value",
                            target.type_name()
                        )))
                    }
                }
            }
        }
        Err(LuaError::Runtime("'__newindex' chain too long; possible loop".to_string()))
    }
}

/// Context handed to host functions: access to the VM and the coroutine the
/// call is running on.
pub struct ExecutionContext<'a> {
    vm: &'a mut LuaVM,
    co: CoroutineHandle,
}

impl<'a> ExecutionContext<'a> {
    /// The global table.
    pub fn globals(&self) -> TableHandle {
        self.vm.globals()
    }

    /// Call a Lua or host function and collect its results. Yields cannot
    /// cross this boundary.
    pub fn call(&mut self, func: Value, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        let co = Rc::clone(&self.co);
        self.vm.call_value(&co, func, args)
    }

    /// Resume another coroutine.
    pub fn resume(&mut self, co: &CoroutineHandle, args: Vec<Value>) -> LuaResult<ResumeResult> {
        self.vm.resume_coroutine(co, args)
    }

    /// Index a value with full metamethod dispatch.
    pub fn index(&mut self, base: Value, key: Value) -> LuaResult<Value> {
        let co = Rc::clone(&self.co);
        self.vm.index_value(&co, base, key)
    }

    /// Metatable of a value (strings share the library-wide one).
    pub fn value_metatable(&self, value: &Value) -> Option<TableHandle> {
        self.vm.value_metatable(value)
    }

    /// Metamethod lookup on a value.
    pub fn metamethod_of(&self, value: &Value, mm: Metamethod) -> Option<Value> {
        self.vm.metamethod_of(value, mm)
    }

    /// The `#` operator.
    pub fn length_of(&mut self, value: Value) -> LuaResult<Value> {
        let co = Rc::clone(&self.co);
        self.vm.length_of(&co, value)
    }

    /// The `print` sink.
    pub fn output(&mut self) -> &mut dyn Write {
        self.vm.output()
    }
}

// ----------------------------------------------------------------
// Register and operand helpers
// ----------------------------------------------------------------

fn reg(regs: &RegisterFile, index: usize) -> Value {
    regs.borrow().get(index).cloned().unwrap_or(Value::Nil)
}

fn set_reg(regs: &RegisterFile, index: usize, value: Value) {
    let mut regs = regs.borrow_mut();
    if index >= regs.len() {
        regs.resize(index + 1, Value::Nil);
    }
    regs[index] = value;
}

fn constant(proto: &FunctionProto, index: usize) -> LuaResult<Value> {
    proto
        .constants
        .get(index)
        .cloned()
        .ok_or_else(|| LuaError::Runtime(format!("invalid constant index {}", index)))
}

/// Resolve an RK operand to a register or constant value.
fn rk(proto: &FunctionProto, regs: &RegisterFile, operand: u32) -> LuaResult<Value> {
    let (is_constant, index) = Instruction::rk(operand);
    if is_constant {
        constant(proto, index)
    } else {
        Ok(reg(regs, index))
    }
}

fn upvalue(closure: &ClosureHandle, index: usize) -> LuaResult<UpvalueHandle> {
    closure
        .upvalues
        .get(index)
        .cloned()
        .ok_or_else(|| LuaError::Runtime(format!("invalid upvalue index {}", index)))
}

fn first_value(values: Vec<Value>) -> Value {
    values.into_iter().next().unwrap_or(Value::Nil)
}

fn for_number(value: Value, what: &str) -> LuaResult<f64> {
    value
        .coerce_number()
        .ok_or_else(|| LuaError::Runtime(format!("{} must be a number", what)))
}
