//! Shared test support: assembles real binary chunks so every test drives
//! the public loader and VM with genuine `.luac` bytes.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use selenite::opcode::OpCode;
use selenite::LuaVM;

/// Encode an A/B/C instruction following the Lua 5.1 layout:
/// bits 0-5 opcode, 6-13 A, 14-22 C, 23-31 B.
pub fn encode_abc(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
    op as u32 | (a << 6) | (c << 14) | (b << 23)
}

/// Encode an A/Bx instruction.
pub fn encode_abx(op: OpCode, a: u32, bx: u32) -> u32 {
    op as u32 | (a << 6) | (bx << 14)
}

/// Encode an A/sBx instruction (signed, biased by 131071).
pub fn encode_asbx(op: OpCode, a: u32, sbx: i32) -> u32 {
    encode_abx(op, a, (sbx + 131071) as u32)
}

/// Mark a 9-bit operand as a constant-pool index.
pub const RK: u32 = 0x100;

/// A constant-pool entry for the builder.
#[derive(Clone, Debug)]
pub enum Const {
    Nil,
    Bool(bool),
    Num(f64),
    Str(&'static str),
}

/// One prototype under construction.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    pub source: Option<&'static str>,
    pub line_defined: i64,
    pub last_line_defined: i64,
    pub num_upvalues: u8,
    pub num_params: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
    pub code: Vec<u32>,
    pub constants: Vec<Const>,
    pub protos: Vec<Proto>,
    pub lines: Vec<u32>,
}

impl Proto {
    /// A main-chunk prototype: named, variadic, with a line table matching
    /// the code length.
    pub fn main(code: Vec<u32>, constants: Vec<Const>) -> Proto {
        let lines = (1..=code.len() as u32).collect();
        Proto {
            source: Some("@test.lua"),
            is_vararg: 2,
            max_stack_size: 16,
            code,
            constants,
            lines,
            ..Proto::default()
        }
    }

    /// A nested function prototype.
    pub fn function(
        num_params: u8,
        num_upvalues: u8,
        code: Vec<u32>,
        constants: Vec<Const>,
    ) -> Proto {
        let lines = (1..=code.len() as u32).collect();
        Proto {
            source: None,
            line_defined: 1,
            last_line_defined: 1,
            num_params,
            num_upvalues,
            max_stack_size: 16,
            code,
            constants,
            lines,
            ..Proto::default()
        }
    }

    pub fn with_protos(mut self, protos: Vec<Proto>) -> Proto {
        self.protos = protos;
        self
    }
}

/// Serialises a prototype tree into `.luac` bytes per the 5.1 format.
pub struct ChunkBuilder {
    pub main: Proto,
    pub big_endian: bool,
    pub int_size: u8,
    pub size_t_size: u8,
    pub number_size: u8,
    pub integral_numbers: bool,
}

impl ChunkBuilder {
    /// The common x86-64 luac layout: little-endian, 4-byte int, 8-byte
    /// size_t, 8-byte float numbers.
    pub fn new(main: Proto) -> ChunkBuilder {
        ChunkBuilder {
            main,
            big_endian: false,
            int_size: 4,
            size_t_size: 8,
            number_size: 8,
            integral_numbers: false,
        }
    }

    pub fn big_endian(mut self) -> ChunkBuilder {
        self.big_endian = true;
        self
    }

    pub fn size_t_size(mut self, size: u8) -> ChunkBuilder {
        self.size_t_size = size;
        self
    }

    pub fn integral_numbers(mut self, number_size: u8) -> ChunkBuilder {
        self.integral_numbers = true;
        self.number_size = number_size;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x1B, 0x4C, 0x75, 0x61]);
        out.push(0x51);
        out.push(0);
        out.push(if self.big_endian { 0 } else { 1 });
        out.push(self.int_size);
        out.push(self.size_t_size);
        out.push(4);
        out.push(self.number_size);
        out.push(if self.integral_numbers { 1 } else { 0 });
        self.write_proto(&mut out, &self.main);
        out
    }

    fn write_uint(&self, out: &mut Vec<u8>, width: u8, value: u64) {
        let bytes = value.to_le_bytes();
        if self.big_endian {
            for i in (0..width as usize).rev() {
                out.push(bytes[i]);
            }
        } else {
            out.extend_from_slice(&bytes[..width as usize]);
        }
    }

    fn write_int(&self, out: &mut Vec<u8>, value: i64) {
        self.write_uint(out, self.int_size, value as u64);
    }

    fn write_size(&self, out: &mut Vec<u8>, value: usize) {
        self.write_uint(out, self.size_t_size, value as u64);
    }

    fn write_number(&self, out: &mut Vec<u8>, value: f64) {
        if self.integral_numbers {
            self.write_uint(out, self.number_size, value as i64 as u64);
        } else if self.number_size == 4 {
            self.write_uint(out, 4, (value as f32).to_bits() as u64);
        } else {
            self.write_uint(out, 8, value.to_bits());
        }
    }

    fn write_string(&self, out: &mut Vec<u8>, value: Option<&str>) {
        match value {
            None => self.write_size(out, 0),
            Some(text) => {
                self.write_size(out, text.len() + 1);
                out.extend_from_slice(text.as_bytes());
                out.push(0);
            }
        }
    }

    fn write_proto(&self, out: &mut Vec<u8>, proto: &Proto) {
        self.write_string(out, proto.source);
        self.write_int(out, proto.line_defined);
        self.write_int(out, proto.last_line_defined);
        out.push(proto.num_upvalues);
        out.push(proto.num_params);
        out.push(proto.is_vararg);
        out.push(proto.max_stack_size);

        self.write_int(out, proto.code.len() as i64);
        for word in &proto.code {
            self.write_uint(out, 4, *word as u64);
        }

        self.write_int(out, proto.constants.len() as i64);
        for constant in &proto.constants {
            match constant {
                Const::Nil => out.push(0),
                Const::Bool(b) => {
                    out.push(1);
                    out.push(if *b { 1 } else { 0 });
                }
                Const::Num(n) => {
                    out.push(3);
                    self.write_number(out, *n);
                }
                Const::Str(s) => {
                    out.push(4);
                    self.write_string(out, Some(s));
                }
            }
        }

        self.write_int(out, proto.protos.len() as i64);
        for nested in &proto.protos {
            self.write_proto(out, nested);
        }

        self.write_int(out, proto.lines.len() as i64);
        for line in &proto.lines {
            self.write_int(out, *line as i64);
        }

        // No local-variable or upvalue-name debug records.
        self.write_int(out, 0);
        self.write_int(out, 0);
    }
}

/// Build the default-layout chunk for a main prototype.
pub fn chunk(main: Proto) -> Vec<u8> {
    ChunkBuilder::new(main).build()
}

/// A chunk that calls `global` (optionally `global.field`) with constant
/// arguments and returns every result.
pub fn call_chunk(global: &'static str, field: Option<&'static str>, args: Vec<Const>) -> Vec<u8> {
    let mut constants = vec![Const::Str(global)];
    let mut code = vec![encode_abx(OpCode::GetGlobal, 0, 0)];
    if let Some(field) = field {
        constants.push(Const::Str(field));
        code.push(encode_abc(OpCode::GetTable, 0, 0, RK | 1));
    }
    let base = constants.len() as u32;
    let nargs = args.len() as u32;
    for (i, constant) in args.into_iter().enumerate() {
        constants.push(constant);
        code.push(encode_abx(OpCode::LoadK, 1 + i as u32, base + i as u32));
    }
    code.push(encode_abc(OpCode::Call, 0, nargs + 1, 0));
    code.push(encode_abc(OpCode::Return, 0, 0, 0));
    chunk(Proto::main(code, constants))
}

/// A `Write` sink tests can hand to `LuaVM::set_output` and read back.
pub struct SharedOutput(pub Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Redirect a VM's print sink into a shared buffer.
pub fn capture_output(vm: &mut LuaVM) -> Rc<RefCell<Vec<u8>>> {
    let buffer = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(Box::new(SharedOutput(Rc::clone(&buffer))));
    buffer
}

/// Run a chunk and collect what it printed.
pub fn run_and_print(bytes: &[u8]) -> String {
    let mut vm = LuaVM::load(bytes).expect("chunk loads");
    let buffer = capture_output(&mut vm);
    vm.run().expect("chunk runs");
    let bytes = buffer.borrow();
    String::from_utf8_lossy(&bytes).into_owned()
}
