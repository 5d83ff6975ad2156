//! Binary chunk reader for pre-compiled Lua 5.1 (`luac`) files.
//!
//! The header declares endianness and the widths of the integer, `size_t`,
//! instruction and number types; every multi-byte read afterwards honors
//! those declarations. Prototypes are read recursively: code, constants,
//! nested prototypes, then debug information.

use std::rc::Rc;

use log::debug;

use crate::error::{LuaError, LuaResult};
use crate::value::{LuaString, Value};

/// `\x1BLua`
pub const SIGNATURE: [u8; 4] = [0x1B, 0x4C, 0x75, 0x61];

/// Lua 5.1 version byte.
pub const VERSION: u8 = 0x51;

/// Constant-pool tags.
const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

/// The declared layout of a binary chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Multi-byte fields are big-endian when set.
    pub big_endian: bool,

    /// Size of the platform `int`, in bytes (4 or 8).
    pub int_size: u8,

    /// Size of `size_t`, in bytes (4 or 8).
    pub size_t_size: u8,

    /// Size of one instruction word (must be 4).
    pub instruction_size: u8,

    /// Size of a Lua number (4 or 8).
    pub number_size: u8,

    /// Numbers are stored as integers when set, floats otherwise.
    pub integral_numbers: bool,
}

/// A local-variable debug record.
#[derive(Debug, Clone)]
pub struct LocalVar {
    /// Variable name.
    pub name: String,

    /// First instruction where the variable is live.
    pub start_pc: u32,

    /// First instruction where it is dead.
    pub end_pc: u32,
}

/// The immutable compiled form of one Lua function.
#[derive(Debug)]
pub struct FunctionProto {
    /// Display name of the chunk, with any leading `@`/`=` marker stripped.
    pub source: String,

    /// Line where the function starts (0 for the main chunk).
    pub line_defined: i64,

    /// Line where the function ends.
    pub last_line_defined: i64,

    /// Number of up-values the function captures.
    pub num_upvalues: u8,

    /// Number of named parameters.
    pub num_params: u8,

    /// Whether the function accepts `...`.
    pub is_vararg: bool,

    /// Register-file size the compiler reserved.
    pub max_stack_size: u8,

    /// Instruction stream.
    pub code: Vec<u32>,

    /// Constant pool: only nil, boolean, number and string values occur.
    pub constants: Vec<Value>,

    /// Nested function prototypes, indexed by `CLOSURE`'s Bx operand.
    pub protos: Vec<Rc<FunctionProto>>,

    /// Source line per instruction.
    pub source_lines: Vec<u32>,

    /// Local-variable debug records.
    pub locals: Vec<LocalVar>,

    /// Up-value names.
    pub upvalue_names: Vec<String>,
}

impl FunctionProto {
    /// Source line for the instruction at `pc`, or 0 when the chunk was
    /// stripped.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.source_lines.get(pc).copied().unwrap_or(0)
    }
}

/// Load a binary chunk, producing the main prototype.
pub fn load_chunk(bytes: &[u8]) -> LuaResult<Rc<FunctionProto>> {
    let mut reader = ChunkReader::new(bytes)?;
    let main = reader.read_proto(None)?;
    debug!(
        "loaded chunk '{}': {} instructions, {} constants, {} nested prototypes",
        main.source,
        main.code.len(),
        main.constants.len(),
        main.protos.len()
    );
    Ok(main)
}

/// Cursor over the chunk bytes, parameterised by the header.
struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
    header: ChunkHeader,
}

impl<'a> ChunkReader<'a> {
    /// Consume and validate the 12-byte header.
    fn new(data: &'a [u8]) -> LuaResult<ChunkReader<'a>> {
        let mut reader = ChunkReader {
            data,
            pos: 0,
            header: ChunkHeader {
                big_endian: false,
                int_size: 4,
                size_t_size: 8,
                instruction_size: 4,
                number_size: 8,
                integral_numbers: false,
            },
        };

        let signature = reader.read_bytes(4)?;
        if signature != SIGNATURE {
            return Err(LuaError::ChunkFormat("bad signature".to_string()));
        }
        let version = reader.read_byte()?;
        if version != VERSION {
            return Err(LuaError::ChunkFormat(format!(
                "unsupported version 0x{:02x} (expected 0x51)",
                version
            )));
        }
        let format = reader.read_byte()?;
        if format != 0 {
            return Err(LuaError::ChunkFormat(format!(
                "unsupported format {}",
                format
            )));
        }
        let endianness = reader.read_byte()?;
        let big_endian = match endianness {
            0 => true,
            1 => false,
            other => {
                return Err(LuaError::ChunkFormat(format!(
                    "bad endianness flag {}",
                    other
                )))
            }
        };
        let int_size = reader.read_byte()?;
        let size_t_size = reader.read_byte()?;
        let instruction_size = reader.read_byte()?;
        let number_size = reader.read_byte()?;
        let integral_flag = reader.read_byte()?;

        if !matches!(int_size, 4 | 8) {
            return Err(LuaError::ChunkFormat(format!(
                "unsupported int size {}",
                int_size
            )));
        }
        if !matches!(size_t_size, 4 | 8) {
            return Err(LuaError::ChunkFormat(format!(
                "unsupported size_t size {}",
                size_t_size
            )));
        }
        if instruction_size != 4 {
            return Err(LuaError::ChunkFormat(format!(
                "unsupported instruction size {}",
                instruction_size
            )));
        }
        if !matches!(number_size, 4 | 8) {
            return Err(LuaError::ChunkFormat(format!(
                "unsupported number size {}",
                number_size
            )));
        }
        let integral_numbers = match integral_flag {
            0 => false,
            1 => true,
            other => {
                return Err(LuaError::ChunkFormat(format!(
                    "bad integral flag {}",
                    other
                )))
            }
        };

        reader.header = ChunkHeader {
            big_endian,
            int_size,
            size_t_size,
            instruction_size,
            number_size,
            integral_numbers,
        };
        debug!("chunk header: {:?}", reader.header);
        Ok(reader)
    }

    fn read_byte(&mut self) -> LuaResult<u8> {
        let byte = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| LuaError::ChunkFormat("unexpected end of chunk".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, count: usize) -> LuaResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| LuaError::ChunkFormat("unexpected end of chunk".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Unsigned integer of `width` bytes honoring the declared endianness.
    fn read_uint(&mut self, width: u8) -> LuaResult<u64> {
        let bytes = self.read_bytes(width as usize)?;
        let mut value: u64 = 0;
        if self.header.big_endian {
            for byte in bytes {
                value = (value << 8) | u64::from(*byte);
            }
        } else {
            for byte in bytes.iter().rev() {
                value = (value << 8) | u64::from(*byte);
            }
        }
        Ok(value)
    }

    /// The chunk's `int` type, signed.
    fn read_int(&mut self) -> LuaResult<i64> {
        let width = self.header.int_size;
        let raw = self.read_uint(width)?;
        Ok(if width == 4 { raw as u32 as i32 as i64 } else { raw as i64 })
    }

    /// A non-negative `int`, used for sequence lengths.
    fn read_count(&mut self) -> LuaResult<usize> {
        let count = self.read_int()?;
        if count < 0 {
            return Err(LuaError::ChunkFormat(format!(
                "negative sequence length {}",
                count
            )));
        }
        // Every element is at least one byte, so a count beyond the
        // remaining input can only be corruption.
        let count = count as usize;
        if count > self.data.len() - self.pos {
            return Err(LuaError::ChunkFormat(format!(
                "sequence length {} exceeds chunk size",
                count
            )));
        }
        Ok(count)
    }

    /// The chunk's `size_t` type.
    fn read_size(&mut self) -> LuaResult<usize> {
        let raw = self.read_uint(self.header.size_t_size)?;
        usize::try_from(raw)
            .map_err(|_| LuaError::ChunkFormat(format!("size_t value {} too large", raw)))
    }

    /// A Lua number, decoded per the header's width and integral flag.
    fn read_number(&mut self) -> LuaResult<f64> {
        let width = self.header.number_size;
        let raw = self.read_uint(width)?;
        Ok(if self.header.integral_numbers {
            if width == 4 {
                (raw as u32 as i32) as f64
            } else {
                (raw as i64) as f64
            }
        } else if width == 4 {
            f32::from_bits(raw as u32) as f64
        } else {
            f64::from_bits(raw)
        })
    }

    /// One instruction word.
    fn read_instruction(&mut self) -> LuaResult<u32> {
        Ok(self.read_uint(self.header.instruction_size)? as u32)
    }

    /// A length-prefixed Lua string. Length 0 denotes a null string;
    /// otherwise the payload is followed by a trailing NUL that is not part
    /// of the content.
    fn read_string(&mut self) -> LuaResult<Option<Vec<u8>>> {
        let size = self.read_size()?;
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(size)?;
        Ok(Some(bytes[..size - 1].to_vec()))
    }

    /// A string read where the format requires a value to be present.
    fn read_string_required(&mut self, what: &str) -> LuaResult<String> {
        match self.read_string()? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            None => Err(LuaError::ChunkFormat(format!("missing {}", what))),
        }
    }

    /// One function prototype, recursively.
    fn read_proto(&mut self, parent_source: Option<&str>) -> LuaResult<Rc<FunctionProto>> {
        let source = match self.read_string()? {
            Some(bytes) => strip_source_marker(&String::from_utf8_lossy(&bytes)),
            None => parent_source.unwrap_or("?").to_string(),
        };
        let line_defined = self.read_int()?;
        let last_line_defined = self.read_int()?;
        let num_upvalues = self.read_byte()?;
        let num_params = self.read_byte()?;
        let is_vararg = self.read_byte()? != 0;
        let max_stack_size = self.read_byte()?;

        let code_len = self.read_count()?;
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            code.push(self.read_instruction()?);
        }

        let const_len = self.read_count()?;
        let mut constants = Vec::with_capacity(const_len);
        for _ in 0..const_len {
            constants.push(self.read_constant()?);
        }

        let proto_len = self.read_count()?;
        let mut protos = Vec::with_capacity(proto_len);
        for _ in 0..proto_len {
            protos.push(self.read_proto(Some(&source))?);
        }

        let line_len = self.read_count()?;
        let mut source_lines = Vec::with_capacity(line_len);
        for _ in 0..line_len {
            source_lines.push(self.read_int()? as u32);
        }

        let local_len = self.read_count()?;
        let mut locals = Vec::with_capacity(local_len);
        for _ in 0..local_len {
            let name = self.read_string_required("local variable name")?;
            let start_pc = self.read_int()? as u32;
            let end_pc = self.read_int()? as u32;
            locals.push(LocalVar {
                name,
                start_pc,
                end_pc,
            });
        }

        let upval_len = self.read_count()?;
        let mut upvalue_names = Vec::with_capacity(upval_len);
        for _ in 0..upval_len {
            upvalue_names.push(self.read_string_required("upvalue name")?);
        }

        Ok(Rc::new(FunctionProto {
            source,
            line_defined,
            last_line_defined,
            num_upvalues,
            num_params,
            is_vararg,
            max_stack_size,
            code,
            constants,
            protos,
            source_lines,
            locals,
            upvalue_names,
        }))
    }

    /// One tagged constant.
    fn read_constant(&mut self) -> LuaResult<Value> {
        let tag = self.read_byte()?;
        match tag {
            TAG_NIL => Ok(Value::Nil),
            TAG_BOOLEAN => Ok(Value::Boolean(self.read_byte()? != 0)),
            TAG_NUMBER => Ok(Value::Number(self.read_number()?)),
            TAG_STRING => match self.read_string()? {
                Some(bytes) => Ok(Value::String(Rc::new(LuaString::from_bytes(bytes)))),
                None => Ok(Value::String(Rc::new(LuaString::from_bytes(Vec::new())))),
            },
            other => Err(LuaError::ChunkFormat(format!(
                "unknown constant tag {}",
                other
            ))),
        }
    }
}

/// Strip the `@` (file) or `=` (custom) marker from a chunk name.
fn strip_source_marker(name: &str) -> String {
    name.strip_prefix('@')
        .or_else(|| name.strip_prefix('='))
        .unwrap_or(name)
        .to_string()
}
