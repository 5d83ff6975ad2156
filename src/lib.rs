//! selenite - an interpreter for pre-compiled Lua 5.1 bytecode.
//!
//! The crate loads a binary chunk (`luac` output), reconstructs its tree of
//! function prototypes, and executes the top-level chunk on a register-based
//! virtual machine implementing the full Lua 5.1 value model: metatables,
//! closures with shared up-values, tail calls, varargs, generic-for
//! iterators and single-threaded cooperative coroutines.
//!
//! ```no_run
//! use selenite::LuaVM;
//!
//! # fn main() -> selenite::LuaResult<()> {
//! let bytes = std::fs::read("chunk.luac").expect("readable chunk");
//! let mut vm = LuaVM::load(&bytes)?;
//! let results = vm.run()?;
//! for value in results {
//!     println!("{}", value);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! This is an execution-only runtime: inputs are pre-compiled, and there is
//! no source compiler.

pub mod chunk;
pub mod error;
pub mod metamethod;
pub mod opcode;
pub mod stdlib;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{LuaError, LuaResult};
pub use value::Value;
pub use vm::{CoroutineStatus, LuaVM, ResumeResult, VmConfig};
