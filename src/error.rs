//! Error types for the selenite runtime.
//!
//! Two error kinds are kept strictly apart: chunk format errors raised by the
//! binary reader, and runtime errors raised during execution. Runtime errors
//! are decorated with a `source:line:` position exactly once, at the faulting
//! instruction, and become `LuaError::Script` from then on.

use thiserror::Error;

use crate::value::Value;

/// Result type for all runtime operations.
pub type LuaResult<T> = std::result::Result<T, LuaError>;

/// Errors that can occur while loading or executing a chunk.
#[derive(Debug, Clone, Error)]
pub enum LuaError {
    /// The binary chunk is malformed: bad signature, unsupported version,
    /// unknown constant tag, unsupported size declaration. Never recoverable
    /// from inside the script.
    #[error("bad chunk format: {0}")]
    ChunkFormat(String),

    /// A raw runtime error that has not yet been given a source position.
    #[error("{0}")]
    Runtime(String),

    /// Type mismatch during execution, e.g. "attempt to call a nil value".
    #[error("{message}")]
    Type {
        /// Lua-style description of the mismatch.
        message: String,
    },

    /// A host function rejected one of its arguments.
    #[error("bad argument #{arg} to '{func}' ({msg})")]
    BadArgument {
        /// Function name as the script knows it.
        func: String,
        /// 1-based argument position.
        arg: usize,
        /// What was wrong with it.
        msg: String,
    },

    /// Call stack exceeded the configured depth.
    #[error("stack overflow")]
    StackOverflow,

    /// A runtime error carrying its `source:line:` prefix. Terminal form;
    /// never re-decorated.
    #[error("{0}")]
    Script(String),

    /// Internal unwind token for `coroutine.yield`. Caught at the nearest
    /// resume boundary; never surfaced to the embedder.
    #[doc(hidden)]
    #[error("attempt to yield from outside a coroutine")]
    Yield(Vec<Value>),
}

impl LuaError {
    /// Shorthand for a Lua-style "attempt to ..." type error.
    pub fn type_error(message: impl Into<String>) -> LuaError {
        LuaError::Type {
            message: message.into(),
        }
    }

    /// True once the error carries its source position (or needs none).
    pub fn is_positioned(&self) -> bool {
        matches!(
            self,
            LuaError::Script(_) | LuaError::ChunkFormat(_) | LuaError::Yield(_)
        )
    }

    /// Attach a `source:line:` prefix to a raw runtime error. Already
    /// positioned errors pass through unchanged.
    pub fn positioned(self, source: &str, line: u32) -> LuaError {
        if self.is_positioned() {
            self
        } else {
            LuaError::Script(format!("{}:{}: {}", source, line, self))
        }
    }
}
