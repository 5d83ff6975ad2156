//! Metamethod names.
//!
//! Every operation that cannot be resolved natively consults a metatable
//! entry named here. The set is fixed: exactly the sixteen events Lua 5.1
//! dispatches on.

use std::fmt;

/// The metamethods recognised by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metamethod {
    /// `__add` - addition
    Add,

    /// `__sub` - subtraction
    Sub,

    /// `__mul` - multiplication
    Mul,

    /// `__div` - division
    Div,

    /// `__mod` - modulo
    Mod,

    /// `__pow` - exponentiation
    Pow,

    /// `__unm` - unary minus
    Unm,

    /// `__concat` - concatenation
    Concat,

    /// `__len` - length operator
    Len,

    /// `__eq` - equality
    Eq,

    /// `__lt` - less than
    Lt,

    /// `__le` - less than or equal
    Le,

    /// `__index` - table indexing
    Index,

    /// `__newindex` - table assignment
    NewIndex,

    /// `__call` - function call
    Call,

    /// `__metatable` - metatable protection
    Metatable,
}

impl Metamethod {
    /// All metamethods, in a fixed order usable as an interning index.
    pub const ALL: [Metamethod; 16] = [
        Metamethod::Add,
        Metamethod::Sub,
        Metamethod::Mul,
        Metamethod::Div,
        Metamethod::Mod,
        Metamethod::Pow,
        Metamethod::Unm,
        Metamethod::Concat,
        Metamethod::Len,
        Metamethod::Eq,
        Metamethod::Lt,
        Metamethod::Le,
        Metamethod::Index,
        Metamethod::NewIndex,
        Metamethod::Call,
        Metamethod::Metatable,
    ];

    /// Get the string name of the metamethod.
    pub fn name(&self) -> &'static str {
        match self {
            Metamethod::Add => "__add",
            Metamethod::Sub => "__sub",
            Metamethod::Mul => "__mul",
            Metamethod::Div => "__div",
            Metamethod::Mod => "__mod",
            Metamethod::Pow => "__pow",
            Metamethod::Unm => "__unm",
            Metamethod::Concat => "__concat",
            Metamethod::Len => "__len",
            Metamethod::Eq => "__eq",
            Metamethod::Lt => "__lt",
            Metamethod::Le => "__le",
            Metamethod::Index => "__index",
            Metamethod::NewIndex => "__newindex",
            Metamethod::Call => "__call",
            Metamethod::Metatable => "__metatable",
        }
    }

    /// Check if this metamethod is an arithmetic metamethod.
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Metamethod::Add
                | Metamethod::Sub
                | Metamethod::Mul
                | Metamethod::Div
                | Metamethod::Mod
                | Metamethod::Pow
                | Metamethod::Unm
        )
    }

    /// Check if this metamethod is a comparison metamethod.
    pub fn is_comparison(&self) -> bool {
        matches!(self, Metamethod::Eq | Metamethod::Lt | Metamethod::Le)
    }
}

impl fmt::Display for Metamethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
