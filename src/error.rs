//! Diagnostic types shared by every assembly pass.
//!
//! The shape follows the textual-IR reader convention of carrying a
//! `Location` alongside every error: here widened with a file name (programs
//! span multiple files via `.INCLUDE`/`.IMPORT`) and the offending raw line,
//! since every assembly diagnostic must be traceable back to source text.

use std::fmt;
use std::sync::Arc;

/// Origin of a line of source text: which file it came from and its
/// 1-based line number within that file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    /// Name of the originating file (or a synthetic name such as
    /// `"<macro FOO>"` for expander-generated lines).
    pub file: Arc<str>,
    /// 1-based line number within `file`.
    pub line: usize,
}

impl Location {
    /// Build a location from a file name and line number.
    pub fn new(file: impl Into<Arc<str>>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Classification of an assembly-time failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyErrorKind {
    /// Bad directive arity, missing end tag, or other lexical/syntactic fault.
    Syntax(String),
    /// Unknown opcode, unknown label, or a label colliding with an opcode
    /// mnemonic, or a duplicate label definition.
    Semantic(String),
    /// A block directive nested where nesting is forbidden, an unexpected
    /// end tag, or `.PREG` used outside `.PROC`.
    Structural(String),
    /// Wrong argument count for a macro/routine call or a `.WITH` clause.
    Arity(String),
    /// A macro/routine expansion cycle, or expansion depth exceeding the
    /// configured bound.
    Recursion(String),
    /// `.WITH` used against a stack-ABI procedure, a non-register actual,
    /// or a register-ABI procedure called without `.WITH`.
    Abi(String),
    /// A placeholder could not be resolved: unknown label, or a coordinate
    /// with no address, or vice versa.
    Resolver(String),
}

impl fmt::Display for AssemblyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(m) => write!(f, "syntax error: {m}"),
            Self::Semantic(m) => write!(f, "semantic error: {m}"),
            Self::Structural(m) => write!(f, "structural error: {m}"),
            Self::Arity(m) => write!(f, "arity error: {m}"),
            Self::Recursion(m) => write!(f, "recursion error: {m}"),
            Self::Abi(m) => write!(f, "ABI error: {m}"),
            Self::Resolver(m) => write!(f, "resolver error: {m}"),
        }
    }
}

/// An assembly error: where it happened, what the offending text was, and
/// what kind of failure it is. Assembly is pure and aborts on the first
/// error; this is that error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{location}: {kind} (in: {text:?})")]
pub struct AssemblyError {
    /// Where the error occurred.
    pub location: Location,
    /// The raw source text of the offending line, if one is available.
    pub text: String,
    /// What kind of failure this is.
    pub kind: AssemblyErrorKind,
}

impl AssemblyError {
    /// Construct a new error at `location`, with `text` as the offending
    /// source line.
    pub fn new(location: Location, text: impl Into<String>, kind: AssemblyErrorKind) -> Self {
        Self {
            location,
            text: text.into(),
            kind,
        }
    }
}

/// Result type returned by every assembly-pipeline function.
pub type AssemblyResult<T> = Result<T, AssemblyError>;

/// Construct an `Err(AssemblyError)` with a `format!`-style message, mirroring
/// the `err!` convenience macro pattern used by textual-IR readers.
macro_rules! asm_err {
    ($loc:expr, $text:expr, $variant:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        Err($crate::error::AssemblyError::new(
            $loc.clone(),
            $text,
            $crate::error::AssemblyErrorKind::$variant(format!($fmt $(, $arg)*)),
        ))
    };
}

pub(crate) use asm_err;

/// A runtime fault raised by a single instruction during a VM tick.
///
/// Unlike [`AssemblyError`] this is never returned as an `Err` from the
/// virtual machine's public API: the VM turns every fault into a sticky
/// `instructionFailed` condition for the current tick and continues, as the
/// specification requires. `VmFault` is the payload carried by that
/// stickiness.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmFault {
    /// The cell under `IP` is neither `CODE` nor empty, under strict typing.
    #[error("cell at instruction pointer is not code")]
    NotCode,
    /// The opcode word at `IP` does not name a registered instruction.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    /// An operand referenced a register id outside every configured bank.
    #[error("invalid register id {0}")]
    InvalidRegister(u32),
    /// An operand expected a scalar but found a vector, or vice versa.
    #[error("register {0} holds the wrong kind of value")]
    WrongValueKind(u32),
    /// A write targeted a cell this organism does not own and is not a
    /// child of the owner.
    #[error("cell is not writable by this organism")]
    NotOwned,
    /// A stack operation would exceed the configured maximum depth, or pop
    /// an empty stack.
    #[error("stack {0} over/underflow")]
    StackBounds(&'static str),
    /// `RET` executed with no active call frame.
    #[error("return with no active call frame")]
    EmptyCallStack,
    /// A jump or scan target landed outside any known coordinate system
    /// (e.g. a `MOVIP` referencing an unknown label).
    #[error("unresolved jump or vector target")]
    UnresolvedTarget,
}
