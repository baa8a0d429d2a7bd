//! Ember Compiler Library
//!
//! A single-pass, precedence-climbing compiler: the scanner produces
//! tokens on demand, and the compiler consumes them while emitting
//! bytecode directly into the current function's Blob. There is no AST.
//!
//! The entry point is [`compile`]: it takes the shared heap (paused for
//! the duration of the compile), the source text, and the Module the code
//! belongs to, and returns the top-level function or every collected
//! compile error joined into one message.

pub mod compiler;
pub mod imports;
pub mod scanner;
pub mod token;

pub use compiler::{compile, decode_escapes, parse_number};
pub use imports::{resolve_import, SOURCE_EXTENSION};
pub use scanner::Scanner;
pub use token::{Token, TokenKind};
