//! Embedded scripting engine for strategy code.
//!
//! A small dynamically-typed dialect: `var`/`let`/`const`, functions,
//! `if`/`while`/`for`, `throw`, arrays, object literals and the usual
//! operators. Host capabilities are injected through the [`Host`] trait;
//! the engine itself never touches the network, the clock or storage.

pub mod ast;
pub mod error;
pub mod interp;
pub mod interrupt;
mod lexer;
mod parser;
pub mod value;

pub use ast::Program;
pub use error::{Fault, ParseError};
pub use interp::{Host, Interpreter, NoHost, THREAD_STACK_SIZE};
pub use interrupt::InterruptHandle;
pub use lexer::is_identifier;
pub use parser::parse;
pub use value::{HostRef, Value};
