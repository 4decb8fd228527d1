//! The ConvoFlow scripting surface: dotted-path variable access, the
//! sandboxed expression language, and the `{{…}}` template renderer.
//!
//! Everything here is pure: no I/O, no clocks. Expressions are compiled
//! (lexed, parsed, statically checked) before any evaluation, so unsafe
//! input is rejected without ever running.

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod path;
pub mod template;

pub use eval::{evaluate, number_value, to_display, to_number, truthy, FunctionRegistry, NativeFn};
pub use parser::{compile, Expr};
pub use path::{get_path, parse_path, set_path, Scope, Segment};
pub use template::render;
