//! Parser and formatter for the compiler's literal reply grammar.
//!
//! Every reply from the compiler is plain text in a Modelica-expression
//! literal syntax: numbers, strings, booleans, nested arrays, tuples and
//! named records. This module converts that text into the [`Value`] tagged
//! variant and back.
//!
//! # Grammar
//!
//! ```text
//! value    := boolean | number | string | sequence | tuple | record | ident
//! boolean  := "true" | "false"              (case-insensitive)
//! sequence := "{" [ value { "," value } ] "}"
//! tuple    := "(" [ value { "," value } ] ")"
//! record   := ident "(" field "=" value { "," field "=" value } ")"
//!           | "record" ident fields "end" ident ";"
//! ```
//!
//! An empty reply parses to [`Value::Empty`]; `{}` parses to an empty
//! [`Value::Sequence`]. Bare (possibly dotted) identifiers such as
//! `Modelica.Blocks` arrive unquoted and parse as [`Value::Str`].
//!
//! # Usage
//!
//! ```ignore
//! use omc_client::parser::{parse, Value};
//!
//! let value = parse("{1, {2, 3}, \"s\"}")?;
//! let text = Value::Integer(42).to_string();
//! ```

mod parse;
mod value;

pub use parse::{parse, ParseError};
pub use value::{escape_str, Value};
