//! bootflow core
//!
//! Leaf building blocks used to assemble a machine bootstrap payload:
//!
//! - [`envfile`]: `.env` style `KEY=VALUE` parsing
//! - [`template`]: flat `${name}` interpolation

pub mod envfile;
pub mod error;
pub mod template;

pub use envfile::{EnvFile, SkippedLine, load_env_file, parse_env, strip_quotes};
pub use error::{CoreError, Result};
pub use template::{Rendered, Template, Variables, interpolate, load_template, merge_variables};
