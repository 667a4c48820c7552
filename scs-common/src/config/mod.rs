//! Configuration file support.
//!
//! The server reads a `config.ini` (see [`ini`] for the grammar) and turns it
//! into typed settings through [`IniReader`], which collects every bad value
//! so startup can report them together.

pub mod ini;

pub use ini::{IniDocument, IniEntry, IniError, IniReader};
