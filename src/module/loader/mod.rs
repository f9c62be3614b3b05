//! Module loading
//!
//! Resolves class identifiers to construction functions.

pub mod catalog;

pub use catalog::ModuleCatalog;
