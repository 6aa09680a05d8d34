//! Tabula syntax definitions.
//!
//! The lexer and parser live outside this workspace; embedders hand the
//! compiler a ready [`ast::Program`]. This crate only defines the tree
//! shape and source positions shared by the compiler and the VM's
//! diagnostics.

pub mod ast;

pub use ast::*;
