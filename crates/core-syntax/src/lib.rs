//! STIL statement grammar, statement slicing, and header-block parsing.
//!
//! The pipeline reads a STIL file twice: once up to the first `Pattern`
//! block (header pass, see `core-symbols`) and once statement-by-statement
//! through [`slicer::StatementSlicer`]. Each sliced statement is handed to
//! [`statement::parse_statement`], which classifies it into the closed
//! [`statement::Statement`] set the transformer consumes.
//!
//! Header text is split into raw blocks by [`header::split_blocks`] (which
//! also captures the byte offsets used to slice procedure/macro bodies
//! verbatim) and then parsed block-by-block with the grammars in
//! [`header`].

pub mod expand;
pub mod header;
pub mod slicer;
pub mod statement;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyntaxError {
    #[error("not a STIL file: first statement is '{0}'")]
    NotStil(String),
    #[error("grammar error: {0}")]
    Grammar(String),
    #[error("unbalanced braces in {context} near byte {offset}")]
    Unbalanced { context: String, offset: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
