//! Lexical analysis for Somon source code.
//!
//! The scanner is lossless: whitespace and comments are produced as trivia
//! tokens, so callers can rewrite individual tokens and copy everything else
//! through unchanged. The same scanner serves the compiler, the `require`
//! extractor and the minifier.
//!
//! ## Usage
//!
//! ```rust
//! use somon_compiler::lexer::{Scanner, TokenKind};
//!
//! let mut scanner = Scanner::new("собит x = 42;");
//!
//! loop {
//!     let token = scanner.next_token();
//!     if matches!(token.kind, TokenKind::Eof) {
//!         break;
//!     }
//!     println!("{:?}", token.kind);
//! }
//! ```

mod scanner;
mod token;

pub use scanner::{line_col, tokenize, Scanner};
pub use token::{Span, Token, TokenKind};
