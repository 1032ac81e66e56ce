// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Code minification

use crate::error::{CompileError, Result};
use crate::lexer::{line_col, tokenize, Token, TokenKind};

/// Shrinks JavaScript without changing its behavior
pub trait Minifier: Send + Sync {
    /// Minify `code`
    fn minify(&self, code: &str) -> Result<String>;
}

/// Removes comments and redundant whitespace.
///
/// Line breaks are kept so that automatic semicolon insertion and line-based
/// source maps still hold for the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceMinifier;

impl Minifier for WhitespaceMinifier {
    fn minify(&self, code: &str) -> Result<String> {
        let mut out = String::with_capacity(code.len());
        let mut prev: Option<&Token> = None;
        let mut pending_space = false;

        let tokens = tokenize(code);
        for tok in &tokens {
            match &tok.kind {
                TokenKind::Whitespace | TokenKind::BlockComment | TokenKind::LineComment => {
                    let newlines = tok.text(code).matches('\n').count();
                    if newlines > 0 {
                        out.extend(std::iter::repeat('\n').take(newlines));
                        prev = None;
                        pending_space = false;
                    } else {
                        pending_space = true;
                    }
                }
                TokenKind::Error(message) => {
                    let (line, column) = line_col(code, tok.span.start);
                    return Err(CompileError::Minify(format!("{}:{}: {}", line, column, message)));
                }
                _ => {
                    let text = tok.text(code);
                    if pending_space && prev.is_some_and(|p| needs_space(p.text(code), p, text)) {
                        out.push(' ');
                    }
                    out.push_str(text);
                    prev = Some(tok);
                    pending_space = false;
                }
            }
        }
        Ok(out)
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$' || !ch.is_ascii()
}

/// Whether dropping the space between two tokens would change how they scan.
fn needs_space(prev_text: &str, prev: &Token, next_text: &str) -> bool {
    let (Some(last), Some(first)) = (prev_text.chars().last(), next_text.chars().next()) else {
        return false;
    };
    if is_word_char(last) && is_word_char(first) {
        return true;
    }
    if matches!(prev.kind, TokenKind::Number) && first == '.' {
        return true;
    }
    matches!((last, first), ('+', '+') | ('-', '-') | ('/', '/') | ('/', '*'))
}
