// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Diagnostics produced by the compiler

use thiserror::Error;

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors reported while compiling or minifying a module
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    /// Malformed token (unterminated literal, invalid character)
    #[error("{line}:{column}: SyntaxError: {message}")]
    Syntax {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// Description of the problem
        message: String,
    },

    /// Opening and closing brackets do not match
    #[error("{line}:{column}: SyntaxError: {message}")]
    Delimiter {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// Description of the problem
        message: String,
    },

    /// JSON module that does not parse
    #[error("Invalid JSON module: {0}")]
    InvalidJson(String),

    /// Semantic problem found by the checker
    #[error("{line}:{column}: TypeError: {message}")]
    Check {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// Description of the problem
        message: String,
    },

    /// The minifier could not process its input
    #[error("Minification failed: {0}")]
    Minify(String),
}

impl CompileError {
    /// Create a syntax error at a position
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            column,
            message: message.into(),
        }
    }
}
