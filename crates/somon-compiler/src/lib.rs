// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # Somon Compiler
//!
//! Translates Somon, a JavaScript dialect with Tajik keywords, into
//! CommonJS-flavored JavaScript.
//!
//! ## Example
//!
//! ```rust
//! use somon_compiler::{CompileOptions, Compiler, SomonCompiler};
//!
//! let output = SomonCompiler::new().compile(
//!     "чоп.сабт(\"Салом, Ҷаҳон\");",
//!     &CompileOptions::default(),
//! );
//! assert_eq!(output.code, "console.log(\"Салом, Ҷаҳон\");");
//! ```

#![warn(missing_docs)]

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod minify;
pub mod requires;

pub use compiler::{CompileOptions, CompileOutput, Compiler, SomonCompiler, SourceKind, Target};
pub use error::{CompileError, Result};
pub use minify::{Minifier, WhitespaceMinifier};
pub use requires::{extract_requires, static_requires, RequireArgument, RequireCall};
