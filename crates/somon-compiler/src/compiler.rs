// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Somon to JavaScript compilation
//!
//! Compilation is a token-level rewrite: keywords are translated, `import` and
//! `export` declarations are lowered to CommonJS, and every other token and all
//! trivia are copied through. Line structure is preserved, so generated line
//! `n` always corresponds to source line `n`.

use crate::error::CompileError;
use crate::lexer::{line_col, tokenize, Token, TokenKind};
use crate::minify::{Minifier, WhitespaceMinifier};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Keyword translations from Somon to JavaScript.
const KEYWORDS: &[(&str, &str)] = &[
    ("функсия", "function"),
    ("бозгашт", "return"),
    ("собит", "const"),
    ("тағйирёбанда", "let"),
    ("агар", "if"),
    ("вагарна", "else"),
    ("токи", "while"),
    ("барои", "for"),
    ("дуруст", "true"),
    ("нодуруст", "false"),
    ("холӣ", "null"),
    ("синф", "class"),
    ("нав", "new"),
    ("ин", "this"),
    ("кӯшиш", "try"),
    ("гирифтан", "catch"),
    ("партофтан", "throw"),
    ("ҳамзамон", "async"),
    ("интизор", "await"),
    ("чоп", "console"),
];

/// Members of the `чоп` standard-library object.
const CONSOLE_MEMBERS: &[(&str, &str)] = &[
    ("сабт", "log"),
    ("хато", "error"),
    ("огоҳӣ", "warn"),
    ("маълумот", "info"),
];

const IMPORT: &[&str] = &["import", "воридот"];
const EXPORT: &[&str] = &["export", "содирот"];
const FROM: &[&str] = &["from", "аз"];
const AS: &[&str] = &["as", "ҳамчун"];
const DEFAULT: &[&str] = &["default", "пешфарз"];
const FUNCTION: &[&str] = &["function", "функсия"];
const CLASS: &[&str] = &["class", "синф"];
const ASYNC: &[&str] = &["async", "ҳамзамон"];
const DECLARATION: &[&str] = &["const", "let", "var", "собит", "тағйирёбанда"];

/// Unwraps the default export of a CommonJS module produced by this compiler.
const DEFAULT_INTEROP: &str = "(function (m) { return m && m.__esModule ? m.default : m; })";

/// ECMAScript version the generated code targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// ECMAScript 5
    Es5,
    /// ECMAScript 2015
    Es2015,
    /// ECMAScript 2020
    #[default]
    Es2020,
    /// Latest supported features
    EsNext,
}

impl Target {
    /// Canonical lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Es5 => "es5",
            Target::Es2015 => "es2015",
            Target::Es2020 => "es2020",
            Target::EsNext => "esnext",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "es5" => Ok(Target::Es5),
            "es2015" | "es6" => Ok(Target::Es2015),
            "es2020" => Ok(Target::Es2020),
            "esnext" => Ok(Target::EsNext),
            other => Err(format!("unknown target '{}'", other)),
        }
    }
}

/// What kind of source a module is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Somon source (`.som`)
    #[default]
    Somon,
    /// Plain JavaScript (`.js`, `.cjs`, `.mjs`)
    JavaScript,
    /// JSON data (`.json`)
    Json,
}

impl SourceKind {
    /// Detect the source kind from a file extension
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("js" | "cjs" | "mjs") => SourceKind::JavaScript,
            Some("json") => SourceKind::Json,
            _ => SourceKind::Somon,
        }
    }
}

/// Options accepted by [`Compiler::compile`]
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Output language version
    pub target: Target,
    /// Minify the generated code
    pub minify: bool,
    /// Run semantic checks
    pub type_check: bool,
    /// Emit `"use strict"`
    pub strict: bool,
    /// Upper bound on compilation time; enforced by the caller
    pub timeout: Duration,
    /// Kind of the source text
    pub kind: SourceKind,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target: Target::default(),
            minify: false,
            type_check: true,
            strict: false,
            timeout: Duration::from_secs(30),
            kind: SourceKind::Somon,
        }
    }
}

impl CompileOptions {
    /// Same options, with the source kind detected from `path`
    pub fn for_path(&self, path: &Path) -> Self {
        Self {
            kind: SourceKind::from_path(path),
            ..self.clone()
        }
    }
}

/// Result of compiling one module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOutput {
    /// Generated JavaScript
    pub code: String,
    /// Fatal diagnostics; the code is unusable when non-empty
    pub errors: Vec<String>,
    /// Non-fatal diagnostics
    pub warnings: Vec<String>,
    /// Serialized source map, when the compiler produces one
    pub source_map: Option<String>,
}

impl CompileOutput {
    /// Whether compilation produced no errors
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A pure function from source text and options to generated code
pub trait Compiler: Send + Sync {
    /// Compile one module
    fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutput;
}

/// The Somon compiler
#[derive(Debug, Clone, Default)]
pub struct SomonCompiler;

impl SomonCompiler {
    /// Create a new compiler
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for SomonCompiler {
    fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutput {
        let mut output = match options.kind {
            SourceKind::Json => compile_json(source),
            SourceKind::Somon => Lowering::new(source, options, true).run(),
            SourceKind::JavaScript => Lowering::new(source, options, false).run(),
        };

        if options.minify && output.is_success() {
            match WhitespaceMinifier.minify(&output.code) {
                Ok(code) => output.code = code,
                Err(e) => output.errors.push(e.to_string()),
            }
        }

        debug!(
            errors = output.errors.len(),
            warnings = output.warnings.len(),
            "compiled {:?} module",
            options.kind
        );
        output
    }
}

fn compile_json(source: &str) -> CompileOutput {
    match serde_json::from_str::<serde_json::Value>(source) {
        Ok(_) => CompileOutput {
            code: format!("module.exports = {};", source.trim()),
            ..Default::default()
        },
        Err(e) => CompileOutput {
            errors: vec![CompileError::InvalidJson(e.to_string()).to_string()],
            ..Default::default()
        },
    }
}

/// Single-pass token rewriter
struct Lowering<'s> {
    source: &'s str,
    options: &'s CompileOptions,
    translate_keywords: bool,
    tokens: Vec<Token>,
    /// Indices into `tokens` of the significant tokens
    sig: Vec<usize>,
    /// Byte offset up to which source has been emitted or skipped
    cursor: usize,
    out: String,
    /// `(exported, local)` pairs appended after the module body
    exports: Vec<(String, String)>,
    has_exports: bool,
    import_counter: usize,
    errors: Vec<CompileError>,
    warnings: Vec<String>,
}

impl<'s> Lowering<'s> {
    fn new(source: &'s str, options: &'s CompileOptions, translate_keywords: bool) -> Self {
        let tokens = tokenize(source);
        let sig = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_significant())
            .map(|(i, _)| i)
            .collect();
        Self {
            source,
            options,
            translate_keywords,
            tokens,
            sig,
            cursor: 0,
            out: String::with_capacity(source.len() + 64),
            exports: Vec::new(),
            has_exports: false,
            import_counter: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn run(mut self) -> CompileOutput {
        self.check_delimiters();

        let mut p = 0;
        while p < self.sig.len() {
            let tok = self.tok(p).clone();
            let statement_start = self.is_statement_start(p);
            let next_is_call = self
                .sig_tok(p + 1)
                .is_some_and(|t| t.is_punct("(") || t.is_punct("."));

            if statement_start && tok.is_ident_any(IMPORT) && !next_is_call {
                p = self.lower_import(p);
                continue;
            }
            if statement_start && tok.is_ident_any(EXPORT) {
                p = self.lower_export(p);
                continue;
            }

            self.copy_to(tok.span.start);
            self.emit_token(p);
            self.cursor = tok.span.end;
            p += 1;
        }
        self.copy_to(self.source.len());

        self.finish()
    }

    fn finish(mut self) -> CompileOutput {
        let mut prefix = String::new();
        if self.options.strict {
            prefix.push_str("\"use strict\"; ");
        }
        if self.has_exports {
            prefix.push_str("Object.defineProperty(exports, \"__esModule\", { value: true }); ");
        }

        let mut seen = HashSet::new();
        let mut trailer = String::new();
        for (exported, local) in &self.exports {
            if !seen.insert(exported.clone()) {
                let message = format!("duplicate export '{}'", exported);
                if self.options.type_check {
                    self.errors.push(CompileError::Check {
                        line: 1,
                        column: 1,
                        message,
                    });
                } else {
                    self.warnings.push(message);
                }
                continue;
            }
            trailer.push_str(&format!("\nexports.{} = {};", exported, local));
        }

        let mut code = prefix;
        code.push_str(&self.out);
        code.push_str(&trailer);

        CompileOutput {
            code,
            errors: self.errors.iter().map(ToString::to_string).collect(),
            warnings: self.warnings,
            source_map: None,
        }
    }

    fn tok(&self, p: usize) -> &Token {
        &self.tokens[self.sig[p]]
    }

    fn sig_tok(&self, p: usize) -> Option<&Token> {
        self.sig.get(p).map(|&i| &self.tokens[i])
    }

    fn position(&self, offset: usize) -> (usize, usize) {
        line_col(self.source, offset)
    }

    /// Emit source verbatim up to `offset`.
    fn copy_to(&mut self, offset: usize) {
        if offset > self.cursor {
            self.out.push_str(&self.source[self.cursor..offset]);
            self.cursor = offset;
        }
    }

    /// Drop source up to `offset`, keeping only its line breaks.
    fn skip_to(&mut self, offset: usize) {
        if offset > self.cursor {
            let newlines = self.source[self.cursor..offset].matches('\n').count();
            self.out.extend(std::iter::repeat('\n').take(newlines));
            self.cursor = offset;
        }
    }

    fn is_statement_start(&self, p: usize) -> bool {
        if p == 0 {
            return true;
        }
        let prev = self.tok(p - 1);
        if prev.is_punct(";") || prev.is_punct("{") || prev.is_punct("}") {
            return true;
        }
        let gap = &self.source[prev.span.end..self.tok(p).span.start];
        gap.contains('\n')
            && match &prev.kind {
                TokenKind::Punct(punct) => matches!(punct.as_str(), ")" | "]"),
                _ => true,
            }
    }

    fn emit_token(&mut self, p: usize) {
        let tok = self.tok(p).clone();
        match &tok.kind {
            TokenKind::Identifier(name) => {
                let translated = self.translate_identifier(p, name);
                self.out.push_str(translated.as_deref().unwrap_or(name));
            }
            TokenKind::Punct(punct) => {
                if punct == "=>" && self.options.target == Target::Es5 {
                    let (line, column) = self.position(tok.span.start);
                    self.warnings.push(format!(
                        "{}:{}: arrow functions are not available in es5",
                        line, column
                    ));
                }
                self.out.push_str(punct);
            }
            TokenKind::Error(message) => {
                let (line, column) = self.position(tok.span.start);
                self.errors.push(CompileError::syntax(line, column, message.clone()));
                self.out.push_str(tok.text(self.source));
            }
            TokenKind::Invalid(ch) => {
                let (line, column) = self.position(tok.span.start);
                self.errors.push(CompileError::syntax(
                    line,
                    column,
                    format!("unexpected character '{}'", ch),
                ));
            }
            _ => self.out.push_str(tok.text(self.source)),
        }
    }

    fn translate_identifier(&mut self, p: usize, name: &str) -> Option<String> {
        let prev = if p > 0 { Some(self.tok(p - 1)) } else { None };
        let after_dot = prev.is_some_and(|t| t.is_punct(".") || t.is_punct("?."));

        if after_dot {
            let receiver_is_console = p >= 2 && self.tok(p - 2).is_ident_any(&["чоп"]);
            if self.translate_keywords && receiver_is_console {
                return lookup(CONSOLE_MEMBERS, name).map(str::to_string);
            }
            return None;
        }

        // Object literal keys stay as written
        let is_key = self.sig_tok(p + 1).is_some_and(|t| t.is_punct(":"))
            && prev.is_some_and(|t| t.is_punct("{") || t.is_punct(","));
        if is_key {
            return None;
        }

        let offset = self.tok(p).span.start;
        let js = if self.translate_keywords {
            lookup(KEYWORDS, name).unwrap_or(name)
        } else {
            name
        };

        if js == "var" {
            let (line, column) = self.position(offset);
            self.warnings.push(format!(
                "{}:{}: 'var' declarations are function-scoped; prefer 'тағйирёбанда'",
                line, column
            ));
        }
        if self.options.target == Target::Es5 && matches!(js, "const" | "let" | "class") {
            let (line, column) = self.position(offset);
            self.warnings.push(format!(
                "{}:{}: '{}' is not available in es5",
                line, column, js
            ));
        }

        (js != name).then(|| js.to_string())
    }

    fn check_delimiters(&mut self) {
        let mut stack: Vec<(&str, usize)> = Vec::new();
        let mut problems = Vec::new();
        for &i in &self.sig {
            let tok = &self.tokens[i];
            let TokenKind::Punct(punct) = &tok.kind else {
                continue;
            };
            match punct.as_str() {
                "(" | "[" | "{" => stack.push((punct.as_str(), tok.span.start)),
                ")" | "]" | "}" => {
                    let expected = match punct.as_str() {
                        ")" => "(",
                        "]" => "[",
                        _ => "{",
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, at)) => problems.push((
                            tok.span.start,
                            format!("'{}' does not close '{}' opened at offset {}", punct, open, at),
                        )),
                        None => problems.push((tok.span.start, format!("unmatched '{}'", punct))),
                    }
                }
                _ => {}
            }
        }
        for (open, at) in stack {
            problems.push((at, format!("unclosed '{}'", open)));
        }
        for (offset, message) in problems {
            let (line, column) = self.position(offset);
            self.errors.push(CompileError::Delimiter {
                line,
                column,
                message,
            });
        }
    }

    fn malformed(&mut self, p: usize, what: &str) -> usize {
        let tok = self.tok(p).clone();
        let (line, column) = self.position(tok.span.start);
        self.errors.push(CompileError::syntax(
            line,
            column,
            format!("malformed {} declaration", what),
        ));
        self.copy_to(tok.span.start);
        self.out.push_str(tok.text(self.source));
        self.cursor = tok.span.end;
        p + 1
    }

    /// Parses `{ a, b as c }` starting at the opening brace.
    ///
    /// Returns the `(imported, local)` pairs and the position after `}`.
    fn parse_brace_list(&self, mut q: usize) -> Option<(Vec<(String, String)>, usize)> {
        if !self.sig_tok(q)?.is_punct("{") {
            return None;
        }
        q += 1;
        let mut pairs = Vec::new();
        loop {
            let tok = self.sig_tok(q)?;
            if tok.is_punct("}") {
                return Some((pairs, q + 1));
            }
            let TokenKind::Identifier(name) = &tok.kind else {
                return None;
            };
            let mut imported = name.clone();
            if DEFAULT.contains(&imported.as_str()) {
                imported = "default".to_string();
            }
            let mut local = imported.clone();
            q += 1;
            if self.sig_tok(q)?.is_ident_any(AS) {
                let TokenKind::Identifier(alias) = &self.sig_tok(q + 1)?.kind else {
                    return None;
                };
                local = alias.clone();
                q += 2;
            }
            pairs.push((imported, local));
            if self.sig_tok(q)?.is_punct(",") {
                q += 1;
            }
        }
    }

    /// Parses `from "specifier"` and an optional `;`.
    ///
    /// Returns the raw string literal and the position after the clause.
    fn parse_from(&self, q: usize) -> Option<(String, usize)> {
        if !self.sig_tok(q)?.is_ident_any(FROM) {
            return None;
        }
        let source = self.parse_string(q + 1)?;
        let mut end = q + 2;
        if self.sig_tok(end).is_some_and(|t| t.is_punct(";")) {
            end += 1;
        }
        Some((source, end))
    }

    fn parse_string(&self, q: usize) -> Option<String> {
        let tok = self.sig_tok(q)?;
        match &tok.kind {
            TokenKind::String(_) => Some(tok.text(self.source).to_string()),
            _ => None,
        }
    }

    fn replace(&mut self, p: usize, end: usize, replacement: &str) -> usize {
        let start = self.tok(p).span.start;
        let stop = self.tok(end - 1).span.end;
        self.copy_to(start);
        self.out.push_str(replacement);
        self.skip_to(stop);
        end
    }

    fn lower_import(&mut self, p: usize) -> usize {
        // import "side-effect";
        if let Some(source) = self.parse_string(p + 1) {
            let mut end = p + 2;
            if self.sig_tok(end).is_some_and(|t| t.is_punct(";")) {
                end += 1;
            }
            return self.replace(p, end, &format!("require({});", source));
        }

        let mut q = p + 1;
        let mut default_binding = None;
        let mut namespace = None;
        let mut named = Vec::new();

        if let Some(TokenKind::Identifier(name)) = self.sig_tok(q).map(|t| t.kind.clone()) {
            if !FROM.contains(&name.as_str()) {
                default_binding = Some(name);
                q += 1;
                if self.sig_tok(q).is_some_and(|t| t.is_punct(",")) {
                    q += 1;
                }
            }
        }
        if self.sig_tok(q).is_some_and(|t| t.is_punct("*")) {
            let alias = match (self.sig_tok(q + 1), self.sig_tok(q + 2)) {
                (Some(as_tok), Some(name_tok)) if as_tok.is_ident_any(AS) => match &name_tok.kind {
                    TokenKind::Identifier(name) => Some(name.clone()),
                    _ => None,
                },
                _ => None,
            };
            let Some(alias) = alias else {
                return self.malformed(p, "import");
            };
            namespace = Some(alias);
            q += 3;
        } else if self.sig_tok(q).is_some_and(|t| t.is_punct("{")) {
            let Some((pairs, next)) = self.parse_brace_list(q) else {
                return self.malformed(p, "import");
            };
            named = pairs;
            q = next;
        }
        let Some((source, end)) = self.parse_from(q) else {
            return self.malformed(p, "import");
        };
        if default_binding.is_none() && namespace.is_none() && named.is_empty() {
            return self.replace(p, end, &format!("require({});", source));
        }

        let bindings = usize::from(default_binding.is_some())
            + usize::from(namespace.is_some())
            + usize::from(!named.is_empty());
        let module_expr = if bindings > 1 {
            let temp = format!("__somon_import_{}", self.import_counter);
            self.import_counter += 1;
            temp
        } else {
            format!("require({})", source)
        };

        let mut replacement = String::new();
        if bindings > 1 {
            replacement.push_str(&format!("const {} = require({}); ", module_expr, source));
        }
        if let Some(name) = namespace {
            replacement.push_str(&format!("const {} = {}; ", name, module_expr));
        }
        if let Some(name) = default_binding {
            replacement.push_str(&format!(
                "const {} = {}({}); ",
                name, DEFAULT_INTEROP, module_expr
            ));
        }
        if !named.is_empty() {
            let fields: Vec<String> = named
                .iter()
                .map(|(imported, local)| {
                    if imported == local {
                        local.clone()
                    } else {
                        format!("{}: {}", imported, local)
                    }
                })
                .collect();
            replacement.push_str(&format!(
                "const {{ {} }} = {}; ",
                fields.join(", "),
                module_expr
            ));
        }
        let replacement = replacement.trim_end().to_string();
        self.replace(p, end, &replacement)
    }

    fn lower_export(&mut self, p: usize) -> usize {
        let Some(next) = self.sig_tok(p + 1).cloned() else {
            return self.malformed(p, "export");
        };
        self.has_exports = true;

        // export default <expression>
        if next.is_ident_any(DEFAULT) {
            return self.replace(p, p + 2, "exports.default =");
        }

        // export function f / export class C / export async function f
        if next.is_ident_any(FUNCTION) || next.is_ident_any(CLASS) || next.is_ident_any(ASYNC) {
            let mut q = p + 2;
            if next.is_ident_any(ASYNC) {
                q += 1;
            }
            if self.sig_tok(q).is_some_and(|t| t.is_punct("*")) {
                q += 1;
            }
            let Some(TokenKind::Identifier(name)) = self.sig_tok(q).map(|t| t.kind.clone()) else {
                return self.malformed(p, "export");
            };
            self.exports.push((name.clone(), name));
            self.drop_keyword(p);
            return p + 1;
        }

        // export const a = 1, b = 2
        if next.is_ident_any(DECLARATION) {
            for name in self.declared_names(p + 2) {
                self.exports.push((name.clone(), name));
            }
            self.drop_keyword(p);
            return p + 1;
        }

        // export { a, b as c } [from "m"]
        if next.is_punct("{") {
            let Some((pairs, after)) = self.parse_brace_list(p + 1) else {
                return self.malformed(p, "export");
            };
            if let Some((source, end)) = self.parse_from(after) {
                let assignments: Vec<String> = pairs
                    .iter()
                    .map(|(local, exported)| format!("exports.{} = m.{};", exported, local))
                    .collect();
                let replacement = format!(
                    "(function (m) {{ {} }})(require({}));",
                    assignments.join(" "),
                    source
                );
                return self.replace(p, end, &replacement);
            }
            for (local, exported) in pairs {
                self.exports.push((exported, local));
            }
            let mut end = after;
            if self.sig_tok(end).is_some_and(|t| t.is_punct(";")) {
                end += 1;
            }
            return self.replace(p, end, "");
        }

        // export * from "m" / export * as ns from "m"
        if next.is_punct("*") {
            if let Some((source, end)) = self.parse_from(p + 2) {
                return self.replace(p, end, &format!("Object.assign(exports, require({}));", source));
            }
            let alias = match (self.sig_tok(p + 2), self.sig_tok(p + 3)) {
                (Some(as_tok), Some(name_tok)) if as_tok.is_ident_any(AS) => match &name_tok.kind {
                    TokenKind::Identifier(name) => Some(name.clone()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(name) = alias {
                if let Some((source, end)) = self.parse_from(p + 4) {
                    return self.replace(p, end, &format!("exports.{} = require({});", name, source));
                }
            }
        }

        self.malformed(p, "export")
    }

    /// Removes the `export` keyword and the trivia after it.
    fn drop_keyword(&mut self, p: usize) {
        let start = self.tok(p).span.start;
        let next_start = self.tok(p + 1).span.start;
        self.copy_to(start);
        self.skip_to(next_start);
    }

    /// Collects the names bound by a `const`/`let`/`var` declaration list.
    fn declared_names(&self, mut q: usize) -> Vec<String> {
        let mut names = Vec::new();
        let mut depth = 0usize;
        let mut expect_name = true;
        while let Some(tok) = self.sig_tok(q) {
            match &tok.kind {
                TokenKind::Identifier(name) if depth == 0 && expect_name => {
                    names.push(name.clone());
                    expect_name = false;
                }
                TokenKind::Punct(p) => match p.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    "," if depth == 0 => expect_name = true,
                    ";" if depth == 0 => break,
                    _ => {}
                },
                _ => {}
            }
            // A line break at depth zero ends the declaration unless it continues a list
            if depth == 0 && !expect_name {
                if let Some(next) = self.sig_tok(q + 1) {
                    let gap = &self.source[tok.span.end..next.span.start];
                    let continues = tok.is_punct(",")
                        || tok.is_punct("=")
                        || next.is_punct(",")
                        || next.is_punct("=");
                    if gap.contains('\n') && !continues {
                        break;
                    }
                }
            }
            q += 1;
        }
        names
    }
}

fn lookup<'a>(table: &'a [(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    table.iter().find(|(from, _)| *from == name).map(|(_, to)| *to)
}
