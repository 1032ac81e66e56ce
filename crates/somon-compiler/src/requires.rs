// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Discovery of `require(...)` calls in generated JavaScript

use crate::lexer::{line_col, tokenize, Span, Token, TokenKind};

/// The argument of a `require` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequireArgument {
    /// A string literal, or a template literal without substitutions
    Literal(String),
    /// A template literal containing `${...}`
    TemplateWithSubstitutions,
    /// Any other expression
    Dynamic,
}

/// One `require(...)` call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireCall {
    /// The argument
    pub argument: RequireArgument,
    /// Span of the argument expression (the literal token for literals)
    pub argument_span: Span,
    /// 1-based line of the `require` identifier
    pub line: usize,
    /// 1-based column of the `require` identifier
    pub column: usize,
}

impl RequireCall {
    /// The specifier, when the argument is a literal
    pub fn specifier(&self) -> Option<&str> {
        match &self.argument {
            RequireArgument::Literal(s) => Some(s),
            _ => None,
        }
    }
}

/// Finds every call of the free function `require` in `code`, in source order.
///
/// Member calls (`x.require(...)`) and declarations named `require` are ignored.
pub fn extract_requires(code: &str) -> Vec<RequireCall> {
    let tokens: Vec<Token> = tokenize(code)
        .into_iter()
        .filter(Token::is_significant)
        .collect();

    let mut calls = Vec::new();
    for (i, tok) in tokens.iter().enumerate() {
        if !tok.is_ident_any(&["require"]) {
            continue;
        }
        if i > 0 {
            let prev = &tokens[i - 1];
            if prev.is_punct(".") || prev.is_punct("?.") || prev.is_ident_any(&["function"]) {
                continue;
            }
        }
        if !tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
            continue;
        }

        let (line, column) = line_col(code, tok.span.start);
        let (argument, argument_span) = classify_argument(&tokens, i + 2, code.len());
        calls.push(RequireCall {
            argument,
            argument_span,
            line,
            column,
        });
    }
    calls
}

/// Literal specifiers only, in source order, without duplicates.
pub fn static_requires(code: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    extract_requires(code)
        .into_iter()
        .filter_map(|call| call.specifier().map(str::to_string))
        .filter(|specifier| seen.insert(specifier.clone()))
        .collect()
}

fn classify_argument(tokens: &[Token], at: usize, len: usize) -> (RequireArgument, Span) {
    let Some(first) = tokens.get(at) else {
        return (RequireArgument::Dynamic, Span::new(len, len));
    };
    let closes = tokens.get(at + 1).is_some_and(|t| t.is_punct(")"));

    match &first.kind {
        TokenKind::String(value) if closes => (RequireArgument::Literal(value.clone()), first.span),
        TokenKind::Template {
            value,
            has_substitutions: false,
        } if closes => (RequireArgument::Literal(value.clone()), first.span),
        TokenKind::Template {
            has_substitutions: true,
            ..
        } => (RequireArgument::TemplateWithSubstitutions, first.span),
        _ => (RequireArgument::Dynamic, first.span),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_requires() {
        let code = "const a = require(\"./a\");\nconst b = require('./b');\nrequire(`./c`);";
        let specs: Vec<_> = extract_requires(code)
            .iter()
            .filter_map(|c| c.specifier().map(str::to_string))
            .collect();
        assert_eq!(specs, vec!["./a", "./b", "./c"]);
    }

    #[test]
    fn test_positions_and_spans() {
        let code = "x;\n  require('./a');";
        let calls = extract_requires(code);
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].line, calls[0].column), (2, 3));
        assert_eq!(calls[0].argument_span.text(code), "'./a'");
    }

    #[test]
    fn test_dynamic_requires() {
        let code = "require(name); require(`./${name}.js`); require('./a' + b);";
        let kinds: Vec<_> = extract_requires(code).into_iter().map(|c| c.argument).collect();
        assert_eq!(
            kinds,
            vec![
                RequireArgument::Dynamic,
                RequireArgument::TemplateWithSubstitutions,
                RequireArgument::Dynamic,
            ]
        );
    }

    #[test]
    fn test_ignores_members_comments_and_strings() {
        let code = "module.require('./x'); // require('./y')\nconst s = \"require('./z')\";\nfunction require(p) {}";
        assert!(extract_requires(code).is_empty());
    }

    #[test]
    fn test_static_requires_dedupes() {
        let code = "require('./a'); require('./b'); require('./a');";
        assert_eq!(static_requires(code), vec!["./a", "./b"]);
    }
}
