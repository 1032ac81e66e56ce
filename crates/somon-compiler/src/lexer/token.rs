//! Token definitions for the Somon scanner.

/// A span in the source code, representing a range of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Start byte offset (inclusive)
    pub start: usize,
    /// End byte offset (exclusive)
    pub end: usize,
}

impl Span {
    /// Creates a new span.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Returns the length of this span in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if this span is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns the source text covered by this span.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// A token produced by the scanner.
///
/// Trivia (whitespace and comments) is kept as tokens too, so that the
/// concatenation of every token's text reproduces the input exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// The span in the source code
    pub span: Span,
}

impl Token {
    /// Creates a new token.
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Returns the source text of this token.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        self.span.text(source)
    }

    /// Whether this token carries meaning (is not whitespace or a comment).
    pub fn is_significant(&self) -> bool {
        self.kind.is_significant()
    }

    /// Whether this token is the given punctuator.
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(p) if p == punct)
    }

    /// Whether this token is an identifier spelled as one of `names`.
    pub fn is_ident_any(&self, names: &[&str]) -> bool {
        matches!(&self.kind, TokenKind::Identifier(name) if names.contains(&name.as_str()))
    }
}

/// The different kinds of tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Spaces, tabs and line breaks
    Whitespace,
    /// `// ...` up to (not including) the line break
    LineComment,
    /// `/* ... */`
    BlockComment,
    /// Identifier or keyword, in either language
    Identifier(String),
    /// Numeric literal, kept verbatim
    Number,
    /// Quoted string literal with escapes decoded
    String(String),
    /// Template literal; `value` is the raw text outside substitutions
    Template {
        /// Raw text between the backticks, substitutions excluded
        value: String,
        /// Whether the literal contains `${...}`
        has_substitutions: bool,
    },
    /// Regular expression literal
    RegExp,
    /// Operator or punctuation
    Punct(String),
    /// Character that cannot start any token
    Invalid(char),
    /// Malformed literal or comment; the message describes the problem
    Error(String),
    /// End of input
    Eof,
}

impl TokenKind {
    /// Whether this kind carries meaning (is not trivia).
    pub fn is_significant(&self) -> bool {
        !matches!(
            self,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }
}
