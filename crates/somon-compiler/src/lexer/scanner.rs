//! The scanner that produces tokens from source text.

use super::{Span, Token, TokenKind};
use unicode_xid::UnicodeXID;

/// Multi-character punctuators, longest first.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>",
];

/// Keywords after which a `/` starts a regular expression rather than a division.
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "do", "else", "in", "of", "new", "delete", "void", "throw",
    "instanceof", "yield", "await", "бозгашт", "партофтан", "нав", "вагарна", "интизор",
];

/// A scanner that tokenizes Somon (and plain JavaScript) source code.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    regex_allowed: bool,
}

impl<'a> Scanner<'a> {
    /// Creates a new scanner for the given source code.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            regex_allowed: true,
        }
    }

    /// Returns the next token from the source.
    pub fn next_token(&mut self) -> Token {
        let start = self.current_pos;

        let Some((_pos, ch)) = self.advance() else {
            return Token::new(TokenKind::Eof, Span::new(start, start));
        };

        let kind = match ch {
            _ if ch.is_whitespace() || ch == '\u{feff}' => self.scan_whitespace(),
            '/' => match self.peek() {
                Some('/') => self.scan_line_comment(),
                Some('*') => self.scan_block_comment(),
                _ if self.regex_allowed => self.scan_regex(),
                _ => self.scan_punct(start),
            },
            '"' | '\'' => self.scan_string(ch),
            '`' => self.scan_template(),
            '0'..='9' => self.scan_number(start),
            '.' if self.peek().is_some_and(|c| c.is_ascii_digit()) => self.scan_number(start),
            _ if is_id_start(ch) => self.scan_identifier(start),
            _ if ch.is_ascii_punctuation() => self.scan_punct(start),
            _ => TokenKind::Invalid(ch),
        };

        if kind.is_significant() {
            self.regex_allowed = regex_allowed_after(&kind);
        }

        Token::new(kind, Span::new(start, self.current_pos))
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((pos, ch)) = result {
            self.current_pos = pos + ch.len_utf8();
        }
        result
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, ch)| *ch)
    }

    fn scan_whitespace(&mut self) -> TokenKind {
        while self.peek().is_some_and(|c| c.is_whitespace() || c == '\u{feff}') {
            self.advance();
        }
        TokenKind::Whitespace
    }

    fn scan_line_comment(&mut self) -> TokenKind {
        while let Some(ch) = self.peek() {
            if ch == '\n' || ch == '\r' {
                break;
            }
            self.advance();
        }
        TokenKind::LineComment
    }

    fn scan_block_comment(&mut self) -> TokenKind {
        self.advance(); // consume '*'
        let mut prev = ' ';
        while let Some((_, ch)) = self.advance() {
            if prev == '*' && ch == '/' {
                return TokenKind::BlockComment;
            }
            prev = ch;
        }
        TokenKind::Error("unterminated block comment".to_string())
    }

    fn scan_string(&mut self, quote: char) -> TokenKind {
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return TokenKind::Error("unterminated string literal".to_string()),
                Some((_, '\n')) => {
                    return TokenKind::Error("unterminated string literal".to_string());
                }
                Some((_, '\\')) => match self.advance() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '0')) => value.push('\0'),
                    // Line continuation
                    Some((_, '\n')) => {}
                    Some((_, other)) => value.push(other),
                    None => {
                        return TokenKind::Error("unterminated string literal".to_string());
                    }
                },
                Some((_, ch)) if ch == quote => return TokenKind::String(value),
                Some((_, ch)) => value.push(ch),
            }
        }
    }

    fn scan_template(&mut self) -> TokenKind {
        let mut value = String::new();
        let mut has_substitutions = false;
        loop {
            match self.advance() {
                None => return TokenKind::Error("unterminated template literal".to_string()),
                Some((_, '\\')) => {
                    value.push('\\');
                    if let Some((_, escaped)) = self.advance() {
                        value.push(escaped);
                    }
                }
                Some((_, '`')) => {
                    return TokenKind::Template {
                        value,
                        has_substitutions,
                    };
                }
                Some((_, '$')) if self.peek() == Some('{') => {
                    self.advance();
                    has_substitutions = true;
                    if let Err(message) = self.skip_substitution() {
                        return TokenKind::Error(message);
                    }
                }
                Some((_, ch)) => value.push(ch),
            }
        }
    }

    /// Skips the body of a `${ ... }` substitution, including nested literals.
    fn skip_substitution(&mut self) -> Result<(), String> {
        let mut depth = 1usize;
        while let Some((_, ch)) = self.advance() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                '"' | '\'' => {
                    if let TokenKind::Error(message) = self.scan_string(ch) {
                        return Err(message);
                    }
                }
                '`' => {
                    if let TokenKind::Error(message) = self.scan_template() {
                        return Err(message);
                    }
                }
                _ => {}
            }
        }
        Err("unterminated template literal".to_string())
    }

    fn scan_regex(&mut self) -> TokenKind {
        let mut in_class = false;
        loop {
            match self.advance() {
                None | Some((_, '\n')) => {
                    return TokenKind::Error("unterminated regular expression literal".to_string());
                }
                Some((_, '\\')) => {
                    self.advance();
                }
                Some((_, '[')) => in_class = true,
                Some((_, ']')) => in_class = false,
                Some((_, '/')) if !in_class => break,
                Some(_) => {}
            }
        }
        // Flags
        while self.peek().is_some_and(is_id_continue) {
            self.advance();
        }
        TokenKind::RegExp
    }

    fn scan_number(&mut self, start: usize) -> TokenKind {
        let literal = &self.source[start..];
        let hex = literal.starts_with("0x") || literal.starts_with("0X");
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                    self.advance();
                    if matches!(c, 'e' | 'E') && !hex && matches!(self.peek(), Some('+' | '-')) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
        TokenKind::Number
    }

    fn scan_identifier(&mut self, start: usize) -> TokenKind {
        while self.peek().is_some_and(is_id_continue) {
            self.advance();
        }
        TokenKind::Identifier(self.source[start..self.current_pos].to_string())
    }

    fn scan_punct(&mut self, start: usize) -> TokenKind {
        let rest = &self.source[start..];
        if let Some(op) = PUNCTUATORS.iter().find(|op| rest.starts_with(**op)) {
            // The first character has already been consumed; all punctuators are ASCII.
            for _ in 1..op.len() {
                self.advance();
            }
            return TokenKind::Punct((*op).to_string());
        }
        TokenKind::Punct(self.source[start..self.current_pos].to_string())
    }
}

impl Iterator for Scanner<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token)
        }
    }
}

/// Tokenizes the whole source, trivia included, without the trailing `Eof`.
pub fn tokenize(source: &str) -> Vec<Token> {
    Scanner::new(source).collect()
}

/// Converts a byte offset into a 1-based `(line, column)` pair.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map(|nl| before[nl + 1..].chars().count())
        .unwrap_or_else(|| before.chars().count())
        + 1;
    (line, column)
}

fn is_id_start(ch: char) -> bool {
    ch == '$' || ch == '_' || UnicodeXID::is_xid_start(ch)
}

fn is_id_continue(ch: char) -> bool {
    ch == '$' || ch == '\u{200c}' || ch == '\u{200d}' || UnicodeXID::is_xid_continue(ch)
}

fn regex_allowed_after(kind: &TokenKind) -> bool {
    match kind {
        TokenKind::Identifier(name) => REGEX_PREFIX_KEYWORDS.contains(&name.as_str()),
        TokenKind::Punct(p) => !matches!(p.as_str(), ")" | "]" | "}" | "++" | "--"),
        TokenKind::Number
        | TokenKind::String(_)
        | TokenKind::Template { .. }
        | TokenKind::RegExp => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn significant(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .into_iter()
            .filter(Token::is_significant)
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_lossless() {
        let source = "собит x = `a${b + \"}\"}c`; // тавзеҳ\n/* блок */ y /= 2;";
        let rebuilt: String = tokenize(source).iter().map(|t| t.text(source)).collect();
        assert_eq!(rebuilt, source);
    }

    #[test]
    fn test_cyrillic_identifiers() {
        assert_eq!(
            significant("функсия салом"),
            vec![
                TokenKind::Identifier("функсия".to_string()),
                TokenKind::Identifier("салом".to_string()),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            significant(r#"'a\'b' "c\nd""#),
            vec![
                TokenKind::String("a'b".to_string()),
                TokenKind::String("c\nd".to_string()),
            ]
        );
    }

    #[test]
    fn test_template_substitutions() {
        let kinds = significant("`./${name}.js` `plain`");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Template {
                    value: "./.js".to_string(),
                    has_substitutions: true,
                },
                TokenKind::Template {
                    value: "plain".to_string(),
                    has_substitutions: false,
                },
            ]
        );
    }

    #[test]
    fn test_regex_versus_division() {
        let kinds = significant("x = a / b; y = /re\"/g;");
        assert!(kinds.contains(&TokenKind::Punct("/".to_string())));
        assert!(kinds.contains(&TokenKind::RegExp));
        assert!(!kinds.iter().any(|k| matches!(k, TokenKind::Error(_))));
    }

    #[test]
    fn test_unterminated_literals() {
        assert!(matches!(significant("'abc")[0], TokenKind::Error(_)));
        assert!(matches!(significant("`abc")[0], TokenKind::Error(_)));
        assert!(matches!(significant("/* abc")[0], TokenKind::Error(_)));
    }

    #[test]
    fn test_punctuators() {
        assert_eq!(
            significant("a === b => c"),
            vec![
                TokenKind::Identifier("a".to_string()),
                TokenKind::Punct("===".to_string()),
                TokenKind::Identifier("b".to_string()),
                TokenKind::Punct("=>".to_string()),
                TokenKind::Identifier("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_line_col() {
        let source = "ab\nсалом";
        assert_eq!(line_col(source, 0), (1, 1));
        assert_eq!(line_col(source, 3), (2, 1));
        assert_eq!(line_col(source, source.len()), (2, 6));
    }
}
