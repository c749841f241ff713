use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Int(i64),
    Dot,
    Comma,
    Semi,
    Colon,
    Plus,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("`{name}`"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Int(_) => "integer literal".to_string(),
            TokenKind::Dot => "`.`".to_string(),
            TokenKind::Comma => "`,`".to_string(),
            TokenKind::Semi => "`;`".to_string(),
            TokenKind::Colon => "`:`".to_string(),
            TokenKind::Plus => "`+`".to_string(),
            TokenKind::LParen => "`(`".to_string(),
            TokenKind::RParen => "`)`".to_string(),
            TokenKind::LBrace => "`{`".to_string(),
            TokenKind::RBrace => "`}`".to_string(),
            TokenKind::Eof => "end of file".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

struct Cursor<'a> {
    chars: Peekable<Chars<'a>>,
    line: u32,
    column: u32,
}

impl Cursor<'_> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>, line: u32, column: u32) -> LexError {
        LexError {
            message: message.into(),
            line,
            column,
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut cursor = Cursor {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();

    loop {
        skip_trivia(&mut cursor)?;
        let (line, column) = (cursor.line, cursor.column);
        let Some(ch) = cursor.peek() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                line,
                column,
            });
            return Ok(tokens);
        };

        let kind = match ch {
            '.' => single(&mut cursor, TokenKind::Dot),
            ',' => single(&mut cursor, TokenKind::Comma),
            ';' => single(&mut cursor, TokenKind::Semi),
            ':' => single(&mut cursor, TokenKind::Colon),
            '+' => single(&mut cursor, TokenKind::Plus),
            '(' => single(&mut cursor, TokenKind::LParen),
            ')' => single(&mut cursor, TokenKind::RParen),
            '{' => single(&mut cursor, TokenKind::LBrace),
            '}' => single(&mut cursor, TokenKind::RBrace),
            '"' => {
                cursor.bump();
                TokenKind::Str(escaped_string(&mut cursor, line, column)?)
            }
            '@' => {
                cursor.bump();
                if cursor.bump() != Some('"') {
                    return Err(cursor.error("expected `\"` after `@`", line, column));
                }
                TokenKind::Str(verbatim_string(&mut cursor, line, column)?)
            }
            c if c.is_ascii_digit() => integer(&mut cursor, line, column)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(c) = cursor.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        cursor.bump();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(ident)
            }
            other => {
                return Err(cursor.error(format!("unexpected character `{other}`"), line, column));
            }
        };
        tokens.push(Token { kind, line, column });
    }
}

fn single(cursor: &mut Cursor<'_>, kind: TokenKind) -> TokenKind {
    cursor.bump();
    kind
}

fn skip_trivia(cursor: &mut Cursor<'_>) -> Result<(), LexError> {
    loop {
        match cursor.peek() {
            Some(c) if c.is_whitespace() => {
                cursor.bump();
            }
            Some('/') => {
                let (line, column) = (cursor.line, cursor.column);
                let mut lookahead = cursor.chars.clone();
                lookahead.next();
                match lookahead.next() {
                    Some('/') => {
                        while let Some(c) = cursor.bump() {
                            if c == '\n' {
                                break;
                            }
                        }
                    }
                    Some('*') => {
                        cursor.bump();
                        cursor.bump();
                        let mut closed = false;
                        while let Some(c) = cursor.bump() {
                            if c == '*' && cursor.peek() == Some('/') {
                                cursor.bump();
                                closed = true;
                                break;
                            }
                        }
                        if !closed {
                            return Err(cursor.error("unterminated block comment", line, column));
                        }
                    }
                    _ => return Ok(()),
                }
            }
            _ => return Ok(()),
        }
    }
}

fn escaped_string(cursor: &mut Cursor<'_>, line: u32, column: u32) -> Result<String, LexError> {
    let mut value = String::new();
    loop {
        match cursor.bump() {
            Some('"') => return Ok(value),
            Some('\\') => {
                let escaped = match cursor.bump() {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('0') => '\0',
                    Some('"') => '"',
                    Some('\'') => '\'',
                    Some('\\') => '\\',
                    Some(other) => {
                        return Err(cursor.error(
                            format!("unknown escape sequence `\\{other}`"),
                            cursor.line,
                            cursor.column.saturating_sub(2),
                        ));
                    }
                    None => break,
                };
                value.push(escaped);
            }
            Some('\n') | None => break,
            Some(c) => value.push(c),
        }
    }
    Err(cursor.error("unterminated string literal", line, column))
}

fn verbatim_string(cursor: &mut Cursor<'_>, line: u32, column: u32) -> Result<String, LexError> {
    let mut value = String::new();
    while let Some(c) = cursor.bump() {
        if c == '"' {
            if cursor.peek() == Some('"') {
                cursor.bump();
                value.push('"');
            } else {
                return Ok(value);
            }
        } else {
            value.push(c);
        }
    }
    Err(cursor.error("unterminated verbatim string literal", line, column))
}

fn integer(cursor: &mut Cursor<'_>, line: u32, column: u32) -> Result<TokenKind, LexError> {
    let mut digits = String::new();
    while let Some(c) = cursor.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            cursor.bump();
        } else {
            break;
        }
    }
    digits
        .parse::<i64>()
        .map(TokenKind::Int)
        .map_err(|_| cursor.error(format!("integer literal `{digits}` is out of range"), line, column))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("tokenizes")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn call_statement_tokens() {
        assert_eq!(
            kinds(r#"Response.Write("X");"#),
            vec![
                TokenKind::Ident("Response".into()),
                TokenKind::Dot,
                TokenKind::Ident("Write".into()),
                TokenKind::LParen,
                TokenKind::Str("X".into()),
                TokenKind::RParen,
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn verbatim_string_undoubles_quotes_and_keeps_newlines() {
        assert_eq!(
            kinds("@\"say \"\"hi\"\"\nbye\""),
            vec![TokenKind::Str("say \"hi\"\nbye".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("// line\n/* block\n */ 42"),
            vec![TokenKind::Int(42), TokenKind::Eof]
        );
    }

    #[test]
    fn positions_are_one_based() {
        let tokens = tokenize("a\n  b").expect("tokenizes");
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn unterminated_string_reports_start() {
        let error = tokenize("x \"abc").expect_err("unterminated");
        assert_eq!((error.line, error.column), (1, 3));
    }
}
