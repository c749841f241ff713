use std::path::Path;

use crate::domain::Diagnostic;

use super::ast::{ClassDecl, Expr, MethodDecl, ScriptUnit, Stmt, Visibility};
use super::lexer::{Token, TokenKind, tokenize};

const CLASS_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "internal",
    "sealed",
    "abstract",
    "static",
    "partial",
];

const MEMBER_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "internal",
    "override",
    "virtual",
    "static",
    "sealed",
    "new",
];

/// Parse one source file into a unit. Stops at the first syntax error.
pub fn parse(file: &Path, source: &str) -> Result<ScriptUnit, Diagnostic> {
    let tokens = tokenize(source).map_err(|error| {
        Diagnostic::error(error.message).at(file, error.line, error.column)
    })?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file,
        usings: Vec::new(),
        classes: Vec::new(),
    };
    parser.items("")?;
    parser.expect(&TokenKind::Eof)?;
    Ok(ScriptUnit {
        file: file.to_path_buf(),
        usings: parser.usings,
        classes: parser.classes,
    })
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    file: &'a Path,
    usings: Vec<String>,
    classes: Vec<ClassDecl>,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(name) if name == keyword)
    }

    fn error_here(&self, message: impl Into<String>) -> Diagnostic {
        let token = self.peek();
        Diagnostic::error(message).at(self.file, token.line, token.column)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, Diagnostic> {
        if &self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "expected {}, found {}",
                kind.describe(),
                self.peek().kind.describe()
            )))
        }
    }

    fn ident(&mut self) -> Result<(String, u32, u32), Diagnostic> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, token.line, token.column))
            }
            other => Err(self.error_here(format!(
                "expected identifier, found {}",
                other.describe()
            ))),
        }
    }

    fn qualified_name(&mut self) -> Result<String, Diagnostic> {
        let (mut name, _, _) = self.ident()?;
        while self.peek().kind == TokenKind::Dot {
            self.advance();
            let (segment, _, _) = self.ident()?;
            name.push('.');
            name.push_str(&segment);
        }
        Ok(name)
    }

    fn items(&mut self, namespace: &str) -> Result<(), Diagnostic> {
        loop {
            match &self.peek().kind {
                TokenKind::Eof | TokenKind::RBrace => return Ok(()),
                _ if self.at_keyword("using") => {
                    self.advance();
                    let name = self.qualified_name()?;
                    self.expect(&TokenKind::Semi)?;
                    if !self.usings.contains(&name) {
                        self.usings.push(name);
                    }
                }
                _ if self.at_keyword("namespace") => {
                    self.advance();
                    let name = self.qualified_name()?;
                    let nested = qualify(namespace, &name);
                    self.expect(&TokenKind::LBrace)?;
                    self.items(&nested)?;
                    self.expect(&TokenKind::RBrace)?;
                }
                _ => {
                    let class = self.class_decl(namespace)?;
                    self.classes.push(class);
                }
            }
        }
    }

    fn class_decl(&mut self, namespace: &str) -> Result<ClassDecl, Diagnostic> {
        while CLASS_MODIFIERS.iter().any(|m| self.at_keyword(m)) {
            self.advance();
        }
        if !self.at_keyword("class") {
            return Err(self.error_here(format!(
                "expected `class`, found {}",
                self.peek().kind.describe()
            )));
        }
        self.advance();
        let (short_name, line, column) = self.ident()?;
        let base = if self.peek().kind == TokenKind::Colon {
            self.advance();
            Some(self.qualified_name()?)
        } else {
            None
        };

        self.expect(&TokenKind::LBrace)?;
        let mut constructor = None;
        let mut methods = Vec::new();
        while self.peek().kind != TokenKind::RBrace {
            if self.peek().kind == TokenKind::Eof {
                return Err(self.error_here(format!("class `{short_name}` is never closed")));
            }
            let (method, is_constructor) = self.member(&short_name)?;
            if is_constructor {
                if constructor.is_some() {
                    return Err(Diagnostic::error(format!(
                        "class `{short_name}` declares more than one constructor"
                    ))
                    .at(self.file, method.line, method.column));
                }
                constructor = Some(method);
            } else {
                methods.push(method);
            }
        }
        self.expect(&TokenKind::RBrace)?;

        Ok(ClassDecl {
            name: qualify(namespace, &short_name),
            namespace: namespace.to_string(),
            base,
            constructor,
            methods,
            line,
            column,
        })
    }

    fn member(&mut self, class_name: &str) -> Result<(MethodDecl, bool), Diagnostic> {
        let mut visibility = Visibility::Private;
        while MEMBER_MODIFIERS.iter().any(|m| self.at_keyword(m)) {
            if self.at_keyword("public") {
                visibility = Visibility::Public;
            }
            self.advance();
        }

        let is_constructor = matches!(&self.peek().kind, TokenKind::Ident(name) if name == class_name)
            && *self.peek_kind_at(1) == TokenKind::LParen;
        if !is_constructor {
            if !self.at_keyword("void") {
                return Err(self.error_here(format!(
                    "expected `void` or a constructor, found {}",
                    self.peek().kind.describe()
                )));
            }
            self.advance();
        }

        let (name, line, column) = self.ident()?;
        let params = self.params()?;
        let body = self.block()?;
        Ok((
            MethodDecl {
                name,
                visibility,
                params,
                body,
                line,
                column,
            },
            is_constructor,
        ))
    }

    fn params(&mut self) -> Result<Vec<String>, Diagnostic> {
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                let (first, _, _) = self.ident()?;
                // `string name` and bare `name` are both accepted; the type is not checked.
                let name = if matches!(self.peek().kind, TokenKind::Ident(_)) {
                    self.ident()?.0
                } else {
                    first
                };
                params.push(name);
                if self.peek().kind == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(params)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        self.expect(&TokenKind::LBrace)?;
        let mut body = Vec::new();
        while self.peek().kind != TokenKind::RBrace {
            if self.peek().kind == TokenKind::Eof {
                return Err(self.error_here("method body is never closed"));
            }
            if self.at_keyword("return") {
                self.advance();
                self.expect(&TokenKind::Semi)?;
                body.push(Stmt::Return);
                continue;
            }
            let expr = self.expr()?;
            self.expect(&TokenKind::Semi)?;
            body.push(Stmt::Expr { expr });
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(body)
    }

    fn expr(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.term()?;
        while self.peek().kind == TokenKind::Plus {
            self.advance();
            let right = self.term()?;
            left = Expr::Concat {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str { value })
            }
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int { value })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(_) => {
                let (first, line, column) = self.ident()?;
                let mut segments = vec![first];
                while self.peek().kind == TokenKind::Dot {
                    self.advance();
                    segments.push(self.ident()?.0);
                }
                if self.peek().kind != TokenKind::LParen {
                    return Ok(Expr::Path {
                        segments,
                        line,
                        column,
                    });
                }
                self.advance();
                let mut args = Vec::new();
                if self.peek().kind != TokenKind::RParen {
                    loop {
                        args.push(self.expr()?);
                        if self.peek().kind == TokenKind::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen)?;
                Ok(Expr::Call {
                    target: segments,
                    args,
                    line,
                    column,
                })
            }
            other => Err(self.error_here(format!(
                "expected expression, found {}",
                other.describe()
            ))),
        }
    }
}

fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}
