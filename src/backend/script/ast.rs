//! Syntax tree of the kiln script language.
//!
//! Serializable so prebuilt bundles can carry parsed units and skip parsing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptUnit {
    pub file: PathBuf,
    pub usings: Vec<String>,
    pub classes: Vec<ClassDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDecl {
    /// Fully qualified name.
    pub name: String,
    pub namespace: String,
    /// Base type as written in source.
    pub base: Option<String>,
    pub constructor: Option<MethodDecl>,
    pub methods: Vec<MethodDecl>,
    pub line: u32,
    pub column: u32,
}

impl ClassDecl {
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    pub visibility: Visibility,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
pub enum Stmt {
    Expr { expr: Expr },
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    Str {
        value: String,
    },
    Int {
        value: i64,
    },
    /// Dotted name without a call, e.g. `Request.Path` or a parameter.
    Path {
        segments: Vec<String>,
        line: u32,
        column: u32,
    },
    Call {
        target: Vec<String>,
        args: Vec<Expr>,
        line: u32,
        column: u32,
    },
    Concat {
        left: Box<Expr>,
        right: Box<Expr>,
    },
}
