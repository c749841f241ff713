//! Link step: resolves names across a batch of parsed units and the modules
//! it references, then freezes the result into a [`ScriptModule`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::Diagnostic;

use super::ast::{ClassDecl, Expr, MethodDecl, ScriptUnit, Stmt, Visibility};

/// Upper bound on base-class chains; anything deeper is treated as a cycle.
pub const MAX_INHERITANCE_DEPTH: usize = 64;

pub const BUILTIN_ROOTS: &[&str] = &["Response", "Request", "Args", "Fields", "Html"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Exact(usize),
    Any,
}

const BUILTIN_CALLS: &[(&str, &str, Arity)] = &[
    ("Response", "Write", Arity::Any),
    ("Response", "WriteLiteral", Arity::Exact(1)),
    ("Response", "Status", Arity::Exact(1)),
    ("Response", "ContentType", Arity::Exact(1)),
    ("Request", "Query", Arity::Exact(1)),
    ("Request", "Header", Arity::Exact(1)),
    ("Args", "Get", Arity::Exact(1)),
    ("Args", "Require", Arity::Exact(1)),
    ("Fields", "Set", Arity::Exact(2)),
    ("Fields", "Get", Arity::Exact(1)),
    ("Html", "Encode", Arity::Exact(1)),
];

const BUILTIN_PROPERTIES: &[(&str, &str)] = &[
    ("Request", "Path"),
    ("Request", "Method"),
    ("Args", "Count"),
];

/// A linked class. Base and static type references are fully qualified.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub base: Option<String>,
    pub constructor: Option<MethodDecl>,
    pub methods: BTreeMap<String, MethodDecl>,
    /// Static call prefix as written -> qualified class name.
    pub type_refs: HashMap<String, String>,
    /// Action registry: public method name -> declaring class.
    pub actions: BTreeMap<String, String>,
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug)]
pub struct ScriptModule {
    pub units: Vec<ScriptUnit>,
    pub classes: HashMap<String, Arc<ClassDef>>,
    pub references: Vec<Arc<ScriptModule>>,
}

impl ScriptModule {
    /// Find a class declared here or in any referenced module.
    pub fn find_class(&self, name: &str) -> Option<&Arc<ClassDef>> {
        self.classes
            .get(name)
            .or_else(|| self.references.iter().find_map(|module| module.find_class(name)))
    }

    /// Class in `class`'s base chain that declares `method`, nearest first.
    pub fn method_owner(&self, class: &Arc<ClassDef>, method: &str) -> Option<Arc<ClassDef>> {
        let mut current = Arc::clone(class);
        for _ in 0..MAX_INHERITANCE_DEPTH {
            if current.methods.contains_key(method) {
                return Some(current);
            }
            let base = current.base.as_deref()?;
            current = Arc::clone(self.find_class(base)?);
        }
        None
    }

    /// Base chain of `class`, root first, ending with `class` itself.
    pub fn lineage(&self, class: &Arc<ClassDef>) -> Vec<Arc<ClassDef>> {
        let mut chain = vec![Arc::clone(class)];
        let mut current = Arc::clone(class);
        while let Some(base) = current.base.as_deref() {
            if chain.len() >= MAX_INHERITANCE_DEPTH {
                break;
            }
            let Some(next) = self.find_class(base) else {
                break;
            };
            current = Arc::clone(next);
            chain.push(Arc::clone(&current));
        }
        chain.reverse();
        chain
    }
}

/// Link parsed units against already linked reference modules.
pub fn link(
    units: Vec<ScriptUnit>,
    references: Vec<Arc<ScriptModule>>,
) -> Result<ScriptModule, Vec<Diagnostic>> {
    let mut linker = Linker {
        pending: HashMap::new(),
        order: Vec::new(),
        references: &references,
        diagnostics: Vec::new(),
    };
    linker.declare(&units);
    linker.check_cycles();
    if !linker.diagnostics.is_empty() {
        return Err(linker.diagnostics);
    }

    let diagnostics = linker.check_bodies();
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let actions: Vec<(String, BTreeMap<String, String>)> = linker
        .order
        .iter()
        .map(|name| (name.clone(), linker.action_registry(name)))
        .collect();
    let mut pending = linker.pending;
    for (name, registry) in actions {
        if let Some(class) = pending.get_mut(&name) {
            class.actions = registry;
        }
    }

    let classes = pending
        .into_iter()
        .map(|(name, class)| (name, Arc::new(class)))
        .collect();
    Ok(ScriptModule {
        units,
        classes,
        references,
    })
}

struct Linker<'a> {
    pending: HashMap<String, ClassDef>,
    order: Vec<String>,
    references: &'a [Arc<ScriptModule>],
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Linker<'a> {
    fn referenced(&self, name: &str) -> Option<&'a ClassDef> {
        self.references
            .iter()
            .find_map(|module| module.find_class(name))
            .map(Arc::as_ref)
    }

    fn class(&self, name: &str) -> Option<&ClassDef> {
        self.pending.get(name).or_else(|| self.referenced(name))
    }

    fn declare(&mut self, units: &[ScriptUnit]) {
        let mut declared: HashSet<String> = HashSet::new();
        let mut accepted: Vec<(&ScriptUnit, &ClassDecl)> = Vec::new();

        for unit in units {
            for class in &unit.classes {
                if !declared.insert(class.name.clone()) {
                    self.diagnostics.push(
                        Diagnostic::error(format!(
                            "type `{}` is declared more than once",
                            class.name
                        ))
                        .at(&unit.file, class.line, class.column),
                    );
                    continue;
                }
                if self.referenced(&class.name).is_some() {
                    self.diagnostics.push(
                        Diagnostic::error(format!(
                            "type `{}` is already declared by a referenced artifact",
                            class.name
                        ))
                        .at(&unit.file, class.line, class.column),
                    );
                    continue;
                }
                accepted.push((unit, class));
            }
        }

        let known = |name: &str, linker: &Self| {
            declared.contains(name) || linker.referenced(name).is_some()
        };

        for (unit, decl) in accepted {
            let base = match decl.base.as_deref() {
                None => None,
                Some(written) => {
                    match candidates(written, &decl.namespace, &unit.usings)
                        .into_iter()
                        .find(|candidate| known(candidate, &*self))
                    {
                        Some(resolved) => Some(resolved),
                        None => {
                            self.diagnostics.push(
                                Diagnostic::error(format!("unknown base type `{written}`"))
                                    .at(&unit.file, decl.line, decl.column),
                            );
                            continue;
                        }
                    }
                }
            };

            let mut methods = BTreeMap::new();
            for method in &decl.methods {
                if methods.insert(method.name.clone(), method.clone()).is_some() {
                    self.diagnostics.push(
                        Diagnostic::error(format!(
                            "method `{}` is declared more than once in `{}`",
                            method.name, decl.name
                        ))
                        .at(&unit.file, method.line, method.column),
                    );
                }
            }

            let mut type_refs = HashMap::new();
            let mut unresolved = Vec::new();
            let bodies = decl.constructor.iter().chain(decl.methods.iter());
            for method in bodies {
                for (written, line, column) in static_prefixes(&method.body) {
                    if type_refs.contains_key(&written) {
                        continue;
                    }
                    match candidates(&written, &decl.namespace, &unit.usings)
                        .into_iter()
                        .find(|candidate| known(candidate, &*self))
                    {
                        Some(resolved) => {
                            type_refs.insert(written, resolved);
                        }
                        None => unresolved.push(
                            Diagnostic::error(format!("unknown type `{written}`"))
                                .at(&unit.file, line, column),
                        ),
                    }
                }
            }
            self.diagnostics.extend(unresolved);

            self.order.push(decl.name.clone());
            self.pending.insert(
                decl.name.clone(),
                ClassDef {
                    name: decl.name.clone(),
                    base,
                    constructor: decl.constructor.clone(),
                    methods,
                    type_refs,
                    actions: BTreeMap::new(),
                    file: unit.file.clone(),
                    line: decl.line,
                    column: decl.column,
                },
            );
        }
    }

    fn check_cycles(&mut self) {
        let mut cyclic = Vec::new();
        for name in &self.order {
            let mut seen = HashSet::from([name.as_str()]);
            let mut current = self.pending.get(name).and_then(|c| c.base.as_deref());
            while let Some(base) = current {
                if !seen.insert(base) {
                    cyclic.push(name.clone());
                    break;
                }
                current = self.pending.get(base).and_then(|c| c.base.as_deref());
            }
        }
        for name in cyclic {
            if let Some(class) = self.pending.get(&name) {
                self.diagnostics.push(
                    Diagnostic::error(format!("inheritance cycle through `{name}`"))
                        .at(&class.file, class.line, class.column),
                );
            }
        }
    }

    /// Nearest class in `start`'s chain declaring `method`, with the method.
    fn method_owner(&self, start: &str, method: &str) -> Option<&MethodDecl> {
        let mut current = self.class(start)?;
        for _ in 0..MAX_INHERITANCE_DEPTH {
            if let Some(found) = current.methods.get(method) {
                return Some(found);
            }
            current = self.class(current.base.as_deref()?)?;
        }
        None
    }

    fn check_bodies(&self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for name in &self.order {
            let Some(class) = self.pending.get(name) else {
                continue;
            };
            for method in class.constructor.iter().chain(class.methods.values()) {
                for stmt in &method.body {
                    if let Stmt::Expr { expr } = stmt {
                        self.check_expr(class, &method.params, expr, &mut out);
                    }
                }
            }
        }
        out
    }

    fn check_expr(&self, class: &ClassDef, params: &[String], expr: &Expr, out: &mut Vec<Diagnostic>) {
        match expr {
            Expr::Str { .. } | Expr::Int { .. } => {}
            Expr::Concat { left, right } => {
                self.check_expr(class, params, left, out);
                self.check_expr(class, params, right, out);
            }
            Expr::Path {
                segments,
                line,
                column,
            } => {
                let known = match segments.as_slice() {
                    [single] => params.contains(single),
                    [root, member] => BUILTIN_PROPERTIES
                        .iter()
                        .any(|(r, m)| r == root && m == member),
                    _ => false,
                };
                if !known {
                    out.push(
                        Diagnostic::error(format!("unknown name `{}`", segments.join(".")))
                            .at(&class.file, *line, *column),
                    );
                }
            }
            Expr::Call {
                target,
                args,
                line,
                column,
            } => {
                for arg in args {
                    self.check_expr(class, params, arg, out);
                }
                let at = |message: String| Diagnostic::error(message).at(&class.file, *line, *column);
                if let Err(message) = self.check_call(class, target, args.len()) {
                    out.push(at(message));
                }
            }
        }
    }

    fn check_call(&self, class: &ClassDef, target: &[String], argc: usize) -> Result<(), String> {
        match target {
            [name] if name == "Fail" => expect_arity(name, Arity::Exact(1), argc),
            [name] => self.check_method(&class.name, name, argc),
            [this, name] if this == "this" => self.check_method(&class.name, name, argc),
            [base, name] if base == "base" => match class.base.as_deref() {
                Some(base) => self.check_method(base, name, argc),
                None => Err(format!("`{}` has no base type", class.name)),
            },
            [root, member] if BUILTIN_ROOTS.contains(&root.as_str()) => {
                match BUILTIN_CALLS
                    .iter()
                    .find(|(r, m, _)| r == root && m == member)
                {
                    Some((_, _, arity)) => expect_arity(&format!("{root}.{member}"), *arity, argc),
                    None => Err(format!("unknown member `{root}.{member}`")),
                }
            }
            [root, ..] if BUILTIN_ROOTS.contains(&root.as_str()) => {
                Err(format!("unknown member `{}`", target.join(".")))
            }
            [prefix @ .., name] => {
                let written = prefix.join(".");
                match class.type_refs.get(&written) {
                    Some(qualified) => self.check_method(qualified, name, argc),
                    None => Err(format!("unknown type `{written}`")),
                }
            }
            [] => Err("empty call target".to_string()),
        }
    }

    fn check_method(&self, class: &str, name: &str, argc: usize) -> Result<(), String> {
        match self.method_owner(class, name) {
            Some(method) => expect_arity(name, Arity::Exact(method.params.len()), argc),
            None => Err(format!("unknown method `{name}` on `{class}`")),
        }
    }

    fn action_registry(&self, name: &str) -> BTreeMap<String, String> {
        let mut chain = Vec::new();
        let mut current = self.class(name);
        while let Some(class) = current {
            if chain.len() >= MAX_INHERITANCE_DEPTH {
                break;
            }
            chain.push(class);
            current = class.base.as_deref().and_then(|base| self.class(base));
        }

        let mut registry = BTreeMap::new();
        for class in chain.into_iter().rev() {
            for method in class.methods.values() {
                if method.visibility == Visibility::Public {
                    registry.insert(method.name.clone(), class.name.clone());
                }
            }
        }
        registry
    }
}

fn expect_arity(name: &str, arity: Arity, argc: usize) -> Result<(), String> {
    match arity {
        Arity::Any => Ok(()),
        Arity::Exact(expected) if expected == argc => Ok(()),
        Arity::Exact(expected) => Err(format!(
            "`{name}` takes {expected} argument(s) but {argc} were supplied"
        )),
    }
}

/// Qualified names a written type name may refer to, innermost scope first.
fn candidates(written: &str, namespace: &str, usings: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut scope = namespace;
    while !scope.is_empty() {
        out.push(format!("{scope}.{written}"));
        scope = scope.rsplit_once('.').map(|(outer, _)| outer).unwrap_or("");
    }
    for using in usings {
        out.push(format!("{using}.{written}"));
    }
    out.push(written.to_string());
    out
}

fn static_prefixes(body: &[Stmt]) -> Vec<(String, u32, u32)> {
    fn walk(expr: &Expr, out: &mut Vec<(String, u32, u32)>) {
        match expr {
            Expr::Concat { left, right } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::Call {
                target,
                args,
                line,
                column,
            } => {
                args.iter().for_each(|arg| walk(arg, out));
                if let [first, .., _] = target.as_slice()
                    && first != "this"
                    && first != "base"
                    && !BUILTIN_ROOTS.contains(&first.as_str())
                {
                    out.push((target[..target.len() - 1].join("."), *line, *column));
                }
            }
            Expr::Str { .. } | Expr::Int { .. } | Expr::Path { .. } => {}
        }
    }

    let mut out = Vec::new();
    for stmt in body {
        if let Stmt::Expr { expr } = stmt {
            walk(expr, &mut out);
        }
    }
    out
}
