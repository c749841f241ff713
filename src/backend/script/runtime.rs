//! Tree-walking interpreter behind script handler instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::backend::handler::{
    Handler, HandlerRequest, HandlerResponse, InvokeError, TypeFactory, Value,
};

use super::ast::{Expr, MethodDecl, Stmt};
use super::link::{ClassDef, ScriptModule};

/// Entry point run by [`Handler::process`].
pub const ENTRY_METHOD: &str = "ProcessRequest";

const MAX_CALL_DEPTH: usize = 64;

/// Type table entry for one linked class.
pub struct ScriptTypeFactory {
    module: Arc<ScriptModule>,
    class: Arc<ClassDef>,
}

impl ScriptTypeFactory {
    pub fn new(module: Arc<ScriptModule>, class: Arc<ClassDef>) -> Self {
        Self { module, class }
    }
}

impl TypeFactory for ScriptTypeFactory {
    fn construct(&self, args: &[Value]) -> Result<Box<dyn Handler>, String> {
        let mut state = InstanceState {
            class: Arc::clone(&self.class),
            args: args.to_vec(),
            fields: BTreeMap::new(),
        };
        let request = HandlerRequest::default();
        let mut interpreter = Interpreter::new(&self.module, &request);
        // Constructors run root first; anything they write is discarded.
        for class in self.module.lineage(&self.class) {
            if let Some(constructor) = class.constructor.as_ref() {
                let params = bind_params(constructor, args);
                interpreter.run_body(&mut state, &class, constructor, params)?;
            }
        }
        Ok(Box::new(ScriptInstance {
            module: Arc::clone(&self.module),
            state,
        }))
    }
}

struct InstanceState {
    class: Arc<ClassDef>,
    args: Vec<Value>,
    fields: BTreeMap<String, Value>,
}

pub struct ScriptInstance {
    module: Arc<ScriptModule>,
    state: InstanceState,
}

impl ScriptInstance {
    fn run(&mut self, method: &str, request: &HandlerRequest) -> Result<HandlerResponse, InvokeError> {
        let mut interpreter = Interpreter::new(&self.module, request);
        interpreter
            .call_virtual(&mut self.state, method, Vec::new())
            .map_err(|message| InvokeError::Runtime {
                type_name: self.state.class.name.clone(),
                message,
            })?;
        Ok(interpreter.response)
    }
}

impl Handler for ScriptInstance {
    fn type_name(&self) -> &str {
        &self.state.class.name
    }

    fn process(&mut self, request: &HandlerRequest) -> Result<HandlerResponse, InvokeError> {
        self.run(ENTRY_METHOD, request)
    }

    fn invoke_action(
        &mut self,
        action: &str,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, InvokeError> {
        if !self.state.class.actions.contains_key(action) {
            return Err(InvokeError::UnknownAction {
                type_name: self.state.class.name.clone(),
                action: action.to_string(),
            });
        }
        self.run(action, request)
    }

    fn actions(&self) -> Vec<String> {
        self.state.class.actions.keys().cloned().collect()
    }
}

struct Interpreter<'a> {
    module: &'a ScriptModule,
    request: &'a HandlerRequest,
    response: HandlerResponse,
    depth: usize,
}

impl<'a> Interpreter<'a> {
    fn new(module: &'a ScriptModule, request: &'a HandlerRequest) -> Self {
        Self {
            module,
            request,
            response: HandlerResponse::default(),
            depth: 0,
        }
    }

    /// Dispatch on the instance's runtime class.
    fn call_virtual(
        &mut self,
        state: &mut InstanceState,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), String> {
        let class = Arc::clone(&state.class);
        self.call_from(state, &class, name, args)
    }

    fn call_from(
        &mut self,
        state: &mut InstanceState,
        start: &Arc<ClassDef>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), String> {
        let owner = self
            .module
            .method_owner(start, name)
            .ok_or_else(|| format!("`{}` has no method `{name}`", start.name))?;
        let Some(method) = owner.methods.get(name) else {
            return Err(format!("`{}` has no method `{name}`", owner.name));
        };
        let params = bind_params(method, &args);
        self.run_body(state, &owner, method, params)
    }

    fn run_body(
        &mut self,
        state: &mut InstanceState,
        owner: &Arc<ClassDef>,
        method: &MethodDecl,
        locals: HashMap<String, Value>,
    ) -> Result<(), String> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(format!(
                "call depth exceeded {MAX_CALL_DEPTH} in `{}.{}`",
                owner.name, method.name
            ));
        }
        self.depth += 1;
        let mut outcome = Ok(());
        for stmt in &method.body {
            match stmt {
                Stmt::Return => break,
                Stmt::Expr { expr } => {
                    if let Err(message) = self.eval(state, owner, &locals, expr) {
                        outcome = Err(message);
                        break;
                    }
                }
            }
        }
        self.depth -= 1;
        outcome
    }

    fn eval(
        &mut self,
        state: &mut InstanceState,
        owner: &Arc<ClassDef>,
        locals: &HashMap<String, Value>,
        expr: &Expr,
    ) -> Result<Value, String> {
        match expr {
            Expr::Str { value } => Ok(Value::Str(value.clone())),
            Expr::Int { value } => Ok(Value::Int(*value)),
            Expr::Concat { left, right } => {
                let left = self.eval(state, owner, locals, left)?;
                let right = self.eval(state, owner, locals, right)?;
                Ok(Value::Str(format!("{left}{right}")))
            }
            Expr::Path { segments, .. } => Ok(self.read_path(state, locals, segments)),
            Expr::Call { target, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(state, owner, locals, arg)?);
                }
                self.call(state, owner, target, values)
            }
        }
    }

    fn read_path(
        &self,
        state: &InstanceState,
        locals: &HashMap<String, Value>,
        segments: &[String],
    ) -> Value {
        match segments {
            [name] => locals.get(name).cloned().unwrap_or_default(),
            [root, member] => match (root.as_str(), member.as_str()) {
                ("Request", "Path") => Value::Str(self.request.path.clone()),
                ("Request", "Method") => Value::Str(self.request.method.clone()),
                ("Args", "Count") => Value::Int(state.args.len() as i64),
                _ => Value::Nil,
            },
            _ => Value::Nil,
        }
    }

    fn call(
        &mut self,
        state: &mut InstanceState,
        owner: &Arc<ClassDef>,
        target: &[String],
        args: Vec<Value>,
    ) -> Result<Value, String> {
        match target {
            [name] if name == "Fail" => Err(first(&args).to_string()),
            [name] => self.call_virtual(state, name, args).map(|()| Value::Nil),
            [this, name] if this == "this" => {
                self.call_virtual(state, name, args).map(|()| Value::Nil)
            }
            [base, name] if base == "base" => {
                let base = owner
                    .base
                    .as_deref()
                    .and_then(|base| self.module.find_class(base))
                    .cloned()
                    .ok_or_else(|| format!("`{}` has no base type", owner.name))?;
                self.call_from(state, &base, name, args).map(|()| Value::Nil)
            }
            [root, member] if is_builtin(root) => self.builtin(state, root, member, args),
            [prefix @ .., name] => {
                let written = prefix.join(".");
                let class = owner
                    .type_refs
                    .get(&written)
                    .and_then(|qualified| self.module.find_class(qualified))
                    .cloned()
                    .ok_or_else(|| format!("unknown type `{written}`"))?;
                // Static calls run on a fresh instance that shares this response.
                let mut fresh = InstanceState {
                    class: Arc::clone(&class),
                    args: Vec::new(),
                    fields: BTreeMap::new(),
                };
                self.call_from(&mut fresh, &class, name, args)
                    .map(|()| Value::Nil)
            }
            [] => Err("empty call target".to_string()),
        }
    }

    fn builtin(
        &mut self,
        state: &mut InstanceState,
        root: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value, String> {
        match (root, member) {
            ("Response", "Write") => {
                for arg in &args {
                    self.response.body.push_str(&arg.to_string());
                }
                Ok(Value::Nil)
            }
            ("Response", "WriteLiteral") => {
                self.response.body.push_str(&first(&args).to_string());
                Ok(Value::Nil)
            }
            ("Response", "Status") => {
                let status = as_int(first(&args))
                    .filter(|status| (100..=599).contains(status))
                    .ok_or_else(|| format!("invalid status code `{}`", first(&args)))?;
                self.response.status = status as u16;
                Ok(Value::Nil)
            }
            ("Response", "ContentType") => {
                self.response.content_type = first(&args).to_string();
                Ok(Value::Nil)
            }
            ("Request", "Query") => Ok(lookup(&self.request.query, first(&args))),
            ("Request", "Header") => {
                let key = first(&args).to_string().to_ascii_lowercase();
                Ok(self
                    .request
                    .headers
                    .iter()
                    .find(|(name, _)| name.to_ascii_lowercase() == key)
                    .map(|(_, value)| Value::Str(value.clone()))
                    .unwrap_or_default())
            }
            ("Args", "Get") => Ok(as_int(first(&args))
                .and_then(|index| usize::try_from(index).ok())
                .and_then(|index| state.args.get(index).cloned())
                .unwrap_or_default()),
            ("Args", "Require") => {
                let required = as_int(first(&args)).unwrap_or(0);
                if (state.args.len() as i64) < required {
                    return Err(format!(
                        "`{}` requires {required} constructor argument(s), got {}",
                        state.class.name,
                        state.args.len()
                    ));
                }
                Ok(Value::Nil)
            }
            ("Fields", "Set") => {
                let mut args = args.into_iter();
                let key = args.next().unwrap_or_default().to_string();
                let value = args.next().unwrap_or_default();
                state.fields.insert(key, value);
                Ok(Value::Nil)
            }
            ("Fields", "Get") => Ok(lookup(&state.fields, first(&args))),
            ("Html", "Encode") => Ok(Value::Str(html_encode(&first(&args).to_string()))),
            _ => Err(format!("unknown member `{root}.{member}`")),
        }
    }
}

fn is_builtin(root: &str) -> bool {
    super::link::BUILTIN_ROOTS.contains(&root)
}

fn bind_params(method: &MethodDecl, args: &[Value]) -> HashMap<String, Value> {
    method
        .params
        .iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), args.get(index).cloned().unwrap_or_default()))
        .collect()
}

fn first(args: &[Value]) -> &Value {
    const NIL: &Value = &Value::Nil;
    args.first().unwrap_or(NIL)
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(value) => Some(*value),
        Value::Str(value) => value.trim().parse().ok(),
        Value::Nil => None,
    }
}

fn lookup(map: &BTreeMap<String, impl Into<Value> + Clone>, key: &Value) -> Value {
    map.get(&key.to_string())
        .cloned()
        .map(Into::into)
        .unwrap_or_default()
}

pub fn html_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
