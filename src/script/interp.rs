//! Tree-walking evaluator.
//!
//! # Scoping
//!
//! Top-level declarations live in the global environment. Each function
//! call gets one local frame for its parameters and `var`/`let`/`const`
//! declarations; functions see their own frame and the globals, never
//! the caller's locals. Function declarations are hoisted per body.
//!
//! # Cancellation
//!
//! Every statement starts with a checkpoint that polls the interrupt
//! channel. A pending request turns into [`Fault::Cancelled`], which
//! unwinds through every enclosing call like any other fault.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::ast::{BinaryOp, Expr, FunctionDef, LogicalOp, Program, Stmt, UnaryOp};
use super::error::Fault;
use super::interrupt::{self, Interrupt, InterruptHandle};
use super::value::{HostRef, Value};

/// Nested script calls beyond this depth fail instead of overflowing the
/// native stack.
const MAX_CALL_DEPTH: usize = 512;

/// Bound on nested `exec`/`eval` activations across all calls.
const MAX_EVAL_DEPTH: usize = 4096;

/// Native stack a thread needs to run an interpreter up to its depth
/// limits. The default 2 MiB of tokio's blocking pool is not enough for
/// deep recursion.
pub const THREAD_STACK_SIZE: usize = 32 << 20;

/// Arrays grow on index assignment by at most this many holes at once.
const MAX_ARRAY_GAP: usize = 1 << 16;

const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Capabilities injected by the embedding application.
pub trait Host {
    /// Call a host function bound as `Value::Native`.
    fn call_native(
        &mut self,
        interp: &Interpreter,
        target: HostRef,
        args: Vec<Value>,
    ) -> Result<Value, Fault>;

    /// Call `method` on a host object bound as `Value::Handle`.
    fn call_method(
        &mut self,
        interp: &Interpreter,
        target: HostRef,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Fault>;
}

/// A host with no capabilities; every host call fails.
pub struct NoHost;

impl Host for NoHost {
    fn call_native(&mut self, _: &Interpreter, _: HostRef, _: Vec<Value>) -> Result<Value, Fault> {
        Err(Fault::error("host functions are not available"))
    }

    fn call_method(
        &mut self,
        _: &Interpreter,
        _: HostRef,
        method: &str,
        _: Vec<Value>,
    ) -> Result<Value, Fault> {
        Err(Fault::error(format!("{method} is not available")))
    }
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{key}"),
            Segment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// An assignable location: a variable plus a property/index path.
struct Place {
    root: String,
    path: Vec<Segment>,
}

pub struct Interpreter {
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
    depth: usize,
    interrupt: Interrupt,
}

impl Interpreter {
    /// A fresh interpreter and the handle that can interrupt it.
    pub fn new() -> (Self, InterruptHandle) {
        let (handle, interrupt) = interrupt::channel();
        let interp = Self {
            globals: HashMap::new(),
            frames: Vec::new(),
            depth: 0,
            interrupt,
        };
        (interp, handle)
    }

    /// Deep copy of the global environment with its own interrupt channel.
    /// Locals of whatever call is in progress are not carried over.
    pub fn fork(&self) -> (Self, InterruptHandle) {
        let (handle, interrupt) = interrupt::channel();
        let interp = Self {
            globals: self.globals.clone(),
            frames: Vec::new(),
            depth: 0,
            interrupt,
        };
        (interp, handle)
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Observe a pending cancellation request.
    pub fn checkpoint(&mut self) -> Result<(), Fault> {
        if self.interrupt.take() {
            Err(Fault::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Execute a program's top-level statements in the global scope.
    pub fn run(&mut self, program: &Program, host: &mut dyn Host) -> Result<(), Fault> {
        self.exec_body(&program.body, host)?;
        Ok(())
    }

    /// Call a function value with already-evaluated arguments.
    pub fn call(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        host: &mut dyn Host,
    ) -> Result<Value, Fault> {
        match callee {
            Value::Function(def) => self.call_function(def, args, host),
            Value::Native(target) => host.call_native(self, *target, args),
            other => Err(Fault::error(format!("{} is not a function", other.type_name()))),
        }
    }

    fn call_function(
        &mut self,
        def: &Arc<FunctionDef>,
        args: Vec<Value>,
        host: &mut dyn Host,
    ) -> Result<Value, Fault> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Fault::error("Maximum call stack size exceeded"));
        }
        let mut args = args.into_iter();
        let frame = def
            .params
            .iter()
            .map(|param| (param.clone(), args.next().unwrap_or_default()))
            .collect();
        self.frames.push(frame);
        let result = self.exec_body(&def.body, host);
        self.frames.pop();
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    // -- Environment ----------------------------------------------------

    fn declare(&mut self, name: &str, value: Value) {
        let scope = match self.frames.last_mut() {
            Some(frame) => frame,
            None => &mut self.globals,
        };
        scope.insert(name.to_string(), value);
    }

    fn lookup(&self, name: &str) -> Result<&Value, Fault> {
        self.frames
            .last()
            .and_then(|frame| frame.get(name))
            .or_else(|| self.globals.get(name))
            .ok_or_else(|| Fault::error(format!("{name} is not defined")))
    }

    /// Assign to the innermost binding of `name`, creating a global when
    /// none exists.
    fn assign(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.frames.last_mut().and_then(|frame| frame.get_mut(name)) {
            *slot = value;
            return;
        }
        self.globals.insert(name.to_string(), value);
    }

    fn binding_mut(&mut self, name: &str) -> Result<&mut Value, Fault> {
        let scope = match self.frames.last_mut() {
            Some(frame) if frame.contains_key(name) => frame,
            _ => &mut self.globals,
        };
        scope
            .get_mut(name)
            .ok_or_else(|| Fault::error(format!("{name} is not defined")))
    }

    // -- Statements -----------------------------------------------------

    fn exec_body(&mut self, body: &[Stmt], host: &mut dyn Host) -> Result<Flow, Fault> {
        for stmt in body {
            if let Stmt::Function(def) = stmt {
                if let Some(name) = &def.name {
                    self.declare(name, Value::Function(def.clone()));
                }
            }
        }
        for stmt in body {
            match self.exec(stmt, host)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn descend(&mut self) -> Result<(), Fault> {
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(Fault::error("Maximum call stack size exceeded"));
        }
        self.depth += 1;
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, host: &mut dyn Host) -> Result<Flow, Fault> {
        self.descend()?;
        let flow = self.exec_stmt(stmt, host);
        self.depth -= 1;
        flow
    }

    fn exec_stmt(&mut self, stmt: &Stmt, host: &mut dyn Host) -> Result<Flow, Fault> {
        self.checkpoint()?;
        match stmt {
            Stmt::Empty | Stmt::Function(_) => Ok(Flow::Normal),
            Stmt::Var { name, init } => {
                match init {
                    Some(expr) => {
                        let value = self.eval(expr, host)?;
                        self.declare(name, value);
                    }
                    None => {
                        let exists = match self.frames.last() {
                            Some(frame) => frame.contains_key(name),
                            None => self.globals.contains_key(name),
                        };
                        if !exists {
                            self.declare(name, Value::Undefined);
                        }
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr, host)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, host)?.is_truthy() {
                    self.exec(then, host)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise, host)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, host)?.is_truthy() {
                    match self.exec(body, host)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.exec(init, host)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !self.eval(cond, host)?.is_truthy() {
                            break;
                        }
                    }
                    match self.exec(body, host)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(step) = step {
                        self.eval(step, host)?;
                    }
                    // Loops with no statements in the body still yield here.
                    self.checkpoint()?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(body) => self.exec_body(body, host),
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, host)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, host)?;
                Err(Fault::Thrown(value.to_string()))
            }
        }
    }

    // -- Expressions ----------------------------------------------------

    fn eval(&mut self, expr: &Expr, host: &mut dyn Host) -> Result<Value, Fault> {
        self.descend()?;
        let value = self.eval_expr(expr, host);
        self.depth -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr, host: &mut dyn Host) -> Result<Value, Fault> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Ident(name) => self.lookup(name).cloned(),
            Expr::Array(items) => Ok(Value::Array(self.eval_list(items, host)?)),
            Expr::Object(fields) => {
                let mut map = BTreeMap::new();
                for (key, expr) in fields {
                    let value = self.eval(expr, host)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expr::Function(def) => Ok(Value::Function(def.clone())),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr, host)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.is_truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::TypeOf => Value::from(value.type_name()),
                })
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, host)?;
                let right = self.eval(right, host)?;
                Ok(binary(*op, left, right))
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, host)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.is_truthy(),
                    LogicalOp::Or => left.is_truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, host)
                }
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, host)?.is_truthy() {
                    self.eval(then, host)
                } else {
                    self.eval(otherwise, host)
                }
            }
            Expr::Assign { target, op, value } => {
                let place = self.place(target, host)?;
                let value = match op {
                    None => self.eval(value, host)?,
                    Some(op) => {
                        let current = self.read_place(&place)?;
                        let rhs = self.eval(value, host)?;
                        binary(*op, current, rhs)
                    }
                };
                self.write_place(&place, value.clone())?;
                Ok(value)
            }
            Expr::Update {
                target,
                delta,
                prefix,
            } => {
                let place = self.place(target, host)?;
                let old = self.read_place(&place)?.to_number();
                let new = old + delta;
                self.write_place(&place, Value::Number(new))?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Member { object, name } => {
                let object = self.eval(object, host)?;
                get_member(&object, name)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, host)?;
                let index = self.eval(index, host)?;
                get_index(&object, &index)
            }
            Expr::Call { callee, args } => {
                if let Expr::Member { object, name } = callee.as_ref() {
                    return self.call_member(object, name, args, host);
                }
                let callee = self.eval(callee, host)?;
                let args = self.eval_list(args, host)?;
                self.call(&callee, args, host)
            }
        }
    }

    fn eval_list(&mut self, exprs: &[Expr], host: &mut dyn Host) -> Result<Vec<Value>, Fault> {
        exprs.iter().map(|expr| self.eval(expr, host)).collect()
    }

    /// `object.name(args)`: host methods, the mutating array builtins,
    /// a few value builtins, then function-valued properties.
    fn call_member(
        &mut self,
        object: &Expr,
        name: &str,
        args: &[Expr],
        host: &mut dyn Host,
    ) -> Result<Value, Fault> {
        let (target, place) = if object.is_place() {
            let place = self.place(object, host)?;
            (self.read_place(&place)?, Some(place))
        } else {
            (self.eval(object, host)?, None)
        };
        let args = self.eval_list(args, host)?;

        match (target, name) {
            (Value::Handle(handle), _) => host.call_method(self, handle, name, args),
            (Value::Array(mut items), "push" | "pop") => {
                let result = if name == "push" {
                    items.extend(args);
                    Value::Number(items.len() as f64)
                } else {
                    items.pop().unwrap_or_default()
                };
                if let Some(place) = place {
                    self.write_place(&place, Value::Array(items))?;
                }
                Ok(result)
            }
            (Value::Array(items), "join") => {
                let separator = match args.first() {
                    Some(Value::Str(s)) => s.clone(),
                    _ => ",".to_string(),
                };
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| if item.is_nullish() { String::new() } else { item.to_string() })
                    .collect();
                Ok(Value::Str(parts.join(&separator)))
            }
            (Value::Number(n), "toFixed") => {
                let digits = args.first().map(Value::to_number).unwrap_or(0.0);
                let digits = if digits.is_finite() { digits.clamp(0.0, 20.0) as usize } else { 0 };
                Ok(Value::Str(format!("{n:.digits$}")))
            }
            (Value::Str(s), "toUpperCase") => Ok(Value::Str(s.to_uppercase())),
            (Value::Str(s), "toLowerCase") => Ok(Value::Str(s.to_lowercase())),
            (target, _) => {
                let method = get_member(&target, name)?;
                if method.is_callable() {
                    self.call(&method, args, host)
                } else {
                    Err(Fault::error(format!("{name} is not a function")))
                }
            }
        }
    }

    // -- Places ---------------------------------------------------------

    fn place(&mut self, expr: &Expr, host: &mut dyn Host) -> Result<Place, Fault> {
        match expr {
            Expr::Ident(name) => Ok(Place {
                root: name.clone(),
                path: Vec::new(),
            }),
            Expr::Member { object, name } => {
                let mut place = self.place(object, host)?;
                place.path.push(Segment::Key(name.clone()));
                Ok(place)
            }
            Expr::Index { object, index } => {
                let mut place = self.place(object, host)?;
                let index = self.eval(index, host)?;
                place.path.push(match index {
                    Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => Segment::Index(n as usize),
                    other => Segment::Key(other.to_string()),
                });
                Ok(place)
            }
            _ => Err(Fault::error("Invalid assignment target")),
        }
    }

    fn read_place(&self, place: &Place) -> Result<Value, Fault> {
        let mut value = self.lookup(&place.root)?.clone();
        for segment in &place.path {
            value = match segment {
                Segment::Key(key) => get_member(&value, key)?,
                Segment::Index(i) => get_index(&value, &Value::Number(*i as f64))?,
            };
        }
        Ok(value)
    }

    fn write_place(&mut self, place: &Place, value: Value) -> Result<(), Fault> {
        if place.path.is_empty() {
            self.assign(&place.root, value);
            return Ok(());
        }
        let mut slot = self.binding_mut(&place.root)?;
        for segment in &place.path {
            slot = match (slot, segment) {
                (Value::Object(map), Segment::Key(key)) => map.entry(key.clone()).or_default(),
                (Value::Object(map), Segment::Index(i)) => map.entry(i.to_string()).or_default(),
                (Value::Array(items), Segment::Index(i)) => {
                    if *i >= items.len() {
                        if *i >= MAX_ARRAY_LENGTH || *i - items.len() > MAX_ARRAY_GAP {
                            return Err(Fault::error("Invalid array length"));
                        }
                        items.resize(*i + 1, Value::Undefined);
                    }
                    &mut items[*i]
                }
                (other, segment) => {
                    return Err(Fault::error(format!(
                        "Cannot set property '{segment}' of {}",
                        other.type_name()
                    )))
                }
            };
        }
        *slot = value;
        Ok(())
    }
}

fn get_member(object: &Value, name: &str) -> Result<Value, Fault> {
    match object {
        Value::Undefined | Value::Null => Err(Fault::error(format!(
            "Cannot read property '{name}' of {object}"
        ))),
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or_default()),
        Value::Array(items) if name == "length" => Ok(Value::Number(items.len() as f64)),
        Value::Str(s) if name == "length" => Ok(Value::Number(s.chars().count() as f64)),
        _ => Ok(Value::Undefined),
    }
}

fn get_index(object: &Value, index: &Value) -> Result<Value, Fault> {
    match (object, index) {
        (Value::Array(items), Value::Number(n)) => Ok(if *n >= 0.0 && n.fract() == 0.0 {
            items.get(*n as usize).cloned().unwrap_or_default()
        } else {
            Value::Undefined
        }),
        (Value::Str(s), Value::Number(n)) => Ok(if *n >= 0.0 && n.fract() == 0.0 {
            s.chars()
                .nth(*n as usize)
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or_default()
        } else {
            Value::Undefined
        }),
        (object, index) => get_member(object, &index.to_string()),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Value {
    match op {
        BinaryOp::Add => match (&left, &right) {
            (Value::Str(_), _) | (_, Value::Str(_)) => Value::Str(format!("{left}{right}")),
            _ => Value::Number(left.to_number() + right.to_number()),
        },
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Mod => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            Value::Bool(match ordering {
                Some(ordering) => match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
                None => false,
            })
        }
        BinaryOp::Eq => Value::Bool(left.loose_equals(&right)),
        BinaryOp::Ne => Value::Bool(!left.loose_equals(&right)),
        BinaryOp::StrictEq => Value::Bool(left == right),
        BinaryOp::StrictNe => Value::Bool(left != right),
    }
}
