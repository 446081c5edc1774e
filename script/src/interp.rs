//! Tree-walking interpreter with per-statement trace hooks.
//!
//! Execution threads a [`Host`] through every operation; the host's hooks
//! fire before each statement, after each call-frame push and before each
//! pop, and once at the raise point of a runtime error. A [`TraceContext`]
//! handed to each hook exposes the frame stack for inspection, variable
//! injection, expression evaluation in any live frame, and moving the
//! instruction pointer — everything a debugger needs, with nothing about
//! debugging in here.

use std::collections::HashMap;
use std::path::Path;

use crate::ast::{BinaryOp, CompiledBlock, CompiledExpr, Expr, Stmt, UnaryOp};
use crate::error::{Interrupt, RuntimeError, ScriptError, TracebackEntry};
use crate::host::{CollectingHost, ForkContext, Host};
use crate::parser;
use crate::value::{Numeric, Value};
use crate::Program;

/// Filename the bundled prelude compiles under. Frames from here are
/// library code a debugger normally skips.
pub const PRELUDE_FILENAME: &str = "<prelude>";

/// Call depth at which a runaway recursion is stopped.
pub const DEFAULT_DEPTH_LIMIT: usize = 200;

const MODULE_FRAME_NAME: &str = "<module>";

/// Largest `range()` the interpreter will materialize.
const RANGE_LIMIT: i64 = 1_000_000;

const PRELUDE_SOURCE: &str = "\
def abs(x)
    if x < 0
        return -x
    end
    return x
end

def max(a, b)
    if a > b
        return a
    end
    return b
end

def min(a, b)
    if a < b
        return a
    end
    return b
end

def sum(items)
    total = 0
    i = 0
    while i < len(items)
        total = total + items[i]
        i = i + 1
    end
    return total
end
";

const PRELUDE_NAMES: [&str; 4] = ["abs", "max", "min", "sum"];

/// Names a user definition may shadow, worth a startup warning.
pub fn reserved_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Builtin::ALL.iter().map(|b| b.name()).collect();
    names.extend(PRELUDE_NAMES);
    names
}

/// One entry of the call stack.
#[derive(Debug)]
pub struct Frame {
    pub function: String,
    pub filename: String,
    /// Line of the statement currently executing (or about to).
    pub line: u32,
    pub locals: HashMap<String, Value>,
    pending_jump: Option<u32>,
}

impl Frame {
    pub fn new(function: &str, filename: &str, line: u32, locals: HashMap<String, Value>) -> Self {
        Self {
            function: function.to_owned(),
            filename: filename.to_owned(),
            line,
            locals,
            pending_jump: None,
        }
    }
}

/// Built-in functions, pre-bound in the global scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Input,
    Len,
    Str,
    Int,
    Range,
    Sleep,
    Fork,
    Run,
    Exit,
}

impl Builtin {
    pub const ALL: [Builtin; 10] = [
        Builtin::Print,
        Builtin::Input,
        Builtin::Len,
        Builtin::Str,
        Builtin::Int,
        Builtin::Range,
        Builtin::Sleep,
        Builtin::Fork,
        Builtin::Run,
        Builtin::Exit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Input => "input",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Range => "range",
            Builtin::Sleep => "sleep",
            Builtin::Fork => "fork",
            Builtin::Run => "run",
            Builtin::Exit => "exit",
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
}

struct Env<'a> {
    frames: &'a mut Vec<Frame>,
    host: &'a mut dyn Host,
    depth_limit: usize,
    /// Index of the frame whose locals are in scope.
    active: usize,
    /// Scope frame this run was entered with; tracebacks report the chain
    /// through it, not through frames that happen to sit above it.
    root_active: usize,
    /// Frame count at entry; frames above this were pushed by this run.
    base: usize,
}

pub struct Interpreter {
    frames: Vec<Frame>,
    depth_limit: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let mut globals = HashMap::new();
        for builtin in Builtin::ALL {
            globals.insert(builtin.name().to_owned(), Value::Builtin(builtin));
        }
        Self {
            frames: vec![Frame::new(MODULE_FRAME_NAME, "", 0, globals)],
            depth_limit: DEFAULT_DEPTH_LIMIT,
        }
    }

    /// Raise the call depth ceiling. A debugging embedder adds headroom so
    /// its own bookkeeping never turns a passing program into one that
    /// trips the limit.
    pub fn set_depth_limit(&mut self, limit: usize) {
        self.depth_limit = limit;
    }

    /// Bind a name in the global scope before (or during) a run.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.frames[0].locals.insert(name.to_owned(), value);
    }

    /// Compile and bind the prelude definitions into the global scope.
    pub fn load_prelude(&mut self) -> Result<(), ScriptError> {
        let program = parser::parse_program(PRELUDE_SOURCE, PRELUDE_FILENAME)?;
        let mut host = CollectingHost::default();
        let mut env = Env {
            frames: &mut self.frames,
            host: &mut host,
            depth_limit: self.depth_limit,
            active: 0,
            root_active: 0,
            base: 1,
        };
        exec_block(&mut env, &program.body)?;
        Ok(())
    }

    /// Run a program to completion under the given host.
    pub fn run(&mut self, program: &Program, host: &mut dyn Host) -> Result<(), ScriptError> {
        self.frames[0].filename = program.filename.clone();
        let mut env = Env {
            frames: &mut self.frames,
            host,
            depth_limit: self.depth_limit,
            active: 0,
            root_active: 0,
            base: 1,
        };
        match exec_block(&mut env, &program.body)? {
            Flow::Normal => Ok(()),
            Flow::Return(_) => {
                let line = env.frames[0].line;
                Err(runtime_error(&mut env, line, "return outside of function"))
            }
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

/// Read a file, compile it and run it standalone, returning the process
/// exit code. Errors print to stderr the way an undebugged run shows them.
pub fn run_file(path: &Path) -> i64 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {}: {e}", path.display());
            return 1;
        }
    };
    let filename = path.display().to_string();
    let program = match parser::parse_program(&source, &filename) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let mut interp = Interpreter::new();
    let mut host = crate::host::DefaultHost;
    if let Err(e) = interp.load_prelude() {
        eprintln!("{e}");
        return 1;
    }
    match interp.run(&program, &mut host) {
        Ok(()) => 0,
        Err(ScriptError::Interrupt(Interrupt::Exit(code))) => code,
        Err(ScriptError::Interrupt(Interrupt::Quit)) => 1,
        Err(ScriptError::Runtime(e)) => {
            eprintln!("{}", e.render());
            1
        }
        Err(ScriptError::Syntax(e)) => {
            eprintln!("{e}");
            1
        }
    }
}

/// Frame-stack access handed to trace hooks.
///
/// Frame numbers throughout are protocol-style: 0 is the innermost frame.
pub struct TraceContext<'a> {
    frames: &'a mut Vec<Frame>,
    active: usize,
    depth_limit: usize,
}

impl<'a> TraceContext<'a> {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        self.frames
    }

    /// The frame execution is currently in.
    pub fn current(&self) -> &Frame {
        &self.frames[self.active]
    }

    pub fn frame_by_number(&self, number: usize) -> Option<&Frame> {
        let index = self.index_of(number)?;
        self.frames.get(index)
    }

    /// Whether the numbered frame is the module frame, where locals and
    /// globals are the same namespace.
    pub fn is_module_frame(&self, number: usize) -> bool {
        self.index_of(number) == Some(0)
    }

    fn index_of(&self, number: usize) -> Option<usize> {
        self.frames.len().checked_sub(1 + number)
    }

    /// Inject a variable into the numbered frame. Returns false when the
    /// frame does not exist.
    pub fn set_variable(&mut self, number: usize, name: &str, value: Value) -> bool {
        let Some(index) = self.index_of(number) else {
            return false;
        };
        self.frames[index].locals.insert(name.to_owned(), value);
        true
    }

    /// Request that execution resume at `line` instead of the statement it
    /// halted at. Applies within the innermost frame's current block; a
    /// target outside it is logged and ignored at resume time.
    pub fn jump_to_line(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pending_jump = Some(line);
        }
    }

    /// Evaluate a compiled expression in the numbered frame's scope.
    ///
    /// Runs silently: no hooks fire, output is discarded, and interactive
    /// or process-level operations fail. A condition can therefore never
    /// re-enter the debugger.
    pub fn eval_in_frame(
        &mut self,
        compiled: &CompiledExpr,
        number: usize,
    ) -> Result<Value, ScriptError> {
        let index = self.index_of(number).ok_or_else(|| no_such_frame(number))?;
        let mut host = CollectingHost::default();
        let base = self.frames.len();
        let mut env = Env {
            frames: &mut *self.frames,
            host: &mut host,
            depth_limit: self.depth_limit,
            active: index,
            root_active: index,
            base,
        };
        eval_expr(&mut env, &compiled.expr)
    }

    /// Execute a compiled statement block in the numbered frame's scope,
    /// collecting everything it prints.
    ///
    /// The collected output is returned even when execution fails, so a
    /// partial print still reaches the user.
    pub fn run_in_frame(
        &mut self,
        compiled: &CompiledBlock,
        number: usize,
    ) -> (String, Result<(), ScriptError>) {
        let Some(index) = self.index_of(number) else {
            return (String::new(), Err(no_such_frame(number)));
        };
        let mut host = CollectingHost::default();
        let base = self.frames.len();
        let result = {
            let mut env = Env {
                frames: &mut *self.frames,
                host: &mut host,
                depth_limit: self.depth_limit,
                active: index,
                root_active: index,
                base,
            };
            match exec_block(&mut env, &compiled.body) {
                Ok(Flow::Normal) => Ok(()),
                Ok(Flow::Return(_)) => {
                    let line = env.frames[env.active].line;
                    Err(runtime_error(&mut env, line, "return outside of function"))
                }
                Err(e) => Err(e),
            }
        };
        (host.output, result)
    }
}

fn no_such_frame(number: usize) -> ScriptError {
    ScriptError::Runtime(RuntimeError {
        message: format!("no stack frame {number}"),
        line: 0,
        traceback: Vec::new(),
    })
}

fn capture_traceback(frames: &[Frame], root_active: usize, base: usize) -> Vec<TracebackEntry> {
    frames[..=root_active.min(frames.len() - 1)]
        .iter()
        .chain(frames[base.min(frames.len())..].iter())
        .map(|frame| TracebackEntry {
            filename: frame.filename.clone(),
            line: frame.line,
            function: frame.function.clone(),
        })
        .collect()
}

/// Build a runtime error and report it through the exception hook before it
/// unwinds. The hook may convert it into an interrupt (a debugger asking to
/// stop right there).
fn runtime_error(env: &mut Env, line: u32, message: impl Into<String>) -> ScriptError {
    let error = RuntimeError {
        message: message.into(),
        line,
        traceback: capture_traceback(env.frames, env.root_active, env.base),
    };
    let mut ctx = TraceContext {
        frames: &mut *env.frames,
        active: env.active,
        depth_limit: env.depth_limit,
    };
    match env.host.on_exception(&mut ctx, &error) {
        Ok(()) => ScriptError::Runtime(error),
        Err(interrupt) => ScriptError::Interrupt(interrupt),
    }
}

fn fire_line(env: &mut Env) -> Result<(), ScriptError> {
    let mut ctx = TraceContext {
        frames: &mut *env.frames,
        active: env.active,
        depth_limit: env.depth_limit,
    };
    env.host.on_line(&mut ctx).map_err(ScriptError::from)
}

fn fire_call(env: &mut Env) -> Result<(), ScriptError> {
    let mut ctx = TraceContext {
        frames: &mut *env.frames,
        active: env.active,
        depth_limit: env.depth_limit,
    };
    env.host.on_call(&mut ctx).map_err(ScriptError::from)
}

fn fire_return(env: &mut Env) -> Result<(), ScriptError> {
    let mut ctx = TraceContext {
        frames: &mut *env.frames,
        active: env.active,
        depth_limit: env.depth_limit,
    };
    env.host.on_return(&mut ctx).map_err(ScriptError::from)
}

/// A jump can only be honored at a statement boundary of a plain block;
/// anywhere else the request is dropped with a warning.
fn clear_stray_jump(env: &mut Env) {
    if let Some(target) = env.frames[env.active].pending_jump.take() {
        tracing::warn!(target, "jump target not applicable here, ignoring");
    }
}

fn exec_block(env: &mut Env, stmts: &[Stmt]) -> Result<Flow, ScriptError> {
    let mut i = 0;
    while i < stmts.len() {
        let stmt = &stmts[i];
        env.frames[env.active].line = stmt.line();
        fire_line(env)?;
        if let Some(target) = env.frames[env.active].pending_jump.take() {
            match stmts.iter().position(|s| s.line() == target) {
                Some(j) => {
                    i = j;
                    continue;
                }
                None => {
                    tracing::warn!(target, "jump target not in the current block, ignoring");
                }
            }
        }
        match exec_stmt(env, stmt)? {
            Flow::Normal => i += 1,
            Flow::Return(value) => return Ok(Flow::Return(value)),
        }
    }
    Ok(Flow::Normal)
}

fn exec_stmt(env: &mut Env, stmt: &Stmt) -> Result<Flow, ScriptError> {
    match stmt {
        Stmt::Assign { name, value, .. } => {
            let value = eval_expr(env, value)?;
            env.frames[env.active].locals.insert(name.clone(), value);
            Ok(Flow::Normal)
        }
        Stmt::AssignIndex {
            line,
            target,
            index,
            value,
        } => {
            let container = eval_expr(env, target)?;
            let index = eval_expr(env, index)?;
            let value = eval_expr(env, value)?;
            assign_index(env, *line, container, index, value)?;
            Ok(Flow::Normal)
        }
        Stmt::Expr { expr, .. } => {
            eval_expr(env, expr)?;
            Ok(Flow::Normal)
        }
        Stmt::If {
            condition,
            then_body,
            else_body,
            ..
        } => {
            if eval_expr(env, condition)?.is_truthy() {
                exec_block(env, then_body)
            } else {
                exec_block(env, else_body)
            }
        }
        Stmt::While {
            line,
            condition,
            body,
        } => {
            let mut first = true;
            loop {
                if !first {
                    // Each loop-around is a fresh visit of the header line.
                    env.frames[env.active].line = *line;
                    fire_line(env)?;
                    clear_stray_jump(env);
                }
                first = false;
                if !eval_expr(env, condition)?.is_truthy() {
                    return Ok(Flow::Normal);
                }
                if let Flow::Return(value) = exec_block(env, body)? {
                    return Ok(Flow::Return(value));
                }
            }
        }
        Stmt::Def { func, .. } => {
            env.frames[env.active]
                .locals
                .insert(func.name.clone(), Value::Function(func.clone()));
            Ok(Flow::Normal)
        }
        Stmt::Return { value, .. } => {
            let value = match value {
                Some(expr) => eval_expr(env, expr)?,
                None => Value::None,
            };
            Ok(Flow::Return(value))
        }
        Stmt::Raise { line, value } => {
            let value = eval_expr(env, value)?;
            Err(runtime_error(env, *line, value.to_display()))
        }
        Stmt::Pass { .. } => Ok(Flow::Normal),
    }
}

fn assign_index(
    env: &mut Env,
    line: u32,
    container: Value,
    index: Value,
    value: Value,
) -> Result<(), ScriptError> {
    match (&container, &index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let Some(slot) = resolve_index(*i, len) else {
                return Err(runtime_error(env, line, "list index out of range"));
            };
            items[slot] = value;
            Ok(())
        }
        (Value::Map(entries), Value::Str(key)) => {
            entries.borrow_mut().insert(key.clone(), value);
            Ok(())
        }
        _ => Err(runtime_error(
            env,
            line,
            format!(
                "cannot assign into {} with {} index",
                container.type_name(),
                index.type_name()
            ),
        )),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

fn current_line(env: &Env) -> u32 {
    env.frames[env.active].line
}

fn eval_expr(env: &mut Env, expr: &Expr) -> Result<Value, ScriptError> {
    match expr {
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::Float(v) => Ok(Value::Float(*v)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::None => Ok(Value::None),
        Expr::Name(name) => {
            if let Some(value) = env.frames[env.active].locals.get(name) {
                return Ok(value.clone());
            }
            if env.active != 0 {
                if let Some(value) = env.frames[0].locals.get(name) {
                    return Ok(value.clone());
                }
            }
            let line = current_line(env);
            Err(runtime_error(
                env,
                line,
                format!("name {name:?} is not defined"),
            ))
        }
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(env, item)?);
            }
            Ok(Value::list(values))
        }
        Expr::Map(pairs) => {
            let mut entries = std::collections::BTreeMap::new();
            for (key, value) in pairs {
                let key = match eval_expr(env, key)? {
                    Value::Str(s) => s,
                    other => {
                        let line = current_line(env);
                        return Err(runtime_error(
                            env,
                            line,
                            format!("map keys must be strings, not {}", other.type_name()),
                        ));
                    }
                };
                let value = eval_expr(env, value)?;
                entries.insert(key, value);
            }
            Ok(Value::map(entries))
        }
        Expr::Unary { op, operand } => {
            let value = eval_expr(env, operand)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => match value.as_number() {
                    Some(Numeric::Int(v)) => Ok(Value::Int(-v)),
                    Some(Numeric::Float(v)) => Ok(Value::Float(-v)),
                    None => {
                        let line = current_line(env);
                        Err(runtime_error(
                            env,
                            line,
                            format!("bad operand type for unary -: {}", value.type_name()),
                        ))
                    }
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(env, *op, left, right),
        Expr::Index { target, index } => {
            let container = eval_expr(env, target)?;
            let index = eval_expr(env, index)?;
            eval_index(env, container, index)
        }
        Expr::Call { target, args, line } => {
            let callee = eval_expr(env, target)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(env, arg)?);
            }
            call_value(env, callee, values, *line)
        }
    }
}

fn eval_binary(env: &mut Env, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, ScriptError> {
    // Short-circuit forms yield the deciding operand, not a bool.
    if op == BinaryOp::And {
        let l = eval_expr(env, left)?;
        if !l.is_truthy() {
            return Ok(l);
        }
        return eval_expr(env, right);
    }
    if op == BinaryOp::Or {
        let l = eval_expr(env, left)?;
        if l.is_truthy() {
            return Ok(l);
        }
        return eval_expr(env, right);
    }

    let l = eval_expr(env, left)?;
    let r = eval_expr(env, right)?;
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(l == r)),
        BinaryOp::NotEq => return Ok(Value::Bool(l != r)),
        _ => {}
    }

    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        return numeric_binary(env, op, a, b);
    }

    match (op, &l, &r) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut s = a.clone();
            s.push_str(b);
            Ok(Value::Str(s))
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinaryOp::Lt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a < b)),
        (BinaryOp::LtEq, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a <= b)),
        (BinaryOp::Gt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a > b)),
        (BinaryOp::GtEq, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a >= b)),
        _ => {
            let line = current_line(env);
            Err(runtime_error(
                env,
                line,
                format!(
                    "unsupported operand types for {}: {} and {}",
                    op_symbol(op),
                    l.type_name(),
                    r.type_name()
                ),
            ))
        }
    }
}

fn numeric_binary(env: &mut Env, op: BinaryOp, a: Numeric, b: Numeric) -> Result<Value, ScriptError> {
    use Numeric::{Float, Int};

    let err = |env: &mut Env, message: &str| {
        let line = current_line(env);
        Err(runtime_error(env, line, message))
    };

    match (op, a, b) {
        (BinaryOp::Add, Int(a), Int(b)) => match a.checked_add(b) {
            Some(v) => Ok(Value::Int(v)),
            None => err(env, "integer overflow"),
        },
        (BinaryOp::Sub, Int(a), Int(b)) => match a.checked_sub(b) {
            Some(v) => Ok(Value::Int(v)),
            None => err(env, "integer overflow"),
        },
        (BinaryOp::Mul, Int(a), Int(b)) => match a.checked_mul(b) {
            Some(v) => Ok(Value::Int(v)),
            None => err(env, "integer overflow"),
        },
        (BinaryOp::Div, Int(a), Int(b)) => match a.checked_div(b) {
            Some(v) => Ok(Value::Int(v)),
            None => err(env, "division by zero"),
        },
        (BinaryOp::Mod, Int(a), Int(b)) => match a.checked_rem(b) {
            Some(v) => Ok(Value::Int(v)),
            None => err(env, "division by zero"),
        },
        (op, a, b) => {
            let a = match a {
                Int(v) => v as f64,
                Float(v) => v,
            };
            let b = match b {
                Int(v) => v as f64,
                Float(v) => v,
            };
            match op {
                BinaryOp::Add => Ok(Value::Float(a + b)),
                BinaryOp::Sub => Ok(Value::Float(a - b)),
                BinaryOp::Mul => Ok(Value::Float(a * b)),
                BinaryOp::Div => {
                    if b == 0.0 {
                        err(env, "division by zero")
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        err(env, "division by zero")
                    } else {
                        Ok(Value::Float(a % b))
                    }
                }
                BinaryOp::Lt => Ok(Value::Bool(a < b)),
                BinaryOp::LtEq => Ok(Value::Bool(a <= b)),
                BinaryOp::Gt => Ok(Value::Bool(a > b)),
                BinaryOp::GtEq => Ok(Value::Bool(a >= b)),
                BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::And | BinaryOp::Or => {
                    unreachable!("handled before numeric dispatch")
                }
            }
        }
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
    }
}

fn eval_index(env: &mut Env, container: Value, index: Value) -> Result<Value, ScriptError> {
    match (&container, &index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            match resolve_index(*i, items.len()) {
                Some(slot) => Ok(items[slot].clone()),
                None => {
                    drop(items);
                    let line = current_line(env);
                    Err(runtime_error(env, line, "list index out of range"))
                }
            }
        }
        (Value::Map(entries), Value::Str(key)) => {
            let entries = entries.borrow();
            match entries.get(key) {
                Some(value) => Ok(value.clone()),
                None => {
                    let message = format!("key {key:?} not found");
                    drop(entries);
                    let line = current_line(env);
                    Err(runtime_error(env, line, message))
                }
            }
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            match resolve_index(*i, chars.len()) {
                Some(slot) => Ok(Value::Str(chars[slot].to_string())),
                None => {
                    let line = current_line(env);
                    Err(runtime_error(env, line, "string index out of range"))
                }
            }
        }
        _ => {
            let line = current_line(env);
            Err(runtime_error(
                env,
                line,
                format!(
                    "cannot index {} with {}",
                    container.type_name(),
                    index.type_name()
                ),
            ))
        }
    }
}

fn call_value(
    env: &mut Env,
    callee: Value,
    args: Vec<Value>,
    line: u32,
) -> Result<Value, ScriptError> {
    match callee {
        Value::Function(func) => {
            if env.frames.len() >= env.depth_limit {
                return Err(runtime_error(env, line, "maximum call depth exceeded"));
            }
            if args.len() != func.params.len() {
                return Err(runtime_error(
                    env,
                    line,
                    format!(
                        "{}() expects {} arguments, got {}",
                        func.name,
                        func.params.len(),
                        args.len()
                    ),
                ));
            }
            let locals: HashMap<String, Value> =
                func.params.iter().cloned().zip(args).collect();
            env.frames
                .push(Frame::new(&func.name, &func.filename, func.line, locals));
            let saved_active = env.active;
            env.active = env.frames.len() - 1;

            let result: Result<Flow, ScriptError> = (|| {
                fire_call(env)?;
                let flow = exec_block(env, &func.body)?;
                fire_return(env)?;
                Ok(flow)
            })();

            env.frames.pop();
            env.active = saved_active;

            match result? {
                Flow::Return(value) => Ok(value),
                Flow::Normal => Ok(Value::None),
            }
        }
        Value::Builtin(builtin) => call_builtin(env, builtin, args, line),
        other => Err(runtime_error(
            env,
            line,
            format!("{} is not callable", other.type_name()),
        )),
    }
}

fn call_builtin(
    env: &mut Env,
    builtin: Builtin,
    args: Vec<Value>,
    line: u32,
) -> Result<Value, ScriptError> {
    match builtin {
        Builtin::Print => {
            let rendered: Vec<String> = args.iter().map(Value::to_display).collect();
            let mut text = rendered.join(" ");
            text.push('\n');
            env.host.stdout(&text);
            Ok(Value::None)
        }
        Builtin::Input => {
            let prompt = match args.first() {
                Some(value) => value.to_display(),
                None => String::new(),
            };
            match env.host.input(&prompt) {
                Ok(text) => Ok(Value::Str(text)),
                Err(e) => Err(runtime_error(env, line, e.0)),
            }
        }
        Builtin::Len => {
            let [value] = take_args::<1>(env, "len", args, line)?;
            match &value {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.borrow().len() as i64)),
                Value::Map(entries) => Ok(Value::Int(entries.borrow().len() as i64)),
                other => Err(runtime_error(
                    env,
                    line,
                    format!("{} has no length", other.type_name()),
                )),
            }
        }
        Builtin::Str => {
            let [value] = take_args::<1>(env, "str", args, line)?;
            Ok(Value::Str(value.to_display()))
        }
        Builtin::Int => {
            let [value] = take_args::<1>(env, "int", args, line)?;
            match &value {
                Value::Int(v) => Ok(Value::Int(*v)),
                Value::Float(v) => Ok(Value::Int(*v as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(s) => match s.trim().parse::<i64>() {
                    Ok(v) => Ok(Value::Int(v)),
                    Err(_) => Err(runtime_error(
                        env,
                        line,
                        format!("could not convert {s:?} to int"),
                    )),
                },
                other => Err(runtime_error(
                    env,
                    line,
                    format!("cannot convert {} to int", other.type_name()),
                )),
            }
        }
        Builtin::Range => {
            let [value] = take_args::<1>(env, "range", args, line)?;
            let Value::Int(n) = value else {
                return Err(runtime_error(env, line, "range() expects an int"));
            };
            if n > RANGE_LIMIT {
                return Err(runtime_error(
                    env,
                    line,
                    format!("range() limit is {RANGE_LIMIT}"),
                ));
            }
            Ok(Value::list((0..n.max(0)).map(Value::Int).collect()))
        }
        Builtin::Sleep => {
            let [value] = take_args::<1>(env, "sleep", args, line)?;
            let millis = match value {
                Value::Int(v) => v.max(0) as u64,
                Value::Float(v) => v.max(0.0) as u64,
                _ => return Err(runtime_error(env, line, "sleep() expects milliseconds")),
            };
            env.host.sleep(millis);
            Ok(Value::None)
        }
        Builtin::Fork => {
            if !args.is_empty() {
                return Err(runtime_error(env, line, "fork() takes no arguments"));
            }
            match env.host.fork(ForkContext::User) {
                Ok(pid) => Ok(Value::Int(pid)),
                Err(e) => Err(runtime_error(env, line, e.0)),
            }
        }
        Builtin::Run => {
            let [value] = take_args::<1>(env, "run", args, line)?;
            let Value::Str(path) = value else {
                return Err(runtime_error(env, line, "run() expects a file path"));
            };
            let pid = match env.host.fork(ForkContext::Internal) {
                Ok(pid) => pid,
                Err(e) => return Err(runtime_error(env, line, e.0)),
            };
            if pid == 0 {
                // Child: becomes the other program, never returns into this
                // script's continuation.
                let code = run_file(Path::new(&path));
                std::process::exit(code as i32);
            }
            match env.host.wait_child(pid) {
                Ok(status) => Ok(Value::Int(status)),
                Err(e) => Err(runtime_error(env, line, e.0)),
            }
        }
        Builtin::Exit => {
            let code = match args.first() {
                Some(Value::Int(v)) => *v,
                None => 0,
                Some(other) => {
                    return Err(runtime_error(
                        env,
                        line,
                        format!("exit() expects an int, got {}", other.type_name()),
                    ))
                }
            };
            Err(ScriptError::Interrupt(Interrupt::Exit(code)))
        }
    }
}

fn take_args<const N: usize>(
    env: &mut Env,
    name: &str,
    args: Vec<Value>,
    line: u32,
) -> Result<[Value; N], ScriptError> {
    match <[Value; N]>::try_from(args) {
        Ok(args) => Ok(args),
        Err(args) => Err(runtime_error(
            env,
            line,
            format!("{name}() expects {N} arguments, got {}", args.len()),
        )),
    }
}
