//! Runtime values.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ast::FunctionDef;
use crate::interp::Builtin;

/// How many elements a container may have before its rendering collapses to
/// a length shortcut, so huge values never cross the wire in full.
const RENDER_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    /// String-keyed, ordered by key.
    Map(Rc<RefCell<BTreeMap<String, Value>>>),
    Function(Rc<FunctionDef>),
    Builtin(Builtin),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Map(entries) => !entries.borrow().is_empty(),
            Value::Function(_) | Value::Builtin(_) => true,
        }
    }

    /// Whether the value has children worth expanding one level.
    pub fn has_children(&self) -> bool {
        match self {
            Value::List(items) => !items.borrow().is_empty(),
            Value::Map(entries) => !entries.borrow().is_empty(),
            _ => false,
        }
    }

    /// Display rendering for variable views and error messages.
    ///
    /// Large containers render as a length shortcut; nested containers
    /// always render as shortcuts.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "none".to_owned(),
            Value::Bool(true) => "true".to_owned(),
            Value::Bool(false) => "false".to_owned(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format!("{v:?}"),
            Value::Str(s) => format!("{s:?}"),
            Value::List(items) => {
                let items = items.borrow();
                if items.len() > RENDER_LIMIT {
                    return format!("<list of {} items>", items.len());
                }
                let rendered: Vec<String> = items.iter().map(Value::short_repr).collect();
                format!("[{}]", rendered.join(", "))
            }
            Value::Map(entries) => {
                let entries = entries.borrow();
                if entries.len() > RENDER_LIMIT {
                    return format!("<map of {} entries>", entries.len());
                }
                let rendered: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{k:?}: {}", v.short_repr()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Value::Function(func) => format!("<function {}>", func.name),
            Value::Builtin(builtin) => format!("<builtin {}>", builtin.name()),
        }
    }

    fn short_repr(&self) -> String {
        match self {
            Value::List(items) => format!("<list of {} items>", items.borrow().len()),
            Value::Map(entries) => format!("<map of {} entries>", entries.borrow().len()),
            other => other.repr(),
        }
    }

    /// Plain-text conversion, as `str()` and `print` use: strings unquoted,
    /// everything else as `repr`.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Numeric view for arithmetic, when the value is a number.
    pub(crate) fn as_number(&self) -> Option<Numeric> {
        match self {
            Value::Int(v) => Some(Numeric::Int(*v)),
            Value::Float(v) => Some(Numeric::Float(*v)),
            _ => None,
        }
    }
}

pub(crate) enum Numeric {
    Int(i64),
    Float(f64),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            // Numbers compare across int/float, as users expect.
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}
