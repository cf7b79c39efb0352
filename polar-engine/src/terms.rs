use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use super::numerics::Numeric;
use super::error::RuntimeError;
use super::sources::{Location, SourceInfo};
use super::visitor::{walk_term, Visitor};

/// A name: variable, rule, class tag or field key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

/// Classes whose instances are engine values rather than host objects.
const BUILTIN_CLASSES: &[&str] = &[
    "Boolean",
    "Dictionary",
    "Float",
    "Integer",
    "List",
    "Number",
    "String",
];

/// `class` is the built-in class `tag` or one of its subclasses.
pub fn builtin_subclass(class: &str, tag: &str) -> bool {
    class == tag || (tag == "Number" && matches!(class, "Integer" | "Float"))
}

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(name.to_owned())
    }

    /// Engine-generated names and the anonymous `_` all start with an underscore.
    pub fn is_temporary_var(&self) -> bool {
        self.0.starts_with('_')
    }

    pub fn is_builtin_class(&self) -> bool {
        BUILTIN_CLASSES.contains(&self.0.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    // goals
    And,
    Or,
    Not,
    ForAll,
    Cut,
    Unify,
    Assign,
    Isa,
    In,
    Print,
    Debug,
    // comparison
    Eq,
    Neq,
    Gt,
    Geq,
    Lt,
    Leq,
    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rem,
    // field lookup or method call
    Dot,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
    pub operator: Operator,
    pub args: TermList,
}

/// A rule call, or a method call when it appears under a `Dot`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Call {
    pub name: Symbol,
    pub args: TermList,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dictionary {
    pub fields: BTreeMap<Symbol, Term>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<Symbol, Term>> for Dictionary {
    fn from(fields: BTreeMap<Symbol, Term>) -> Self {
        Self { fields }
    }
}

/// `Tag{field: value, ...}`: matches instances of `Tag` with those fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceLiteral {
    pub tag: Symbol,
    pub fields: Dictionary,
}

/// Right-hand side of `matches`, and the form every specializer takes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    Dictionary(Dictionary),
    Instance(InstanceLiteral),
}

impl From<InstanceLiteral> for Pattern {
    fn from(literal: InstanceLiteral) -> Self {
        Pattern::Instance(literal)
    }
}

impl From<Dictionary> for Pattern {
    fn from(dict: Dictionary) -> Self {
        Pattern::Dictionary(dict)
    }
}

impl From<BTreeMap<Symbol, Term>> for Pattern {
    fn from(fields: BTreeMap<Symbol, Term>) -> Self {
        Pattern::Dictionary(Dictionary { fields })
    }
}

/// Handle to an object the host owns. The engine only ever compares ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalInstance {
    pub instance_id: u64,
    #[serde(default)]
    pub constructor: Option<Term>,
    #[serde(default)]
    pub repr: Option<String>,
    /// Instance id of the object's class, when the host registered it. Lets `isa` against a
    /// class with a registered MRO be answered without a host round trip.
    #[serde(default)]
    pub class_id: Option<u64>,
}

pub type TermList = Vec<Term>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Number(Numeric),
    String(String),
    Boolean(bool),
    ExternalInstance(ExternalInstance),
    Dictionary(Dictionary),
    Pattern(Pattern),
    Call(Call),
    List(TermList),
    Variable(Symbol),
    Expression(Operation),
}

impl Value {
    fn expected<T>(&self, what: &str) -> Result<T, RuntimeError> {
        Err(RuntimeError::TypeError {
            msg: format!("Expected {}, got: {}", what, self),
            stack_trace: None,
        })
    }

    pub fn as_expression(&self) -> Result<&Operation, RuntimeError> {
        match self {
            Value::Expression(op) => Ok(op),
            other => other.expected("expression"),
        }
    }

    pub fn as_call(&self) -> Result<&Call, RuntimeError> {
        match self {
            Value::Call(call) => Ok(call),
            other => other.expected("call"),
        }
    }

    /// Most specific built-in class of the value. Host objects and non-values have none.
    pub fn builtin_class(&self) -> Option<&'static str> {
        Some(match self {
            Value::Number(Numeric::Integer(_)) => "Integer",
            Value::Number(Numeric::Float(_)) => "Float",
            Value::String(_) => "String",
            Value::Boolean(_) => "Boolean",
            Value::List(_) => "List",
            Value::Dictionary(_) => "Dictionary",
            _ => return None,
        })
    }

    /// True when the value can be compared structurally with no bindings and no host help.
    pub fn is_ground(&self) -> bool {
        match self {
            Value::Number(_) | Value::String(_) | Value::Boolean(_) => true,
            Value::List(items) => items.iter().all(Term::is_ground),
            Value::Dictionary(dict) => dict.fields.values().all(Term::is_ground),
            Value::Expression(op) => op.args.iter().all(Term::is_ground),
            Value::Variable(_)
            | Value::Call(_)
            | Value::Pattern(_)
            | Value::ExternalInstance(_) => false,
        }
    }
}

/// A value plus where it came from. Equality and hashing look only at the value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Term {
    #[serde(skip, default = "SourceInfo::ffi")]
    pub source_info: SourceInfo,
    value: Arc<Value>,
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state)
    }
}

#[derive(Default)]
struct FirstOccurrences {
    seen: HashSet<Symbol>,
    order: Vec<Symbol>,
}

impl Visitor for FirstOccurrences {
    fn visit_variable(&mut self, var: &Symbol) {
        if self.seen.insert(var.clone()) {
            self.order.push(var.clone());
        }
    }
}

struct Occurs<'v> {
    var: &'v Symbol,
    found: bool,
}

impl Visitor for Occurs<'_> {
    fn visit_term(&mut self, term: &Term) {
        if !self.found {
            walk_term(self, term);
        }
    }

    fn visit_variable(&mut self, var: &Symbol) {
        self.found |= var == self.var;
    }
}

impl Term {
    fn with_source(source_info: SourceInfo, value: Value) -> Self {
        Self {
            source_info,
            value: Arc::new(value),
        }
    }

    /// A term the engine introduced, such as a rewrite temporary.
    pub fn new_temporary(value: Value) -> Self {
        Self::with_source(SourceInfo::TemporaryVariable, value)
    }

    /// A term handed in by the host.
    pub fn new_from_ffi(value: Value) -> Self {
        Self::with_source(SourceInfo::Ffi, value)
    }

    pub fn new_from_policy(location: Arc<Location>, value: Value) -> Self {
        Self::with_source(SourceInfo::Policy { location }, value)
    }

    pub fn new_from_test(value: Value) -> Self {
        Self::with_source(SourceInfo::Test, value)
    }

    /// Same source info as `self`, different value.
    pub fn clone_with_value(&self, value: Value) -> Self {
        Self::with_source(self.source_info.clone(), value)
    }

    pub fn replace_value(&mut self, value: Value) {
        self.value = Arc::new(value);
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn location(&self) -> Option<&Location> {
        self.source_info.location()
    }

    pub fn is_ground(&self) -> bool {
        self.value.is_ground()
    }

    pub fn as_expression(&self) -> Result<&Operation, RuntimeError> {
        self.value.as_expression()
    }

    /// Each variable in the term once, in order of first appearance.
    pub fn ordered_variables(&self) -> Vec<Symbol> {
        let mut visitor = FirstOccurrences::default();
        walk_term(&mut visitor, self);
        visitor.order
    }

    pub fn contains_variable(&self, var: &Symbol) -> bool {
        let mut visitor = Occurs { var, found: false };
        walk_term(&mut visitor, self);
        visitor.found
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term::new_from_ffi(value)
    }
}

impl From<Symbol> for Term {
    fn from(var: Symbol) -> Self {
        Term::new_temporary(Value::Variable(var))
    }
}

impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Term::new_from_ffi(Value::Boolean(b))
    }
}

impl From<Operation> for Term {
    fn from(op: Operation) -> Self {
        Term::new_temporary(Value::Expression(op))
    }
}
