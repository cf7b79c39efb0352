//! Shorthand for building terms, parameters and rules, mostly in tests.
//!
//! `value!` takes anything implementing [`IntoValue`], and the other macros are built on it.
//! A `[a, b]` argument to `value!` or `term!` becomes a list of terms.

use std::collections::BTreeMap;

use crate::rules::Parameter;
use crate::terms::*;

pub trait IntoValue {
    fn into_value(self) -> Value;
}

macro_rules! into_value {
    ($($ty:ty => |$x:ident| $value:expr;)*) => {
        $(impl IntoValue for $ty {
            fn into_value(self) -> Value {
                let $x = self;
                $value
            }
        })*
    };
}

into_value! {
    Value => |value| value;
    i64 => |i| Value::Number(i.into());
    f64 => |f| Value::Number(f.into());
    bool => |b| Value::Boolean(b);
    &str => |s| Value::String(s.to_owned());
    String => |s| Value::String(s);
    Symbol => |name| Value::Variable(name);
    Term => |term| term.value().clone();
    TermList => |items| Value::List(items);
    Call => |call| Value::Call(call);
    Operation => |op| Value::Expression(op);
    Dictionary => |dict| Value::Dictionary(dict);
    BTreeMap<Symbol, Term> => |fields| Value::Dictionary(Dictionary { fields });
    Pattern => |pattern| Value::Pattern(pattern);
    InstanceLiteral => |literal| Value::Pattern(Pattern::Instance(literal));
    ExternalInstance => |instance| Value::ExternalInstance(instance);
}

impl<T: IntoValue + Clone> IntoValue for &T {
    fn into_value(self) -> Value {
        self.clone().into_value()
    }
}

#[doc(hidden)]
pub fn plain_param(value: Value) -> Parameter {
    Parameter {
        parameter: Term::new_from_test(value),
        specializer: None,
    }
}

/// A dictionary specializer becomes a dictionary pattern.
#[doc(hidden)]
pub fn specialized_param(name: Symbol, specializer: Term) -> Parameter {
    let pattern = match specializer.value() {
        Value::Dictionary(dict) => Value::Pattern(Pattern::Dictionary(dict.clone())),
        other => other.clone(),
    };
    Parameter {
        parameter: specializer.clone_with_value(Value::Variable(name)),
        specializer: Some(specializer.clone_with_value(pattern)),
    }
}

#[macro_export]
macro_rules! value {
    ([$($items:expr),*]) => {
        $crate::terms::Value::List(vec![$($crate::term!($items)),*])
    };
    ($v:expr) => {
        $crate::macros::IntoValue::into_value($v)
    };
}

#[macro_export]
macro_rules! term {
    ($($v:tt)*) => {
        $crate::terms::Term::new_from_test($crate::value!($($v)*))
    };
}

#[macro_export]
macro_rules! sym {
    ($name:expr) => {
        $crate::terms::Symbol::new(&$name)
    };
}

#[macro_export]
macro_rules! var {
    ($name:expr) => {
        $crate::term!($crate::sym!($name))
    };
}

#[macro_export]
macro_rules! call {
    ($name:expr $(, [$($args:expr),*])?) => {
        $crate::terms::Call {
            name: $crate::sym!($name),
            args: vec![$($($crate::term!($args)),*)?],
        }
    };
}

/// Operands must already be terms.
#[macro_export]
macro_rules! op {
    ($operator:ident $(, $args:expr)*) => {
        $crate::terms::Operation {
            operator: $crate::terms::Operator::$operator,
            args: vec![$($args),*],
        }
    };
}

#[macro_export]
macro_rules! dict {
    ($fields:expr) => {
        $crate::terms::Dictionary::from($fields)
    };
}

#[macro_export]
macro_rules! instance {
    ($tag:expr) => {
        $crate::instance!($tag, $crate::terms::Dictionary::new())
    };
    ($tag:expr, $fields:expr) => {
        $crate::terms::InstanceLiteral {
            tag: $crate::sym!($tag),
            fields: $crate::dict!($fields),
        }
    };
}

#[macro_export]
macro_rules! pattern {
    ($p:expr) => {
        $crate::terms::Value::Pattern($crate::terms::Pattern::from($p))
    };
}

#[macro_export]
macro_rules! param {
    ($v:expr) => {
        $crate::macros::plain_param($crate::value!($v))
    };
}

/// Rule parameters, in order. `name; specializer` declares a specialized variable and any
/// other argument is a plain parameter.
#[macro_export]
macro_rules! params {
    (@built [$($done:expr),*]) => {
        vec![$($done),*]
    };
    (@built [$($done:expr),*] $name:expr ; $spec:expr $(, $($rest:tt)*)?) => {
        $crate::params!(@built [$($done,)* $crate::macros::specialized_param(
            $crate::sym!($name),
            $crate::term!($spec),
        )] $($($rest)*)?)
    };
    (@built [$($done:expr),*] $arg:expr $(, $($rest:tt)*)?) => {
        $crate::params!(@built [$($done,)* $crate::param!($arg)] $($($rest)*)?)
    };
    ($($args:tt)*) => {
        $crate::params!(@built [] $($args)*)
    };
}

/// `rule!("name", [params] => goal, ...)`. The goals become the conjunction in the body.
#[macro_export]
macro_rules! rule {
    ($name:expr, [$($params:tt)*] $(=> $($goal:expr),+)?) => {
        $crate::rules::Rule::new_from_test(
            $crate::sym!($name),
            $crate::params!($($params)*),
            $crate::term!($crate::op!(And $($(, $crate::term!($goal))+)?)),
        )
    };
}
