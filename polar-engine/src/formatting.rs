//! `Display` for terms and rules.
//!
//! Errors, warnings and VM log lines show terms in policy syntax. Operands are parenthesized
//! only where operator precedence would otherwise change how the text reads.

use std::fmt::{self, Display, Formatter};

use super::numerics::Numeric;
use super::rules::{Parameter, Rule};
use super::terms::*;

impl Operator {
    pub fn symbol(self) -> &'static str {
        use Operator::*;
        match self {
            And => "and",
            Or => "or",
            Not => "not",
            ForAll => "forall",
            Cut => "cut",
            Unify => "=",
            Assign => ":=",
            Eq => "==",
            Neq => "!=",
            Gt => ">",
            Geq => ">=",
            Lt => "<",
            Leq => "<=",
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "mod",
            Rem => "rem",
            Dot => ".",
            In => "in",
            Isa => "matches",
            Print => "print",
            Debug => "debug",
        }
    }

    /// Higher binds tighter.
    fn binding_power(self) -> u8 {
        use Operator::*;
        match self {
            Or => 1,
            And => 2,
            Not => 3,
            Unify | Assign => 4,
            Eq | Neq | Gt | Geq | Lt | Leq => 5,
            Add | Sub => 6,
            Mul | Div | Mod | Rem => 7,
            In | Isa => 8,
            Dot => 9,
            Cut | ForAll => 10,
            Print | Debug => 11,
        }
    }
}

/// A term printed as an operand of `parent`.
struct Operand<'t>(Operator, &'t Term);

impl Display for Operand<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Operand(parent, term) = *self;
        match term.value() {
            Value::Expression(op) if op.operator.binding_power() < parent.binding_power() => {
                write!(f, "({})", term)
            }
            _ => write!(f, "{}", term),
        }
    }
}

fn write_separated<T: Display>(
    f: &mut Formatter<'_>,
    items: impl IntoIterator<Item = T>,
    separator: &str,
) -> fmt::Result {
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// List elements and call arguments only need parentheses around disjunctions.
fn write_elements(f: &mut Formatter<'_>, terms: &[Term]) -> fmt::Result {
    write_separated(f, terms.iter().map(|t| Operand(Operator::And, t)), ", ")
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for Numeric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::Integer(i) => write!(f, "{}", i),
            Numeric::Float(x) => write!(f, "{}", x),
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Display for Dictionary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let fields = self.fields.iter().map(|(k, v)| format!("{}: {}", k, v));
        write_separated(f, fields, ", ")?;
        f.write_str("}")
    }
}

impl Display for InstanceLiteral {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tag, self.fields)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Dictionary(dict) => dict.fmt(f),
            Pattern::Instance(literal) => literal.fmt(f),
        }
    }
}

impl Display for ExternalInstance {
    /// Hosts substitute their own representation for the `^{id: N}` form.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Some(repr) => f.write_str(repr),
            None => write!(f, "^{{id: {}}}", self.instance_id),
        }
    }
}

impl Display for Call {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        write_elements(f, &self.args)?;
        f.write_str(")")
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Operator::*;
        let op = self.operator;
        let operand = |i: usize| Operand(op, &self.args[i]);
        match (op, self.args.len()) {
            (Cut, _) => f.write_str("cut"),
            (And, 0) => f.write_str("(true)"),
            (Or, 0) => f.write_str("(false)"),
            (And, _) | (Or, _) => {
                let separator = format!(" {} ", op);
                write_separated(f, self.args.iter().map(|t| Operand(op, t)), &separator)
            }
            (Not, 1) => write!(f, "not {}", operand(0)),
            (ForAll, 2) => write!(f, "forall({}, {})", self.args[0], self.args[1]),
            (Dot, 2) | (Dot, 3) => {
                match self.args[1].value() {
                    Value::String(field) => write!(f, "{}.{}", self.args[0], field)?,
                    _ => write!(f, "{}.{}", self.args[0], self.args[1])?,
                }
                match self.args.get(2) {
                    Some(result) => write!(f, " = {}", result),
                    None => Ok(()),
                }
            }
            (Add | Sub | Mul | Div | Mod | Rem, 3) => write!(
                f,
                "{} {} {} = {}",
                operand(0),
                op,
                operand(1),
                operand(2)
            ),
            (_, 2) if !matches!(op, Print | Debug | ForAll) => {
                write!(f, "{} {} {}", operand(0), op, operand(1))
            }
            // print, debug, and any arity the forms above do not cover
            _ => {
                write!(f, "{}(", op)?;
                write_separated(f, self.args.iter().map(|t| Operand(op, t)), ", ")?;
                f.write_str(")")
            }
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => n.fmt(f),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Boolean(b) => b.fmt(f),
            Value::Dictionary(dict) => dict.fmt(f),
            Value::Pattern(pattern) => pattern.fmt(f),
            Value::ExternalInstance(instance) => instance.fmt(f),
            Value::Call(call) => call.fmt(f),
            Value::List(items) => {
                f.write_str("[")?;
                write_elements(f, items)?;
                f.write_str("]")
            }
            Value::Variable(var) => var.fmt(f),
            Value::Expression(op) => op.fmt(f),
        }
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.value().fmt(f)
    }
}

impl Display for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.parameter.fmt(f)?;
        if let Some(specializer) = &self.specializer {
            write!(f, ": {}", specializer)?;
        }
        Ok(())
    }
}

/// `name(params)` without the body, as shown in rule listings and traces.
pub struct RuleHead<'r>(&'r Rule);

impl Display for RuleHead<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.0.name)?;
        write_separated(f, &self.0.params, ", ")?;
        f.write_str(")")
    }
}

impl Rule {
    pub fn head(&self) -> RuleHead<'_> {
        RuleHead(self)
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.body.value() {
            Value::Expression(Operation {
                operator: Operator::And,
                args,
            }) if args.is_empty() => write!(f, "{};", self.head()),
            Value::Expression(Operation {
                operator: Operator::And,
                args,
            }) => {
                write!(f, "{} if ", self.head())?;
                write_separated(f, args.iter().map(|t| Operand(Operator::And, t)), " and ")?;
                f.write_str(";")
            }
            _ => write!(f, "{} if {};", self.head(), self.body),
        }
    }
}
