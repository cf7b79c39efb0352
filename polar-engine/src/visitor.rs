//! Read-only, depth-first traversal of terms and rules.

use crate::rules::Rule;
use crate::terms::*;

/// Hooks called while walking a term. Overriding `visit_term` or `visit_operation` takes over the
/// descent into children; call the matching `walk_*` function to keep it.
pub trait Visitor: Sized {
    fn visit_term(&mut self, term: &Term) {
        walk_term(self, term)
    }

    fn visit_variable(&mut self, _var: &Symbol) {}

    fn visit_operation(&mut self, op: &Operation) {
        walk_operation(self, op)
    }
}

fn visit_all<'t, V: Visitor>(visitor: &mut V, terms: impl IntoIterator<Item = &'t Term>) {
    for term in terms {
        visitor.visit_term(term);
    }
}

/// Host instances are leaves: their constructors are not walked.
pub fn walk_term<V: Visitor>(visitor: &mut V, term: &Term) {
    match term.value() {
        Value::Variable(var) => visitor.visit_variable(var),
        Value::Expression(op) => visitor.visit_operation(op),
        Value::List(items) => visit_all(visitor, items),
        Value::Call(call) => visit_all(visitor, &call.args),
        Value::Dictionary(dict) | Value::Pattern(Pattern::Dictionary(dict)) => {
            visit_all(visitor, dict.fields.values())
        }
        Value::Pattern(Pattern::Instance(literal)) => {
            visit_all(visitor, literal.fields.fields.values())
        }
        Value::ExternalInstance(_) | Value::Number(_) | Value::String(_) | Value::Boolean(_) => {}
    }
}

pub fn walk_operation<V: Visitor>(visitor: &mut V, op: &Operation) {
    visit_all(visitor, &op.args)
}

/// Parameters (each followed by its specializer) come before the body.
pub fn walk_rule<V: Visitor>(visitor: &mut V, rule: &Rule) {
    for param in &rule.params {
        visitor.visit_term(&param.parameter);
        if let Some(specializer) = &param.specializer {
            visitor.visit_term(specializer);
        }
    }
    visitor.visit_term(&rule.body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VariableLog {
        seen: Vec<String>,
        skip_lookups: bool,
    }

    impl Visitor for VariableLog {
        fn visit_variable(&mut self, var: &Symbol) {
            self.seen.push(var.0.clone());
        }

        fn visit_operation(&mut self, op: &Operation) {
            if !(self.skip_lookups && op.operator == Operator::Dot) {
                walk_operation(self, op);
            }
        }
    }

    #[test]
    fn test_walk_reaches_nested_variables() {
        let term = term!(btreemap! {
            sym!("owner") => term!(pattern!(instance!("User", btreemap! {sym!("id") => term!(sym!("i"))}))),
            sym!("tags") => term!(value!(["a", sym!("t")])),
            sym!("total") => term!(op!(Add, term!(1), term!(call!("f", [sym!("n")])))),
        });
        let mut log = VariableLog::default();
        log.visit_term(&term);
        assert_eq!(log.seen, vec!["i", "t", "n"]);
    }

    #[test]
    fn test_walk_rule_order_and_pruning() {
        let rule = rule!("can_read", ["user"; btreemap! {sym!("org") => term!(sym!("o"))}, sym!("doc")] =>
            op!(Dot, term!(sym!("doc")), term!("owner"), term!(sym!("owner"))),
            call!("member", [sym!("user"), sym!("o")])
        );

        let mut log = VariableLog::default();
        walk_rule(&mut log, &rule);
        assert_eq!(log.seen, vec!["user", "o", "doc", "doc", "owner", "user", "o"]);

        let mut pruned = VariableLog {
            skip_lookups: true,
            ..VariableLog::default()
        };
        walk_rule(&mut pruned, &rule);
        assert_eq!(pruned.seen, vec!["user", "o", "doc", "user", "o"]);
    }
}
