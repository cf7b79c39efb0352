//! Rewrites applied to policy and query terms before evaluation.
//!
//! Lookups and two-operand arithmetic are replaced by fresh temporaries, so `a.b = 1` becomes
//! `a.b = _value_1 and _value_1 = 1`. The goal binding a temporary runs first in the nearest
//! enclosing conjunction. Goals hoisted out of a rule head run at the end of the body.

use std::collections::HashMap;

use super::folder::{fold_operation, fold_term, Folder};
use super::kb::KnowledgeBase;
use super::rules::Rule;
use super::terms::*;

/// Lookups and arithmetic that have not been given a result variable yet.
pub(crate) fn needs_rewrite(op: &Operation) -> bool {
    use Operator::*;
    matches!(op.operator, Add | Sub | Mul | Div | Mod | Rem | Dot) && op.args.len() == 2
}

/// Gives every non-constant variable a fresh name, once per renamer. Applied to each rule
/// before it runs so two uses of one rule never share variables.
pub struct Renamer<'kb> {
    kb: &'kb KnowledgeBase,
    renames: HashMap<Symbol, Symbol>,
}

impl<'kb> Renamer<'kb> {
    pub fn new(kb: &'kb KnowledgeBase) -> Self {
        Self {
            kb,
            renames: HashMap::new(),
        }
    }
}

impl Folder for Renamer<'_> {
    fn fold_variable(&mut self, var: Symbol) -> Symbol {
        if self.kb.is_constant(&var) {
            return var;
        }
        let kb = self.kb;
        self.renames
            .entry(var)
            .or_insert_with_key(|var| kb.gensym(&var.0))
            .clone()
    }
}

struct Hoister<'kb> {
    kb: &'kb KnowledgeBase,
    /// Goals hoisted so far, one frame per open conjunction.
    frames: Vec<Vec<Term>>,
}

impl Hoister<'_> {
    fn fold_in_frame(&mut self, term: Term) -> Term {
        self.frames.push(vec![]);
        let folded = self.fold_term(term);
        let hoisted = self.frames.pop().unwrap_or_default();
        if hoisted.is_empty() {
            return folded;
        }
        let mut goals = hoisted;
        goals.push(folded.clone());
        folded.clone_with_value(Value::Expression(Operation {
            operator: Operator::And,
            args: goals,
        }))
    }

    fn temporary(&self, operator: Operator) -> Term {
        let prefix = match operator {
            Operator::Dot => "value",
            _ => "op",
        };
        Term::new_temporary(Value::Variable(self.kb.gensym(prefix)))
    }
}

impl Folder for Hoister<'_> {
    fn fold_term(&mut self, term: Term) -> Term {
        if self.frames.is_empty() {
            return self.fold_in_frame(term);
        }
        match term.value() {
            Value::Expression(op) if needs_rewrite(op) => {
                let mut with_result = fold_operation(op.clone(), self);
                let temporary = self.temporary(op.operator);
                with_result.args.push(temporary.clone());
                if let Some(frame) = self.frames.last_mut() {
                    frame.push(term.clone_with_value(Value::Expression(with_result)));
                }
                term.clone_with_value(temporary.value().clone())
            }
            _ => fold_term(term, self),
        }
    }

    /// Each operand of a connective is its own conjunction.
    fn fold_operation(&mut self, op: Operation) -> Operation {
        match op.operator {
            Operator::And | Operator::Or | Operator::Not => Operation {
                operator: op.operator,
                args: op
                    .args
                    .into_iter()
                    .map(|arg| self.fold_in_frame(arg))
                    .collect(),
            },
            _ => fold_operation(op, self),
        }
    }

    fn fold_variable(&mut self, var: Symbol) -> Symbol {
        if var.0 == "_" {
            self.kb.gensym("_")
        } else {
            var
        }
    }

    fn fold_rule(&mut self, rule: Rule) -> Rule {
        let Rule {
            name,
            params,
            body,
            source_info,
        } = rule;
        let body = match body.value() {
            Value::Expression(op) if op.operator == Operator::And => body,
            _ => body.clone_with_value(Value::Expression(op!(And, body.clone()))),
        };
        let body = self.fold_term(body);

        self.frames.push(vec![]);
        let params = params.into_iter().map(|p| self.fold_param(p)).collect();
        let from_head = self.frames.pop().unwrap_or_default();
        let body = match from_head.is_empty() {
            true => body,
            false => body.clone_with_value(Value::Expression(Operation {
                operator: Operator::And,
                args: conjuncts(&body).into_iter().chain(from_head).collect(),
            })),
        };
        Rule {
            name,
            params,
            body,
            source_info,
        }
    }
}

/// Operands of a conjunction, or the term alone.
pub fn conjuncts(term: &Term) -> TermList {
    match term.value() {
        Value::Expression(op) if op.operator == Operator::And => op.args.clone(),
        _ => vec![term.clone()],
    }
}

pub fn rewrite_term(term: Term, kb: &KnowledgeBase) -> Term {
    Hoister { kb, frames: vec![] }.fold_term(term)
}

/// The rewritten rule's body is always a conjunction.
pub fn rewrite_rule(rule: Rule, kb: &KnowledgeBase) -> Rule {
    Hoister { kb, frames: vec![] }.fold_rule(rule)
}
