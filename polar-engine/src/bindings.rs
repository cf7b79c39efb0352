//! Variable bindings for one query.
//!
//! Bindings live on a stack, so a choice point restores an earlier state by truncating it.
//! Variables bound to each other form chains ending at a value or at an unbound root, and
//! those chains never loop.

use std::collections::HashMap;

use crate::error::{invalid_state_error, PolarError, PolarResult, RuntimeError};
use crate::folder::{fold_term, Folder};
use crate::terms::{Symbol, Term, Value};

pub type Bindings = HashMap<Symbol, Term>;

/// Height of the binding stack, used as a rollback watermark.
pub type Bsp = usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VariableState {
    Unbound,
    Bound(Term),
}

/// End of a variable's chain.
enum Resolved {
    Root(Symbol),
    Value(Term),
}

#[derive(Clone, Debug, PartialEq)]
#[must_use]
pub enum UnifyOutcome {
    /// Nothing was bound.
    Failed,
    /// Unified, on condition that the host finds each deferred pair equal. Those pairs
    /// involve host instances.
    Succeeded { deferred: Vec<(Term, Term)> },
}

#[derive(Clone, Debug)]
struct Binding {
    var: Symbol,
    value: Term,
}

#[derive(Clone, Debug, Default)]
pub struct BindingManager {
    stack: Vec<Binding>,
}

struct DeepDeref<'a>(&'a BindingManager);

impl Folder for DeepDeref<'_> {
    fn fold_term(&mut self, term: Term) -> Term {
        let term = match term.value() {
            Value::Variable(_) => self.0.deref(&term),
            _ => term,
        };
        match term.value() {
            Value::Variable(_) => term,
            _ => fold_term(term, self),
        }
    }
}

fn cannot_unify(what: &str, left: &Term, right: &Term) -> PolarError {
    RuntimeError::TypeError {
        msg: format!("cannot unify {} directly `{}` = `{}`", what, left, right),
        stack_trace: None,
    }
    .into()
}

impl BindingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bsp(&self) -> Bsp {
        self.stack.len()
    }

    pub fn backtrack(&mut self, to: Bsp) {
        self.stack.truncate(to)
    }

    /// Bind `var` to `value`. A variable value links the two chains instead. Rebinding a
    /// variable that already has a value is an error.
    pub fn bind(&mut self, var: &Symbol, value: Term) -> PolarResult<()> {
        if let Value::Variable(other) = value.value() {
            return self.link(var, other);
        }
        match self.resolve(var) {
            Resolved::Root(root) => {
                self.push(root, value);
                Ok(())
            }
            Resolved::Value(_) => invalid_state_error(format!("Cannot rebind {}", var)),
        }
    }

    /// Shadow whatever `var` holds. Only for variables nothing is linked to, such as the
    /// placeholder result of an external call.
    pub fn unsafe_rebind(&mut self, var: &Symbol, value: Term) {
        self.push(var.clone(), value);
    }

    /// All-or-nothing unification: on failure or error the stack is back where it started.
    /// Expressions and patterns are type errors.
    pub fn unify(&mut self, left: &Term, right: &Term) -> PolarResult<UnifyOutcome> {
        let bsp = self.bsp();
        let mut deferred = vec![];
        let unified = self.unify_terms(left, right, &mut deferred);
        if !matches!(unified, Ok(true)) {
            self.backtrack(bsp);
        }
        Ok(match unified? {
            true => UnifyOutcome::Succeeded { deferred },
            false => UnifyOutcome::Failed,
        })
    }

    /// A variable becomes the value at the end of its chain, or the chain's root when unbound.
    /// Anything else is returned as is.
    pub fn deref(&self, term: &Term) -> Term {
        let var = match term.value() {
            Value::Variable(var) => var,
            _ => return term.clone(),
        };
        match self.resolve(var) {
            Resolved::Value(value) => value,
            Resolved::Root(root) if &root == var => term.clone(),
            Resolved::Root(root) => term.clone_with_value(Value::Variable(root)),
        }
    }

    /// `deref` applied everywhere inside `term`.
    pub fn deep_deref(&self, term: &Term) -> Term {
        DeepDeref(self).fold_term(term.clone())
    }

    pub fn variable_state(&self, var: &Symbol) -> VariableState {
        match self.resolve(var) {
            Resolved::Root(_) => VariableState::Unbound,
            Resolved::Value(value) => VariableState::Bound(value),
        }
    }

    fn push(&mut self, var: Symbol, value: Term) {
        self.stack.push(Binding { var, value });
    }

    /// Latest binding of `var`.
    fn lookup(&self, var: &Symbol) -> Option<&Term> {
        self.stack
            .iter()
            .rev()
            .find(|binding| &binding.var == var)
            .map(|binding| &binding.value)
    }

    fn resolve(&self, var: &Symbol) -> Resolved {
        let mut current = var;
        while let Some(value) = self.lookup(current) {
            match value.value() {
                Value::Variable(next) => current = next,
                _ => return Resolved::Value(value.clone()),
            }
        }
        Resolved::Root(current.clone())
    }

    /// Join the chains of two variables at their roots. Temporaries point at query variables.
    fn link(&mut self, left: &Symbol, right: &Symbol) -> PolarResult<()> {
        match (self.resolve(left), self.resolve(right)) {
            (Resolved::Root(l), Resolved::Root(r)) if l == r => {}
            (Resolved::Root(l), Resolved::Root(r)) => {
                let (from, to) = if l.is_temporary_var() && !r.is_temporary_var() {
                    (l, r)
                } else {
                    (r, l)
                };
                self.push(from, Term::from(to));
            }
            (Resolved::Root(root), Resolved::Value(value))
            | (Resolved::Value(value), Resolved::Root(root)) => self.push(root, value),
            (Resolved::Value(_), Resolved::Value(_)) => {
                return invalid_state_error(format!("{} and {} are both bound", left, right))
            }
        }
        Ok(())
    }

    /// Bind the root `var` to `value` unless `var` occurs inside it.
    fn bind_root(&mut self, var: &Symbol, value: &Term) -> bool {
        let occurs = !value.is_ground() && self.deep_deref(value).contains_variable(var);
        if !occurs {
            self.push(var.clone(), value.clone());
        }
        !occurs
    }

    fn unify_terms(
        &mut self,
        left: &Term,
        right: &Term,
        deferred: &mut Vec<(Term, Term)>,
    ) -> PolarResult<bool> {
        // Pairs are popped left to right, so the first mismatch or error in reading order wins.
        let mut pending = vec![(left.clone(), right.clone())];
        while let Some((left, right)) = pending.pop() {
            let left = self.deref(&left);
            let right = self.deref(&right);
            let mut push_pairs = |pairs: Vec<(&Term, &Term)>| {
                for (l, r) in pairs.into_iter().rev() {
                    pending.push((l.clone(), r.clone()));
                }
            };
            match (left.value(), right.value()) {
                (Value::Expression(_), _) | (_, Value::Expression(_)) => {
                    return Err(cannot_unify("expressions", &left, &right))
                }
                (Value::Pattern(_), _) | (_, Value::Pattern(_)) => {
                    return Err(cannot_unify("patterns", &left, &right))
                }
                (Value::Variable(l), Value::Variable(r)) => self.link(l, r)?,
                (Value::Variable(var), _) => {
                    if !self.bind_root(var, &right) {
                        return Ok(false);
                    }
                }
                (_, Value::Variable(var)) => {
                    if !self.bind_root(var, &left) {
                        return Ok(false);
                    }
                }
                (Value::Call(l), Value::Call(r))
                    if l.name == r.name && l.args.len() == r.args.len() =>
                {
                    push_pairs(l.args.iter().zip(&r.args).collect())
                }
                (Value::List(l), Value::List(r)) if l.len() == r.len() => {
                    push_pairs(l.iter().zip(r).collect())
                }
                (Value::Dictionary(l), Value::Dictionary(r))
                    if l.fields.keys().eq(r.fields.keys()) =>
                {
                    push_pairs(l.fields.values().zip(r.fields.values()).collect())
                }
                (Value::Number(l), Value::Number(r)) if l == r => {}
                (Value::String(l), Value::String(r)) if l == r => {}
                (Value::Boolean(l), Value::Boolean(r)) if l == r => {}
                (Value::ExternalInstance(l), Value::ExternalInstance(r))
                    if l.instance_id == r.instance_id => {}
                // Only the host knows whether its objects equal anything else.
                (Value::ExternalInstance(_), _) | (_, Value::ExternalInstance(_)) => {
                    deferred.push((left.clone(), right.clone()))
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::terms::ExternalInstance;

    fn host_object(id: u64) -> Term {
        term!(Value::ExternalInstance(ExternalInstance {
            instance_id: id,
            constructor: None,
            repr: None,
            class_id: None,
        }))
    }

    fn unifies(bm: &mut BindingManager, left: Term, right: Term) -> bool {
        matches!(bm.unify(&left, &right).unwrap(), UnifyOutcome::Succeeded { .. })
    }

    #[test]
    fn test_ground_terms() {
        let mut bm = BindingManager::new();
        let dict = |k: &str, v: i64| term!(btreemap! {sym!(k) => term!(v)});
        assert!(unifies(&mut bm, term!(1), term!(1.0)));
        assert!(unifies(&mut bm, term!([1, "a", true]), term!([1, "a", true])));
        assert!(unifies(&mut bm, dict("a", 1), dict("a", 1)));
        assert!(unifies(&mut bm, term!(call!("f", [1])), term!(call!("f", [1]))));

        assert!(!unifies(&mut bm, term!(true), term!(1)));
        assert!(!unifies(&mut bm, term!([1, 2]), term!([1, 2, 3])));
        assert!(!unifies(&mut bm, dict("a", 1), dict("b", 1)));
        assert!(!unifies(&mut bm, dict("a", 1), dict("a", 2)));
        assert!(!unifies(&mut bm, term!(call!("f", [1])), term!(call!("g", [1]))));
        assert_eq!(bm.bsp(), 0);
    }

    #[test]
    fn test_partial_failure_leaves_no_bindings() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("z"), term!(0)).unwrap();
        let before = bm.bsp();

        // `x` is bound to 1 before 2 and 3 clash.
        let left = term!([sym!("x"), 2, sym!("y")]);
        assert!(!unifies(&mut bm, left.clone(), term!([1, 3, 4])));
        assert_eq!(bm.bsp(), before);
        assert_eq!(bm.variable_state(&sym!("x")), VariableState::Unbound);

        assert!(unifies(&mut bm, left, term!([1, 2, 4])));
        assert_eq!(bm.variable_state(&sym!("y")), VariableState::Bound(term!(4)));

        bm.backtrack(before);
        assert_eq!(bm.variable_state(&sym!("y")), VariableState::Unbound);
        assert_eq!(bm.variable_state(&sym!("z")), VariableState::Bound(term!(0)));
    }

    #[test]
    fn test_linked_variables_share_a_value() {
        let mut bm = BindingManager::new();
        let (x, y, temp) = (sym!("x"), sym!("y"), sym!("_t_1"));

        bm.bind(&temp, term!(x.clone())).unwrap();
        assert_eq!(bm.deref(&term!(temp.clone())), term!(x.clone()));

        bm.bind(&x, term!(y.clone())).unwrap();
        let linked = bm.bsp();
        bm.bind(&y, term!(temp.clone())).unwrap();
        bm.bind(&x, term!(x.clone())).unwrap();
        assert_eq!(bm.bsp(), linked, "already on one chain");

        bm.bind(&temp, term!(7)).unwrap();
        for var in [&x, &y, &temp] {
            assert_eq!(bm.variable_state(var), VariableState::Bound(term!(7)));
        }
        assert!(bm.bind(&y, term!(8)).is_err());
    }

    #[test]
    fn test_variable_inside_its_own_value() {
        let mut bm = BindingManager::new();
        assert!(!unifies(&mut bm, var!("x"), term!([1, sym!("x")])));
        bm.bind(&sym!("y"), term!(sym!("x"))).unwrap();
        assert!(!unifies(&mut bm, var!("x"), term!(call!("f", [sym!("y")]))));
    }

    #[test]
    fn test_deep_deref_reaches_nested_terms() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!(1)).unwrap();
        bm.bind(&sym!("y"), term!([sym!("x"), sym!("z")])).unwrap();
        let derefed = bm.deep_deref(&term!(btreemap! {
            sym!("a") => var!("y"),
            sym!("b") => term!(call!("f", [sym!("x")])),
        }));
        assert_eq!(
            derefed,
            term!(btreemap! {
                sym!("a") => term!([1, sym!("z")]),
                sym!("b") => term!(call!("f", [1])),
            })
        );
    }

    #[test]
    fn test_host_objects_defer_to_the_host() {
        let mut bm = BindingManager::new();
        assert_eq!(
            bm.unify(&host_object(1), &host_object(1)).unwrap(),
            UnifyOutcome::Succeeded { deferred: vec![] }
        );
        let outcome = bm
            .unify(&term!([host_object(1), sym!("x")]), &term!([2, 3]))
            .unwrap();
        assert_eq!(
            outcome,
            UnifyOutcome::Succeeded {
                deferred: vec![(host_object(1), term!(2))]
            }
        );
        assert_eq!(bm.variable_state(&sym!("x")), VariableState::Bound(term!(3)));
    }

    #[test]
    fn test_patterns_are_type_errors() {
        let mut bm = BindingManager::new();
        bm.bind(&sym!("x"), term!(1)).unwrap();
        let pattern = term!(pattern!(instance!("User")));
        let err = bm
            .unify(&term!([sym!("y"), pattern.clone()]), &term!([2, 3]))
            .unwrap_err();
        assert!(err.to_string().contains("cannot unify patterns"));
        assert_eq!(bm.bsp(), 1, "`y` was unbound again");
        assert!(bm.unify(&var!("x"), &pattern).is_err());
    }
}
