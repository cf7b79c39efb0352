use std::collections::HashMap;

use super::diagnostic::{Diagnostic, Warning};
use super::error::{LoadError, PolarError, PolarResult};
use super::kb::*;
use super::rewrites::needs_rewrite;
use super::rules::*;
use super::terms::*;
use super::visitor::{walk_rule, walk_term, Visitor};

/// Structural checks on a compiled rule before it is added to the knowledge base.
pub fn validate_rule(rule: &Rule) -> PolarResult<()> {
    let problem = if rule.name.0.is_empty() {
        Some("rule name cannot be empty".to_owned())
    } else if matches!(rule.body.value(), Value::Pattern(_)) {
        Some(format!("body of rule {} cannot be a pattern", rule.name))
    } else {
        rule.params.iter().find_map(|param| param_problem(&rule.name, param))
    };
    match problem {
        Some(msg) => {
            Err(PolarError::from(LoadError::InvalidRule { msg }).with_location(rule.location()))
        }
        None => Ok(()),
    }
}

/// A parameter is a value or variable, or a lookup the rewriter turns into one. A specializer
/// is a pattern.
fn param_problem(rule: &Symbol, param: &Parameter) -> Option<String> {
    let is_value = match param.parameter.value() {
        Value::Expression(op) => needs_rewrite(op),
        Value::Pattern(_) => false,
        _ => true,
    };
    if !is_value {
        return Some(format!(
            "parameter `{}` of rule {} must be a value or a variable",
            param.parameter, rule
        ));
    }
    match &param.specializer {
        Some(spec) if !matches!(spec.value(), Value::Pattern(_)) => Some(format!(
            "specializer `{}` of rule {} must be a class or dictionary pattern",
            spec, rule
        )),
        _ => None,
    }
}

/// Variables seen once in a rule, and class specializers that name nothing registered.
struct SingletonVisitor<'kb> {
    kb: &'kb KnowledgeBase,
    /// The first occurrence of each variable, cleared once it is seen again.
    seen: HashMap<Symbol, Option<Term>>,
    unknown_specializers: Vec<Term>,
}

impl Visitor for SingletonVisitor<'_> {
    fn visit_term(&mut self, t: &Term) {
        match t.value() {
            Value::Variable(v) if !v.is_temporary_var() && !self.kb.is_constant(v) => {
                self.seen
                    .entry(v.clone())
                    .and_modify(|first| *first = None)
                    .or_insert_with(|| Some(t.clone()));
            }
            Value::Pattern(Pattern::Instance(literal))
                if !literal.tag.is_builtin_class() && !self.kb.is_constant(&literal.tag) =>
            {
                self.unknown_specializers.push(t.clone());
            }
            _ => {}
        }
        walk_term(self, t);
    }
}

/// Warnings for one rule, singletons first in document order.
pub fn check_singletons(rule: &Rule, kb: &KnowledgeBase) -> Vec<Diagnostic> {
    let mut visitor = SingletonVisitor {
        kb,
        seen: HashMap::new(),
        unknown_specializers: vec![],
    };
    walk_rule(&mut visitor, rule);

    let mut singletons: Vec<(Symbol, Term)> = visitor
        .seen
        .into_iter()
        .filter_map(|(sym, once)| Some((sym, once?)))
        .collect();
    singletons.sort_by_key(|(_, term)| term.location().map(|l| (l.row, l.column)));

    let singletons = singletons
        .into_iter()
        .map(|(sym, term)| Warning::SingletonVariable { term, sym });
    let unknown = visitor
        .unknown_specializers
        .into_iter()
        .map(|term| Warning::UnknownSpecializer { term });
    singletons.chain(unknown).map(Diagnostic::from).collect()
}

/// Rule calls in a body. Calls under a dot are host method calls and are skipped.
#[derive(Default)]
struct CallCollector {
    calls: Vec<Term>,
}

impl Visitor for CallCollector {
    fn visit_term(&mut self, term: &Term) {
        match term.value() {
            Value::Expression(op) if op.operator == Operator::Dot => return,
            Value::Call(_) => self.calls.push(term.clone()),
            _ => {}
        }
        walk_term(self, term)
    }
}

/// Warn about every call no loaded rule can answer, by name and arity.
pub fn check_undefined_rule_calls(kb: &KnowledgeBase) -> Vec<Diagnostic> {
    let mut rules: Vec<&Rule> = kb
        .get_rules()
        .values()
        .flat_map(|generic_rule| generic_rule.rules.values().map(|rule| &**rule))
        .collect();
    rules.sort_by_key(|rule| rule.location().map(|l| (l.row, l.column)));

    let mut collector = CallCollector::default();
    for rule in rules {
        collector.visit_term(&rule.body);
    }
    collector
        .calls
        .into_iter()
        .filter(|term| match term.value() {
            Value::Call(call) => kb.lookup(&call.name, call.args.len()).is_empty(),
            _ => false,
        })
        .map(|term| Warning::UndefinedRuleCall { term }.into())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorTaxonomy;

    #[test]
    fn test_invalid_rules() {
        assert!(validate_rule(&rule!("f", [sym!("x")])).is_ok());

        let err = validate_rule(&rule!("", [1])).unwrap_err();
        assert!(err.to_string().contains("rule name cannot be empty"));

        let mut bad_param = rule!("f", [sym!("x")]);
        bad_param.params[0].parameter = term!(op!(Add, term!(1), term!(2)));
        assert!(validate_rule(&bad_param).is_ok());
        bad_param.params[0].parameter = term!(op!(Or, term!(true), term!(false)));
        assert!(validate_rule(&bad_param).is_err());

        let mut bad_specializer = rule!("f", [sym!("x")]);
        bad_specializer.params[0].specializer = Some(term!(1));
        let err = validate_rule(&bad_specializer).unwrap_err();
        assert_eq!(err.taxonomy(), ErrorTaxonomy::LoadError);
    }

    #[test]
    fn test_singletons_and_unknown_specializers() {
        let mut kb = KnowledgeBase::new();
        kb.register_constant(sym!("limit"), term!(10)).unwrap();
        let rule = rule!("f", [sym!("x"), "y"; instance!("Usr"), "z"; instance!("Integer"), sym!("_ignored")] =>
            op!(Gt, var!("z"), var!("limit")),
            op!(Unify, var!("y"), var!("z"))
        );
        let warnings: Vec<String> = check_singletons(&rule, &kb)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            warnings,
            vec![
                "Singleton variable x is unused or undefined; try renaming to _x or _",
                "Unknown specializer Usr{}",
            ]
        );
    }

    #[test]
    fn test_undefined_rule_calls() {
        let mut kb = KnowledgeBase::new();
        kb.add_rule(rule!("f", [sym!("x")] => call!("no_such_rule", [sym!("x")])));
        kb.add_rule(rule!("g", [sym!("x")] =>
            call!("f", [sym!("x")]),
            call!("f", [sym!("x"), 2]),
            op!(Dot, var!("x"), term!(call!("method", [1])), var!("y"))
        ));
        let warnings: Vec<String> = check_undefined_rule_calls(&kb)
            .iter()
            .inspect(|warning| assert!(!warning.is_error()))
            .map(ToString::to_string)
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.contains(&"Call to undefined rule: no_such_rule(x)".to_owned()));
        // Arity counts: `f` is only defined with one parameter.
        assert!(warnings.contains(&"Call to undefined rule: f(x, 2)".to_owned()));
    }
}
