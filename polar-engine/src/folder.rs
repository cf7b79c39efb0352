//! Rebuilding traversal: consumes a term or rule and returns one of the same shape.
//!
//! Names (rule names, dictionary keys, class tags) are never folded, only the terms under them.

use crate::rules::*;
use crate::terms::*;

pub trait Folder: Sized {
    fn fold_term(&mut self, term: Term) -> Term {
        fold_term(term, self)
    }

    fn fold_variable(&mut self, var: Symbol) -> Symbol {
        var
    }

    fn fold_operation(&mut self, op: Operation) -> Operation {
        fold_operation(op, self)
    }

    fn fold_param(&mut self, param: Parameter) -> Parameter {
        fold_param(param, self)
    }

    fn fold_rule(&mut self, rule: Rule) -> Rule {
        fold_rule(rule, self)
    }
}

fn fold_terms<F: Folder>(terms: TermList, folder: &mut F) -> TermList {
    terms.into_iter().map(|t| folder.fold_term(t)).collect()
}

fn fold_fields<F: Folder>(dict: Dictionary, folder: &mut F) -> Dictionary {
    let fields = dict
        .fields
        .into_iter()
        .map(|(key, term)| (key, folder.fold_term(term)))
        .collect();
    Dictionary { fields }
}

fn fold_value<F: Folder>(value: Value, folder: &mut F) -> Value {
    match value {
        Value::Variable(var) => Value::Variable(folder.fold_variable(var)),
        Value::Expression(op) => Value::Expression(folder.fold_operation(op)),
        Value::List(items) => Value::List(fold_terms(items, folder)),
        Value::Call(Call { name, args }) => Value::Call(Call {
            name,
            args: fold_terms(args, folder),
        }),
        Value::Dictionary(dict) => Value::Dictionary(fold_fields(dict, folder)),
        Value::Pattern(Pattern::Dictionary(dict)) => {
            Value::Pattern(Pattern::Dictionary(fold_fields(dict, folder)))
        }
        Value::Pattern(Pattern::Instance(InstanceLiteral { tag, fields })) => {
            Value::Pattern(Pattern::Instance(InstanceLiteral {
                tag,
                fields: fold_fields(fields, folder),
            }))
        }
        Value::ExternalInstance(instance) => Value::ExternalInstance(ExternalInstance {
            constructor: instance.constructor.map(|c| folder.fold_term(c)),
            ..instance
        }),
        scalar => scalar,
    }
}

/// Rebuilds the value under `term`, keeping its source info.
pub fn fold_term<F: Folder>(term: Term, folder: &mut F) -> Term {
    let value = fold_value(term.value().clone(), folder);
    term.clone_with_value(value)
}

pub fn fold_operation<F: Folder>(op: Operation, folder: &mut F) -> Operation {
    Operation {
        operator: op.operator,
        args: fold_terms(op.args, folder),
    }
}

pub fn fold_param<F: Folder>(param: Parameter, folder: &mut F) -> Parameter {
    Parameter {
        parameter: folder.fold_term(param.parameter),
        specializer: param.specializer.map(|s| folder.fold_term(s)),
    }
}

pub fn fold_rule<F: Folder>(rule: Rule, folder: &mut F) -> Rule {
    let params = rule
        .params
        .into_iter()
        .map(|p| folder.fold_param(p))
        .collect();
    let body = folder.fold_term(rule.body);
    Rule {
        params,
        body,
        ..rule
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sources::Location;

    struct Suffix;

    impl Folder for Suffix {
        fn fold_variable(&mut self, var: Symbol) -> Symbol {
            Symbol(format!("{}_1", var.0))
        }
    }

    struct Untouched;

    impl Folder for Untouched {}

    #[test]
    fn test_fold_variable_reaches_every_position() {
        let rule = rule!("f", [sym!("x"), "y"; btreemap! {sym!("id") => term!(sym!("i"))}] =>
            op!(Dot, term!(sym!("x")), term!("name"), term!(sym!("n"))),
            call!("g", [value!([sym!("y"), 1]), btreemap! {sym!("k") => term!(sym!("v"))}])
        );
        let folded = Suffix.fold_rule(rule);
        assert_eq!(folded.name, sym!("f"));

        let mut vars = vec![];
        for param in &folded.params {
            vars.extend(param.parameter.ordered_variables());
            if let Some(specializer) = &param.specializer {
                vars.extend(specializer.ordered_variables());
            }
        }
        vars.extend(folded.body.ordered_variables());
        assert_eq!(
            vars,
            vec![
                sym!("x_1"),
                sym!("y_1"),
                sym!("i_1"),
                sym!("x_1"),
                sym!("n_1"),
                sym!("y_1"),
                sym!("v_1"),
            ]
        );

        let Value::Expression(body) = folded.body.value() else {
            panic!("body is not a conjunction");
        };
        let Value::Call(call) = body.args[1].value() else {
            panic!("second goal is not a call");
        };
        assert_eq!(call.name, sym!("g"));
        assert!(matches!(
            call.args[1].value(),
            Value::Dictionary(Dictionary { fields }) if fields.contains_key(&sym!("k"))
        ));
    }

    #[test]
    fn test_fold_keeps_source_info() {
        let location = Arc::new(Location::new(Some("a.polar".into()), 3, 4));
        let term = Term::new_from_policy(
            location,
            value!(op!(Unify, term!(sym!("a")), term!(value!([1, "b", true])))),
        );
        let folded = Untouched.fold_term(term.clone());
        assert_eq!(folded, term);
        assert_eq!(folded.location().map(|l| (l.row, l.column)), Some((3, 4)));
    }
}
