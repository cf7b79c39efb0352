//! Declared shapes for rules.
//!
//! A rule type is a bodiless rule whose parameters say what every rule of that name must look
//! like. Once any type is declared for a name, each rule with that name has to match one of
//! them. A required type must also be implemented by at least one rule.

use std::collections::HashMap;
use std::fmt;

use super::error::{LoadError, PolarError, PolarResult};
use super::kb::KnowledgeBase;
use super::rules::{Parameter, Rule};
use super::terms::*;

#[derive(Clone, Debug)]
pub struct RuleType {
    pub rule: Rule,
    pub required: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RuleTypes(HashMap<Symbol, Vec<RuleType>>);

impl RuleTypes {
    pub fn add(&mut self, rule: Rule, required: bool) -> PolarResult<()> {
        let has_body = !matches!(
            rule.body.value(),
            Value::Expression(Operation { operator: Operator::And, args }) if args.is_empty()
        );
        if has_body {
            let msg = format!("rule type {} cannot have a body", rule.head());
            return Err(PolarError::from(LoadError::InvalidRuleType { msg }).with_location(rule.location()));
        }
        self.0
            .entry(rule.name.clone())
            .or_default()
            .push(RuleType { rule, required });
        Ok(())
    }

    pub fn get(&self, name: &Symbol) -> &[RuleType] {
        self.0.get(name).map_or(&[], Vec::as_slice)
    }

    /// Required types, ordered by name for stable error reporting.
    pub fn required(&self) -> Vec<&RuleType> {
        let mut required: Vec<&RuleType> = self.0.values().flatten().filter(|t| t.required).collect();
        required.sort_by(|a, b| a.rule.name.cmp(&b.rule.name));
        required
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Whether a rule fits a rule type, and if not, the first reason it doesn't.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamMatch {
    True,
    False(String),
}

impl ParamMatch {
    pub fn is_true(&self) -> bool {
        matches!(self, ParamMatch::True)
    }
}

impl fmt::Display for ParamMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamMatch::True => f.write_str("matches"),
            ParamMatch::False(reason) => f.write_str(reason),
        }
    }
}

/// Every field the type asks for is present on the rule side with an equal value.
fn fields_match(type_fields: &Dictionary, rule_fields: &Dictionary) -> bool {
    type_fields
        .fields
        .iter()
        .all(|(key, value)| rule_fields.fields.get(key) == Some(value))
}

/// The class pattern a plain value in a rule head is an instance of.
fn value_pattern(value: &Value) -> Option<Pattern> {
    let class = value.builtin_class()?;
    let fields = match value {
        Value::Dictionary(dict) => dict.clone(),
        _ => Dictionary::new(),
    };
    Some(Pattern::Instance(InstanceLiteral {
        tag: Symbol::new(class),
        fields,
    }))
}

impl KnowledgeBase {
    /// `rule` matches `rule_type` when the arities agree and every parameter matches.
    pub fn rule_params_match(&self, rule: &Rule, rule_type: &Rule) -> ParamMatch {
        if rule.arity() != rule_type.arity() {
            return ParamMatch::False(format!(
                "Different number of parameters. Rule has {} parameter(s) but rule type has {}.",
                rule.arity(),
                rule_type.arity()
            ));
        }
        rule.params
            .iter()
            .zip(&rule_type.params)
            .enumerate()
            .map(|(index, (param, type_param))| self.check_param(index + 1, param, type_param))
            .find(|result| !result.is_true())
            .unwrap_or(ParamMatch::True)
    }

    /// Compare the parameter at (1-based) `index` with the rule type's parameter there.
    pub fn check_param(&self, index: usize, param: &Parameter, type_param: &Parameter) -> ParamMatch {
        fn spec(p: &Parameter) -> Option<&Value> {
            p.specializer.as_ref().map(Term::value)
        }
        match (type_param.parameter.value(), spec(type_param)) {
            // An unconstrained variable accepts anything.
            (Value::Variable(_), None) => ParamMatch::True,
            (Value::Variable(_), Some(expected)) => {
                let actual = match (param.parameter.value(), spec(param)) {
                    (Value::Variable(_), None) => {
                        return ParamMatch::False(format!(
                            "Invalid rule parameter {}. Rule type expected {}",
                            index, expected
                        ))
                    }
                    (Value::Variable(_), Some(actual)) | (actual, None) => actual,
                    (value, Some(_)) => {
                        return ParamMatch::False(format!(
                            "Invalid rule parameter {}. {} cannot have a specializer",
                            index, value
                        ))
                    }
                };
                match expected {
                    Value::Pattern(expected) => self.check_pattern(index, actual, expected),
                    _ if actual == expected => ParamMatch::True,
                    _ => ParamMatch::False(format!(
                        "Invalid parameter {}. Rule type expected {}, got {}.",
                        index, expected, actual
                    )),
                }
            }
            (expected, None) => match (param.parameter.value(), spec(param)) {
                (actual, None) if actual == expected => ParamMatch::True,
                (actual, _) => ParamMatch::False(format!(
                    "Invalid parameter {}. Rule type expected {}, got {}.",
                    index, expected, actual
                )),
            },
            (expected, Some(_)) => ParamMatch::False(format!(
                "Invalid rule type parameter {}. {} cannot have a specializer",
                index, expected
            )),
        }
    }

    /// `actual` is a pattern from a rule head, or a plain value standing for its class.
    fn check_pattern(&self, index: usize, actual: &Value, expected: &Pattern) -> ParamMatch {
        let actual = match actual {
            Value::Pattern(pattern) => pattern.clone(),
            value => match value_pattern(value) {
                Some(pattern) => pattern,
                None => {
                    return ParamMatch::False(format!(
                        "Invalid parameter {}. {} cannot be checked against {}.",
                        index, value, expected
                    ))
                }
            },
        };
        let fields_differ = || {
            ParamMatch::False(format!(
                "Specializer {} on parameter {} does not have the fields of {}.",
                actual, index, expected
            ))
        };

        match (&actual, expected) {
            (Pattern::Instance(rule), Pattern::Instance(ty)) => {
                if rule.tag != ty.tag {
                    if let Some(reason) = self.not_a_subclass(index, &rule.tag, &ty.tag) {
                        return ParamMatch::False(reason);
                    }
                }
                if fields_match(&ty.fields, &rule.fields) {
                    ParamMatch::True
                } else {
                    fields_differ()
                }
            }
            (Pattern::Dictionary(rule), Pattern::Dictionary(ty))
            | (Pattern::Instance(InstanceLiteral { fields: rule, .. }), Pattern::Dictionary(ty)) => {
                if fields_match(ty, rule) {
                    ParamMatch::True
                } else {
                    fields_differ()
                }
            }
            (Pattern::Dictionary(rule), Pattern::Instance(ty)) if ty.tag.0 == "Dictionary" => {
                if fields_match(&ty.fields, rule) {
                    ParamMatch::True
                } else {
                    fields_differ()
                }
            }
            _ => ParamMatch::False(format!(
                "Invalid parameter {}. Rule specializer {} does not match rule type specializer {}.",
                index, actual, expected
            )),
        }
    }

    /// Why class `tag` is not known to be `expected` or a subclass of it. Built-in classes
    /// follow their fixed hierarchy. Host classes need a registered MRO.
    fn not_a_subclass(&self, index: usize, tag: &Symbol, expected: &Symbol) -> Option<String> {
        if tag.is_builtin_class() || expected.is_builtin_class() {
            return (!builtin_subclass(&tag.0, &expected.0)).then(|| {
                format!(
                    "Rule specializer {} on parameter {} must match rule type specializer {}",
                    tag, index, expected
                )
            });
        }
        let expected_id = match self.get_class_id_for_symbol(expected) {
            Some(id) => id,
            None => {
                return Some(format!(
                    "Rule type specializer {} on parameter {} is not a registered class.",
                    expected, index
                ))
            }
        };
        match self.mro.get(tag) {
            Some(mro) if mro.contains(&expected_id) => None,
            Some(_) => Some(format!(
                "Rule specializer {} on parameter {} must match rule type specializer {}",
                tag, index, expected
            )),
            None => Some(format!(
                "Rule specializer {} on parameter {} is not registered as a class.",
                tag, index
            )),
        }
    }

    /// Check every rule against the types declared for its name, then check that every
    /// required type has an implementation.
    pub fn validate_rule_types(&self) -> PolarResult<()> {
        let mut names: Vec<&Symbol> = self.get_rules().keys().collect();
        names.sort();
        for name in names {
            let types = self.get_rule_types(name);
            if types.is_empty() {
                continue;
            }
            let generic_rule = match self.get_generic_rule(name) {
                Some(generic_rule) => generic_rule,
                None => continue,
            };
            for rule in generic_rule.rules.values() {
                let results: Vec<ParamMatch> = types
                    .iter()
                    .map(|rule_type| self.rule_params_match(rule, &rule_type.rule))
                    .collect();
                if results.iter().any(ParamMatch::is_true) {
                    continue;
                }
                let reasons = types
                    .iter()
                    .zip(&results)
                    .map(|(rule_type, result)| format!("\n  {}: {}", rule_type.rule.head(), result))
                    .collect::<String>();
                let error = LoadError::RuleTypeMismatch {
                    rule: rule.head().to_string(),
                    msg: reasons,
                };
                return Err(PolarError::from(error).with_location(rule.location()));
            }
        }

        for rule_type in self.rule_types.required() {
            let implemented = self.get_generic_rule(&rule_type.rule.name).map_or(false, |g| {
                g.rules
                    .values()
                    .any(|rule| self.rule_params_match(rule, &rule_type.rule).is_true())
            });
            if !implemented {
                let error = LoadError::MissingRequiredRule {
                    rule_type: rule_type.rule.head().to_string(),
                };
                return Err(PolarError::from(error).with_location(rule_type.rule.location()));
            }
        }
        Ok(())
    }
}
