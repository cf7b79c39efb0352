//! Compiled policy documents, the input to `Polar::load`.
//!
//! A policy arrives as JSON produced by an external compiler: a list of rules, each with
//! its parameters, body and an optional position in the original document, plus any inline
//! queries the document declared.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{LoadError, PolarResult};
use super::folder::{fold_term, Folder};
use super::rules::*;
use super::sources::{Location, SourceInfo};
use super::terms::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub rules: Vec<CompiledRule>,
    #[serde(default)]
    pub queries: Vec<Term>,
    #[serde(default)]
    pub rule_types: Vec<RuleTypeDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRule {
    pub name: Symbol,
    #[serde(default)]
    pub params: Vec<Parameter>,
    #[serde(default = "empty_body")]
    pub body: Term,
    #[serde(default)]
    pub location: Option<Location>,
}

/// A bodiless rule declaring the shape of every rule with its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTypeDecl {
    #[serde(flatten)]
    pub rule: CompiledRule,
    #[serde(default)]
    pub required: bool,
}

fn empty_body() -> Term {
    Term::new_from_ffi(Value::Expression(Operation {
        operator: Operator::And,
        args: vec![],
    }))
}

/// A JSON document holds either one policy or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyDocument {
    One(Policy),
    Many(Vec<Policy>),
}

impl Policy {
    /// Build a policy from rules that already exist in memory.
    pub fn new(filename: Option<String>, rules: Vec<Rule>) -> Self {
        Self {
            filename,
            rules: rules.into_iter().map(CompiledRule::from).collect(),
            queries: vec![],
            rule_types: vec![],
        }
    }

    pub fn with_rule_type(mut self, rule_type: Rule, required: bool) -> Self {
        self.rule_types.push(RuleTypeDecl {
            rule: rule_type.into(),
            required,
        });
        self
    }

    pub fn with_queries(mut self, queries: Vec<Term>) -> Self {
        self.queries = queries;
        self
    }

    pub fn from_json(src: &str) -> PolarResult<Vec<Self>> {
        match serde_json::from_str(src) {
            Ok(PolicyDocument::One(policy)) => Ok(vec![policy]),
            Ok(PolicyDocument::Many(policies)) => Ok(policies),
            Err(e) => Err(LoadError::InvalidIr { msg: e.to_string() }.into()),
        }
    }

    /// Hash of the document contents, used to detect the same policy loaded under two names.
    pub fn fingerprint(&self) -> PolarResult<u64> {
        let rules = serde_json::to_string(&self.rules)
            .map_err(|e| LoadError::InvalidIr { msg: e.to_string() })?;
        let queries = serde_json::to_string(&self.queries)
            .map_err(|e| LoadError::InvalidIr { msg: e.to_string() })?;
        let rule_types = serde_json::to_string(&self.rule_types)
            .map_err(|e| LoadError::InvalidIr { msg: e.to_string() })?;
        let mut hasher = DefaultHasher::new();
        for part in [rules, queries, rule_types] {
            part.hash(&mut hasher);
        }
        Ok(hasher.finish())
    }
}

impl CompiledRule {
    /// Turn the IR into a `Rule`, stamping every term with the rule's position.
    pub fn into_rule(self, filename: Option<&str>) -> Rule {
        let CompiledRule {
            name,
            params,
            body,
            location,
        } = self;
        match location {
            Some(mut location) => {
                if location.file.is_none() {
                    location.file = filename.map(str::to_owned);
                }
                let location = Arc::new(location);
                let mut stamper = LocationStamper {
                    location: location.clone(),
                };
                let rule = Rule::new_from_policy(location, name, params, body);
                stamper.fold_rule(rule)
            }
            None => Rule {
                name,
                params,
                body,
                source_info: SourceInfo::Ffi,
            },
        }
    }
}

impl From<Rule> for CompiledRule {
    fn from(rule: Rule) -> Self {
        let location = rule.location().cloned();
        Self {
            name: rule.name,
            params: rule.params,
            body: rule.body,
            location,
        }
    }
}

/// Gives every term without a policy position the position of its rule.
struct LocationStamper {
    location: Arc<Location>,
}

impl Folder for LocationStamper {
    fn fold_term(&mut self, t: Term) -> Term {
        let mut t = fold_term(t, self);
        if t.location().is_none() {
            t.source_info = SourceInfo::Policy {
                location: self.location.clone(),
            };
        }
        t
    }
}
