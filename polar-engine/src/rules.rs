use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::sources::{Location, SourceInfo};
use super::terms::*;

/// One position in a rule head: a value or variable, optionally narrowed by a pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub parameter: Term,
    #[serde(default)]
    pub specializer: Option<Term>,
}

impl Parameter {
    /// The value an argument must equal, when the parameter is an unspecialized ground value.
    fn ground_value(&self) -> Option<&Value> {
        let value = self.parameter.value();
        (self.specializer.is_none() && value.is_ground()).then_some(value)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub name: Symbol,
    pub params: Vec<Parameter>,
    pub body: Term,
    #[serde(skip, default = "SourceInfo::ffi")]
    pub source_info: SourceInfo,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params && self.body == other.body
    }
}

impl Rule {
    fn with_source(source_info: SourceInfo, name: Symbol, params: Vec<Parameter>, body: Term) -> Self {
        Self {
            name,
            params,
            body,
            source_info,
        }
    }

    pub fn new_from_test(name: Symbol, params: Vec<Parameter>, body: Term) -> Self {
        Self::with_source(SourceInfo::Test, name, params, body)
    }

    pub fn new_from_policy(
        location: Arc<Location>,
        name: Symbol,
        params: Vec<Parameter>,
        body: Term,
    ) -> Self {
        Self::with_source(SourceInfo::Policy { location }, name, params, body)
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn location(&self) -> Option<&Location> {
        self.source_info.location()
    }

    /// Every parameter is a plain ground value, so the index alone decides applicability.
    pub fn is_ground(&self) -> bool {
        self.params.iter().all(|p| p.ground_value().is_some())
    }
}

pub type Rules = Vec<Arc<Rule>>;

/// Prefix tree over rule heads, one level per argument position. A ground parameter files its
/// rule under that value; any other parameter files it under `wildcard`. A rule id is stored at
/// the node reached after its last parameter, so every lookup also filters on arity.
#[derive(Clone, Debug, Default)]
struct ArgTrie {
    ends_here: BTreeSet<u64>,
    by_value: HashMap<Value, ArgTrie>,
    wildcard: Option<Box<ArgTrie>>,
}

impl ArgTrie {
    fn insert(&mut self, rule_id: u64, params: &[Parameter]) {
        let mut node = self;
        for param in params {
            node = match param.ground_value() {
                Some(value) => node.by_value.entry(value.clone()).or_default(),
                None => node.wildcard.get_or_insert_with(Box::default).as_mut(),
            };
        }
        node.ends_here.insert(rule_id);
    }

    /// Ids of rules whose ground parameters agree with the ground arguments in `args`.
    fn candidates(&self, args: &[Term], found: &mut BTreeSet<u64>) {
        let (first, rest) = match args.split_first() {
            Some(split) => split,
            None => {
                found.extend(&self.ends_here);
                return;
            }
        };
        let arg = first.value();
        if arg.is_ground() {
            if let Some(next) = self.by_value.get(arg) {
                next.candidates(rest, found);
            }
        } else {
            for next in self.by_value.values() {
                next.candidates(rest, found);
            }
        }
        if let Some(next) = &self.wildcard {
            next.candidates(rest, found);
        }
    }
}

/// Every rule with one name. Ids grow with registration order, and every accessor returns
/// rules in id order.
#[derive(Clone, Debug)]
pub struct GenericRule {
    pub name: Symbol,
    pub rules: BTreeMap<u64, Arc<Rule>>,
    trie: ArgTrie,
}

impl GenericRule {
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            rules: BTreeMap::new(),
            trie: ArgTrie::default(),
        }
    }

    pub fn add_rule(&mut self, rule: Arc<Rule>) {
        let rule_id = self.rules.len() as u64;
        self.trie.insert(rule_id, &rule.params);
        self.rules.insert(rule_id, rule);
    }

    pub fn rules_with_arity(&self, arity: usize) -> Rules {
        self.rules
            .values()
            .filter(|rule| rule.arity() == arity)
            .cloned()
            .collect()
    }

    /// Rules of the right arity that the ground arguments in `args` do not already rule out.
    pub fn get_applicable_rules(&self, args: &[Term]) -> Rules {
        let mut ids = BTreeSet::new();
        self.trie.candidates(args, &mut ids);
        ids.iter().filter_map(|id| self.rules.get(id)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic_rule(rules: Vec<Rule>) -> GenericRule {
        let mut generic_rule = GenericRule::new(sym!("f"));
        for rule in rules {
            generic_rule.add_rule(Arc::new(rule));
        }
        generic_rule
    }

    fn heads(rules: Rules) -> Vec<String> {
        rules.iter().map(|r| r.head().to_string()).collect()
    }

    #[test]
    fn test_trie_layout() {
        let generic_rule = generic_rule(vec![
            rule!("f", [1, 1, "x"]),
            rule!("f", [1, 1, "y"]),
            rule!("f", [1, sym!("x"), "y"] => op!(Unify, var!("x"), term!(2))),
            rule!("f", [1, 2, btreemap! {sym!("b") => term!("y")}]),
            rule!("f", ["a"; instance!("User")]),
        ]);
        let root = &generic_rule.trie;
        assert!(root.ends_here.is_empty());
        assert_eq!(root.by_value.len(), 1);

        // A specialized parameter is a wildcard even when its name is ground.
        let specialized = root.wildcard.as_ref().unwrap();
        assert_eq!(specialized.ends_here.iter().copied().collect::<Vec<_>>(), vec![4]);

        let after_1 = &root.by_value[&value!(1)];
        assert_eq!(after_1.by_value.len(), 2);
        assert!(after_1.wildcard.is_some());

        let after_1_1 = &after_1.by_value[&value!(1)];
        assert_eq!(after_1_1.by_value[&value!("x")].ends_here.len(), 1);
        assert_eq!(after_1_1.by_value[&value!("y")].ends_here.len(), 1);

        let after_1_2 = &after_1.by_value[&value!(2)];
        assert!(after_1_2
            .by_value
            .contains_key(&value!(btreemap! {sym!("b") => term!("y")})));
    }

    #[test]
    fn test_applicable_rules_keep_registration_order() {
        let generic_rule = generic_rule(vec![
            rule!("f", [sym!("x")]),
            rule!("f", [1]),
            rule!("f", [2]),
            rule!("f", [sym!("x"), sym!("y")]),
        ]);

        assert_eq!(heads(generic_rule.get_applicable_rules(&[term!(1)])), vec!["f(x)", "f(1)"]);
        assert_eq!(
            heads(generic_rule.get_applicable_rules(&[var!("a")])),
            vec!["f(x)", "f(1)", "f(2)"]
        );
        assert_eq!(
            heads(generic_rule.get_applicable_rules(&[term!(3), term!(4)])),
            vec!["f(x, y)"]
        );
        assert!(generic_rule.get_applicable_rules(&[]).is_empty());
        assert_eq!(generic_rule.rules_with_arity(1).len(), 3);
        assert!(generic_rule.rules_with_arity(3).is_empty());
    }

    #[test]
    fn test_integral_float_argument_finds_integer_rule() {
        let generic_rule = generic_rule(vec![
            rule!("f", [9007199254740992]),
            rule!("f", [1]),
        ]);
        assert_eq!(
            heads(generic_rule.get_applicable_rules(&[term!(9007199254740992.0)])),
            vec!["f(9007199254740992)"]
        );
        assert_eq!(heads(generic_rule.get_applicable_rules(&[term!(1.0)])), vec!["f(1)"]);
    }
}
