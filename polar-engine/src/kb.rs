use std::collections::HashMap;
use std::sync::Arc;

pub use super::bindings::Bindings;
use super::counter::Counter;
use super::error::{LoadError, ParameterError, PolarResult};
use super::rule_types::{RuleType, RuleTypes};
use super::rules::*;
use super::sources::*;
use super::terms::*;

/// Everything a query runs against: rules, rule types, constants and class hierarchies.
///
/// Rules and rule types come from loaded policies and are dropped by `clear_rules`.
/// Constants and MROs are registered by the host and survive it.
#[derive(Default)]
pub struct KnowledgeBase {
    constants: Bindings,
    /// Constant naming each registered host class, by class id.
    class_names: HashMap<u64, Symbol>,
    /// Method resolution order of each registered class, as host class ids,
    /// starting with the class itself.
    pub mro: HashMap<Symbol, Vec<u64>>,

    rules: HashMap<Symbol, GenericRule>,
    pub(crate) rule_types: RuleTypes,
    pub sources: Sources,
    pub inline_queries: Vec<Term>,
    loaded: bool,

    gensyms: Counter,
    /// Call, instance and source ids.
    ids: Counter,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh id, exactly representable as a double.
    pub fn new_id(&self) -> u64 {
        self.ids.next()
    }

    /// A fresh temporary name. Every generated name starts with `_`.
    pub fn gensym(&self, prefix: &str) -> Symbol {
        let n = self.gensyms.next();
        match prefix {
            "_" => Symbol(format!("_{}", n)),
            p if p.starts_with('_') => Symbol(format!("{}_{}", p, n)),
            p => Symbol(format!("_{}_{}", p, n)),
        }
    }

    /// Names starting with `_` are reserved for temporaries. A host instance registered here
    /// is treated as a class: its id becomes the class id of `name`.
    pub fn register_constant(&mut self, name: Symbol, value: Term) -> PolarResult<()> {
        if name.is_temporary_var() {
            let msg = format!(
                "Cannot register constant `{}`: names starting with `_` are reserved",
                name
            );
            return Err(ParameterError(msg).into());
        }
        if let Value::ExternalInstance(instance) = value.value() {
            self.class_names.insert(instance.instance_id, name.clone());
        }
        self.constants.insert(name, value);
        Ok(())
    }

    pub fn is_constant(&self, name: &Symbol) -> bool {
        self.constants.contains_key(name)
    }

    pub fn get_registered_constants(&self) -> &Bindings {
        &self.constants
    }

    pub fn add_mro(&mut self, name: Symbol, mro: Vec<u64>) -> PolarResult<()> {
        if !self.is_constant(&name) {
            return Err(LoadError::UnregisteredClass { name }.into());
        }
        self.mro.insert(name, mro);
        Ok(())
    }

    pub fn get_class_id_for_symbol(&self, name: &Symbol) -> Option<u64> {
        match self.constants.get(name)?.value() {
            Value::ExternalInstance(instance) => Some(instance.instance_id),
            _ => None,
        }
    }

    pub fn get_symbol_for_class_id(&self, id: u64) -> Option<&Symbol> {
        self.class_names.get(&id)
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules
            .entry(rule.name.clone())
            .or_insert_with_key(|name| GenericRule::new(name.clone()))
            .add_rule(Arc::new(rule));
    }

    pub fn get_rules(&self) -> &HashMap<Symbol, GenericRule> {
        &self.rules
    }

    pub fn get_generic_rule(&self, name: &Symbol) -> Option<&GenericRule> {
        self.rules.get(name)
    }

    /// Rules callable as `name` with `arity` arguments, in the order they were loaded.
    ///
    /// Load-time checks use this to decide whether a call in a rule body can ever succeed.
    /// Hosts can use it to inspect what a loaded policy defines.
    pub fn lookup(&self, name: &Symbol, arity: usize) -> Rules {
        match self.rules.get(name) {
            Some(generic_rule) => generic_rule.rules_with_arity(arity),
            None => vec![],
        }
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Declare a rule type. Its body must be empty.
    pub fn add_rule_type(&mut self, rule_type: Rule, required: bool) -> PolarResult<()> {
        self.rule_types.add(rule_type, required)
    }

    /// Rule types declared for `name`, in declaration order.
    pub fn get_rule_types(&self, name: &Symbol) -> &[RuleType] {
        self.rule_types.get(name)
    }

    /// Register a policy document, returning its source id.
    pub fn add_source(&mut self, filename: Option<&str>, fingerprint: u64) -> PolarResult<u64> {
        let src_id = self.new_id();
        if let Err(msg) = self.sources.add_source(src_id, filename, fingerprint) {
            return Err(LoadError::DuplicateSource { msg }.into());
        }
        Ok(src_id)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Forget everything that came from policies.
    pub fn clear_rules(&mut self) {
        self.rules.clear();
        self.rule_types.clear();
        self.sources = Sources::default();
        self.inline_queries.clear();
        self.loaded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn class(id: u64) -> Term {
        term!(ExternalInstance {
            instance_id: id,
            constructor: None,
            repr: None,
            class_id: None,
        })
    }

    #[test]
    fn test_gensym() {
        let kb = KnowledgeBase::new();
        let names: Vec<Symbol> = ["_", "_value", "x"].iter().map(|p| kb.gensym(p)).collect();
        assert_eq!(names, vec![sym!("_1"), sym!("_value_2"), sym!("_x_3")]);
        assert!(names.iter().all(Symbol::is_temporary_var));
    }

    #[test]
    fn test_lookup_by_name_and_arity() {
        let mut kb = KnowledgeBase::new();
        kb.add_rule(rule!("f", [1]));
        kb.add_rule(rule!("f", [sym!("x"), sym!("y")]));
        kb.add_rule(rule!("g", [1]));
        kb.add_rule(rule!("f", [2]));
        kb.add_rule(rule!("f", [3]));

        let heads: Vec<String> = kb
            .lookup(&sym!("f"), 1)
            .iter()
            .map(|rule| rule.head().to_string())
            .collect();
        assert_eq!(heads, vec!["f(1)", "f(2)", "f(3)"]);
        assert_eq!(kb.lookup(&sym!("f"), 2).len(), 1);
        assert!(kb.lookup(&sym!("f"), 3).is_empty());
        assert!(kb.lookup(&sym!("h"), 1).is_empty());
    }

    #[test]
    fn test_constants_and_mro() {
        let mut kb = KnowledgeBase::new();
        let err = kb.add_mro(sym!("User"), vec![10]).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Load(LoadError::UnregisteredClass { .. })
        ));

        kb.register_constant(sym!("User"), class(10)).unwrap();
        kb.register_constant(sym!("limit"), term!(5)).unwrap();
        assert!(kb.register_constant(sym!("_hidden"), term!(1)).is_err());
        kb.add_mro(sym!("User"), vec![10, 11]).unwrap();

        assert!(kb.is_constant(&sym!("limit")));
        assert_eq!(kb.get_registered_constants().get(&sym!("limit")), Some(&term!(5)));
        assert_eq!(kb.get_class_id_for_symbol(&sym!("User")), Some(10));
        assert_eq!(kb.get_class_id_for_symbol(&sym!("limit")), None);
        assert_eq!(kb.get_symbol_for_class_id(10), Some(&sym!("User")));
        assert_eq!(kb.mro[&sym!("User")], vec![10, 11]);
        assert_eq!(kb.get_registered_constants().len(), 2);
    }

    #[test]
    fn test_clear_rules_keeps_constants() {
        let mut kb = KnowledgeBase::new();
        kb.register_constant(sym!("limit"), term!(5)).unwrap();
        kb.add_rule(rule!("f", [1]));
        kb.add_rule_type(rule!("f", [sym!("x")]), true).unwrap();
        kb.add_source(Some("a.polar"), 1).unwrap();
        kb.inline_queries.push(term!(true));
        kb.mark_loaded();

        kb.clear_rules();
        assert!(!kb.has_rules());
        assert!(kb.get_rule_types(&sym!("f")).is_empty());
        assert!(!kb.is_loaded());
        assert!(kb.sources.is_empty());
        assert!(kb.inline_queries.is_empty());
        assert!(kb.is_constant(&sym!("limit")));
        // The same file can be loaded again.
        kb.add_source(Some("a.polar"), 1).unwrap();
    }
}
