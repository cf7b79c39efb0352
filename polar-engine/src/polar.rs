use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use super::config::QueryConfig;
use super::diagnostic::Diagnostic;
use super::error::{LoadError, PolarResult};
use super::kb::*;
use super::messages::*;
use super::policy::{Policy, RuleTypeDecl};
use super::query::Query;
use super::rewrites::*;
use super::terms::*;
use super::validations::{check_singletons, check_undefined_rule_calls, validate_rule};
use super::vm::*;

/// The engine a host embeds: one knowledge base, loaded once, queried many times.
pub struct Polar {
    pub kb: Arc<RwLock<KnowledgeBase>>,
    messages: MessageQueue,
    config: QueryConfig,
}

impl Default for Polar {
    fn default() -> Self {
        Self::new()
    }
}

/// Add one policy document to `kb`. Singleton warnings are returned; the first error stops
/// the document.
fn load_policy(kb: &mut KnowledgeBase, policy: Policy) -> PolarResult<Vec<Diagnostic>> {
    let fingerprint = policy.fingerprint()?;
    let Policy {
        filename,
        rules,
        queries,
        rule_types,
    } = policy;
    let filename = filename.as_deref();
    let src_id = kb.add_source(filename, fingerprint)?;
    debug!(src_id, file = filename.unwrap_or("<none>"), "loading policy");

    for RuleTypeDecl { rule, required } in rule_types {
        let rule_type = rule.into_rule(filename);
        validate_rule(&rule_type)?;
        kb.add_rule_type(rule_type, required)?;
    }

    let mut warnings = vec![];
    for compiled in rules {
        let rule = compiled.into_rule(filename);
        validate_rule(&rule)?;
        warnings.extend(check_singletons(&rule, kb));
        let rule = rewrite_rule(rule, kb);
        debug!(rule = %rule, "loaded rule");
        kb.add_rule(rule);
    }
    kb.inline_queries.extend(queries);
    Ok(warnings)
}

/// Load every document, then run the checks that need all of them: rule types, and calls
/// to rules no document defines. Rules stay in `kb` even when errors are reported.
fn load_all(kb: &mut KnowledgeBase, policies: Vec<Policy>) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = policies
        .into_iter()
        .flat_map(|policy| match load_policy(kb, policy) {
            Ok(warnings) => warnings,
            Err(e) => vec![Diagnostic::Error(e)],
        })
        .collect();
    if diagnostics.iter().any(Diagnostic::is_error) {
        return diagnostics;
    }
    match kb.validate_rule_types() {
        Ok(()) => diagnostics.extend(check_undefined_rule_calls(kb)),
        Err(e) => diagnostics.push(Diagnostic::Error(e)),
    }
    diagnostics
}

impl Polar {
    /// Queries are configured from the environment.
    pub fn new() -> Self {
        Self::with_config(QueryConfig::from_env())
    }

    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            kb: Arc::new(RwLock::new(KnowledgeBase::new())),
            messages: MessageQueue::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Load compiled policies, all at once. Loading again needs `clear_rules` first.
    ///
    /// Warnings go to the message queue. On the first error nothing stays loaded.
    pub fn load(&self, policies: Vec<Policy>) -> PolarResult<()> {
        let mut kb = self.kb.write()?;
        if kb.is_loaded() {
            return Err(LoadError::MultipleLoad.into());
        }

        let mut first_error = None;
        for diagnostic in load_all(&mut kb, policies) {
            match diagnostic {
                Diagnostic::Warning(warning) => {
                    warn!("{}", warning);
                    self.messages.push(MessageKind::Warning, warning.to_string());
                }
                Diagnostic::Error(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => {
                kb.clear_rules();
                Err(e)
            }
            None => {
                kb.mark_loaded();
                info!(sources = kb.sources.len(), "policies loaded");
                Ok(())
            }
        }
    }

    /// Load one policy document or a list of them from their JSON form.
    pub fn load_json(&self, src: &str) -> PolarResult<()> {
        self.load(Policy::from_json(src)?)
    }

    /// Drop everything loaded from policies. Constants and MROs stay registered.
    pub fn clear_rules(&self) -> PolarResult<()> {
        self.kb.write()?.clear_rules();
        Ok(())
    }

    /// The next query a loaded policy declared, in declaration order.
    pub fn next_inline_query(&self) -> PolarResult<Option<Query>> {
        let next = {
            let mut kb = self.kb.write()?;
            match kb.inline_queries.is_empty() {
                true => None,
                false => Some(kb.inline_queries.remove(0)),
            }
        };
        next.map(|term| self.new_query_from_term(term)).transpose()
    }

    pub fn new_query_from_term(&self, term: Term) -> PolarResult<Query> {
        let term = rewrite_term(term, &*self.kb.read()?);
        let goals = vec![Goal::Query { term: term.clone() }];
        let vm = PolarVirtualMachine::new(
            self.kb.clone(),
            self.config.clone(),
            goals,
            self.messages.clone(),
        )?;
        Ok(Query::new(vm, term))
    }

    /// An id for a new host instance, from the same sequence as call ids.
    pub fn get_external_id(&self) -> PolarResult<u64> {
        Ok(self.kb.read()?.new_id())
    }

    pub fn register_constant(&self, name: Symbol, value: Term) -> PolarResult<()> {
        self.kb.write()?.register_constant(name, value)
    }

    /// `mro` lists class ids from the class registered as `name` out to its furthest
    /// ancestor.
    pub fn register_mro(&self, name: Symbol, mro: Vec<u64>) -> PolarResult<()> {
        self.kb.write()?.add_mro(name, mro)
    }

    pub fn next_message(&self) -> Option<Message> {
        self.messages.next()
    }
}
