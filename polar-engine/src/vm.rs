//! The goal-stack machine that evaluates queries.
//!
//! A query runs as a stack of goals. A goal with several ways to succeed pushes a choice point
//! holding snapshots of the machine's stacks, and backtracking restores the latest snapshot and
//! resumes with its next alternative. A goal the engine cannot decide alone ends `run` with a
//! host event. The host's answer is fed back in before the next `run`.

use std::collections::HashMap;
use std::fmt::{self, Write};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Instant;

use tracing::{debug, info, trace, Level};

use crate::bindings::{BindingManager, Bindings, UnifyOutcome, VariableState};
use crate::config::{LogLevel, QueryConfig};
use crate::error::{invalid_state_error, unsupported, ErrorKind, ParameterError, PolarError};
use crate::error::{PolarResult, RuntimeError};
use crate::events::QueryEvent;
use crate::folder::Folder;
use crate::kb::KnowledgeBase;
use crate::messages::{MessageKind, MessageQueue};
use crate::rewrites::Renamer;
use crate::rules::{Parameter, Rule, Rules};
use crate::runnable::Runnable;
use crate::terms::*;

#[derive(Debug, Clone)]
#[must_use = "ignored goals are never accomplished"]
#[allow(clippy::large_enum_variant)]
pub enum Goal {
    Query {
        term: Term,
    },
    PopQuery,
    Unify {
        left: Term,
        right: Term,
    },
    Isa {
        left: Term,
        right: Term,
    },
    Backtrack,
    /// Drop every choice at or above `choice_index`.
    Cut {
        choice_index: usize,
    },
    Halt,
    Error {
        error: PolarError,
    },
    Debug {
        message: String,
    },
    /// `field` on a dictionary, bound or unbound.
    Lookup {
        dict: Dictionary,
        field: Term,
        value: Term,
    },
    LookupExternal {
        call_id: u64,
        instance: Term,
        field: Term,
    },
    IsaExternal {
        instance: Term,
        literal: InstanceLiteral,
    },
    /// Check `candidates` one at a time against `args`, collecting the applicable ones in `kept`.
    FilterRules {
        args: TermList,
        candidates: Rules,
        kept: Rules,
    },
    /// One step of an insertion sort by specificity. `rules[..sorted]` is in order, and the
    /// rule that started at `sorted` now sits at `at`.
    SortRules {
        args: TermList,
        rules: Rules,
        sorted: usize,
        at: usize,
    },
    IsMoreSpecific {
        left: Arc<Rule>,
        right: Arc<Rule>,
        args: TermList,
    },
    /// Sets `answer` when `left` is the more specific of two specializers for `arg`.
    IsSubspecializer {
        answer: Symbol,
        left: Term,
        right: Term,
        arg: Term,
    },
    /// A `cut` in the rule body truncates the choice stack to `choice_index`.
    EnterRule {
        rule: Arc<Rule>,
        choice_index: usize,
    },
    ExitRule,
}

pub type Goals = Vec<Goal>;

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Goal::Query { term } => write!(f, "Query({})", term),
            Goal::Unify { left, right } => write!(f, "Unify({}, {})", left, right),
            Goal::Isa { left, right } => write!(f, "Isa({}, {})", left, right),
            Goal::Cut { choice_index } => write!(f, "Cut({})", choice_index),
            Goal::Lookup { dict, field, value } => {
                write!(f, "Lookup({}, {}, {})", dict, field, value)
            }
            Goal::LookupExternal {
                call_id,
                instance,
                field,
            } => write!(f, "LookupExternal({}, {}, {})", call_id, instance, field),
            Goal::IsaExternal { instance, literal } => {
                write!(f, "IsaExternal({}, {})", instance, literal)
            }
            Goal::FilterRules {
                candidates, kept, ..
            } => write!(f, "FilterRules({} kept, {} left)", kept.len(), candidates.len()),
            Goal::SortRules {
                rules, sorted, at, ..
            } => write!(f, "SortRules({} rules, {}, {})", rules.len(), sorted, at),
            Goal::IsMoreSpecific { left, right, .. } => {
                write!(f, "IsMoreSpecific({}, {})", left.head(), right.head())
            }
            Goal::IsSubspecializer {
                left, right, arg, ..
            } => write!(f, "IsSubspecializer({}, {}, {})", left, right, arg),
            Goal::EnterRule { rule, .. } => write!(f, "EnterRule({})", rule.head()),
            Goal::Error { error } => write!(f, "Error({})", error),
            Goal::Debug { message } => write!(f, "Debug({})", message),
            Goal::PopQuery => f.write_str("PopQuery"),
            Goal::Backtrack => f.write_str("Backtrack"),
            Goal::Halt => f.write_str("Halt"),
            Goal::ExitRule => f.write_str("ExitRule"),
        }
    }
}

/// Goals in execution order from the top: the last element runs next.
type GoalStack = Vec<Arc<Goal>>;

fn goal_stack(goals: Goals) -> GoalStack {
    goals.into_iter().rev().map(Arc::new).collect()
}

#[derive(Clone, Debug)]
struct ChoicePoint {
    /// Untried alternatives. The next one is last.
    alternatives: Vec<GoalStack>,
    bsp: usize,
    goals: GoalStack,
    queries: TermList,
    rule_frames: Vec<usize>,
}

fn unbound(var: &Symbol) -> PolarError {
    RuntimeError::UnboundVariable { sym: var.clone() }.into()
}

/// Conjunctions of fewer than two goals add nothing to logs or traces.
fn is_trivial_conjunction(term: &Term) -> bool {
    matches!(term.value(), Value::Expression(op) if op.operator == Operator::And && op.args.len() < 2)
}

/// Booleans compare as 0 and 1. Structured values only support (in)equality, and only once
/// fully bound. `None` when the operands cannot be compared with `op`.
fn compare(op: Operator, left: &Value, right: &Value) -> Option<bool> {
    fn ordered<T: PartialOrd + ?Sized>(op: Operator, l: &T, r: &T) -> Option<bool> {
        use Operator::*;
        Some(match op {
            Lt => l < r,
            Leq => l <= r,
            Gt => l > r,
            Geq => l >= r,
            Eq => l == r,
            Neq => l != r,
            _ => return None,
        })
    }
    let number = |value: &Value| match value {
        Value::Number(n) => Some(*n),
        Value::Boolean(b) => Some(Numeric::Integer(i64::from(*b))),
        _ => None,
    };

    if let (Some(l), Some(r)) = (number(left), number(right)) {
        return ordered(op, &l, &r);
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => ordered(op, l.as_str(), r.as_str()),
        _ if matches!(op, Operator::Eq | Operator::Neq) && left.is_ground() && right.is_ground() => {
            Some((left == right) == (op == Operator::Eq))
        }
        _ => None,
    }
}

/// Unify each argument with its parameter, then match it against the specializer.
fn match_head(args: &[Term], params: &[Parameter]) -> Goals {
    let mut goals = vec![];
    for (arg, param) in args.iter().zip(params) {
        goals.push(Goal::Unify {
            left: arg.clone(),
            right: param.parameter.clone(),
        });
        if let Some(specializer) = &param.specializer {
            goals.push(Goal::Isa {
                left: param.parameter.clone(),
                right: specializer.clone(),
            });
        }
    }
    goals
}

/// The registered MRO of the host class `instance` belongs to.
fn registered_mro<'kb>(kb: &'kb KnowledgeBase, instance: &ExternalInstance) -> Option<&'kb [u64]> {
    let class = kb.get_symbol_for_class_id(instance.class_id?)?;
    kb.mro.get(class).map(Vec::as_slice)
}

struct HideTemporaries;

impl Folder for HideTemporaries {
    fn fold_variable(&mut self, var: Symbol) -> Symbol {
        if var.is_temporary_var() {
            Symbol::new("_")
        } else {
            var
        }
    }
}

fn describe_result(bindings: &Bindings) -> String {
    if bindings.is_empty() {
        return "RESULT: SUCCESS".to_owned();
    }
    let mut vars: Vec<_> = bindings.iter().collect();
    vars.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = "RESULT: {".to_owned();
    for (var, value) in vars {
        let _ = write!(out, "\n  {}: {}", var, value);
    }
    out.push_str("\n}");
    out
}

#[derive(Clone)]
pub struct PolarVirtualMachine {
    goals: GoalStack,
    choices: Vec<ChoicePoint>,
    /// Terms being queried, innermost last. Feeds stack traces and error locations.
    queries: TermList,
    /// Choice stack height when each active rule was entered.
    rule_frames: Vec<usize>,
    bindings: BindingManager,

    /// Variables of the original query, reported in each result.
    query_vars: Vec<Symbol>,
    /// Result variable of each outstanding host call.
    pending_calls: HashMap<u64, Symbol>,

    started: Option<Instant>,
    steps: u64,
    config: QueryConfig,

    pub kb: Arc<RwLock<KnowledgeBase>>,
    pub messages: MessageQueue,
}

impl PolarVirtualMachine {
    /// `goals` run first to last. Registered constants are bound before anything runs.
    pub fn new(
        kb: Arc<RwLock<KnowledgeBase>>,
        config: QueryConfig,
        goals: Goals,
        messages: MessageQueue,
    ) -> PolarResult<Self> {
        let constants = kb.read()?.get_registered_constants().clone();

        let mut query_vars: Vec<Symbol> = vec![];
        for goal in &goals {
            if let Goal::Query { term } = goal {
                for var in term.ordered_variables() {
                    if !var.is_temporary_var()
                        && !constants.contains_key(&var)
                        && !query_vars.contains(&var)
                    {
                        query_vars.push(var);
                    }
                }
            }
        }

        let mut bindings = BindingManager::new();
        for (name, value) in constants {
            bindings.bind(&name, value)?;
        }

        Ok(Self {
            goals: goal_stack(goals),
            choices: vec![],
            queries: vec![],
            rule_frames: vec![],
            bindings,
            query_vars,
            pending_calls: HashMap::new(),
            started: None,
            steps: 0,
            config,
            kb,
            messages,
        })
    }

    #[cfg(test)]
    pub fn new_test(kb: Arc<RwLock<KnowledgeBase>>, goals: Goals) -> Self {
        let config = QueryConfig {
            timeout_ms: 0,
            ..QueryConfig::default()
        };
        PolarVirtualMachine::new(kb, config, goals, MessageQueue::new()).unwrap()
    }

    #[cfg(test)]
    fn is_halted(&self) -> bool {
        self.goals.is_empty() && self.choices.is_empty()
    }

    fn kb(&self) -> PolarResult<RwLockReadGuard<KnowledgeBase>> {
        Ok(self.kb.read()?)
    }

    fn gensym(&self, prefix: &str) -> PolarResult<Symbol> {
        Ok(self.kb()?.gensym(prefix))
    }

    /// Register `answer` as the variable that receives the host's answer to a new call.
    fn host_call(&mut self, answer: &Symbol) -> PolarResult<u64> {
        let call_id = self.kb()?.new_id();
        self.pending_calls.insert(call_id, answer.clone());
        Ok(call_id)
    }

    /// A yes/no question for the host. The answer starts out `false`, and the goal pushed here
    /// only succeeds once the host answers yes.
    fn host_question(&mut self, prefix: &str) -> PolarResult<u64> {
        let answer = self.gensym(prefix)?;
        self.bindings.bind(&answer, Term::from(false))?;
        let call_id = self.host_call(&answer)?;
        self.push_goal(Goal::Unify {
            left: Term::from(answer),
            right: Term::from(true),
        })?;
        Ok(call_id)
    }

    fn answered_call(&mut self, call_id: u64) -> PolarResult<Symbol> {
        self.pending_calls.remove(&call_id).ok_or_else(|| {
            ParameterError(format!("unregistered external call ID {}", call_id)).into()
        })
    }

    fn push_goal(&mut self, goal: Goal) -> PolarResult<()> {
        let limit = self.config.stack_limit;
        if self.goals.len() >= limit {
            let msg = format!("Goal stack overflow! MAX_GOALS = {}", limit);
            return Err(RuntimeError::StackOverflow { msg }.into());
        }
        self.goals.push(Arc::new(goal));
        Ok(())
    }

    /// The first goal runs next.
    fn push_goals(&mut self, goals: Goals) -> PolarResult<()> {
        for goal in goals.into_iter().rev() {
            self.push_goal(goal)?;
        }
        Ok(())
    }

    /// Alternatives run in order on later backtracks. Goals already on the stack run after
    /// each of them.
    fn push_choice(&mut self, alternatives: Vec<Goals>) -> PolarResult<()> {
        let limit = self.config.stack_limit;
        if self.choices.len() >= limit {
            let msg = format!("Too many choices. MAX_CHOICES = {}", limit);
            return Err(RuntimeError::StackOverflow { msg }.into());
        }
        self.choices.push(ChoicePoint {
            alternatives: alternatives.into_iter().rev().map(goal_stack).collect(),
            bsp: self.bindings.bsp(),
            goals: self.goals.clone(),
            queries: self.queries.clone(),
            rule_frames: self.rule_frames.clone(),
        });
        Ok(())
    }

    /// Run the first alternative now and leave the rest to backtracking. With no alternatives,
    /// fail.
    fn choose(&mut self, alternatives: Vec<Goals>) -> PolarResult<()> {
        let mut alternatives = alternatives.into_iter();
        match alternatives.next() {
            Some(first) => {
                let rest: Vec<Goals> = alternatives.collect();
                if !rest.is_empty() {
                    self.push_choice(rest)?;
                }
                self.push_goals(first)
            }
            None => self.backtrack(),
        }
    }

    /// Run `then` if every goal of `condition` succeeds, otherwise `otherwise`. Either branch
    /// starts from the state before `condition`, so its bindings never leak.
    fn if_then_else(&mut self, mut condition: Goals, then: Goals, mut otherwise: Goals) -> PolarResult<()> {
        let then_index = self.choices.len();
        self.push_choice(vec![then])?;
        let otherwise_index = self.choices.len();

        condition.push(Goal::Cut {
            choice_index: otherwise_index,
        });
        condition.push(Goal::Backtrack);
        otherwise.insert(
            0,
            Goal::Cut {
                choice_index: then_index,
            },
        );
        self.choose(vec![condition, otherwise])
    }

    /// A copy of `rule` with fresh variables.
    fn renamed(&self, rule: &Rule) -> PolarResult<Rule> {
        let kb = self.kb()?;
        Ok(Renamer::new(&kb).fold_rule(rule.clone()))
    }

    fn shown(&self, terms: &[Term]) -> String {
        terms
            .iter()
            .map(|term| self.bindings.deep_deref(term).to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn print(&self, message: String) {
        if self.config.log_stderr {
            eprintln!("{}", message);
        } else {
            self.messages.push(MessageKind::Print, message);
        }
    }

    /// Emit through `tracing`, and into the message queue when the query's log level allows.
    /// `message` is only built when one of them will use it.
    fn log<M: AsRef<str>>(&self, level: LogLevel, message: impl FnOnce() -> M) {
        let queued = self
            .config
            .log_level
            .map_or(false, |min| min.should_print_on_level(level));
        let traced = match level {
            LogLevel::Trace => tracing::enabled!(Level::TRACE),
            LogLevel::Debug => tracing::enabled!(Level::DEBUG),
            LogLevel::Info => tracing::enabled!(Level::INFO),
        };
        if !queued && !traced {
            return;
        }

        let message = message();
        let message = message.as_ref();
        let depth = self.queries.len();
        match level {
            LogLevel::Trace => trace!(depth, "{}", message),
            LogLevel::Debug => debug!(depth, "{}", message),
            LogLevel::Info => info!(depth, "{}", message),
        }
        if queued {
            let indent = "  ".repeat(depth + 1);
            for line in message.lines() {
                self.print(format!("[polar][{}] {}{}", level, indent, line));
            }
        }
    }

    pub(crate) fn stack_trace(&self) -> String {
        let mut trace = "trace (most recent evaluation last):".to_owned();
        let shown = self.queries.iter().filter(|q| !is_trivial_conjunction(q));
        for (depth, term) in shown.enumerate() {
            let _ = write!(trace, "\n  {:03}: {}", depth, term);
            if let Some(location) = term.location() {
                let _ = write!(trace, "\n   {}", location);
            }
        }
        trace
    }

    fn check_budget(&mut self) -> PolarResult<()> {
        self.steps += 1;
        if let Some(limit) = self.config.max_steps {
            if self.steps > limit {
                return Err(RuntimeError::StepLimitExceeded { limit }.into());
            }
        }
        let timeout = self.config.timeout_ms;
        if timeout > 0 {
            let elapsed = self
                .started
                .map_or(0, |start| start.elapsed().as_millis() as u64);
            if elapsed > timeout {
                return Err(RuntimeError::QueryTimeout { elapsed, timeout }.into());
            }
        }
        Ok(())
    }

    fn type_error<T>(&self, term: &Term, msg: String) -> PolarResult<T> {
        let error = RuntimeError::TypeError {
            msg,
            stack_trace: Some(self.stack_trace()),
        };
        Err(PolarError::from(error).with_location(term.location()))
    }

    /// Add the stack trace and the innermost known location to an error leaving `run`.
    fn decorate_error(&self, mut error: PolarError) -> PolarError {
        if let ErrorKind::Runtime(runtime @ RuntimeError::TypeError { stack_trace: None, .. }) =
            &mut error.kind
        {
            runtime.add_stack_trace(self.stack_trace());
        }
        let location = self.queries.iter().rev().find_map(|term| term.location());
        error.with_location(location)
    }

    /// Each query variable's value. Unbound temporaries inside values show as `_`.
    fn result_bindings(&self) -> Bindings {
        self.query_vars
            .iter()
            .map(|var| {
                let term = Term::new_from_ffi(Value::Variable(var.clone()));
                let value = self.bindings.deep_deref(&term);
                let value = match value.value() {
                    Value::Variable(root) if root.is_temporary_var() => term,
                    _ => HideTemporaries.fold_term(value),
                };
                (var.clone(), value)
            })
            .collect()
    }

    fn step(&mut self, goal: Arc<Goal>) -> PolarResult<QueryEvent> {
        self.check_budget()?;
        self.log(LogLevel::Trace, || goal.to_string());

        match goal.as_ref() {
            Goal::Query { term } => return self.query(term),
            Goal::PopQuery => {
                self.queries.pop();
            }
            Goal::Unify { left, right } => self.unify(left, right)?,
            Goal::Isa { left, right } => self.isa(left, right)?,
            Goal::Backtrack => self.backtrack()?,
            Goal::Cut { choice_index } => self.choices.truncate(*choice_index),
            Goal::Halt => {
                self.log(LogLevel::Trace, || "HALT");
                self.goals.clear();
                self.choices.clear();
                return Ok(QueryEvent::Done { result: true });
            }
            Goal::Error { error } => return Err(error.clone()),
            Goal::Debug { message } => {
                // Time paused in the host does not count against the query.
                self.started = None;
                return Ok(QueryEvent::Debug {
                    message: message.clone(),
                });
            }
            Goal::Lookup { dict, field, value } => self.lookup(dict, field, value)?,
            Goal::LookupExternal {
                call_id,
                instance,
                field,
            } => return self.lookup_external(*call_id, instance, field),
            Goal::IsaExternal { instance, literal } => {
                let call_id = self.host_question("isa")?;
                return Ok(QueryEvent::ExternalIsa {
                    call_id,
                    instance: self.bindings.deep_deref(instance),
                    class_tag: literal.tag.clone(),
                });
            }
            Goal::FilterRules {
                args,
                candidates,
                kept,
            } => self.filter_rules(args, candidates, kept)?,
            Goal::SortRules {
                args,
                rules,
                sorted,
                at,
            } => self.sort_rules(args, rules, *sorted, *at)?,
            Goal::IsMoreSpecific { left, right, args } => {
                self.is_more_specific(left, right, args)?
            }
            Goal::IsSubspecializer {
                answer,
                left,
                right,
                arg,
            } => return self.is_subspecializer(answer, left, right, arg),
            Goal::EnterRule { rule, choice_index } => {
                self.log(LogLevel::Info, || format!("RULE: {}", rule));
                self.rule_frames.push(*choice_index);
            }
            Goal::ExitRule => {
                self.rule_frames.pop();
            }
        }
        Ok(QueryEvent::None)
    }

    /// Undo bindings back to the latest choice point and resume with its next alternative.
    /// With no choice points left, halt.
    fn backtrack(&mut self) -> PolarResult<()> {
        self.log(LogLevel::Trace, || "BACKTRACK");
        while let Some(mut choice) = self.choices.pop() {
            self.bindings.backtrack(choice.bsp);
            let alternative = match choice.alternatives.pop() {
                Some(alternative) => alternative,
                None => continue,
            };
            self.goals.clone_from(&choice.goals);
            self.queries.clone_from(&choice.queries);
            self.rule_frames.clone_from(&choice.rule_frames);
            self.goals.extend(alternative);
            if !choice.alternatives.is_empty() {
                self.choices.push(choice);
            }
            return Ok(());
        }
        self.push_goal(Goal::Halt)
    }

    fn query(&mut self, term: &Term) -> PolarResult<QueryEvent> {
        match term.value() {
            Value::Call(call) => self.log(LogLevel::Info, || format!("QUERY RULE: {}", call)),
            _ if is_trivial_conjunction(term) => {}
            _ => self.log(LogLevel::Trace, || format!("QUERY: {}", term)),
        }
        self.queries.push(term.clone());
        self.push_goal(Goal::PopQuery)?;

        match term.value() {
            Value::Call(call) => self.call_rule(call)?,
            Value::Expression(op) => return self.query_operation(term, op),
            Value::Variable(var) => match self.bindings.variable_state(var) {
                VariableState::Bound(value) => self.push_goal(Goal::Query { term: value })?,
                VariableState::Unbound => return Err(unbound(var)),
            },
            Value::Boolean(true) => {}
            Value::Boolean(false) => self.push_goal(Goal::Backtrack)?,
            _ => {
                return self.type_error(
                    term,
                    format!(
                        "{} isn't something that is true or false so can't be a condition",
                        term
                    ),
                )
            }
        }
        Ok(QueryEvent::None)
    }

    /// Start filtering the rules the index does not already rule out.
    fn call_rule(&mut self, call: &Call) -> PolarResult<()> {
        let candidates = {
            let kb = self.kb()?;
            let generic_rule =
                kb.get_generic_rule(&call.name)
                    .ok_or_else(|| RuntimeError::UnknownRule {
                        name: call.name.clone(),
                    })?;
            let args: TermList = call
                .args
                .iter()
                .map(|arg| self.bindings.deep_deref(arg))
                .collect();
            generic_rule.get_applicable_rules(&args)
        };
        self.push_goal(Goal::FilterRules {
            args: call.args.clone(),
            candidates,
            kept: vec![],
        })
    }

    fn query_operation(&mut self, term: &Term, op: &Operation) -> PolarResult<QueryEvent> {
        use Operator::*;
        let args = &op.args;
        let expect_arity = |arity: usize| {
            if args.len() == arity {
                Ok(())
            } else {
                invalid_state_error(format!("`{}` expects {} operands: {}", op.operator, arity, term))
            }
        };

        match op.operator {
            And => self.push_goals(args.iter().map(|t| Goal::Query { term: t.clone() }).collect())?,
            Or => self.choose(
                args.iter()
                    .map(|t| vec![Goal::Query { term: t.clone() }])
                    .collect(),
            )?,
            Not => {
                expect_arity(1)?;
                let inner = Goal::Query {
                    term: args[0].clone(),
                };
                self.if_then_else(vec![inner], vec![Goal::Backtrack], vec![])?
            }
            ForAll => {
                expect_arity(2)?;
                // forall(c, a) holds when `c and not a` has no solution.
                let expression = |op| term.clone_with_value(Value::Expression(op));
                let fails = expression(op!(Not, args[1].clone()));
                let counterexample = expression(op!(And, args[0].clone(), fails));
                self.push_goal(Goal::Query {
                    term: expression(op!(Not, counterexample)),
                })?
            }
            Unify | Isa => {
                expect_arity(2)?;
                let (left, right) = (args[0].clone(), args[1].clone());
                self.push_goal(match op.operator {
                    Unify => Goal::Unify { left, right },
                    _ => Goal::Isa { left, right },
                })?
            }
            Assign => {
                expect_arity(2)?;
                self.assign(&args[0], &args[1])?
            }
            Cut => {
                // Discards every choice made since the enclosing rule was entered, including
                // that rule's remaining alternatives.
                let choice_index = self.rule_frames.last().copied().unwrap_or(0);
                self.push_goal(Goal::Cut { choice_index })?
            }
            Print => self.print(self.shown(args)),
            Debug => {
                let message = format!("debug({})", self.shown(args));
                self.push_goal(Goal::Debug { message })?
            }
            Dot => {
                expect_arity(3)?;
                self.dot(&args[0], &args[1], &args[2])?
            }
            In => {
                expect_arity(2)?;
                self.member(&args[0], &args[1])?
            }
            Eq | Neq | Gt | Geq | Lt | Leq => {
                expect_arity(2)?;
                return self.comparison(term, op.operator, args);
            }
            Add | Sub | Mul | Div | Mod | Rem => {
                expect_arity(3)?;
                self.arithmetic(term, op.operator, args)?
            }
        }
        Ok(QueryEvent::None)
    }

    fn assign(&mut self, left: &Term, right: &Term) -> PolarResult<()> {
        match left.value() {
            Value::Variable(var) if self.bindings.variable_state(var) == VariableState::Unbound => {
                self.push_goal(Goal::Unify {
                    left: left.clone(),
                    right: right.clone(),
                })
            }
            Value::Variable(var) => self.type_error(
                left,
                format!("Can only assign to unbound variables, {} is not unbound.", var),
            ),
            _ => self.type_error(left, format!("Cannot assign to type {}.", left)),
        }
    }

    /// The first two operands, fully dereferenced. Both must be bound.
    fn bound_operands(&self, args: &[Term]) -> PolarResult<(Term, Term)> {
        let left = self.bindings.deep_deref(&args[0]);
        let right = self.bindings.deep_deref(&args[1]);
        for operand in [&left, &right] {
            if let Value::Variable(var) = operand.value() {
                return Err(unbound(var));
            }
        }
        Ok((left, right))
    }

    fn comparison(&mut self, term: &Term, operator: Operator, args: &[Term]) -> PolarResult<QueryEvent> {
        let (left, right) = self.bound_operands(args)?;
        let involves_host = [&left, &right]
            .iter()
            .any(|t| matches!(t.value(), Value::ExternalInstance(_)));
        if involves_host {
            let call_id = self.host_question("external_op_result")?;
            return Ok(QueryEvent::ExternalOp {
                call_id,
                operator,
                args: vec![left, right],
            });
        }
        match compare(operator, left.value(), right.value()) {
            Some(true) => {}
            Some(false) => self.push_goal(Goal::Backtrack)?,
            None => return unsupported(format!("comparison {}", term)),
        }
        Ok(QueryEvent::None)
    }

    /// `left op right = result`. Overflow and division by zero are errors.
    fn arithmetic(&mut self, term: &Term, operator: Operator, args: &[Term]) -> PolarResult<()> {
        let (left, right) = self.bound_operands(args)?;
        let (l, r) = match (left.value(), right.value()) {
            (Value::Number(l), Value::Number(r)) => (*l, *r),
            _ => {
                return self.type_error(
                    term,
                    format!("unsupported arithmetic operands: {} {} {}", left, operator, right),
                )
            }
        };
        let result = match operator {
            Operator::Add => l + r,
            Operator::Sub => l - r,
            Operator::Mul => l * r,
            Operator::Div => l / r,
            Operator::Mod => l.modulo(r),
            Operator::Rem => l % r,
            _ => return unsupported(format!("numeric operation {}", operator)),
        };
        match result {
            Some(n) => self.push_goal(Goal::Unify {
                left: term.clone_with_value(Value::Number(n)),
                right: args[2].clone(),
            }),
            None => {
                let error = RuntimeError::ArithmeticError {
                    msg: format!("{} {} {}", left, operator, right),
                };
                Err(PolarError::from(error).with_location(term.location()))
            }
        }
    }

    /// `object.field = value`. Dictionary fields are looked up in the engine; everything else,
    /// including method calls on dictionaries, goes to the host.
    fn dot(&mut self, object: &Term, field: &Term, value: &Term) -> PolarResult<()> {
        let object = self.bindings.deref(object);
        let field = self.bindings.deref(field);
        match object.value() {
            Value::Dictionary(dict) if matches!(field.value(), Value::String(_) | Value::Variable(_)) => {
                self.push_goal(Goal::Lookup {
                    dict: dict.clone(),
                    field,
                    value: value.clone(),
                })
            }
            Value::Dictionary(_)
            | Value::ExternalInstance(_)
            | Value::List(_)
            | Value::Number(_)
            | Value::String(_) => {
                let answer = self.gensym("lookup_value")?;
                let call_id = self.host_call(&answer)?;
                self.push_goals(vec![
                    Goal::LookupExternal {
                        call_id,
                        instance: object.clone(),
                        field,
                    },
                    Goal::Unify {
                        left: value.clone(),
                        right: Term::from(answer),
                    },
                ])
            }
            Value::Variable(var) => Err(unbound(var)),
            _ => self.type_error(
                &object,
                format!("can only perform lookups on dicts and instances, this is {}", object),
            ),
        }
    }

    /// An unbound `field` enumerates every key.
    fn lookup(&mut self, dict: &Dictionary, field: &Term, value: &Term) -> PolarResult<()> {
        let field = self.bindings.deep_deref(field);
        match field.value() {
            Value::String(name) => match dict.fields.get(&Symbol::new(name)) {
                Some(found) => self.push_goal(Goal::Unify {
                    left: found.clone(),
                    right: value.clone(),
                }),
                None => self.push_goal(Goal::Backtrack),
            },
            Value::Variable(_) => {
                let alternatives = dict
                    .fields
                    .iter()
                    .map(|(key, found)| {
                        vec![
                            Goal::Unify {
                                left: field.clone_with_value(Value::String(key.0.clone())),
                                right: field.clone(),
                            },
                            Goal::Unify {
                                left: found.clone(),
                                right: value.clone(),
                            },
                        ]
                    })
                    .collect();
                self.choose(alternatives)
            }
            _ => self.type_error(&field, format!("cannot look up field {} on a dictionary", field)),
        }
    }

    fn lookup_external(&mut self, call_id: u64, instance: &Term, field: &Term) -> PolarResult<QueryEvent> {
        let (attribute, args) = match self.bindings.deep_deref(field).value() {
            Value::String(name) => (Symbol::new(name), None),
            Value::Call(call) => {
                let args: TermList = call
                    .args
                    .iter()
                    .map(|arg| self.bindings.deep_deref(arg))
                    .collect();
                (call.name.clone(), Some(args))
            }
            _ => {
                return self.type_error(
                    field,
                    format!("cannot look up field {} on an external instance", field),
                )
            }
        };
        let instance = self.bindings.deep_deref(instance);
        self.log(LogLevel::Trace, || match &args {
            Some(args) => format!("LOOKUP: {}.{}({})", instance, attribute, self.shown(args)),
            None => format!("LOOKUP: {}.{}", instance, attribute),
        });
        Ok(QueryEvent::ExternalCall {
            call_id,
            instance,
            attribute,
            args,
        })
    }

    /// `item in collection` over lists, dictionary `[key, value]` pairs and the characters of
    /// a string.
    fn member(&mut self, item: &Term, collection: &Term) -> PolarResult<()> {
        let item = self.bindings.deep_deref(item);
        let collection = self.bindings.deep_deref(collection);
        let elements: TermList = match collection.value() {
            Value::List(items) => items.clone(),
            Value::Dictionary(dict) => dict
                .fields
                .iter()
                .map(|(key, value)| {
                    let key = value.clone_with_value(Value::String(key.0.clone()));
                    collection.clone_with_value(Value::List(vec![key, value.clone()]))
                })
                .collect(),
            Value::String(s) => s
                .chars()
                .map(|c| collection.clone_with_value(Value::String(c.to_string())))
                .collect(),
            Value::Variable(var) => return Err(unbound(var)),
            _ => {
                return self.type_error(
                    &collection,
                    format!(
                        "can only use `in` on a list, dictionary or string, this is {}",
                        collection
                    ),
                )
            }
        };
        // A ground element that differs from a ground item cannot unify with it.
        let alternatives = elements
            .into_iter()
            .filter(|element| !(item.is_ground() && element.is_ground()) || *element == item)
            .map(|element| {
                vec![Goal::Unify {
                    left: item.clone(),
                    right: element,
                }]
            })
            .collect();
        self.choose(alternatives)
    }

    fn unify(&mut self, left: &Term, right: &Term) -> PolarResult<()> {
        self.log(LogLevel::Trace, || format!("UNIFY: {} = {}", left, right));
        match self.bindings.unify(left, right)? {
            UnifyOutcome::Failed => self.push_goal(Goal::Backtrack),
            // Pairs involving host objects hold only if the host says they are equal.
            UnifyOutcome::Succeeded { deferred } => self.push_goals(
                deferred
                    .into_iter()
                    .map(|(left, right)| Goal::Query {
                        term: Term::from(op!(Eq, left, right)),
                    })
                    .collect(),
            ),
        }
    }

    /// `left matches right`: structural matching against patterns, unification otherwise.
    fn isa(&mut self, left: &Term, right: &Term) -> PolarResult<()> {
        let left = self.bindings.deref(left);
        let right = self.bindings.deref(right);
        self.log(LogLevel::Trace, || format!("MATCHES: {} matches {}", left, right));

        match (left.value(), right.value()) {
            (Value::Expression(_), _) | (_, Value::Expression(_)) => self.type_error(
                &left,
                format!("cannot match expressions directly `{}` matches `{}`", left, right),
            ),
            (Value::Variable(var), _) => Err(unbound(var)),
            (_, Value::Pattern(Pattern::Dictionary(fields))) => self.isa_fields(&left, fields),
            (_, Value::Pattern(Pattern::Instance(literal))) => self.isa_class(&left, &right, literal),
            (Value::List(l), Value::List(r)) if l.len() == r.len() => self.push_goals(
                l.iter()
                    .zip(r)
                    .map(|(l, r)| Goal::Isa {
                        left: l.clone(),
                        right: r.clone(),
                    })
                    .collect(),
            ),
            (Value::List(_), Value::List(_)) => self.push_goal(Goal::Backtrack),
            _ => self.push_goal(Goal::Unify {
                left: left.clone(),
                right: right.clone(),
            }),
        }
    }

    /// Every field of the pattern must be present and match. Host objects are asked for each
    /// field in turn.
    fn isa_fields(&mut self, left: &Term, pattern: &Dictionary) -> PolarResult<()> {
        match left.value() {
            Value::Dictionary(dict) => {
                if !pattern.fields.keys().all(|key| dict.fields.contains_key(key)) {
                    return self.push_goal(Goal::Backtrack);
                }
                let goals = pattern
                    .fields
                    .iter()
                    .filter_map(|(key, expected)| {
                        dict.fields.get(key).map(|actual| Goal::Isa {
                            left: actual.clone(),
                            right: expected.clone(),
                        })
                    })
                    .collect();
                self.push_goals(goals)
            }
            Value::ExternalInstance(_) => {
                let mut goals = vec![];
                for (name, expected) in &pattern.fields {
                    let answer = self.gensym("isa_value")?;
                    let call_id = self.host_call(&answer)?;
                    goals.push(Goal::LookupExternal {
                        call_id,
                        instance: left.clone(),
                        field: expected.clone_with_value(Value::String(name.0.clone())),
                    });
                    goals.push(Goal::Isa {
                        left: Term::from(answer),
                        right: expected.clone(),
                    });
                }
                self.push_goals(goals)
            }
            _ => self.push_goal(Goal::Backtrack),
        }
    }

    /// Class membership, decided in the engine for built-in classes and for host classes
    /// with a registered MRO. The literal's fields are matched afterwards.
    fn isa_class(&mut self, left: &Term, right: &Term, literal: &InstanceLiteral) -> PolarResult<()> {
        let check_fields = Goal::Isa {
            left: left.clone(),
            right: right.clone_with_value(Value::Pattern(Pattern::Dictionary(
                literal.fields.clone(),
            ))),
        };

        if literal.tag.is_builtin_class() {
            let is_instance = left
                .value()
                .builtin_class()
                .map_or(false, |class| builtin_subclass(class, &literal.tag.0));
            return match (is_instance, literal.fields.is_empty()) {
                (false, _) => self.push_goal(Goal::Backtrack),
                (true, true) => Ok(()),
                (true, false) => self.push_goal(check_fields),
            };
        }

        let instance = match left.value() {
            Value::ExternalInstance(instance) => instance,
            _ => return self.push_goal(Goal::Backtrack),
        };
        let in_mro = {
            let kb = self.kb()?;
            registered_mro(&kb, instance)
                .zip(kb.get_class_id_for_symbol(&literal.tag))
                .map(|(mro, class_id)| mro.contains(&class_id))
        };
        match in_mro {
            Some(true) => self.push_goal(check_fields),
            Some(false) => self.push_goal(Goal::Backtrack),
            None => self.push_goals(vec![
                Goal::IsaExternal {
                    instance: left.clone(),
                    literal: literal.clone(),
                },
                check_fields,
            ]),
        }
    }

    /// Check the next candidate. Ground rules were fully checked by the index; others must
    /// unify with the arguments and match their specializers, without keeping any bindings.
    fn filter_rules(&mut self, args: &TermList, candidates: &Rules, kept: &Rules) -> PolarResult<()> {
        let (rule, rest) = match candidates.split_first() {
            Some((rule, rest)) => (rule.clone(), rest.to_vec()),
            None => {
                if kept.is_empty() {
                    self.log(LogLevel::Info, || "No matching rules found");
                }
                return self.push_goal(Goal::SortRules {
                    args: args.clone(),
                    rules: kept.clone(),
                    sorted: 1,
                    at: 1,
                });
            }
        };

        let skip = Goal::FilterRules {
            args: args.clone(),
            candidates: rest.clone(),
            kept: kept.clone(),
        };
        if rule.arity() != args.len() {
            return self.push_goal(skip);
        }
        let mut with_rule = kept.clone();
        with_rule.push(rule.clone());
        let keep = Goal::FilterRules {
            args: args.clone(),
            candidates: rest,
            kept: with_rule,
        };
        if rule.is_ground() {
            return self.push_goal(keep);
        }

        let renamed = self.renamed(&rule)?;
        self.if_then_else(match_head(args, &renamed.params), vec![keep], vec![skip])
    }

    /// Comparing two rules can need the host, so each comparison is a goal of its own.
    fn sort_rules(&mut self, args: &TermList, rules: &Rules, sorted: usize, at: usize) -> PolarResult<()> {
        if rules.is_empty() {
            return self.push_goal(Goal::Backtrack);
        }
        if sorted >= rules.len() {
            return self.call_rules(args, rules);
        }
        if at > sorted {
            return invalid_state_error(format!("bad insertion sort state: {} > {}", at, sorted));
        }

        let next = Goal::SortRules {
            args: args.clone(),
            rules: rules.clone(),
            sorted: sorted + 1,
            at: sorted + 1,
        };
        if at == 0 {
            return self.push_goal(next);
        }
        let mut swapped = rules.clone();
        swapped.swap(at - 1, at);
        let moved_up = Goal::SortRules {
            args: args.clone(),
            rules: swapped,
            sorted,
            at: at - 1,
        };
        let more_specific = Goal::IsMoreSpecific {
            left: rules[at].clone(),
            right: rules[at - 1].clone(),
            args: args.clone(),
        };
        self.if_then_else(vec![more_specific], vec![moved_up], vec![next])
    }

    /// One alternative per rule, most specific first.
    fn call_rules(&mut self, args: &TermList, rules: &Rules) -> PolarResult<()> {
        self.log(LogLevel::Info, || {
            let mut listing = "APPLICABLE_RULES:".to_owned();
            for rule in rules {
                let _ = write!(listing, "\n  {}", rule.head());
                if let Some(location) = rule.location() {
                    let _ = write!(listing, "{}", location);
                }
            }
            listing
        });

        // A cut in any body also discards the rules after it.
        let choice_index = self.choices.len();
        let mut alternatives = vec![];
        for rule in rules {
            let Rule { params, body, .. } = self.renamed(rule)?;
            let mut goals = vec![Goal::EnterRule {
                rule: rule.clone(),
                choice_index,
            }];
            goals.extend(match_head(args, &params));
            goals.push(Goal::Query { term: body });
            goals.push(Goal::ExitRule);
            alternatives.push(goals);
        }
        self.choose(alternatives)
    }

    /// Succeeds if `left` is more specific than `right` for `args`. The first parameter where
    /// the specializers differ decides, and a specializer beats none.
    #[allow(clippy::wrong_self_convention)]
    fn is_more_specific(&mut self, left: &Rule, right: &Rule, args: &TermList) -> PolarResult<()> {
        let pairs = left.params.iter().zip(&right.params).zip(args);
        for ((l, r), arg) in pairs {
            match (&l.specializer, &r.specializer) {
                (Some(l), Some(r)) if l != r => {
                    let answer = self.gensym("is_subspecializer")?;
                    self.bindings.bind(&answer, Term::from(false))?;
                    return self.push_goals(vec![
                        Goal::IsSubspecializer {
                            answer: answer.clone(),
                            left: l.clone(),
                            right: r.clone(),
                            arg: arg.clone(),
                        },
                        Goal::Unify {
                            left: Term::from(answer),
                            right: Term::from(true),
                        },
                    ]);
                }
                (Some(_), None) => return Ok(()),
                (None, Some(_)) => break,
                _ => {}
            }
        }
        self.push_goal(Goal::Backtrack)
    }

    #[allow(clippy::wrong_self_convention)]
    fn is_subspecializer(
        &mut self,
        answer: &Symbol,
        left: &Term,
        right: &Term,
        arg: &Term,
    ) -> PolarResult<QueryEvent> {
        let arg = self.bindings.deep_deref(arg);
        let decided = match (left.value(), right.value()) {
            (Value::Pattern(Pattern::Instance(l)), Value::Pattern(Pattern::Instance(r)))
                if l.tag == r.tag =>
            {
                // Same class: the fields decide.
                let fields = |term: &Term, literal: &InstanceLiteral| {
                    term.clone_with_value(Value::Pattern(Pattern::Dictionary(literal.fields.clone())))
                };
                self.push_goal(Goal::IsSubspecializer {
                    answer: answer.clone(),
                    left: fields(left, l),
                    right: fields(right, r),
                    arg,
                })?;
                None
            }
            (Value::Pattern(Pattern::Instance(l)), Value::Pattern(Pattern::Instance(r)))
                if l.tag.is_builtin_class() || r.tag.is_builtin_class() =>
            {
                Some(builtin_subclass(&l.tag.0, &r.tag.0))
            }
            (Value::Pattern(Pattern::Instance(l)), Value::Pattern(Pattern::Instance(r))) => {
                let instance = match arg.value() {
                    Value::ExternalInstance(instance) => instance,
                    _ => return Ok(QueryEvent::None),
                };
                let order = {
                    let kb = self.kb()?;
                    registered_mro(&kb, instance).and_then(|mro| {
                        let position = |tag: &Symbol| {
                            let class_id = kb.get_class_id_for_symbol(tag)?;
                            mro.iter().position(|id| *id == class_id)
                        };
                        Some(position(&l.tag)? < position(&r.tag)?)
                    })
                };
                match order {
                    Some(order) => Some(order),
                    None => {
                        let call_id = self.host_call(answer)?;
                        return Ok(QueryEvent::ExternalIsSubSpecializer {
                            call_id,
                            instance_id: instance.instance_id,
                            left_class_tag: l.tag.clone(),
                            right_class_tag: r.tag.clone(),
                        });
                    }
                }
            }
            // More fields is more specific. Rules were already filtered for applicability.
            (Value::Pattern(Pattern::Dictionary(l)), Value::Pattern(Pattern::Dictionary(r))) => {
                (l.fields.len() != r.fields.len()).then(|| l.fields.len() > r.fields.len())
            }
            (Value::Pattern(Pattern::Instance(_)), Value::Pattern(Pattern::Dictionary(_))) => Some(true),
            _ => Some(false),
        };
        if let Some(is_sub) = decided {
            self.bindings.unsafe_rebind(answer, Term::from(is_sub));
        }
        Ok(QueryEvent::None)
    }
}

impl Runnable for PolarVirtualMachine {
    /// Pop and run goals until one needs the host or the stack empties, which is a result.
    /// Called again to resume.
    fn run(&mut self) -> PolarResult<QueryEvent> {
        self.started.get_or_insert_with(Instant::now);

        if self.goals.is_empty() {
            if self.choices.is_empty() {
                return Ok(QueryEvent::Done { result: true });
            }
            self.backtrack()?;
        }

        while let Some(goal) = self.goals.pop() {
            match self.step(goal).map_err(|e| self.decorate_error(e))? {
                QueryEvent::None => {}
                event => return Ok(event),
            }
        }

        let bindings = self.result_bindings();
        self.log(LogLevel::Info, || describe_result(&bindings));
        Ok(QueryEvent::Result { bindings })
    }

    fn external_question_result(&mut self, call_id: u64, answer: bool) -> PolarResult<()> {
        let var = self.answered_call(call_id)?;
        self.bindings.unsafe_rebind(&var, Term::from(answer));
        Ok(())
    }

    fn external_call_result(&mut self, call_id: u64, term: Option<Term>) -> PolarResult<()> {
        let var = self.answered_call(call_id)?;
        match term {
            Some(value) => {
                self.log(LogLevel::Trace, || format!("=> {}", value));
                self.push_goal(Goal::Unify {
                    left: Term::from(var),
                    right: value,
                })
            }
            None => {
                self.log(LogLevel::Trace, || "=> No value.");
                self.push_goal(Goal::Backtrack)
            }
        }
    }

    fn external_error(&mut self, call_id: u64, message: String) -> PolarResult<()> {
        self.answered_call(call_id)?;
        let error = RuntimeError::Application {
            msg: message,
            stack_trace: Some(self.stack_trace()),
        }
        .into();
        self.push_goal(Goal::Error { error })
    }
}
