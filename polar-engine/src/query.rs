use serde::{Deserialize, Serialize};

use super::error::{ParameterError, PolarError, PolarResult};
use super::events::*;
use super::messages::*;
use super::runnable::Runnable;
use super::terms::*;
use super::vm::*;

/// What kind of answer an outstanding host event expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerKind {
    /// A term, or no value (`ExternalCall`).
    Call,
    /// A yes/no answer (`ExternalIsa`, `ExternalIsSubSpecializer`, `ExternalOp`).
    Question,
}

#[derive(Debug, Clone)]
enum QueryState {
    Running,
    Waiting { call_id: u64, kind: AnswerKind },
    Done,
    Failed(PolarError),
}

/// An answer to a host event, in the shape hosts send it across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExternalAnswer {
    Term(Term),
    NoValue,
    Bool(bool),
    Error(String),
}

pub struct Query {
    term: Term,
    vm: PolarVirtualMachine,
    state: QueryState,
    finished: bool,
}

impl Query {
    pub fn new(vm: PolarVirtualMachine, term: Term) -> Self {
        Self {
            term,
            vm,
            state: QueryState::Running,
            finished: false,
        }
    }

    /// Advance the query to its next event.
    pub fn next_event(&mut self) -> PolarResult<QueryEvent> {
        match &self.state {
            QueryState::Waiting { call_id, .. } => {
                return Err(ParameterError(format!(
                    "the query is waiting for an answer to call {}",
                    call_id
                ))
                .into())
            }
            QueryState::Done => return Ok(QueryEvent::Done { result: true }),
            QueryState::Failed(error) => return Err(error.clone()),
            QueryState::Running => {}
        }

        match self.vm.run() {
            Ok(event) => {
                self.state = match &event {
                    QueryEvent::Done { .. } => QueryState::Done,
                    QueryEvent::ExternalCall { call_id, .. } => QueryState::Waiting {
                        call_id: *call_id,
                        kind: AnswerKind::Call,
                    },
                    QueryEvent::ExternalIsa { call_id, .. }
                    | QueryEvent::ExternalIsSubSpecializer { call_id, .. }
                    | QueryEvent::ExternalOp { call_id, .. } => QueryState::Waiting {
                        call_id: *call_id,
                        kind: AnswerKind::Question,
                    },
                    _ => QueryState::Running,
                };
                Ok(event)
            }
            Err(error) => {
                self.state = QueryState::Failed(error.clone());
                Err(error)
            }
        }
    }

    /// Check that `call_id` is the outstanding call and, if `kind` is given, that it
    /// expects that kind of answer.
    fn expect_answer(&self, call_id: u64, kind: Option<AnswerKind>) -> PolarResult<()> {
        match self.state {
            QueryState::Waiting {
                call_id: waiting,
                kind: expected,
            } => {
                if waiting != call_id {
                    Err(ParameterError(format!(
                        "call {} is not the outstanding call {}",
                        call_id, waiting
                    ))
                    .into())
                } else if kind.map_or(false, |kind| kind != expected) {
                    Err(ParameterError(format!(
                        "call {} expects a {} answer",
                        call_id,
                        match expected {
                            AnswerKind::Call => "term",
                            AnswerKind::Question => "boolean",
                        }
                    ))
                    .into())
                } else {
                    Ok(())
                }
            }
            _ => Err(ParameterError(format!(
                "the query is not waiting for an answer to call {}",
                call_id
            ))
            .into()),
        }
    }

    pub fn call_result(&mut self, call_id: u64, value: Option<Term>) -> PolarResult<()> {
        self.expect_answer(call_id, Some(AnswerKind::Call))?;
        self.vm.external_call_result(call_id, value)?;
        self.state = QueryState::Running;
        Ok(())
    }

    pub fn question_result(&mut self, call_id: u64, result: bool) -> PolarResult<()> {
        self.expect_answer(call_id, Some(AnswerKind::Question))?;
        self.vm.external_question_result(call_id, result)?;
        self.state = QueryState::Running;
        Ok(())
    }

    /// Report an exception the host raised while answering `call_id`.
    /// The query fails on its next advance.
    pub fn application_error(&mut self, call_id: u64, message: String) -> PolarResult<()> {
        self.expect_answer(call_id, None)?;
        self.vm.external_error(call_id, message)?;
        self.state = QueryState::Running;
        Ok(())
    }

    pub fn answer_external(&mut self, call_id: u64, answer: ExternalAnswer) -> PolarResult<()> {
        match answer {
            ExternalAnswer::Term(term) => self.call_result(call_id, Some(term)),
            ExternalAnswer::NoValue => self.call_result(call_id, None),
            ExternalAnswer::Bool(result) => self.question_result(call_id, result),
            ExternalAnswer::Error(message) => self.application_error(call_id, message),
        }
    }

    pub fn next_message(&self) -> Option<Message> {
        self.vm.messages.next()
    }

    pub fn source_info(&self) -> String {
        match self.term.location() {
            Some(location) => format!("{}{}", self.term, location),
            None => self.term.to_string(),
        }
    }
}

// Query as an iterator returns `None` after the first time `Done` or an error is seen
impl Iterator for Query {
    type Item = PolarResult<QueryEvent>;

    fn next(&mut self) -> Option<PolarResult<QueryEvent>> {
        if self.finished {
            return None;
        }
        let event = self.next_event();
        if matches!(event, Ok(QueryEvent::Done { .. }) | Err(_)) {
            self.finished = true;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use super::*;
    use crate::config::QueryConfig;
    use crate::error::ErrorTaxonomy;
    use crate::kb::KnowledgeBase;

    fn query(kb: KnowledgeBase, term: Term) -> Query {
        let vm = PolarVirtualMachine::new(
            Arc::new(RwLock::new(kb)),
            QueryConfig::default(),
            vec![Goal::Query { term: term.clone() }],
            MessageQueue::new(),
        )
        .unwrap();
        Query::new(vm, term)
    }

    fn lookup_query() -> Query {
        let instance = term!(Value::ExternalInstance(ExternalInstance {
            instance_id: 1,
            constructor: None,
            repr: None,
            class_id: None,
        }));
        query(
            KnowledgeBase::new(),
            term!(op!(Dot, instance, term!("name"), var!("x"))),
        )
    }

    #[test]
    fn test_query_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Query>();
    }

    #[test]
    fn test_done_repeats() {
        let mut kb = KnowledgeBase::new();
        kb.add_rule(rule!("f", [1]));
        let mut q = query(kb, term!(call!("f", [1])));
        assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
        assert!(matches!(q.next_event().unwrap(), QueryEvent::Done { .. }));
        assert!(matches!(q.next_event().unwrap(), QueryEvent::Done { .. }));
    }

    #[test]
    fn test_protocol_errors_leave_state_untouched() {
        let mut q = lookup_query();
        let call_id = q.next_event().unwrap().call_id().unwrap();

        let advance = q.next_event().unwrap_err();
        assert_eq!(advance.taxonomy(), ErrorTaxonomy::ProtocolUsageError);

        let stale = q.call_result(call_id + 100, None).unwrap_err();
        assert_eq!(stale.taxonomy(), ErrorTaxonomy::ProtocolUsageError);

        let wrong_kind = q.question_result(call_id, true).unwrap_err();
        assert_eq!(wrong_kind.taxonomy(), ErrorTaxonomy::ProtocolUsageError);

        q.answer_external(call_id, ExternalAnswer::Term(term!("bob")))
            .unwrap();
        match q.next_event().unwrap() {
            QueryEvent::Result { bindings } => assert_eq!(bindings[&sym!("x")], term!("bob")),
            event => panic!("unexpected event {:?}", event),
        }
        assert!(matches!(q.next_event().unwrap(), QueryEvent::Done { .. }));
    }

    #[test]
    fn test_application_error_fails_the_query() {
        let mut q = lookup_query();
        let call_id = q.next_event().unwrap().call_id().unwrap();
        q.answer_external(call_id, ExternalAnswer::Error("no such field".to_owned()))
            .unwrap();
        let err = q.next_event().unwrap_err();
        assert_eq!(err.taxonomy(), ErrorTaxonomy::HostReportedError);
        // The error sticks.
        let again = q.next_event().unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let q = query(KnowledgeBase::new(), term!(call!("missing")));
        let events: Vec<_> = q.collect();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap_err().taxonomy(),
            ErrorTaxonomy::UnknownRuleError
        );
    }

    #[test]
    fn test_external_answer_wire_format() {
        let answer: ExternalAnswer = serde_json::from_str(r#"{"Bool": true}"#).unwrap();
        assert_eq!(answer, ExternalAnswer::Bool(true));
        let answer: ExternalAnswer = serde_json::from_str(r#""NoValue""#).unwrap();
        assert_eq!(answer, ExternalAnswer::NoValue);
    }
}
