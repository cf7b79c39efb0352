use serde::{Deserialize, Serialize};

use super::kb::*;
use super::terms::*;

#[allow(clippy::large_enum_variant)]
#[must_use]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueryEvent {
    /// Internal: the step made progress without needing the host.
    None,

    /// The search space is exhausted. Repeats on every later advance.
    Done {
        result: bool,
    },

    Debug {
        message: String,
    },

    ExternalCall {
        /// Persistent id for the answer to this call.
        call_id: u64,
        /// The external instance (or built-in value) to make this call on.
        instance: Term,
        /// Field name to lookup or method name to call.
        attribute: Symbol,
        /// List of arguments to a method call; `None` for a field lookup.
        args: Option<Vec<Term>>,
    },

    /// Checks if the instance is an instance of (a subclass of) the class_tag.
    ExternalIsa {
        call_id: u64,
        instance: Term,
        class_tag: Symbol,
    },

    /// Checks if the left is more specific than right with respect to instance.
    ExternalIsSubSpecializer {
        call_id: u64,
        instance_id: u64,
        left_class_tag: Symbol,
        right_class_tag: Symbol,
    },

    /// Applies a comparison the engine cannot evaluate itself, such as equality
    /// between a host instance and another value.
    ExternalOp {
        call_id: u64,
        operator: Operator,
        args: TermList,
    },

    Result {
        bindings: Bindings,
    },
}

impl QueryEvent {
    /// The call id the host must answer, if this event expects an answer.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Self::ExternalCall { call_id, .. }
            | Self::ExternalIsa { call_id, .. }
            | Self::ExternalIsSubSpecializer { call_id, .. }
            | Self::ExternalOp { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}
