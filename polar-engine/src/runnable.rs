use crate::error::PolarResult;
use crate::events::QueryEvent;
use crate::terms::Term;

/// Trait for something that produces query events and accepts answers.
pub trait Runnable {
    /// Run the Runnable until a Error or QueryEvent is obtained.
    ///
    /// Returns: The next query event or an error.
    fn run(&mut self) -> PolarResult<QueryEvent>;

    /// Answer a yes/no question (`ExternalIsa`, `ExternalIsSubSpecializer`, `ExternalOp`).
    fn external_question_result(&mut self, call_id: u64, answer: bool) -> PolarResult<()>;

    /// Answer an `ExternalCall`. `None` means the attribute has no value.
    fn external_call_result(&mut self, call_id: u64, term: Option<Term>) -> PolarResult<()>;

    /// Report an exception raised by the host while answering `call_id`.
    fn external_error(&mut self, call_id: u64, message: String) -> PolarResult<()>;
}
