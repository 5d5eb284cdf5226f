//! The MentorLink query pipeline.
//!
//! A query flows through five steps:
//!
//! 1. **Lease** the session and snapshot its history
//! 2. **Retrieve** reference fragments (degrading to none when the index is down)
//! 3. **Assemble** a prompt that fits the token budget
//! 4. **Invoke** the model, with retries, deadlines and cancellation
//! 5. **Commit** the user/assistant exchange atomically
//!
//! Tutoring profiles and quiz generation ride on the same assembler and
//! invoker.

pub mod context;
pub mod invoker;
pub mod orchestrator;
pub mod quiz;
pub mod stream_event;
pub mod tutor;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{AssembledPrompt, AssemblyError, AssemblyInput, AssemblyMetadata, PromptAssembler};
pub use invoker::{
    Completion, Invocation, InvocationState, ModelEvent, ModelInvoker, ModelResponse, ModelStream, RetryPolicy,
};
pub use orchestrator::{
    AnswerStream, OrchestrationError, Orchestrator, Outcome, PipelineSettings, QueryAnswer, QueryRequest, Stage,
};
pub use quiz::{Quiz, QuizGenerator, QuizQuestion};
pub use stream_event::QueryEvent;
pub use tutor::TutorProfile;
