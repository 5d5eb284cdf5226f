//! Prompt assembly under a token budget.
//!
//! | Part | Source | Trim Strategy |
//! |------|--------|---------------|
//! | System instructions | Config / tutor profile | Never trimmed |
//! | Current query | Request | Never trimmed |
//! | Reference material | Retrieved fragments | Whole fragments, lowest score skipped |
//! | History | Session turns | Oldest turns dropped |

pub mod assembler;
pub mod token;

pub use assembler::{
    AssembledPrompt, AssemblyError, AssemblyInput, AssemblyMetadata, DropInfo, LayerStats, PromptAssembler,
};
