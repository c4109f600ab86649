//! The loop driver.
//!
//! Executes one loop to a terminal outcome: rebuild the prompt from
//! persisted state, call the model, run tools, validate, accumulate
//! feedback, checkpoint. No conversation history survives an iteration.

mod driver;
mod prompt;
mod validation;

pub use driver::{DriverConfig, LoopDriver};
pub use prompt::{PromptBuilder, estimate_tokens};
pub use validation::{FormatRules, ValidationOutcome, run_validation};
