pub mod engine;
pub mod plan;
pub mod prompts;

pub use engine::{AgentEngine, PendingAction, StepOutcome, TurnReply};
pub use plan::{parse_plan, PlanParseError, PlanStep};
