pub mod event_store;
pub mod expansion;
pub mod generation;
pub mod planner;
pub mod scheduler;
pub mod sweep;

pub use event_store::EventStore;
pub use expansion::{build_event_prompt, expand_event, MemoryClient, SLEEP_TEXT, WAKE_UP_TEXT};
pub use generation::{GenerationClient, GenerationConfig, GenerationError, APOLOGY_TEXT};
pub use planner::{parse_day_plan, DayPlanner, ParsedDayPlan, PlannedEvent, MAX_PLANNED_EVENTS};
pub use scheduler::{
    ActivitySource, EventExecutor, EventScheduler, MemoryActivitySource, ProcessOutcome,
    WebhookExecutor, ACTIVE_WINDOW_MINUTES, MAX_ATTEMPTS, RESCHEDULE_DELAY_MINUTES,
};
pub use sweep::DueSweep;
