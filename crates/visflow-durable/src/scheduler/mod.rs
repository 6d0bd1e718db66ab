//! Cron and event-driven workflow scheduling

mod scheduler;
mod trigger;

pub use scheduler::{Scheduler, SchedulerConfig, TriggerInfo};
pub use trigger::{
    CatchUpPolicy, CronTrigger, GroupFactory, GroupReady, WorkflowFactory, WorkflowRequest,
};
