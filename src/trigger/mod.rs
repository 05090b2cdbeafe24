/// Trigger arming
///
/// Each trigger strategy turns an external signal into `TriggerFiring`s and
/// hands them to a `RunLauncher`, which spawns one independent run per
/// firing without waiting for it.

// Event waiter registry shared by push triggers and in-run waits
pub mod waiter;

// Push triggers: waiter -> spawn run -> re-register
pub mod event;

// Timer triggers on tokio-cron-scheduler
pub mod cron;

// Pull triggers: polling loop feeding a bounded queue
pub mod poll;

use crate::error::Result;
use crate::runtime::engine::TriggerFiring;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use cron::CronTriggers;
pub use event::EventTrigger;
pub use poll::{HttpPollSource, PollSource, PollSources, PollTrigger};
pub use waiter::{EventWaiter, WaitOutcome, Waiter, WaiterInfo, WaiterScope};

/// Spawns a run for a firing and returns its run id
pub trait RunLauncher: Send + Sync {
    fn launch(&self, firing: TriggerFiring) -> Result<String>;
}

/// How an armed trigger is disarmed
#[derive(Debug, Clone)]
pub enum Teardown {
    /// Registered job on the cron scheduler
    CronJob(Uuid),
    /// Background loop stopped through its token
    Task(CancellationToken),
    /// Nothing armed; fired only through the manual run surface
    None,
}
