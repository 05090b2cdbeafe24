/// Crash recovery
///
/// Live runs write heartbeats; the reaper turns runs whose heartbeat went
/// stale into `error` / `crashed` and cancels their waiters.

// Heartbeat writes and reads on the shared cache substrate
pub mod heartbeat;

// Periodic scan for orphaned runs
pub mod reaper;

pub use heartbeat::HeartbeatStore;
pub use reaper::Reaper;
