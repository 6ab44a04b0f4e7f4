pub mod client;
pub mod cron;
pub mod politeness;
pub mod ranker;
pub mod scheduler;
pub mod task;
pub mod worker;
