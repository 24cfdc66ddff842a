pub mod monitor_queues;
pub mod recover_jobs;
