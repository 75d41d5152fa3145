pub mod ai;
pub mod job_store;
pub mod monitor;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod submitter;
pub mod validation;
pub mod worker;
