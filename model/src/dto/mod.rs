pub mod bid;
pub mod job;
