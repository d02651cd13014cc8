pub mod auction;
pub mod hub;
pub mod job;
