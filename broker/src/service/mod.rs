pub(crate) mod auction;
pub(crate) mod bidding;
pub(crate) mod hub;
pub(crate) mod scheduler;
pub(crate) mod status;
pub(crate) mod watchdog;
