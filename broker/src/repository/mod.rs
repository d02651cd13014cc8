pub(crate) mod auction;
pub(crate) mod category_board;
pub(crate) mod cron;
pub(crate) mod notifier;
pub(crate) mod status_store;
pub(crate) mod subscribers;
