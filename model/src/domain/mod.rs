pub mod auction;
pub mod category;
pub mod rate;
pub mod stage;
