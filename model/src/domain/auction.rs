use serde::{Deserialize, Serialize};

use crate::domain::rate::Rate;
use crate::{BidId, DeviceId, WorkerId};

/// The bid that won an auction and the rate it clears at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChosenBid {
    pub bid:    BidId,
    pub worker: WorkerId,
    pub device: DeviceId,
    /// Second-lowest eligible rate, or the winner's own rate when it was
    /// alone.
    pub price:  Rate,
}

/// Where an auction stands, as seen by someone polling for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuctionOutcome {
    Won(ChosenBid),
    Pending,
    NoBids,
}

impl AuctionOutcome {
    pub fn winner(&self) -> Option<&ChosenBid> {
        match self {
            AuctionOutcome::Won(chosen) => Some(chosen),
            _ => None,
        }
    }
}
