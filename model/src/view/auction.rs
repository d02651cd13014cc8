use serde::{Deserialize, Serialize};

use crate::domain::auction::{AuctionOutcome, ChosenBid};
use crate::domain::rate::Rate;
use crate::{BidId, DeviceId, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostBid {
    pub worker_id: WorkerId,
    pub device_id: DeviceId,
    pub rate:      Rate,
}

/// Answer to a bid submission. `is_winner` is only known once the auction the
/// bid took part in has closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidReceipt {
    pub bid_id:    BidId,
    pub is_winner: bool,
    pub late:      bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionWon {
    pub bid_id: BidId,
    pub rate:   Rate,
}

impl From<ChosenBid> for AuctionWon {
    fn from(chosen: ChosenBid) -> Self {
        AuctionWon { bid_id: chosen.bid, rate: chosen.price }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuctionStatus {
    Won { bid_id: BidId, rate: Rate },
    Pending,
    NoBids,
}

impl From<AuctionOutcome> for AuctionStatus {
    fn from(outcome: AuctionOutcome) -> Self {
        match outcome {
            AuctionOutcome::Won(chosen) => {
                AuctionStatus::Won { bid_id: chosen.bid, rate: chosen.price }
            }
            AuctionOutcome::Pending => AuctionStatus::Pending,
            AuctionOutcome::NoBids => AuctionStatus::NoBids,
        }
    }
}
