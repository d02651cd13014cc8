use core::str::FromStr;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown lifecycle stage {0:?}")]
pub struct UnknownStage(pub String);

/// A named, set-once milestone in the life of a job.
///
/// The last three are the terminal set: at most one of them is ever written
/// for a given job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DataSynced,
    ImageBuilt,
    AuctionCompleted,
    ImageDownloaded,
    DataDownloaded,
    OutputLogPosted,
    OutputDataPosted,
    #[serde(rename = "completed_at", alias = "completed")]
    Completed,
    #[serde(rename = "canceled_at", alias = "canceled")]
    Canceled,
    #[serde(rename = "failed_at", alias = "failed")]
    Failed,
}

/// How a job left the active set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Completed,
    Canceled,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::DataSynced,
        Stage::ImageBuilt,
        Stage::AuctionCompleted,
        Stage::ImageDownloaded,
        Stage::DataDownloaded,
        Stage::OutputLogPosted,
        Stage::OutputDataPosted,
        Stage::Completed,
        Stage::Canceled,
        Stage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DataSynced => "data_synced",
            Stage::ImageBuilt => "image_built",
            Stage::AuctionCompleted => "auction_completed",
            Stage::ImageDownloaded => "image_downloaded",
            Stage::DataDownloaded => "data_downloaded",
            Stage::OutputLogPosted => "output_log_posted",
            Stage::OutputDataPosted => "output_data_posted",
            Stage::Completed => "completed_at",
            Stage::Canceled => "canceled_at",
            Stage::Failed => "failed_at",
        }
    }

    pub fn terminal(&self) -> Option<Terminal> {
        match self {
            Stage::Completed => Some(Terminal::Completed),
            Stage::Canceled => Some(Terminal::Canceled),
            Stage::Failed => Some(Terminal::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool { self.terminal().is_some() }
}

impl Terminal {
    pub fn stage(&self) -> Stage {
        match self {
            Terminal::Completed => Stage::Completed,
            Terminal::Canceled => Stage::Canceled,
            Terminal::Failed => Stage::Failed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.stage().fmt(f)
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let name = trimmed.strip_suffix("_at").unwrap_or(&trimmed);
        match name {
            "data_synced" => Ok(Stage::DataSynced),
            "image_built" => Ok(Stage::ImageBuilt),
            "auction_completed" => Ok(Stage::AuctionCompleted),
            "image_downloaded" => Ok(Stage::ImageDownloaded),
            "data_downloaded" => Ok(Stage::DataDownloaded),
            "output_log_posted" => Ok(Stage::OutputLogPosted),
            "output_data_posted" => Ok(Stage::OutputDataPosted),
            "completed" => Ok(Stage::Completed),
            "canceled" | "cancelled" => Ok(Stage::Canceled),
            "failed" => Ok(Stage::Failed),
            _ => Err(UnknownStage(s.to_string())),
        }
    }
}
