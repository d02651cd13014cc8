use std::fmt;

use serde::{Deserialize, Serialize};

use crate::JobId;

const CATEGORY_MAX_LEN: usize = 128;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CategoryError {
    #[error("A category cannot be empty")]
    Empty,
    #[error("A category is at most {CATEGORY_MAX_LEN} characters long")]
    TooLong,
    #[error("A category cannot contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Per-job event streams, each lives under `{job_id}-{suffix}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTopic {
    /// The job was canceled, the executor should stop and upload what it has.
    Cancel,
    /// The executor posted its output data.
    Output,
    /// The auction closed, with or without a winner.
    Auction,
    /// The job reached a terminal state on its own (completion, failure).
    Status,
}

impl JobTopic {
    pub const ALL: [JobTopic; 4] =
        [JobTopic::Cancel, JobTopic::Output, JobTopic::Auction, JobTopic::Status];

    fn suffix(&self) -> &'static str {
        match self {
            JobTopic::Cancel => "cancel",
            JobTopic::Output => "output",
            JobTopic::Auction => "auction",
            JobTopic::Status => "status",
        }
    }
}

/// Key of a publish/subscribe stream on the distribution hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn parse(raw: &str) -> Result<Self, CategoryError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CategoryError::Empty);
        }
        if raw.chars().count() > CATEGORY_MAX_LEN {
            return Err(CategoryError::TooLong);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(CategoryError::Whitespace(raw.to_string()));
        }
        Ok(Category(raw.to_string()))
    }

    pub fn for_job(job: &JobId, topic: JobTopic) -> Self {
        Category(format!("{}-{}", job, topic.suffix()))
    }

    /// Whether this category belongs to the given job.
    pub fn is_of_job(&self, job: &JobId) -> bool {
        self.0.starts_with(&job.to_string())
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Category::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_categories_are_scoped_to_their_job() {
        let job = JobId::generate();
        let other = JobId::generate();
        for topic in JobTopic::ALL {
            let category = Category::for_job(&job, topic);
            assert!(category.is_of_job(&job));
            assert!(!category.is_of_job(&other));
            assert_eq!(Category::parse(category.as_str()), Ok(category));
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Category::parse("   "), Err(CategoryError::Empty));
        assert_eq!(Category::parse(&"x".repeat(129)), Err(CategoryError::TooLong));
        assert!(matches!(
            Category::parse("two words"),
            Err(CategoryError::Whitespace(_))
        ));
        assert_eq!(Category::parse(" logs ").unwrap().as_str(), "logs");
    }
}
