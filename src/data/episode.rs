//! Support/query episodes for few-shot schemes

use super::Batch;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A single episode: support set for adaptation or prototypes, query set for
/// the loss that is actually reported.
///
/// Both halves share one label space; that is the upstream sampler's job and
/// is not checked here.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub support: Batch,
    pub query: Batch,
}

impl Episode {
    pub fn new(support: Batch, query: Batch) -> Self {
        Self { support, query }
    }

    /// Number of support examples
    pub fn support_size(&self) -> usize {
        self.support.batch_size()
    }

    /// Number of query examples
    pub fn query_size(&self) -> usize {
        self.query.batch_size()
    }
}

/// How episodic schemes carve a plain batch into support and query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EpisodeSplit {
    /// First half support, second half query
    Halves,
    /// Fixed number of leading support examples
    SupportSize(usize),
}

impl Default for EpisodeSplit {
    fn default() -> Self {
        Self::Halves
    }
}

impl EpisodeSplit {
    /// Split point for a batch of `batch_size` examples
    pub fn split_point(&self, batch_size: usize) -> usize {
        match self {
            EpisodeSplit::Halves => (batch_size / 2).max(1),
            EpisodeSplit::SupportSize(n) => *n,
        }
    }
}

/// What a step method receives
#[derive(Debug, Clone, PartialEq)]
pub enum TaskBatch {
    Standard(Batch),
    Episodic(Episode),
}

impl TaskBatch {
    /// View as an episode, splitting a standard batch when needed
    pub fn episode(&self, split: EpisodeSplit) -> Result<Cow<'_, Episode>> {
        match self {
            TaskBatch::Episodic(episode) => {
                episode.support.check_consistent()?;
                episode.query.check_consistent()?;
                Ok(Cow::Borrowed(episode))
            }
            TaskBatch::Standard(batch) => {
                let (support, query) = batch.split_at(split.split_point(batch.batch_size()))?;
                Ok(Cow::Owned(Episode::new(support, query)))
            }
        }
    }

    /// The batch a non-episodic scheme trains on: the batch itself, or the
    /// query half of an episode
    pub fn supervised(&self) -> &Batch {
        match self {
            TaskBatch::Standard(batch) => batch,
            TaskBatch::Episodic(episode) => &episode.query,
        }
    }
}

impl From<Batch> for TaskBatch {
    fn from(batch: Batch) -> Self {
        TaskBatch::Standard(batch)
    }
}

impl From<Episode> for TaskBatch {
    fn from(episode: Episode) -> Self {
        TaskBatch::Episodic(episode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Modality, Target};
    use ndarray::{ArrayD, IxDyn};

    fn batch(n: usize) -> Batch {
        Batch::new()
            .with_input(Modality::Image, ArrayD::zeros(IxDyn(&[n, 3])))
            .with_target(Modality::Image, Target::Classes((0..n).map(|i| i % 2).collect()))
    }

    #[test]
    fn test_split_policies() {
        assert_eq!(EpisodeSplit::Halves.split_point(10), 5);
        assert_eq!(EpisodeSplit::Halves.split_point(1), 1);
        assert_eq!(EpisodeSplit::SupportSize(3).split_point(10), 3);
    }

    #[test]
    fn test_standard_batch_splits_into_episode() {
        let task: TaskBatch = batch(6).into();
        let episode = task.episode(EpisodeSplit::SupportSize(4)).unwrap();
        assert_eq!(episode.support_size(), 4);
        assert_eq!(episode.query_size(), 2);
    }

    #[test]
    fn test_episodic_batch_is_borrowed() {
        let task: TaskBatch = Episode::new(batch(2), batch(3)).into();
        let episode = task.episode(EpisodeSplit::Halves).unwrap();
        assert!(matches!(episode, Cow::Borrowed(_)));
        assert_eq!(task.supervised().batch_size(), 3);
    }
}
