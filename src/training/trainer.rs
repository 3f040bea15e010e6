//! Epoch loop: gradient accumulation, scheduler stepping and unstable-batch
//! handling around the scheme's step methods

use crate::data::TaskBatch;
use crate::error::{AdaptationError, Result};
use crate::metrics::{MetricAverager, MetricMap, MetricSet};
use crate::nn::Gradients;
use crate::schemes::AdaptationScheme;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Configuration for the outer loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// Number of train steps whose gradients are averaged per optimizer step
    pub accumulate_grad_batches: usize,
    /// Skip batches failing with a numerical instability instead of aborting
    pub skip_unstable_batches: bool,
    /// Validation metric handed to plateau schedulers, e.g. `"loss"`
    pub monitor: Option<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10,
            accumulate_grad_batches: 1,
            skip_unstable_batches: true,
            monitor: Some("loss".to_string()),
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(AdaptationError::config("max_epochs must be positive"));
        }
        if self.accumulate_grad_batches == 0 {
            return Err(AdaptationError::config("accumulate_grad_batches must be positive"));
        }
        Ok(())
    }

    /// Builder pattern: set epochs
    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    /// Builder pattern: set accumulation
    pub fn with_accumulation(mut self, batches: usize) -> Self {
        self.accumulate_grad_batches = batches;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Training,
    Validation,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Training => "training",
            Phase::Validation => "validation",
            Phase::Test => "test",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Averaged metrics of one pass over a batch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub phase: Phase,
    /// Keys are `"{phase}/overall_{metric}"`
    pub metrics: MetricMap,
    pub batches: usize,
    pub skipped: usize,
    pub learning_rate: f64,
}

impl EpochSummary {
    /// Averaged value of an unprefixed metric such as `"loss"`
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.metrics.get(&metric_key(self.phase, metric)).copied()
    }
}

fn metric_key(phase: Phase, metric: &str) -> String {
    format!("{}/overall_{}", phase, metric)
}

fn phase_metrics(phase: Phase, averager: &MetricAverager) -> MetricMap {
    averager
        .means()
        .into_iter()
        .map(|(name, value)| (metric_key(phase, &name), value))
        .collect()
}

/// Gradients summed over the batches of one accumulation window
#[derive(Default)]
struct Accumulator {
    gradients: Gradients,
    count: usize,
}

impl Accumulator {
    fn push(&mut self, gradients: &Gradients) {
        self.gradients.accumulate(gradients);
        self.count += 1;
    }

    fn flush(&mut self, scheme: &mut dyn AdaptationScheme) -> Result<bool> {
        if self.count == 0 {
            return Ok(false);
        }
        let mut mean = std::mem::take(&mut self.gradients);
        mean.scale(1.0 / self.count as f64);
        self.count = 0;
        scheme.optimizer_step(&mean)?;
        Ok(true)
    }
}

/// Drives fit / validate / test loops and keeps the epoch history
pub struct Trainer {
    config: TrainerConfig,
    history: Vec<EpochSummary>,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            history: Vec::new(),
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Every summary produced so far, in order
    pub fn history(&self) -> &[EpochSummary] {
        &self.history
    }

    /// Decide what to do with a failed step
    fn recover(&self, err: AdaptationError, phase: Phase, index: usize) -> Result<()> {
        let err = err.with_batch(index);
        if err.is_recoverable() && self.config.skip_unstable_batches {
            warn!(phase = %phase, batch = index, error = %err, "Skipping unstable batch");
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Train for `max_epochs`, validating after each epoch when `val` is not
    /// empty. The scheduler advances once per epoch.
    pub fn fit(
        &mut self,
        scheme: &mut dyn AdaptationScheme,
        train: &[TaskBatch],
        val: &[TaskBatch],
        metrics: &MetricSet,
    ) -> Result<Vec<EpochSummary>> {
        if !scheme.is_built() {
            return Err(AdaptationError::NotBuilt { scheme: scheme.name() });
        }
        info!(
            scheme = scheme.name(),
            epochs = self.config.max_epochs,
            train_batches = train.len(),
            val_batches = val.len(),
            "Starting fit"
        );

        let mut summaries = Vec::new();
        for epoch in 0..self.config.max_epochs {
            let mut averager = MetricAverager::new();
            let mut accumulator = Accumulator::default();
            let mut skipped = 0;
            let mut updates = 0;

            for (index, batch) in train.iter().enumerate() {
                match scheme.train_step(batch, metrics) {
                    Ok(out) => {
                        averager.add(&out.metrics);
                        accumulator.push(&out.gradients);
                        if accumulator.count >= self.config.accumulate_grad_batches && accumulator.flush(scheme)? {
                            updates += 1;
                        }
                    }
                    Err(err) => {
                        self.recover(err, Phase::Training, index)?;
                        skipped += 1;
                    }
                }
            }
            if accumulator.flush(scheme)? {
                updates += 1;
            }

            let training = EpochSummary {
                epoch,
                phase: Phase::Training,
                metrics: phase_metrics(Phase::Training, &averager),
                batches: train.len() - skipped,
                skipped,
                learning_rate: scheme.learning_rate()?,
            };
            let train_loss = training.get("loss").unwrap_or(f64::NAN);
            debug!(epoch, updates, skipped, "Training epoch done");
            self.history.push(training.clone());
            summaries.push(training);

            let monitored = if val.is_empty() {
                None
            } else {
                let validation = self.run_eval(scheme, val, metrics, Phase::Validation, epoch)?;
                let monitored = self.config.monitor.as_deref().and_then(|m| validation.get(m));
                summaries.push(validation);
                monitored
            };

            let lr = scheme.scheduler_step(monitored)?;
            info!(
                epoch,
                loss = train_loss,
                monitor = self.config.monitor.as_deref().unwrap_or("none"),
                monitored = monitored.unwrap_or(f64::NAN),
                lr,
                "Epoch complete"
            );
        }
        Ok(summaries)
    }

    pub fn validate(&mut self, scheme: &dyn AdaptationScheme, batches: &[TaskBatch], metrics: &MetricSet) -> Result<EpochSummary> {
        let epoch = self.history.len();
        self.run_eval(scheme, batches, metrics, Phase::Validation, epoch)
    }

    pub fn test(&mut self, scheme: &dyn AdaptationScheme, batches: &[TaskBatch], metrics: &MetricSet) -> Result<EpochSummary> {
        let epoch = self.history.len();
        self.run_eval(scheme, batches, metrics, Phase::Test, epoch)
    }

    fn run_eval(
        &mut self,
        scheme: &dyn AdaptationScheme,
        batches: &[TaskBatch],
        metrics: &MetricSet,
        phase: Phase,
        epoch: usize,
    ) -> Result<EpochSummary> {
        let mut averager = MetricAverager::new();
        let mut skipped = 0;
        for (index, batch) in batches.iter().enumerate() {
            match scheme.eval_step(batch, metrics) {
                Ok(values) => averager.add(&values),
                Err(err) => {
                    self.recover(err, phase, index)?;
                    skipped += 1;
                }
            }
        }

        let summary = EpochSummary {
            epoch,
            phase,
            metrics: phase_metrics(phase, &averager),
            batches: batches.len() - skipped,
            skipped,
            learning_rate: scheme.learning_rate()?,
        };
        info!(phase = %phase, metrics = ?summary.metrics, skipped, "Evaluation done");
        self.history.push(summary.clone());
        Ok(summary)
    }
}
