//! Episodic MAML: inner-loop adaptation on the support set, meta-loss on the
//! query set.
//!
//! Each episode adapts a value copy of the parameters with plain SGD steps and
//! throws the copy away afterwards. Only the meta-gradient with respect to the
//! original parameters leaves the step; the trainer applies it.
//!
//! First-order mode returns the query gradient taken at the adapted
//! parameters. Second-order mode pulls that gradient back through every inner
//! step, `v <- (I - inner_lr * H_k) v`, where `H_k v` is a central finite
//! difference of analytic support gradients around the k-th iterate.

use super::common::{collect_metrics, delegate_to_core, SchemeCore, StepContext};
use super::fine_tuning::{build_supervised, supervised_inference, supervised_pass};
use super::{
    AdaptationScheme, Capabilities, FineTuneScope, Inference, MamlConfig, SchemeKind, TrainOutput,
};
use crate::backbone::SharedBackbone;
use crate::data::{Batch, Episode, ShapeDict, TaskBatch};
use crate::error::{AdaptationError, Result};
use crate::metrics::{MetricMap, MetricSet};
use crate::nn::{ActivationType, Gradients, ModelParams};
use tracing::debug;

/// Parameters after the inner loop plus what is needed to differentiate it
struct Adaptation {
    params: ModelParams,
    /// Iterates `theta_0 .. theta_{k-1}`, only kept for second-order
    trajectory: Vec<ModelParams>,
    support_loss: Option<f64>,
}

/// MAML over a single head per modality, optionally adapting the backbone too
pub struct MamlScheme {
    core: SchemeCore,
    scope: FineTuneScope,
    config: MamlConfig,
}

impl MamlScheme {
    pub fn new(backbone: SharedBackbone, scope: FineTuneScope, config: MamlConfig) -> Self {
        let kind = match scope {
            FineTuneScope::HeadsOnly => SchemeKind::EpisodicMamlSingleLinearLayer,
            FineTuneScope::FullModel => SchemeKind::EpisodicMamlFullModel,
        };
        Self {
            core: SchemeCore::new(kind, backbone, config.learner.clone()),
            scope,
            config,
        }
    }

    pub fn config(&self) -> &MamlConfig {
        &self.config
    }

    fn gradients_at(ctx: &StepContext<'_>, params: &ModelParams, batch: &Batch) -> Result<Gradients> {
        let pass = supervised_pass(ctx, params, batch, true)?;
        let gradients = pass.gradients.unwrap_or_default();
        if !gradients.is_finite() {
            return Err(AdaptationError::unstable("non-finite support gradients in inner loop"));
        }
        Ok(gradients)
    }

    fn adapt(&self, ctx: &StepContext<'_>, support: &Batch) -> Result<Adaptation> {
        let mut params = ctx.working_copy();
        let mut trajectory = Vec::new();
        let mut support_loss = None;

        for step in 0..self.config.num_inner_steps {
            let pass = supervised_pass(ctx, &params, support, true)?;
            let gradients = pass.gradients.unwrap_or_default();
            if !gradients.is_finite() {
                return Err(AdaptationError::unstable(format!(
                    "non-finite support gradients at inner step {}",
                    step
                )));
            }
            if step == 0 {
                support_loss = Some(pass.loss);
            }
            if self.config.second_order {
                trajectory.push(params.clone());
            }
            params.descend(&gradients, self.config.inner_lr);
        }

        Ok(Adaptation {
            params,
            trajectory,
            support_loss,
        })
    }

    /// Pull the query gradient back through the inner loop
    fn meta_gradient(
        &self,
        ctx: &StepContext<'_>,
        support: &Batch,
        adaptation: &Adaptation,
        query_gradients: Gradients,
    ) -> Result<Gradients> {
        let mut v = query_gradients;
        for theta in adaptation.trajectory.iter().rev() {
            let norm = v.global_norm();
            if norm == 0.0 {
                break;
            }
            let r = self.config.finite_difference_eps / norm;
            let plus = Self::gradients_at(ctx, &theta.offset(&v, r), support)?;
            let minus = Self::gradients_at(ctx, &theta.offset(&v, -r), support)?;

            let mut hvp = plus;
            hvp.add_scaled(&minus, -1.0);
            hvp.scale(1.0 / (2.0 * r));
            v.add_scaled(&hvp, -self.config.inner_lr);
        }
        Ok(v)
    }

    /// Adapt on the support set and score the query set
    fn episode_step(
        &self,
        episode: &Episode,
        metrics: &MetricSet,
        with_gradients: bool,
    ) -> Result<(MetricMap, Option<Gradients>)> {
        let ctx = self.core.context()?;
        let adaptation = self.adapt(&ctx, &episode.support)?;
        let query = supervised_pass(&ctx, &adaptation.params, &episode.query, with_gradients)?;

        let mut out = collect_metrics(
            metrics,
            &query.predictions,
            &episode.query,
            &query.modality_losses,
            query.loss,
        )?;
        if let Some(support_loss) = adaptation.support_loss {
            out.insert("support_loss".to_string(), support_loss);
            let adapted = supervised_pass(&ctx, &adaptation.params, &episode.support, false)?;
            out.insert("adapted_support_loss".to_string(), adapted.loss);
        }

        let gradients = match query.gradients {
            Some(query_gradients) if self.config.second_order => {
                Some(self.meta_gradient(&ctx, &episode.support, &adaptation, query_gradients)?)
            }
            other => other,
        };
        if let Some(gradients) = gradients.as_ref() {
            if !gradients.is_finite() {
                return Err(AdaptationError::unstable("non-finite meta-gradient"));
            }
        }
        Ok((out, gradients))
    }
}

impl AdaptationScheme for MamlScheme {
    fn kind(&self) -> SchemeKind {
        self.core.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            episodic: true,
            inner_loop: true,
            metric_based: false,
            fuses_experts: false,
            updates_backbone: self.scope.updates_backbone(),
        }
    }

    fn build(&mut self, input_shapes: &ShapeDict, output_shapes: &ShapeDict, output_activation: ActivationType) -> Result<()> {
        self.config.validate()?;
        build_supervised(
            &mut self.core,
            &self.config.head,
            self.scope.updates_backbone(),
            input_shapes,
            output_shapes,
            output_activation,
        )
    }

    fn train_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<TrainOutput> {
        self.core.built()?;
        let episode = batch.episode(self.config.episode_split)?;
        let (metrics, gradients) = self.episode_step(&episode, metrics, true)?;
        let gradients = gradients.unwrap_or_default();
        debug!(
            scheme = self.name(),
            support = episode.support_size(),
            query = episode.query_size(),
            inner_steps = self.config.num_inner_steps,
            loss = metrics.get("loss").copied().unwrap_or(f64::NAN),
            "Meta-train step"
        );
        Ok(TrainOutput { metrics, gradients })
    }

    fn eval_step(&self, batch: &TaskBatch, metrics: &MetricSet) -> Result<MetricMap> {
        self.core.built()?;
        let episode = batch.episode(self.config.episode_split)?;
        Ok(self.episode_step(&episode, metrics, false)?.0)
    }

    /// Episodes are adapted on their support set before predicting the query
    /// set. A plain batch is predicted with the meta-learned initialisation.
    fn inference_step(&self, batch: &TaskBatch) -> Result<Inference> {
        let ctx = self.core.context()?;
        match batch {
            TaskBatch::Standard(batch) => supervised_inference(&ctx, &ctx.current_params(), batch),
            TaskBatch::Episodic(episode) => {
                let adaptation = self.adapt(&ctx, &episode.support)?;
                supervised_inference(&ctx, &adaptation.params, &episode.query)
            }
        }
    }

    delegate_to_core!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heads::HeadConfig;
    use crate::schemes::fixtures::{class_batch, dense_backbone, image_task};
    use approx::assert_abs_diff_eq;

    fn built(scope: FineTuneScope, config: MamlConfig) -> MamlScheme {
        let (inputs, outputs) = image_task(3);
        let mut scheme = MamlScheme::new(dense_backbone(&inputs, 4), scope, config);
        scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();
        scheme
    }

    fn episode(seed: u64) -> TaskBatch {
        Episode::new(class_batch(6, 3, seed), class_batch(6, 3, seed + 1)).into()
    }

    #[test]
    fn test_inner_loop_reduces_support_loss() {
        let scheme = built(
            FineTuneScope::HeadsOnly,
            MamlConfig {
                num_inner_steps: 10,
                inner_lr: 0.5,
                ..MamlConfig::default()
            },
        );
        let out = scheme.eval_step(&episode(3), &MetricSet::classification()).unwrap();
        assert!(out["adapted_support_loss"] < out["support_loss"]);
        assert!(out.contains_key("accuracy"));
    }

    #[test]
    fn test_eval_does_not_commit_adaptation() {
        let scheme = built(FineTuneScope::FullModel, MamlConfig::default());
        let heads_before = scheme.head_parameters().unwrap().clone();
        let backbone_before = scheme.backbone().parameters();
        scheme.eval_step(&episode(1), &MetricSet::classification()).unwrap();
        assert_eq!(scheme.head_parameters().unwrap(), &heads_before);
        assert_eq!(scheme.backbone().parameters(), backbone_before);
    }

    #[test]
    fn test_head_only_meta_gradient_skips_backbone() {
        let scheme = built(FineTuneScope::HeadsOnly, MamlConfig::default());
        let out = scheme.train_step(&episode(2), &MetricSet::classification()).unwrap();
        assert!(out.gradients.backbone.is_empty());
        assert!(!out.gradients.heads.is_empty());
    }

    #[test]
    fn test_second_order_matches_finite_difference_meta_gradient() {
        let config = MamlConfig {
            head: HeadConfig::Linear,
            num_inner_steps: 2,
            inner_lr: 0.3,
            second_order: true,
            finite_difference_eps: 1e-5,
            ..MamlConfig::default()
        };
        let scheme = built(FineTuneScope::HeadsOnly, config);
        let task = episode(7);
        let metrics = MetricSet::new();
        let gradients = scheme.train_step(&task, &metrics).unwrap().gradients;

        // meta-loss as a function of one head weight, differentiated numerically
        let name = "image.linear.weight";
        let meta_loss = |delta: f64| {
            let mut shifted = built(FineTuneScope::HeadsOnly, scheme.config().clone());
            let state = shifted.core.built_mut().unwrap();
            state.head_params = scheme.head_parameters().unwrap().clone();
            state.head_params.get_mut(name).unwrap()[[1, 2]] += delta;
            shifted.eval_step(&task, &metrics).unwrap()["loss"]
        };
        let eps = 1e-5;
        let numeric = (meta_loss(eps) - meta_loss(-eps)) / (2.0 * eps);
        let analytic = gradients.heads.get(name).unwrap()[[1, 2]];
        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-4);
    }

    #[test]
    fn test_build_rejects_non_positive_inner_lr() {
        let (inputs, outputs) = image_task(3);
        let config = MamlConfig {
            inner_lr: 0.0,
            ..MamlConfig::default()
        };
        let mut scheme = MamlScheme::new(dense_backbone(&inputs, 4), FineTuneScope::HeadsOnly, config);
        assert!(matches!(
            scheme.build(&inputs, &outputs, ActivationType::Linear),
            Err(AdaptationError::Configuration(_))
        ));
        assert!(!scheme.is_built());
    }

    #[test]
    fn test_standard_batch_is_split() {
        let scheme = built(FineTuneScope::HeadsOnly, MamlConfig::default());
        let batch: TaskBatch = class_batch(8, 3, 4).into();
        let out = scheme.train_step(&batch, &MetricSet::classification()).unwrap();
        assert!(out.metrics["loss"].is_finite());

        let single: TaskBatch = class_batch(1, 3, 4).into();
        assert!(scheme.train_step(&single, &MetricSet::new()).is_err());
    }
}
