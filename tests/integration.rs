//! End-to-end tests across schemes, trainer and configuration files

use adaptation_schemes::backbone::{BackboneConfig, DenseBackbone, IdentityBackbone, SharedBackbone};
use adaptation_schemes::config::{load_config, ExperimentConfig, LoggingSettings};
use adaptation_schemes::data::{dummy_batch, Batch, Episode, Modality, ShapeDescriptor, ShapeDict, Target, TaskBatch};
use adaptation_schemes::error::AdaptationError;
use adaptation_schemes::heads::HeadConfig;
use adaptation_schemes::metrics::{argmax_rows, MetricSet};
use adaptation_schemes::nn::{ActivationType, Gradients};
use adaptation_schemes::optim::{OptimizerConfig, SchedulerConfig};
use adaptation_schemes::schemes::{
    fuse_experts, AdaptationScheme, DistanceMetric, ExpertOutput, FineTuneScope, FineTuningConfig, FineTuningScheme,
    LearnerSettings, MamlConfig, MamlScheme, MatchingNetworkScheme, MetricConfig, PoemConfig, PoemHeadMetricConfig,
    PrototypicalNetworkScheme, SchemeConfig,
};
use adaptation_schemes::training::{Trainer, TrainerConfig};
use approx::assert_abs_diff_eq;
use ndarray::{array, Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn image_shapes(input: Vec<usize>, classes: usize) -> (ShapeDict, ShapeDict) {
    (
        ShapeDict::from([(Modality::Image, ShapeDescriptor::new(input))]),
        ShapeDict::from([(Modality::Image, ShapeDescriptor::classes(classes))]),
    )
}

fn dense_backbone(inputs: &ShapeDict) -> SharedBackbone {
    let config = BackboneConfig::new(vec![8], vec![5]).with_seed(11);
    SharedBackbone::new(DenseBackbone::new(config, inputs).unwrap())
}

/// Labelled batch whose class shows up as a bump in one input column
fn labelled_batch(n: usize, width: usize, classes: usize, rng: &mut StdRng) -> Batch {
    let labels: Vec<usize> = (0..n).map(|i| i % classes).collect();
    let inputs = ArrayD::from_shape_fn(IxDyn(&[n, width]), |idx| {
        let bump = if idx[1] == labels[idx[0]] % width { 2.0 } else { 0.0 };
        bump + rng.gen_range(-0.2..0.2)
    });
    Batch::new()
        .with_input(Modality::Image, inputs)
        .with_target(Modality::Image, Target::Classes(labels))
}

fn every_scheme() -> Vec<SchemeConfig> {
    vec![
        SchemeConfig::SingleLinearLayerFineTuning(FineTuningConfig::default()),
        SchemeConfig::FullModelFineTuning(FineTuningConfig::default()),
        SchemeConfig::EpisodicMamlSingleLinearLayer(MamlConfig::default()),
        SchemeConfig::EpisodicMamlFullModel(MamlConfig::default()),
        SchemeConfig::EpisodicPrototypicalNetwork(MetricConfig::default()),
        SchemeConfig::EpisodicMatchingNetwork(MetricConfig::default()),
        SchemeConfig::PartialObservationExpertsModelling(PoemConfig::default()),
        SchemeConfig::PrototypicalNetworkPoemHead(small_fused_metric()),
        SchemeConfig::MatchingNetworkPoemHead(small_fused_metric()),
    ]
}

fn small_fused_metric() -> PoemHeadMetricConfig {
    PoemHeadMetricConfig {
        embedding_dim: 8,
        ..PoemHeadMetricConfig::default()
    }
}

#[test]
fn test_steps_before_build_fail() {
    let (inputs, _) = image_shapes(vec![4], 3);
    let mut rng = StdRng::seed_from_u64(0);
    let batch: TaskBatch = labelled_batch(4, 4, 3, &mut rng).into();
    let single: TaskBatch = labelled_batch(1, 4, 3, &mut rng).into();
    let metrics = MetricSet::classification();

    for config in every_scheme() {
        let mut scheme = config.instantiate(dense_backbone(&inputs)).unwrap();
        let not_built = |err: AdaptationError| matches!(err, AdaptationError::NotBuilt { .. });
        assert!(not_built(scheme.train_step(&batch, &metrics).unwrap_err()), "{}", scheme.name());
        assert!(not_built(scheme.eval_step(&batch, &metrics).unwrap_err()));
        assert!(not_built(scheme.inference_step(&batch).unwrap_err()));
        // too small to split into support and query
        assert!(not_built(scheme.train_step(&single, &metrics).unwrap_err()), "{}", scheme.name());
        assert!(not_built(scheme.eval_step(&single, &metrics).unwrap_err()), "{}", scheme.name());
        assert!(not_built(scheme.inference_step(&single).unwrap_err()), "{}", scheme.name());
        assert!(not_built(scheme.reset_learning().unwrap_err()));
        assert!(not_built(scheme.optimizer_step(&Gradients::default()).unwrap_err()));
    }
}

#[test]
fn test_reset_learning_only_touches_heads() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let config = FineTuningConfig {
        learner: LearnerSettings::default().with_optimizer(OptimizerConfig::sgd(0.1, 0.9)),
        ..FineTuningConfig::default()
    };
    let mut scheme = FineTuningScheme::new(dense_backbone(&inputs), FineTuneScope::FullModel, config);
    scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    let batch: TaskBatch = labelled_batch(6, 4, 3, &mut rng).into();
    let out = scheme.train_step(&batch, &MetricSet::new()).unwrap();
    scheme.optimizer_step(&out.gradients).unwrap();

    let heads_before = scheme.head_parameters().unwrap().clone();
    let backbone_before = scheme.backbone().parameters();
    let momentum_key = "heads/image.linear.weight";
    let momentum_before = scheme.optimizer().unwrap().momentum(momentum_key).cloned().unwrap();
    let tracked_before = scheme.optimizer().unwrap().num_tracked();

    scheme.reset_learning().unwrap();

    assert!(scheme.head_parameters().unwrap().max_abs_diff(&heads_before) > 0.0);
    assert_eq!(scheme.backbone().parameters(), backbone_before);
    assert_eq!(scheme.optimizer().unwrap().momentum(momentum_key), Some(&momentum_before));
    assert_eq!(scheme.optimizer().unwrap().num_tracked(), tracked_before);
}

#[test]
fn test_maml_without_inner_steps_matches_fine_tuning() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let backbone = dense_backbone(&inputs);

    let mut fine_tuning = FineTuningScheme::new(backbone.clone(), FineTuneScope::HeadsOnly, FineTuningConfig::default());
    fine_tuning.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    let maml_config = MamlConfig {
        num_inner_steps: 0,
        ..MamlConfig::default()
    };
    let mut maml = MamlScheme::new(backbone, FineTuneScope::HeadsOnly, maml_config);
    maml.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    assert_eq!(maml.head_parameters().unwrap(), fine_tuning.head_parameters().unwrap());

    let mut rng = StdRng::seed_from_u64(2);
    let support = labelled_batch(6, 4, 3, &mut rng);
    let query = labelled_batch(6, 4, 3, &mut rng);
    let metrics = MetricSet::classification();

    let plain = fine_tuning.train_step(&query.clone().into(), &metrics).unwrap();
    let meta = maml.train_step(&Episode::new(support, query).into(), &metrics).unwrap();

    assert_abs_diff_eq!(plain.metrics["loss"], meta.metrics["loss"], epsilon = 1e-12);
    assert!(plain.gradients.max_abs_diff(&meta.gradients) < 1e-12);
    assert!(!meta.metrics.contains_key("support_loss"));
}

#[test]
fn test_poem_fusion_properties() {
    let p = 0.8;
    let equal = fuse_experts(&[
        ExpertOutput {
            modality: Modality::Image,
            mean: array![[1.0, 4.0]],
            precision: Array2::from_elem((1, 2), p),
            observed: vec![true],
        },
        ExpertOutput {
            modality: Modality::Text,
            mean: array![[3.0, -2.0]],
            precision: Array2::from_elem((1, 2), p),
            observed: vec![true],
        },
    ])
    .unwrap();
    for j in 0..2 {
        assert_abs_diff_eq!(equal.precision[[0, j]], 2.0 * p, epsilon = 1e-12);
    }
    assert_abs_diff_eq!(equal.mean[[0, 0]], 2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(equal.mean[[0, 1]], 1.0, epsilon = 1e-12);

    let single = fuse_experts(&[
        ExpertOutput {
            modality: Modality::Image,
            mean: array![[0.5], [1.5]],
            precision: array![[3.0], [0.25]],
            observed: vec![true, false],
        },
        ExpertOutput {
            modality: Modality::Audio,
            mean: array![[-1.0], [7.0]],
            precision: array![[1.0], [2.0]],
            observed: vec![true, true],
        },
    ])
    .unwrap();
    assert_abs_diff_eq!(single.mean[[1, 0]], 7.0, epsilon = 1e-12);
    assert_abs_diff_eq!(single.precision[[1, 0]], 2.0, epsilon = 1e-12);
}

#[test]
fn test_one_shot_prototypes_and_matching_rank_alike() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let backbone = SharedBackbone::new(IdentityBackbone::new());
    let config = MetricConfig {
        distance: DistanceMetric::Euclidean,
        fine_tune_backbone: false,
        ..MetricConfig::default()
    };
    let mut prototypical = PrototypicalNetworkScheme::new(backbone.clone(), config.clone());
    prototypical.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    let mut matching = MatchingNetworkScheme::new(backbone, config);
    matching.build(&inputs, &outputs, ActivationType::Linear).unwrap();

    let mut rng = StdRng::seed_from_u64(3);
    let support = labelled_batch(3, 4, 3, &mut rng);
    let query = Batch::new()
        .with_input(
            Modality::Image,
            ArrayD::from_shape_fn(IxDyn(&[5, 4]), |_| rng.gen_range(-1.0..2.0)),
        )
        .with_target(Modality::Image, Target::Classes(vec![0; 5]));
    let episode: TaskBatch = Episode::new(support, query).into();

    let by_prototype = prototypical.inference_step(&episode).unwrap().predictions[&Modality::Image].clone();
    let by_attention = matching.inference_step(&episode).unwrap().predictions[&Modality::Image].clone();
    let ranking = |scores: &Array2<f64>| -> Vec<Vec<usize>> {
        scores
            .rows()
            .into_iter()
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
                order
            })
            .collect()
    };
    assert_eq!(ranking(&by_prototype), ranking(&by_attention));
    assert_eq!(argmax_rows(&by_prototype), argmax_rows(&by_attention));
}

#[test]
fn test_build_then_infer_on_dummy_batch() {
    let (inputs, outputs) = image_shapes(vec![2, 3], 4);
    for config in every_scheme() {
        let mut scheme = config.instantiate(dense_backbone(&inputs)).unwrap();
        scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();

        // 2 is the batch size used for feature discovery
        for batch_size in [2, 4] {
            let mut rng = StdRng::seed_from_u64(4);
            let batch = dummy_batch(&inputs, &outputs, batch_size, &mut rng);
            let inference = scheme.inference_step(&batch.into()).unwrap();
            let predictions = &inference.predictions[&Modality::Image];
            assert_eq!(predictions.ncols(), 4, "{}", scheme.name());
            if scheme.capabilities().metric_based {
                assert!(predictions.nrows() > 0);
            } else {
                assert_eq!(predictions.nrows(), batch_size, "{}", scheme.name());
            }
            assert_eq!(inference.precisions.is_empty(), !scheme.capabilities().fuses_experts);
        }
        assert_eq!(scheme.capabilities().episodic, scheme.kind().is_episodic());
    }
}

#[test]
fn test_wide_features_single_linear_layer() {
    let (inputs, outputs) = image_shapes(vec![2048], 10);
    let mut scheme = SchemeConfig::SingleLinearLayerFineTuning(FineTuningConfig::default())
        .instantiate(SharedBackbone::new(IdentityBackbone::new()))
        .unwrap();
    scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    let batch = Batch::new()
        .with_input(
            Modality::Image,
            ArrayD::from_shape_fn(IxDyn(&[2, 2048]), |_| rng.gen_range(-1.0..1.0)),
        )
        .with_target(Modality::Image, Target::Classes(vec![3, 7]));
    let out = scheme.train_step(&batch.into(), &MetricSet::classification()).unwrap();

    let loss = out.metrics["loss"];
    assert!(loss.is_finite() && loss >= 0.0);
    assert!((0.0..=1.0).contains(&out.metrics["accuracy"]));
    assert_eq!(out.gradients.heads.get("image.linear.weight").unwrap().shape(), &[2048, 10]);
}

#[test]
fn test_head_only_optimizer_excludes_backbone() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let config = FineTuningConfig {
        learner: LearnerSettings::default().with_optimizer(OptimizerConfig::sgd(0.1, 0.9)),
        ..FineTuningConfig::default()
    };
    let backbone = dense_backbone(&inputs);
    let mut scheme = FineTuningScheme::new(backbone.clone(), FineTuneScope::HeadsOnly, config);
    scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    assert!(!scheme.trainable().unwrap().includes_backbone());
    assert!(!backbone.is_claimed());

    let before = backbone.parameters();
    let mut rng = StdRng::seed_from_u64(6);
    let out = scheme.train_step(&labelled_batch(6, 4, 3, &mut rng).into(), &MetricSet::new()).unwrap();
    scheme.optimizer_step(&out.gradients).unwrap();

    assert_eq!(backbone.parameters(), before);
    let tracked = scheme.optimizer().unwrap().num_tracked();
    assert_eq!(tracked, scheme.head_parameters().unwrap().len());
}

#[test]
fn test_second_full_model_claim_fails() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let backbone = dense_backbone(&inputs);

    let mut first = FineTuningScheme::new(backbone.clone(), FineTuneScope::FullModel, FineTuningConfig::default());
    first.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    // rebuilding releases and retakes the same claim
    first.build(&inputs, &outputs, ActivationType::Linear).unwrap();

    let mut second = MamlScheme::new(backbone.clone(), FineTuneScope::FullModel, MamlConfig::default());
    assert!(matches!(
        second.build(&inputs, &outputs, ActivationType::Linear),
        Err(AdaptationError::Configuration(_))
    ));

    drop(first);
    assert!(!backbone.is_claimed());
    second.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    assert!(backbone.is_claimed());
}

#[test]
fn test_cosine_schedule_reaches_floor() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let config = FineTuningConfig {
        learner: LearnerSettings::default()
            .with_optimizer(OptimizerConfig::adam(0.01))
            .with_scheduler(SchedulerConfig::cosine(4, 1e-4)),
        ..FineTuningConfig::default()
    };
    let mut scheme = FineTuningScheme::new(dense_backbone(&inputs), FineTuneScope::HeadsOnly, config);
    scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();
    assert_abs_diff_eq!(scheme.learning_rate().unwrap(), 0.01, epsilon = 1e-15);

    let mut previous = 0.01;
    for _ in 0..4 {
        let lr = scheme.scheduler_step(None).unwrap();
        assert!(lr < previous);
        previous = lr;
    }
    assert_abs_diff_eq!(scheme.learning_rate().unwrap(), 1e-4, epsilon = 1e-12);
    assert_abs_diff_eq!(scheme.scheduler_step(None).unwrap(), 1e-4, epsilon = 1e-12);
}

#[test]
fn test_config_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let experiments = vec![
        ExperimentConfig {
            scheme: SchemeConfig::PartialObservationExpertsModelling(PoemConfig {
                mean_head: HeadConfig::mlp(3, 16),
                ..PoemConfig::default()
            }),
            trainer: TrainerConfig::default().with_max_epochs(3),
            logging: LoggingSettings {
                level: "debug".to_string(),
                json: true,
            },
        },
        ExperimentConfig {
            scheme: SchemeConfig::EpisodicMatchingNetwork(MetricConfig {
                distance: DistanceMetric::Cosine,
                embedding_head: Some(HeadConfig::Linear),
                ..MetricConfig::default()
            }),
            ..ExperimentConfig::default()
        },
        ExperimentConfig {
            scheme: SchemeConfig::EpisodicMamlFullModel(MamlConfig {
                second_order: true,
                ..MamlConfig::default()
            }),
            ..ExperimentConfig::default()
        },
    ];

    for (i, experiment) in experiments.iter().enumerate() {
        for extension in ["json", "toml", "yaml"] {
            let path = dir.path().join(format!("experiment_{}.{}", i, extension));
            experiment.save(&path).unwrap();
            let loaded = load_config(&path).unwrap();
            assert_eq!(&loaded, experiment, "{}", path.display());
        }
    }
}

#[test]
fn test_trainer_drives_episodic_scheme() {
    let (inputs, outputs) = image_shapes(vec![4], 3);
    let config = MetricConfig {
        learner: LearnerSettings::default().with_optimizer(OptimizerConfig::adam(0.01)),
        ..MetricConfig::default()
    };
    let mut scheme = PrototypicalNetworkScheme::new(dense_backbone(&inputs), config);
    scheme.build(&inputs, &outputs, ActivationType::Linear).unwrap();

    let mut rng = StdRng::seed_from_u64(8);
    let episodes: Vec<TaskBatch> = (0..3)
        .map(|_| Episode::new(labelled_batch(6, 4, 3, &mut rng), labelled_batch(6, 4, 3, &mut rng)).into())
        .collect();

    let backbone_before = scheme.backbone().parameters();
    let mut trainer = Trainer::new(TrainerConfig::default().with_max_epochs(2)).unwrap();
    let summaries = trainer
        .fit(&mut scheme, &episodes, &episodes[..1], &MetricSet::classification())
        .unwrap();
    assert_eq!(summaries.len(), 4);
    assert!(summaries.iter().all(|s| s.skipped == 0));
    assert_ne!(scheme.backbone().parameters(), backbone_before);

    let test = trainer.test(&scheme, &episodes, &MetricSet::classification()).unwrap();
    assert!(test.metrics.contains_key("test/overall_accuracy"));
}
