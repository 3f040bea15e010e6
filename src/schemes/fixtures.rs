//! Small tasks shared by the scheme unit tests

use crate::backbone::{BackboneConfig, DenseBackbone, SharedBackbone};
use crate::data::{Batch, Modality, ShapeDescriptor, ShapeDict, Target};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) const INPUT_DIM: usize = 6;

/// Image input of width `INPUT_DIM` and a `classes`-way label output
pub(crate) fn image_task(classes: usize) -> (ShapeDict, ShapeDict) {
    let inputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::new(vec![INPUT_DIM]))]);
    let outputs = ShapeDict::from([(Modality::Image, ShapeDescriptor::classes(classes))]);
    (inputs, outputs)
}

pub(crate) fn dense_backbone(inputs: &ShapeDict, feature_dim: usize) -> SharedBackbone {
    let config = BackboneConfig::new(vec![8], vec![feature_dim]).with_seed(3);
    SharedBackbone::new(DenseBackbone::new(config, inputs).unwrap())
}

/// `n` labelled examples, label `i % classes`, with a class-dependent offset
pub(crate) fn class_batch(n: usize, classes: usize, seed: u64) -> Batch {
    let mut rng = StdRng::seed_from_u64(seed);
    let labels: Vec<usize> = (0..n).map(|i| i % classes).collect();
    let inputs = ArrayD::from_shape_fn(IxDyn(&[n, INPUT_DIM]), |idx| {
        let centre = if idx[1] == labels[idx[0]] % INPUT_DIM { 2.0 } else { 0.0 };
        centre + rng.gen_range(-0.3..0.3)
    });
    Batch::new()
        .with_input(Modality::Image, inputs)
        .with_target(Modality::Image, Target::Classes(labels))
}
