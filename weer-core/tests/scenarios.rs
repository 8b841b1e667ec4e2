//! End-to-end scenarios through the public API.

use approx::assert_relative_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use weer_core::bin::{Bin, Binning};
use weer_core::config::{ResamplerConfig, ReweightSettings};
use weer_core::controller::{PopulationController, WeDriver};
use weer_core::observer::RecordingObserver;
use weer_core::reweight::divergence::{kl_divergence, CandidateSamples};
use weer_core::reweight::optimize_weights;
use weer_core::subgroup::ParentGrouping;
use weer_core::walker::{merge_walkers, split_walker, Walker};

#[test]
fn test_optimized_weights_beat_uniform_baseline() {
    let reference = [1.0, 2.0, 3.0, 4.0, 5.0];
    let candidate = CandidateSamples::from_points(&[1.2, 2.2, 2.8, 4.5, 5.5, 6.0, 5.0]).unwrap();
    let uniform = vec![1.0 / 7.0; 7];

    let weights = optimize_weights(&reference, &uniform, &candidate, 100, 1e-10).unwrap();

    assert_relative_eq!(weights.sum(), 1.0, epsilon = 1e-6);
    assert!(weights.iter().all(|&w| (0.0..=1.0).contains(&w)));
    let baseline = kl_divergence(&uniform, &reference, &candidate, 100, 1e-10).unwrap();
    let optimised =
        kl_divergence(weights.as_slice().unwrap(), &reference, &candidate, 100, 1e-10).unwrap();
    assert!(optimised < baseline);
}

#[test]
fn test_self_divergence_vanishes() {
    let reference = [0.5, 1.5, 1.5, 2.5, 4.0];
    let candidate = CandidateSamples::from_points(&reference).unwrap();
    let d = kl_divergence(&[0.2; 5], &reference, &candidate, 100, 1e-10).unwrap();
    assert!(d.abs() < 1e-8, "divergence {}", d);
}

#[test]
fn test_split_and_merge_conserve_weight() {
    let walker = Walker::from_trajectory(0.6, vec![1.0]).unwrap().with_parent(1);
    let copies = split_walker(&walker, 4).unwrap();
    assert_eq!(copies.len(), 4);
    for copy in &copies {
        assert_relative_eq!(copy.weight, 0.15, epsilon = 1e-12);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let merged = merge_walkers(copies, &mut rng).unwrap();
    assert_relative_eq!(merged.weight, 0.6, epsilon = 1e-12);
}

#[test]
fn test_three_subgroups_to_five_walkers() {
    let controller = PopulationController::new(ResamplerConfig {
        seed: Some(8),
        do_adjust_counts: true,
        subgroup: Box::new(ParentGrouping {}),
        reweight: ReweightSettings::disabled(),
        ..ResamplerConfig::default()
    })
    .unwrap();
    let walkers = [(0.1, 0), (0.25, 0), (0.3, 1), (0.2, 2), (0.15, 2)]
        .iter()
        .map(|&(w, parent)| {
            Walker::from_trajectory(w, vec![0.5])
                .unwrap()
                .with_parent(parent)
        })
        .collect();
    let mut binning = Binning::new(vec![Bin::with_walkers(5, walkers)]);

    let summary = controller
        .run_iteration(&mut binning, &RecordingObserver::new())
        .unwrap();

    assert_eq!(summary.total_subgroups, 3);
    assert_eq!(binning.bins[0].len(), 5);
    assert_relative_eq!(binning.total_weight(), 1.0, epsilon = 1e-12);
}

#[test]
fn test_heavy_walker_split_below_threshold() {
    let controller = PopulationController::new(ResamplerConfig {
        seed: Some(8),
        do_thresholds: true,
        largest_allowed_weight: 0.1,
        reweight: ReweightSettings::disabled(),
        ..ResamplerConfig::default()
    })
    .unwrap();
    let mut binning = Binning::new(vec![
        Bin::with_walkers(
            4,
            vec![Walker::from_trajectory(0.3, vec![0.5]).unwrap().with_parent(0)],
        ),
        Bin::with_walkers(
            7,
            vec![Walker::from_trajectory(0.7, vec![1.5]).unwrap().with_parent(1)],
        ),
    ]);
    let observer = RecordingObserver::new();

    let summary = controller.run_iteration(&mut binning, &observer).unwrap();

    assert_eq!(binning.bins[0].len(), 4);
    assert_eq!(binning.bins[1].len(), 7);
    assert!(binning.walkers().all(|w| w.weight <= 0.1));
    assert!(summary.warnings.is_empty());
    assert!(observer.threshold_violations().is_empty());
}
