#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

mod common;

use aog_core::grid::ScoreMap;
use aog_core::loss::LossSpec;
use aog_core::{Anchor, DetectOptions, Inference, InferenceConfig, InferenceError, LossKind};
use common::{block_grammar, two_block_scene};

fn root_maps(engine: &Inference<'_>) -> Vec<Option<ScoreMap>> {
    engine.cache().scores(engine.root()).to_vec()
}

#[test]
fn test_hardest_negative_under_loss() {
    let (pyramid, boxes) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();

    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.5);
    engine.propagate_with_loss(&pyramid, &LossSpec::new(&overlap, 0)).unwrap();

    let top = DetectOptions::builder().threshold(f64::NEG_INFINITY).max_detections(1).build();
    let selection = engine.select_candidates(&top).unwrap();
    let worst = selection.candidates[0];
    // a half-covering window of the first block: score 0 plus loss 1
    assert_eq!(worst.anchor, Anchor { level: 0, x: 2, y: 2 });
    assert_eq!(worst.score, 1.0);

    let tree = engine.parse(&worst.anchor, true).unwrap();
    assert_eq!(tree.total_loss(), 1.0);
    assert_eq!(tree.nodes()[1].score, 0.0);

    // no backup was taken
    assert!(matches!(engine.recover(), Err(InferenceError::MissingBackup)));
}

#[test]
fn test_correct_window_carries_no_loss() {
    let (pyramid, boxes) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.5);
    engine.propagate_with_loss(&pyramid, &LossSpec::new(&overlap, 1)).unwrap();

    let cache = engine.cache();
    let object = engine.object_nodes()[0];
    assert_eq!(cache.loss_map(object, 0).unwrap().get(9, 10), 0.0);
    // the other instance is excluded, not rewarded
    assert_eq!(cache.score(engine.root(), 0, 3, 2), Some(f64::NEG_INFINITY));
}

#[test]
fn test_overlap_loss_scales_with_overlap() {
    let (pyramid, boxes) = two_block_scene(0.0);
    let grammar = block_grammar();
    let config = InferenceConfig::builder().loss_kind(LossKind::Overlap).build();
    let mut engine = Inference::with_config(&grammar, config).unwrap();
    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.5);
    engine.propagate(&pyramid).unwrap();
    engine.apply_loss(&LossSpec::new(&overlap, 0), true).unwrap();

    let object = engine.object_nodes()[0];
    let loss = engine.cache().loss_map(object, 0).unwrap();
    // IoU of a half-shifted window is 1/3
    assert!((loss.get(2, 2) - 2.0 / 3.0).abs() < 1e-12);
    assert_eq!(loss.get(0, 0), 1.0);
    engine.recover().unwrap();
}

#[test]
fn test_inhibit_then_recover_round_trip() {
    let (pyramid, boxes) = two_block_scene(0.05);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    engine.propagate(&pyramid).unwrap();
    let before = root_maps(&engine);

    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.5);
    engine.inhibit_output(&overlap, 1, 0.5, true).unwrap();
    engine.apply_loss(&LossSpec::new(&overlap, 1), true).unwrap();

    let selection = engine.select_candidates(&DetectOptions::with_threshold(f64::NEG_INFINITY)).unwrap();
    assert_eq!(selection.candidates[0].anchor, Anchor { level: 0, x: 10, y: 9 });

    engine.recover().unwrap();
    let after = root_maps(&engine);
    for (a, b) in before.iter().zip(&after) {
        assert!(a.as_ref().unwrap().bit_eq(b.as_ref().unwrap()));
    }
}

#[test]
fn test_best_parse_per_box_leaves_maps_untouched() {
    let (pyramid, boxes) = two_block_scene(0.05);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    engine.propagate(&pyramid).unwrap();
    let before = root_maps(&engine);

    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.7);
    assert_eq!(overlap.valid_levels(), &[true]);
    let parses = engine.best_parse_per_box(&overlap, 0.7).unwrap();

    let anchors: Vec<Anchor> = parses.iter().map(|p| p.as_ref().unwrap().root().anchor).collect();
    assert_eq!(anchors, vec![Anchor { level: 0, x: 2, y: 3 }, Anchor { level: 0, x: 10, y: 9 }]);
    for (i, tree) in parses.iter().enumerate() {
        assert_eq!(tree.as_ref().unwrap().root().bbox, boxes[i]);
    }

    let after = root_maps(&engine);
    for (a, b) in before.iter().zip(&after) {
        assert!(a.as_ref().unwrap().bit_eq(b.as_ref().unwrap()));
    }
    assert!(!engine.cache().has_backup());
}

#[test]
fn test_recover_keeps_loss_of_loss_augmented_run() {
    let (pyramid, boxes) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.5);
    engine.propagate_with_loss(&pyramid, &LossSpec::new(&overlap, 0)).unwrap();

    let anchor = Anchor { level: 0, x: 2, y: 2 };
    let tree = engine.parse(&anchor, true).unwrap();
    assert_eq!((tree.total_loss(), tree.score()), (1.0, 1.0));

    engine.inhibit_output(&overlap, 1, 0.5, true).unwrap();
    engine.recover().unwrap();
    let tree = engine.parse(&anchor, true).unwrap();
    assert_eq!((tree.total_loss(), tree.score()), (1.0, 1.0));

    engine.best_parse_per_box(&overlap, 0.5).unwrap();
    let tree = engine.parse(&anchor, true).unwrap();
    assert_eq!((tree.total_loss(), tree.score()), (1.0, 1.0));
}

#[test]
fn test_best_parse_per_box_keeps_caller_inhibition() {
    let (pyramid, boxes) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    engine.propagate(&pyramid).unwrap();
    let root = engine.root();

    let overlap = engine.compute_overlap(&boxes, &pyramid, 0.5);
    engine.inhibit_output(&overlap, 1, 0.5, true).unwrap();
    assert_eq!(engine.cache().score(root, 0, 3, 2), Some(f64::NEG_INFINITY));

    let parses = engine.best_parse_per_box(&overlap, 0.5).unwrap();
    // the first block was already excluded by the caller
    assert!(parses[0].is_none());
    assert_eq!(parses[1].as_ref().unwrap().root().anchor, Anchor { level: 0, x: 10, y: 9 });

    assert_eq!(engine.cache().score(root, 0, 3, 2), Some(f64::NEG_INFINITY));
    assert!(engine.cache().has_backup());
    engine.recover().unwrap();
    assert_eq!(engine.cache().score(root, 0, 3, 2), Some(0.5));
}
