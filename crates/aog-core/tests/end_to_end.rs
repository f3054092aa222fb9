#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

mod common;

use aog_core::grid::ScoreMap;
use aog_core::test_utils::{deformable_grammar, random_pyramid, single_channel_pyramid, two_object_grammar};
use aog_core::{Anchor, BoundingBox, DetectOptions, Inference, InferenceConfig, NodeId};
use approx::assert_abs_diff_eq;
use common::{block_grammar, two_block_scene};

#[test]
fn test_deformable_hand_computed() {
    // f is zero except f(y 1, x 3) = 9 and f(y 4, x 0) = 5; cost dx^2 + dy^2
    let mut f = ScoreMap::filled(5, 5, 0.0);
    f.set(1, 3, 9.0);
    f.set(4, 0, 5.0);
    let pyramid = single_channel_pyramid(&[f], 0, 0);
    let grammar = deformable_grammar(1.0, 0);
    let root = grammar.root().unwrap();

    let mut engine = Inference::new(&grammar).unwrap();
    engine.propagate(&pyramid).unwrap();
    let cache = engine.cache();
    let disp = cache.displacement(root, 0).unwrap();

    // (y 3, x 1): 9 - (4 + 4) = 1 loses to 5 - (1 + 1) = 3
    assert_eq!(cache.score(root, 0, 3, 1), Some(3.0));
    assert_eq!((disp.dx.get(3, 1), disp.dy.get(3, 1)), (-1, 1));
    // (y 2, x 3): one row below the 9
    assert_eq!(cache.score(root, 0, 2, 3), Some(8.0));
    assert_eq!((disp.dx.get(2, 3), disp.dy.get(2, 3)), (0, -1));
    // (y 4, x 4): staying put beats both peaks
    assert_eq!(cache.score(root, 0, 4, 4), Some(0.0));
    assert_eq!((disp.dx.get(4, 4), disp.dy.get(4, 4)), (0, 0));

    let tree = engine.parse(&Anchor { level: 0, x: 1, y: 3 }, false).unwrap();
    assert_eq!(tree.nodes()[1].anchor, Anchor { level: 0, x: 0, y: 4 });
    assert_eq!(tree.nodes()[1].displacement, Some([-1, 1]));
}

#[test]
fn test_detect_finds_planted_blocks() {
    let (pyramid, boxes) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();

    let (detections, stats) = engine
        .detect_with_stats(&pyramid, &DetectOptions::with_threshold(0.1))
        .unwrap();

    assert_eq!(detections.len(), 2);
    assert_eq!(stats.num_detections, 2);
    assert_eq!(stats.num_above_threshold, 2);
    assert_eq!(stats.num_valid_levels, 1);
    assert!(stats.total_ms >= stats.propagation_ms);

    // equal scores keep row-major order
    for (det, expected) in detections.iter().zip(&boxes) {
        assert_abs_diff_eq!(det.candidate.score, 0.5);
        assert_eq!(det.candidate.bbox, *expected);
        assert_eq!(det.parse.root().bbox, *expected);
        assert_eq!(det.parse.len(), 3);
    }
    assert_eq!(detections[0].candidate.anchor, Anchor { level: 0, x: 2, y: 3 });
}

#[test]
fn test_detect_ext_keeps_raw_detections() {
    let (pyramid, _) = two_block_scene(0.05);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();

    let ext = engine.detect_ext(&pyramid, -0.1).unwrap();
    // without suppression every raw detection is parsed
    assert_eq!(ext.detections.len(), ext.raw.len());
    assert_eq!(ext.stats.num_above_threshold, ext.raw.len());
    assert!(ext.raw.len() > 2);
    assert!(ext.raw.windows(2).all(|w| w[0].score >= w[1].score));

    let top: Vec<Anchor> = ext.raw.iter().take(2).map(|c| c.anchor).collect();
    assert!(top.contains(&Anchor { level: 0, x: 2, y: 3 }));
    assert!(top.contains(&Anchor { level: 0, x: 10, y: 9 }));

    // half-block windows overlap a full block by exactly one half
    let config = InferenceConfig::builder().nms_overlap(0.3).build();
    let mut strict = Inference::with_config(&grammar, config).unwrap();
    let kept = strict.detect(&pyramid, &DetectOptions::with_threshold(-0.1)).unwrap();
    assert_eq!(kept.len(), 2);
}

#[test]
fn test_multi_level_parse_is_consistent() {
    let pyramid = random_pyramid(3, &[(14, 14), (10, 10), (7, 7)], 2, 2, 1);
    let grammar = two_object_grammar();
    let mut engine = Inference::new(&grammar).unwrap();

    let detections = engine
        .detect(&pyramid, &DetectOptions::builder().threshold(f64::NEG_INFINITY).max_detections(10).build())
        .unwrap();
    assert!(!detections.is_empty());

    for det in &detections {
        let tree = &det.parse;
        assert_eq!(tree.root().node, grammar.root().unwrap());
        assert_eq!(tree.score(), det.candidate.score);
        assert_eq!(tree.nodes()[1].node, det.candidate.object);
        // an OR node carries its chosen child's score
        assert_eq!(tree.nodes()[1].score, tree.score());

        // every AND node re-adds to its children within rounding
        for (i, node) in tree.nodes().iter().enumerate() {
            let kind = &grammar.node(node.node).kind;
            if let aog_core::grammar::NodeKind::Compositional { bias, .. } = kind {
                let sum: f64 = tree.children(i).map(|c| c.score).sum();
                assert_abs_diff_eq!(node.score, sum + bias, epsilon = 1e-9);
            }
            if let aog_core::grammar::NodeKind::Deformable { bias, deformation, .. } = kind {
                let mut sum = *bias;
                for c in tree.children(i) {
                    sum += c.score;
                    if let Some([dx, dy]) = c.displacement {
                        sum -= deformation.cost(dx, dy);
                    }
                }
                assert_abs_diff_eq!(node.score, sum, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_release_then_stale() {
    let (pyramid, _) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    engine.propagate(&pyramid).unwrap();
    engine.release();

    assert!(matches!(
        engine.select_candidates(&DetectOptions::default()),
        Err(aog_core::InferenceError::StaleCache)
    ));
    assert!(matches!(
        engine.parse(&Anchor::default(), false),
        Err(aog_core::InferenceError::StaleCache)
    ));

    // a fresh run makes the engine usable again
    engine.propagate(&pyramid).unwrap();
    assert_eq!(engine.cache().generation(), 2);
    assert!(engine.select_candidates(&DetectOptions::default()).is_ok());
}

#[test]
fn test_window_matches_object_extent() {
    let (pyramid, _) = two_block_scene(0.0);
    let grammar = block_grammar();
    let mut engine = Inference::new(&grammar).unwrap();
    engine.propagate(&pyramid).unwrap();
    let selection = engine.select_candidates(&DetectOptions::with_threshold(0.1)).unwrap();
    let object = NodeId::new(1);
    assert!(selection.candidates.iter().all(|c| c.object == object));
    assert_eq!(selection.candidates[1].bbox, BoundingBox::new(10.0, 9.0, 2.0, 2.0));
}
