use aog_core::filter::LinearFilter;
use aog_core::grammar::{Grammar, Offset, Part};
use aog_core::pyramid::FeaturePyramid;
use aog_core::select::BoundingBox;
use aog_core::test_utils::scene::SceneBuilder;

/// A 16x16 single-channel level with two 2x2 blocks of ones, at
/// `(x 2, y 3)` and `(x 10, y 9)`, over optional noise.
pub fn two_block_scene(noise_sigma: f32) -> (FeaturePyramid, [BoundingBox; 2]) {
    let mut scene = SceneBuilder::new(16, 16, 1).with_noise(noise_sigma, 42);
    let first = scene.plant(0, 2, 3, 2, 2, 0, 1.0);
    let second = scene.plant(0, 10, 9, 2, 2, 0, 1.0);
    let (pyramid, _) = scene.build();
    (pyramid, [first, second])
}

/// OR root over one rigid object: a 2x2 averaging filter with bias -0.5.
///
/// Scores 0.5 on a full block, 0 on half a block, -0.5 on background.
pub fn block_grammar() -> Grammar {
    let mut g = Grammar::new();
    let filter = g.add_terminal("block", LinearFilter::new(2, 2, 1, vec![0.25; 4], 0.0).unwrap());
    let object = g.add_compositional("object", &[Part::new(filter, Offset::new(0, 0))], -0.5);
    let root = g.add_switching("root", &[object]);
    g.set_root(root);
    g
}
