//! Property tests for the colour-dot renderer.

use minillm::viz::{
    dot_style, layout, render_matrix, DrawCall, Matrix, Raster, Recorder, RenderOptions, Rgb,
    MIN_VISIBLE_FRACTION,
};
use proptest::prelude::*;

fn matrix_strategy(max_rows: usize, max_cols: usize) -> impl Strategy<Value = Matrix> {
    (0..=max_rows, 0..=max_cols).prop_flat_map(|(rows, cols)| {
        prop::collection::vec(prop::collection::vec(-5.0f32..5.0, cols), rows).prop_map(
            move |values| {
                let cols = if rows == 0 { 0 } else { cols };
                let (min, max) = values
                    .iter()
                    .flatten()
                    .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                Matrix {
                    rows,
                    cols,
                    values,
                    min,
                    max,
                }
            },
        )
    })
}

fn small_caps() -> RenderOptions {
    RenderOptions {
        max_rows: 8,
        max_cols: 12,
        ..RenderOptions::fit(100)
    }
}

fn dot_parts(call: &DrawCall) -> (Rgb, f32) {
    match *call {
        DrawCall::Circle { radius, color, .. } => (color, radius),
        DrawCall::Rect { w, color, .. } => (color, w / 2.0),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn empty_matrices_draw_nothing(cols in 0usize..10) {
        let m = Matrix { rows: 0, cols, values: Vec::new(), min: 0.0, max: 0.0 };
        let mut rec = Recorder::default();
        render_matrix(&mut rec, &m, &RenderOptions::default());
        prop_assert!(rec.calls.is_empty());
        prop_assert!(rec.size.is_none());
    }

    #[test]
    fn only_the_top_left_block_is_drawn(m in matrix_strategy(20, 20)) {
        let opts = small_caps();
        let mut rec = Recorder::default();
        render_matrix(&mut rec, &m, &opts);
        let Some(lay) = layout(&m, &opts) else {
            prop_assert!(rec.calls.is_empty());
            return Ok(());
        };
        prop_assert_eq!(lay.rows, m.rows.min(opts.max_rows));
        prop_assert_eq!(lay.cols, m.cols.min(opts.max_cols));
        prop_assert_eq!(rec.dots().len(), lay.rows * lay.cols);
        for call in rec.dots() {
            if let DrawCall::Circle { cx, cy, .. } = *call {
                prop_assert!(cx > 0.0 && cx < lay.width as f32);
                prop_assert!(cy > 0.0 && cy < lay.height as f32);
            }
        }
    }

    #[test]
    fn negation_swaps_channels_and_keeps_radii(m in matrix_strategy(6, 6)) {
        let neg = Matrix {
            values: m.values.iter().map(|r| r.iter().map(|v| -v).collect()).collect(),
            min: -m.max,
            max: -m.min,
            ..m.clone()
        };
        let opts = small_caps();
        let (mut a, mut b) = (Recorder::default(), Recorder::default());
        render_matrix(&mut a, &m, &opts);
        render_matrix(&mut b, &neg, &opts);
        prop_assert_eq!(a.dots().len(), b.dots().len());
        for (x, y) in a.dots().iter().zip(b.dots()) {
            let ((cx, rx), (cy, ry)) = (dot_parts(x), dot_parts(y));
            prop_assert!((rx - ry).abs() < 1e-6);
            prop_assert_eq!(cx.r, cy.b);
            prop_assert_eq!(cx.b, cy.r);
            prop_assert_eq!(cx.g, 0);
        }
    }

    #[test]
    fn rendering_is_idempotent(m in matrix_strategy(10, 10)) {
        let opts = RenderOptions::fit(60);
        let mut first = Raster::new(0, 0);
        let mut second = Raster::new(0, 0);
        render_matrix(&mut first, &m, &opts);
        render_matrix(&mut second, &m, &opts);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn radius_never_drops_below_the_floor(v in -10.0f32..10.0, abs_max in 0.0f32..10.0) {
        let (_, frac) = dot_style(v, abs_max);
        prop_assert!(frac >= MIN_VISIBLE_FRACTION);
        prop_assert!(frac <= 1.0);
    }
}

#[test]
fn all_zero_matrix_renders_floor_dots_in_black() {
    let m = Matrix::new(vec![vec![0.0; 3]; 2]).expect("matrix");
    let opts = RenderOptions::fit(90);
    let lay = layout(&m, &opts).expect("layout");
    let mut rec = Recorder::default();
    render_matrix(&mut rec, &m, &opts);
    assert_eq!(rec.dots().len(), 6);
    for call in rec.dots() {
        let (color, radius) = dot_parts(call);
        assert_eq!(color, Rgb::BLACK);
        assert!((radius - lay.base_radius() * MIN_VISIBLE_FRACTION).abs() < 1e-5);
    }
}

#[test]
fn extreme_values_saturate_their_channel() {
    let m = Matrix::new(vec![vec![3.0, -1.5], vec![-3.0, 0.0]]).expect("matrix");
    let mut rec = Recorder::default();
    render_matrix(&mut rec, &m, &RenderOptions::fit(100));
    let colors: Vec<Rgb> = rec.dots().iter().map(|c| dot_parts(c).0).collect();
    assert_eq!(colors[0], Rgb::new(255, 0, 0));
    assert_eq!(colors[1], Rgb::new(0, 0, 128));
    assert_eq!(colors[2], Rgb::new(0, 0, 255));
    assert_eq!(colors[3], Rgb::BLACK);
}
