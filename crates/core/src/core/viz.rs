//! Matrix payloads and the colour-dot renderer.
//!
//! A [`Matrix`] is drawn as a grid of dots. Colour encodes sign (red for
//! positive, blue for negative, black at zero) and both intensity and radius
//! encode magnitude relative to `max(|min|, |max|)`. Drawing goes through the
//! [`Canvas`] / [`DrawContext`] traits so the same routine can target the
//! in-memory [`Raster`], a browser canvas, or a recorder in tests.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::array::Array2;
use crate::error::VizError;

/// Guards the all-zero matrix against division by zero.
pub const EPSILON: f32 = 1e-8;
/// Radius floor as a fraction of the full dot radius.
pub const MIN_VISIBLE_FRACTION: f32 = 0.15;
pub const DEFAULT_MAX_DIM: u32 = 300;
pub const DEFAULT_MAX_ROWS: usize = 32;
pub const DEFAULT_MAX_COLS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<Vec<f32>>,
    pub min: f32,
    pub max: f32,
}

impl Matrix {
    /// Bounds are taken from the data.
    pub fn new(values: Vec<Vec<f32>>) -> Result<Self, VizError> {
        let (min, max) = bounds(values.iter().flatten().copied());
        Self::with_bounds(values, min, max)
    }

    /// Caller-supplied normalisation range.
    pub fn with_bounds(values: Vec<Vec<f32>>, min: f32, max: f32) -> Result<Self, VizError> {
        let m = Self {
            rows: values.len(),
            cols: values.first().map_or(0, Vec::len),
            values,
            min,
            max,
        };
        m.validate()?;
        Ok(m)
    }

    pub fn from_array(a: &Array2) -> Self {
        let values = (0..a.rows()).map(|r| a.row(r).to_vec()).collect();
        let (min, max) = bounds(a.data().iter().copied());
        Self {
            rows: a.rows(),
            cols: a.cols(),
            values,
            min,
            max,
        }
    }

    /// Every `max(1, dim / cap)`-th row and column, truncated to `cap`.
    pub fn sample_from(a: &Array2, cap: usize) -> Self {
        let cap = cap.max(1);
        let row_step = (a.rows() / cap).max(1);
        let col_step = (a.cols() / cap).max(1);
        let values: Vec<Vec<f32>> = (0..a.rows())
            .step_by(row_step)
            .take(cap)
            .map(|r| {
                a.row(r)
                    .iter()
                    .step_by(col_step)
                    .take(cap)
                    .copied()
                    .collect()
            })
            .collect();
        let (min, max) = bounds(values.iter().flatten().copied());
        Self {
            rows: values.len(),
            cols: values.first().map_or(0, Vec::len),
            values,
            min,
            max,
        }
    }

    pub fn validate(&self) -> Result<(), VizError> {
        if self.values.len() != self.rows {
            return Err(VizError::RowCount {
                expected: self.rows,
                got: self.values.len(),
            });
        }
        for (row, v) in self.values.iter().enumerate() {
            if v.len() != self.cols {
                return Err(VizError::Ragged {
                    row,
                    len: v.len(),
                    cols: self.cols,
                });
            }
        }
        if self.min > self.max {
            return Err(VizError::InvertedBounds {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Value at `(r, c)`, or 0 when the cell is missing.
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.values
            .get(r)
            .and_then(|row| row.get(c))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn abs_max(&self) -> f32 {
        finite_or_zero(self.min)
            .abs()
            .max(finite_or_zero(self.max).abs())
            .max(EPSILON)
    }

    pub fn mean(&self) -> f32 {
        let n = self.rows * self.cols;
        if n == 0 {
            return 0.0;
        }
        self.values.iter().flatten().sum::<f32>() / n as f32
    }

    pub fn std(&self) -> f32 {
        let n = self.rows * self.cols;
        if n == 0 {
            return 0.0;
        }
        let m = self.mean();
        let var = self
            .values
            .iter()
            .flatten()
            .map(|v| (v - m) * (v - m))
            .sum::<f32>()
            / n as f32;
        var.sqrt()
    }
}

fn bounds(it: impl Iterator<Item = f32>) -> (f32, f32) {
    let (lo, hi) = it
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        (0.0, 0.0)
    } else {
        (lo, hi)
    }
}

#[inline]
fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Attention of one head in one layer over a token sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionResult {
    pub layer: usize,
    pub head: usize,
    pub tokens: Vec<String>,
    pub weights: Matrix,
}

impl AttentionResult {
    pub fn validate(&self) -> Result<(), VizError> {
        self.weights.validate()?;
        let n = self.tokens.len();
        if self.weights.rows != n || self.weights.cols != n {
            return Err(VizError::NotSquare {
                rows: self.weights.rows,
                cols: self.weights.cols,
                tokens: n,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Drawing surfaces

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn css(&self) -> String {
        format!("rgb({}, {}, {})", self.r, self.g, self.b)
    }
}

pub trait DrawContext {
    fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgb);
    fn fill_circle(&mut self, cx: f32, cy: f32, radius: f32, color: Rgb);
}

pub trait Canvas {
    fn set_size(&mut self, width: u32, height: u32);
    /// `None` when no drawing context can be acquired.
    fn context(&mut self) -> Option<&mut dyn DrawContext>;
}

// ---------------------------------------------------------------------------
// Renderer

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellSize {
    /// Largest dot that keeps the grid within `max_dim` pixels on both axes.
    Fit { max_dim: u32 },
    /// Fixed dot size in pixels.
    Fixed(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DotShape {
    Circle,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub max_rows: usize,
    pub max_cols: usize,
    pub cell: CellSize,
    pub shape: DotShape,
    pub background: Rgb,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            max_cols: DEFAULT_MAX_COLS,
            cell: CellSize::Fit {
                max_dim: DEFAULT_MAX_DIM,
            },
            shape: DotShape::Circle,
            background: Rgb::BLACK,
        }
    }
}

impl RenderOptions {
    pub fn fit(max_dim: u32) -> Self {
        Self {
            cell: CellSize::Fit { max_dim },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Displayed rows and columns after truncation.
    pub rows: usize,
    pub cols: usize,
    pub dot: u32,
    pub gap: u32,
    pub cell: u32,
    pub width: u32,
    pub height: u32,
}

impl Layout {
    pub fn center(&self, r: usize, c: usize) -> (f32, f32) {
        let cell = self.cell as f32;
        (c as f32 * cell + cell / 2.0, r as f32 * cell + cell / 2.0)
    }

    pub fn base_radius(&self) -> f32 {
        self.dot as f32 / 2.0
    }
}

/// `None` when there is nothing to draw.
pub fn layout(m: &Matrix, opts: &RenderOptions) -> Option<Layout> {
    let rows = m.rows.min(opts.max_rows);
    let cols = m.cols.min(opts.max_cols);
    if rows == 0 || cols == 0 {
        return None;
    }
    let dot = match opts.cell {
        CellSize::Fit { max_dim } => {
            let by_cols = max_dim / cols as u32;
            let by_rows = max_dim / rows as u32;
            by_cols.min(by_rows).max(1)
        }
        CellSize::Fixed(px) => px.max(1),
    };
    let gap = ((dot as f32 * 0.2).floor() as u32).max(1);
    let cell = dot + gap;
    Some(Layout {
        rows,
        cols,
        dot,
        gap,
        cell,
        width: cols as u32 * cell,
        height: rows as u32 * cell,
    })
}

/// Colour and radius fraction for a value under a given `abs_max`.
pub fn dot_style(v: f32, abs_max: f32) -> (Rgb, f32) {
    let norm = (finite_or_zero(v) / abs_max.max(EPSILON)).clamp(-1.0, 1.0);
    let level = (norm.abs() * 255.0).round() as u8;
    let color = if norm >= 0.0 {
        Rgb::new(level, 0, 0)
    } else {
        Rgb::new(0, 0, level)
    };
    (color, norm.abs().max(MIN_VISIBLE_FRACTION))
}

/// Draw `m` onto `canvas`. Rows and columns beyond the caps are not drawn.
pub fn render_matrix(canvas: &mut dyn Canvas, m: &Matrix, opts: &RenderOptions) {
    let Some(lay) = layout(m, opts) else {
        return;
    };
    canvas.set_size(lay.width, lay.height);
    let Some(ctx) = canvas.context() else {
        return;
    };

    ctx.fill_rect(
        0.0,
        0.0,
        lay.width as f32,
        lay.height as f32,
        opts.background,
    );

    let abs_max = m.abs_max();
    let base = lay.base_radius();
    for r in 0..lay.rows {
        for c in 0..lay.cols {
            let (color, frac) = dot_style(m.get(r, c), abs_max);
            let radius = base * frac;
            let (cx, cy) = lay.center(r, c);
            match opts.shape {
                DotShape::Circle => ctx.fill_circle(cx, cy, radius, color),
                DotShape::Square => {
                    ctx.fill_rect(cx - radius, cy - radius, radius * 2.0, radius * 2.0, color)
                }
            }
        }
    }
}

/// "showing N×M of R×C" when the caps cut the matrix.
pub fn truncation_notice(m: &Matrix, opts: &RenderOptions) -> Option<String> {
    let rows = m.rows.min(opts.max_rows);
    let cols = m.cols.min(opts.max_cols);
    (rows < m.rows || cols < m.cols)
        .then(|| format!("showing {rows}×{cols} of {}×{}", m.rows, m.cols))
}

// ---------------------------------------------------------------------------
// Raster surface

/// In-memory RGB surface with a deterministic rasteriser.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<Rgb>,
}

impl Raster {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Rgb::BLACK; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Binary PPM (P6).
    pub fn write_ppm<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write!(w, "P6\n{} {}\n255\n", self.width, self.height)?;
        let mut bytes = Vec::with_capacity(self.pixels.len() * 3);
        for p in &self.pixels {
            bytes.extend_from_slice(&[p.r, p.g, p.b]);
        }
        w.write_all(&bytes)
    }

    /// Pixel range whose centres fall inside `[lo, hi)`.
    fn span(lo: f32, hi: f32, limit: u32) -> std::ops::Range<u32> {
        let start = (lo - 0.5).ceil().max(0.0) as u32;
        let end = ((hi - 0.5).ceil().max(0.0) as u32).min(limit);
        start.min(end)..end
    }
}

impl DrawContext for Raster {
    fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgb) {
        let width = self.width as usize;
        for py in Self::span(y, y + h, self.height) {
            for px in Self::span(x, x + w, self.width) {
                self.pixels[py as usize * width + px as usize] = color;
            }
        }
    }

    fn fill_circle(&mut self, cx: f32, cy: f32, radius: f32, color: Rgb) {
        let r2 = radius * radius;
        let width = self.width as usize;
        for py in Self::span(cy - radius, cy + radius + 1.0, self.height) {
            for px in Self::span(cx - radius, cx + radius + 1.0, self.width) {
                let dx = px as f32 + 0.5 - cx;
                let dy = py as f32 + 0.5 - cy;
                if dx * dx + dy * dy <= r2 {
                    self.pixels[py as usize * width + px as usize] = color;
                }
            }
        }
    }
}

impl Canvas for Raster {
    fn set_size(&mut self, width: u32, height: u32) {
        *self = Raster::new(width, height);
    }

    fn context(&mut self) -> Option<&mut dyn DrawContext> {
        Some(self as &mut dyn DrawContext)
    }
}

// ---------------------------------------------------------------------------
// Recording surface

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCall {
    Rect {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        color: Rgb,
    },
    Circle {
        cx: f32,
        cy: f32,
        radius: f32,
        color: Rgb,
    },
}

/// Canvas that records draw calls. With `available = false` it behaves like
/// a surface whose context cannot be acquired.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorder {
    pub available: bool,
    pub size: Option<(u32, u32)>,
    pub calls: Vec<DrawCall>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            available: true,
            size: None,
            calls: Vec::new(),
        }
    }
}

impl Recorder {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    /// Dot calls only (the background rect is the first call).
    pub fn dots(&self) -> &[DrawCall] {
        self.calls.get(1..).unwrap_or(&[])
    }
}

impl DrawContext for Recorder {
    fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgb) {
        self.calls.push(DrawCall::Rect { x, y, w, h, color });
    }

    fn fill_circle(&mut self, cx: f32, cy: f32, radius: f32, color: Rgb) {
        self.calls.push(DrawCall::Circle {
            cx,
            cy,
            radius,
            color,
        });
    }
}

impl Canvas for Recorder {
    fn set_size(&mut self, width: u32, height: u32) {
        self.size = Some((width, height));
    }

    fn context(&mut self) -> Option<&mut dyn DrawContext> {
        if self.available {
            Some(self as &mut dyn DrawContext)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Matrix {
        Matrix::with_bounds(vec![vec![1.0, -1.0], vec![0.0, 0.5]], -1.0, 1.0).expect("matrix")
    }

    #[test]
    fn two_by_two_scenario() {
        let m = scenario();
        let opts = RenderOptions::fit(100);
        let lay = layout(&m, &opts).expect("layout");
        assert_eq!((lay.dot, lay.gap, lay.cell), (50, 10, 60));

        let mut rec = Recorder::default();
        render_matrix(&mut rec, &m, &opts);
        assert_eq!(rec.size, Some((120, 120)));
        assert_eq!(
            rec.calls[0],
            DrawCall::Rect {
                x: 0.0,
                y: 0.0,
                w: 120.0,
                h: 120.0,
                color: Rgb::BLACK
            }
        );
        let dots = rec.dots();
        assert_eq!(
            dots,
            &[
                DrawCall::Circle {
                    cx: 30.0,
                    cy: 30.0,
                    radius: 25.0,
                    color: Rgb::new(255, 0, 0)
                },
                DrawCall::Circle {
                    cx: 90.0,
                    cy: 30.0,
                    radius: 25.0,
                    color: Rgb::new(0, 0, 255)
                },
                DrawCall::Circle {
                    cx: 30.0,
                    cy: 90.0,
                    radius: 25.0 * MIN_VISIBLE_FRACTION,
                    color: Rgb::BLACK
                },
                DrawCall::Circle {
                    cx: 90.0,
                    cy: 90.0,
                    radius: 12.5,
                    color: Rgb::new(128, 0, 0)
                },
            ]
        );
    }

    #[test]
    fn empty_matrix_draws_nothing() {
        let m = Matrix::new(Vec::new()).expect("matrix");
        let mut rec = Recorder::default();
        render_matrix(&mut rec, &m, &RenderOptions::default());
        assert!(rec.calls.is_empty());
        assert_eq!(rec.size, None);
    }

    #[test]
    fn missing_context_is_a_silent_no_op() {
        let mut rec = Recorder::unavailable();
        render_matrix(&mut rec, &scenario(), &RenderOptions::default());
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn ragged_rows_are_rejected_but_render_as_zero() {
        assert!(matches!(
            Matrix::new(vec![vec![1.0, 2.0], vec![3.0]]),
            Err(VizError::Ragged { row: 1, .. })
        ));
        let m = Matrix {
            rows: 2,
            cols: 2,
            values: vec![vec![1.0, 2.0], vec![3.0]],
            min: 0.0,
            max: 3.0,
        };
        assert_eq!(m.get(1, 1), 0.0);
        assert_eq!(m.get(5, 0), 0.0);
    }

    #[test]
    fn square_variant_uses_rects() {
        let opts = RenderOptions {
            shape: DotShape::Square,
            cell: CellSize::Fixed(10),
            ..RenderOptions::default()
        };
        let mut rec = Recorder::default();
        render_matrix(&mut rec, &scenario(), &opts);
        assert!(rec
            .dots()
            .iter()
            .all(|c| matches!(c, DrawCall::Rect { .. })));
        assert_eq!(rec.size, Some((24, 24)));
    }

    #[test]
    fn raster_paints_dot_centres() {
        let mut r = Raster::default();
        render_matrix(&mut r, &scenario(), &RenderOptions::fit(100));
        assert_eq!((r.width(), r.height()), (120, 120));
        assert_eq!(r.pixel(30, 30), Some(Rgb::new(255, 0, 0)));
        assert_eq!(r.pixel(90, 30), Some(Rgb::new(0, 0, 255)));
        assert_eq!(r.pixel(0, 0), Some(Rgb::BLACK));

        let mut ppm = Vec::new();
        r.write_ppm(&mut ppm).expect("ppm");
        assert!(ppm.starts_with(b"P6\n120 120\n255\n"));
        assert_eq!(ppm.len(), "P6\n120 120\n255\n".len() + 120 * 120 * 3);
    }

    #[test]
    fn notice_only_when_truncated() {
        let big = Matrix::new(vec![vec![0.0; 100]; 40]).expect("matrix");
        let opts = RenderOptions::default();
        assert_eq!(
            truncation_notice(&big, &opts).as_deref(),
            Some("showing 32×64 of 40×100")
        );
        assert_eq!(truncation_notice(&scenario(), &opts), None);
    }

    #[test]
    fn sampling_strides_and_caps() {
        let a = Array2::from_vec(4, 6, (0..24).map(|v| v as f32).collect());
        let m = Matrix::sample_from(&a, 2);
        // row step 2, col step 3
        assert_eq!(m.values, vec![vec![0.0, 3.0], vec![12.0, 15.0]]);
        assert_eq!((m.min, m.max), (0.0, 15.0));
    }
}
