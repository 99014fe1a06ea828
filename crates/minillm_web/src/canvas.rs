//! `Canvas` over an `HtmlCanvasElement`, so the dot renderer can draw in the
//! browser.

use minillm::viz::{render_matrix, Canvas, DrawContext, Matrix, RenderOptions, Rgb};
use wasm_bindgen::JsCast;
use web_sys::{CanvasRenderingContext2d, HtmlCanvasElement};

struct Context2d(CanvasRenderingContext2d);

impl DrawContext for Context2d {
    fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgb) {
        self.0.set_fill_style_str(&color.css());
        self.0.fill_rect(x as f64, y as f64, w as f64, h as f64);
    }

    fn fill_circle(&mut self, cx: f32, cy: f32, radius: f32, color: Rgb) {
        self.0.set_fill_style_str(&color.css());
        self.0.begin_path();
        let _ = self
            .0
            .arc(cx as f64, cy as f64, radius as f64, 0.0, std::f64::consts::PI * 2.0);
        self.0.fill();
    }
}

pub struct WebCanvas {
    element: HtmlCanvasElement,
    ctx: Option<Context2d>,
}

impl WebCanvas {
    pub fn new(element: HtmlCanvasElement) -> Self {
        Self { element, ctx: None }
    }

    /// Look the canvas up by element id.
    pub fn by_id(id: &str) -> Option<Self> {
        web_sys::window()?
            .document()?
            .get_element_by_id(id)?
            .dyn_into::<HtmlCanvasElement>()
            .ok()
            .map(Self::new)
    }

    pub fn element(&self) -> &HtmlCanvasElement {
        &self.element
    }
}

impl Canvas for WebCanvas {
    fn set_size(&mut self, width: u32, height: u32) {
        self.element.set_width(width);
        self.element.set_height(height);
    }

    fn context(&mut self) -> Option<&mut dyn DrawContext> {
        if self.ctx.is_none() {
            // get_context may throw or return null; both mean "nothing to draw on"
            let ctx = self
                .element
                .get_context("2d")
                .ok()
                .flatten()?
                .dyn_into::<CanvasRenderingContext2d>()
                .ok()?;
            self.ctx = Some(Context2d(ctx));
        }
        self.ctx.as_mut().map(|c| c as &mut dyn DrawContext)
    }
}

/// Render `m` into the canvas with id `canvas_id`. Missing elements and
/// unavailable contexts are silent no-ops.
pub fn draw_matrix(canvas_id: &str, m: &Matrix, opts: &RenderOptions) {
    if let Some(mut canvas) = WebCanvas::by_id(canvas_id) {
        render_matrix(&mut canvas, m, opts);
    }
}
