use crate::canvas::Canvas;
use crate::types::Pt;

/// Measurable, incrementally-consumable cell payload.
///
/// `height` is the *remaining* content extent and shrinks as `generate`
/// commits output. `try_generate` is a pure dry-run against a height budget;
/// `generate` draws at the canvas cursor and advances the payload's state.
pub trait CellContent: Send + Sync {
    fn height(&self) -> Pt;

    /// The value `height` returned before the most recent commit.
    fn last_height(&self) -> Pt;

    /// Dry-run: (lines that would fit, remaining height afterwards).
    fn try_generate(&self, budget: Pt) -> (usize, Pt);

    /// Commit: (lines written, height before this commit, remaining height).
    fn generate(&mut self, canvas: &mut Canvas, budget: Pt) -> (usize, Pt, Pt);
}

/// Line-oriented text payload with a fixed per-line height. The caller
/// pre-splits the text; no shaping or width measurement happens here, which
/// keeps output deterministic in total height.
pub struct TextContent {
    lines: Vec<String>,
    line_height: Pt,
    written: usize,
    last_height: Pt,
}

impl TextContent {
    pub fn new(text: &str, line_height: Pt) -> Self {
        Self::from_lines(text.split('\n').map(str::to_string).collect(), line_height)
    }

    pub fn from_lines(lines: Vec<String>, line_height: Pt) -> Self {
        let last_height = line_height * lines.len() as i32;
        Self {
            lines,
            line_height,
            written: 0,
            last_height,
        }
    }

    pub fn line_height(&self) -> Pt {
        self.line_height
    }

    fn remaining(&self) -> usize {
        self.lines.len() - self.written
    }

    fn fit(&self, budget: Pt) -> usize {
        let line = self.line_height.to_milli_i64();
        if line <= 0 {
            return 0;
        }
        let budget = budget.to_milli_i64().max(0);
        ((budget / line) as usize).min(self.remaining())
    }
}

impl CellContent for TextContent {
    fn height(&self) -> Pt {
        self.line_height * self.remaining() as i32
    }

    fn last_height(&self) -> Pt {
        self.last_height
    }

    fn try_generate(&self, budget: Pt) -> (usize, Pt) {
        let fit = self.fit(budget);
        (fit, self.line_height * (self.remaining() - fit) as i32)
    }

    fn generate(&mut self, canvas: &mut Canvas, budget: Pt) -> (usize, Pt, Pt) {
        let fit = self.fit(budget);
        self.last_height = self.height();
        let (x, mut y) = canvas.xy();
        for line in &self.lines[self.written..self.written + fit] {
            canvas.draw_string(x, y, line.clone());
            y += self.line_height;
        }
        self.written += fit;
        (fit, self.last_height, self.height())
    }
}
