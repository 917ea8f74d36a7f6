use crate::types::{Margins, Pt, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDash {
    Straight,
    Dashed,
    Dotted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineStyle {
    pub dash: LineDash,
    pub width: Pt,
}

impl LineStyle {
    pub fn straight(width: Pt) -> Self {
        Self {
            dash: LineDash::Straight,
            width,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetLineStyle { dash: LineDash, width: Pt },
    SetGrayStroke(f32),
    LineH { x1: Pt, y: Pt, x2: Pt },
    LineV { x: Pt, y1: Pt, y2: Pt },
    DrawString { x: Pt, y: Pt, text: String },
}

#[derive(Debug, Clone)]
pub struct Page {
    pub commands: Vec<Command>,
}

impl Page {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub page_size: Size,
    pub pages: Vec<Page>,
}

/// Command-recording drawing surface with fixed-height pages, a content box
/// defined by the page margins, and a drawing cursor.
pub struct Canvas {
    page_size: Size,
    margins: Margins,
    pages: Vec<Page>,
    current: Page,
    cursor_x: Pt,
    cursor_y: Pt,
    line_style: LineStyle,
    stroke_gray: f32,
}

impl Canvas {
    pub fn new(page_size: Size, margins: Margins) -> Self {
        let margins = margins.sanitized();
        Self {
            page_size,
            margins,
            pages: Vec::new(),
            current: Page::new(),
            cursor_x: margins.left,
            cursor_y: margins.top,
            line_style: LineStyle::straight(Pt::from_f32(1.0)),
            stroke_gray: 0.0,
        }
    }

    pub fn page_size(&self) -> Size {
        self.page_size
    }

    pub fn content_width(&self) -> Pt {
        (self.page_size.width - self.margins.left - self.margins.right).max(Pt::ZERO)
    }

    pub fn content_height(&self) -> Pt {
        (self.page_size.height - self.margins.top - self.margins.bottom).max(Pt::ZERO)
    }

    pub fn page_start_xy(&self) -> (Pt, Pt) {
        (self.margins.left, self.margins.top)
    }

    pub fn page_end_y(&self) -> Pt {
        self.page_size.height - self.margins.bottom
    }

    pub fn xy(&self) -> (Pt, Pt) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn set_xy(&mut self, x: Pt, y: Pt) {
        self.cursor_x = x;
        self.cursor_y = y;
    }

    /// Closes the current page and starts a fresh one with the cursor at the
    /// content origin. `keep_style=false` resets the stroke state as well.
    pub fn add_page(&mut self, keep_style: bool) {
        let current = std::mem::replace(&mut self.current, Page::new());
        self.pages.push(current);
        let (x, y) = self.page_start_xy();
        self.cursor_x = x;
        self.cursor_y = y;
        if !keep_style {
            self.line_style = LineStyle::straight(Pt::from_f32(1.0));
            self.stroke_gray = 0.0;
        }
    }

    pub fn set_line_style(&mut self, style: LineStyle) {
        let style = LineStyle {
            dash: style.dash,
            width: style.width.max(Pt::ZERO),
        };
        if self.line_style == style {
            return;
        }
        self.line_style = style;
        self.current.commands.push(Command::SetLineStyle {
            dash: style.dash,
            width: style.width,
        });
    }

    pub fn gray_stroke(&mut self, gray: f32) {
        let gray = if gray.is_finite() {
            gray.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if self.stroke_gray == gray {
            return;
        }
        self.stroke_gray = gray;
        self.current.commands.push(Command::SetGrayStroke(gray));
    }

    pub fn line_h(&mut self, x1: Pt, y: Pt, x2: Pt) {
        self.current.commands.push(Command::LineH { x1, y, x2 });
    }

    pub fn line_v(&mut self, x: Pt, y1: Pt, y2: Pt) {
        self.current.commands.push(Command::LineV { x, y1, y2 });
    }

    pub fn draw_string(&mut self, x: Pt, y: Pt, text: impl Into<String>) {
        self.current.commands.push(Command::DrawString {
            x,
            y,
            text: text.into(),
        });
    }

    pub fn current_command_count(&self) -> usize {
        self.current.commands.len()
    }

    pub fn finish(mut self) -> Document {
        if !self.current.commands.is_empty() || self.pages.is_empty() {
            let current = std::mem::replace(&mut self.current, Page::new());
            self.pages.push(current);
        }
        Document {
            page_size: self.page_size,
            pages: self.pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas() -> Canvas {
        Canvas::new(
            Size {
                width: Pt::from_f32(600.0),
                height: Pt::from_f32(800.0),
            },
            Margins::all(50.0),
        )
    }

    #[test]
    fn content_box_excludes_margins() {
        let canvas = canvas();
        assert_eq!(canvas.content_width(), Pt::from_f32(500.0));
        assert_eq!(canvas.content_height(), Pt::from_f32(700.0));
        assert_eq!(canvas.page_end_y(), Pt::from_f32(750.0));
        assert_eq!(canvas.page_start_xy(), (Pt::from_f32(50.0), Pt::from_f32(50.0)));
    }

    #[test]
    fn add_page_resets_cursor_and_optionally_style() {
        let mut canvas = canvas();
        canvas.set_xy(Pt::from_f32(200.0), Pt::from_f32(300.0));
        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
        canvas.add_page(false);
        assert_eq!(canvas.xy(), canvas.page_start_xy());
        // The reset state means the next 0.1 style change is re-emitted.
        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
        let doc = canvas.finish();
        assert_eq!(doc.pages.len(), 2);
        assert!(matches!(
            doc.pages[1].commands[0],
            Command::SetLineStyle { .. }
        ));
    }

    #[test]
    fn style_changes_are_deduplicated() {
        let mut canvas = canvas();
        canvas.gray_stroke(0.5);
        canvas.gray_stroke(0.5);
        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
        let doc = canvas.finish();
        assert_eq!(doc.pages[0].commands.len(), 2);
    }

    #[test]
    fn finish_flushes_open_page() {
        let mut canvas = canvas();
        canvas.line_h(Pt::ZERO, Pt::ZERO, Pt::from_f32(10.0));
        let doc = canvas.finish();
        assert_eq!(doc.pages.len(), 1);
        assert_eq!(doc.pages[0].commands.len(), 1);
    }
}
