use crate::canvas::{Canvas, LineStyle};
use crate::content::CellContent;
use crate::debug::DebugLogger;
use crate::error::GridFlowError;
use crate::types::{Margins, Pt};
use std::sync::Arc;

/// Row index sentinel: no row of the current page has finished yet.
const NO_ROW_COMPLETED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Top-left slot of a rowspan x colspan rectangle; carries the payload.
    Entity { rowspan: usize, colspan: usize },
    /// Slot covered by an entity's rectangle. Owner coordinates are absolute
    /// grid coordinates (they survive reflow trimming unchanged).
    Phantom { owner_row: usize, owner_col: usize },
}

pub struct TableCell {
    row: usize,
    col: usize,
    kind: CellKind,
    element: Option<Box<dyn CellContent>>,
    min_height: Pt,
    height: Pt,
    rows_written: usize,
}

impl TableCell {
    pub fn set_element(&mut self, element: Box<dyn CellContent>) -> &mut Self {
        self.element = Some(element);
        self
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// The solved row minimum; every slot of a row shares this after solving.
    pub fn min_height(&self) -> Pt {
        self.min_height
    }

    /// Full vertical extent: for a rowspan-1 entity this equals `min_height`,
    /// for a taller entity the sum of its spanned rows' minima.
    pub fn height(&self) -> Pt {
        self.height
    }

    /// Span rows already emitted on the current page.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    fn entity_span(&self) -> Option<(usize, usize)> {
        match self.kind {
            CellKind::Entity { rowspan, colspan } => Some((rowspan, colspan)),
            CellKind::Phantom { .. } => None,
        }
    }
}

fn element_has_emitted(element: &dyn CellContent) -> bool {
    // Drained, or the height moved since the previous commit.
    let height = element.height();
    let last = element.last_height();
    height == Pt::ZERO || (last - height).abs() > Pt::from_f32(0.1)
}

/// Irregular table built over a rectangular grid: entities cover
/// rowspan x colspan rectangles, the remaining covered slots are phantoms.
/// Rendering paginates the grid over the canvas, splitting cells at page
/// boundaries and reshaping the residual grid between pages.
pub struct Table {
    rows: usize,
    cols: usize,
    width: Pt,
    line_height: Pt,
    margin: Margins,
    col_widths: Vec<f64>,
    cells: Vec<Vec<Option<TableCell>>>,
    cursor: Option<(usize, usize)>,
    completed_rows: usize,
    checked: bool,
    cached_col: Vec<Pt>,
    cached_row: Vec<Pt>,
    debug: Option<Arc<DebugLogger>>,
}

impl Table {
    pub fn new(cols: usize, rows: usize, width: Pt, line_height: Pt, canvas: &Canvas) -> Self {
        let width = width.min(canvas.content_width());
        let col_widths = if cols > 0 {
            vec![1.0 / cols as f64; cols]
        } else {
            Vec::new()
        };
        let mut cells = Vec::with_capacity(rows);
        for _ in 0..rows {
            cells.push((0..cols).map(|_| None).collect());
        }
        Self {
            rows,
            cols,
            width,
            line_height,
            margin: Margins::zero(),
            col_widths,
            cells,
            cursor: if rows > 0 && cols > 0 {
                Some((0, 0))
            } else {
                None
            },
            completed_rows: NO_ROW_COMPLETED,
            checked: false,
            cached_col: Vec::new(),
            cached_row: Vec::new(),
            debug: None,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn width(&self) -> Pt {
        self.width
    }

    pub fn set_line_height(&mut self, line_height: Pt) {
        self.line_height = line_height;
    }

    pub fn set_margin(&mut self, margin: Margins) {
        self.margin = margin.sanitized();
    }

    pub fn set_debug(&mut self, logger: Arc<DebugLogger>) {
        self.debug = Some(logger);
    }

    /// Proportional column widths; must cover every column and sum to 1.
    pub fn set_col_widths(&mut self, widths: &[f64]) -> Result<(), GridFlowError> {
        if widths.len() != self.cols {
            return Err(GridFlowError::InvalidConfiguration(format!(
                "{} column widths for {} columns",
                widths.len(),
                self.cols
            )));
        }
        let sum: f64 = widths.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(GridFlowError::InvalidConfiguration(format!(
                "column widths sum to {sum}, expected 1"
            )));
        }
        self.col_widths = widths.to_vec();
        Ok(())
    }

    /// Absolute width of the (spanned) cell at a grid position.
    pub fn col_width(&self, row: usize, col: usize) -> Result<Pt, GridFlowError> {
        if row >= self.cells.len() || col >= self.cols {
            return Err(GridFlowError::ColumnOutOfBounds { row, col });
        }
        let colspan = match self.cells[row][col].as_ref().map(|cell| cell.kind) {
            Some(CellKind::Entity { colspan, .. }) => colspan,
            _ => 0,
        };
        let mut total = Pt::ZERO;
        for k in col..(col + colspan).min(self.cols) {
            total += self.width.mul_f64(self.col_widths[k]);
        }
        Ok(total)
    }

    /// Allocates a 1x1 entity at the insertion cursor.
    pub fn new_cell(&mut self) -> Result<&mut TableCell, GridFlowError> {
        let (row, col) = self.cursor.ok_or(GridFlowError::GridFull)?;
        self.cells[row][col] = Some(TableCell {
            row,
            col,
            kind: CellKind::Entity {
                rowspan: 1,
                colspan: 1,
            },
            element: None,
            min_height: self.line_height,
            height: self.line_height,
            rows_written: 0,
        });
        self.advance_cursor(1);
        self.occupied_slot_mut(row, col)
    }

    /// Allocates a colspan x rowspan entity at the insertion cursor and fills
    /// the rest of its rectangle with phantoms. The rectangle must fit the
    /// grid and must not touch any occupied slot; on failure the grid is
    /// unchanged.
    pub fn new_cell_by_range(
        &mut self,
        colspan: usize,
        rowspan: usize,
    ) -> Result<&mut TableCell, GridFlowError> {
        if colspan == 0 || rowspan == 0 {
            return Err(GridFlowError::InvalidSpan(format!(
                "span {colspan}x{rowspan} must be at least 1x1"
            )));
        }
        if colspan == 1 && rowspan == 1 {
            return self.new_cell();
        }
        let (row, col) = self.cursor.ok_or(GridFlowError::GridFull)?;
        if row + rowspan > self.rows || col + colspan > self.cols {
            return Err(GridFlowError::InvalidSpan(format!(
                "span {colspan}x{rowspan} at ({row}, {col}) exceeds a {}x{} grid",
                self.cols, self.rows
            )));
        }
        for i in row..row + rowspan {
            for j in col..col + colspan {
                if self.cells[i][j].is_some() {
                    return Err(GridFlowError::InvalidSpan(format!(
                        "span {colspan}x{rowspan} at ({row}, {col}) collides at ({i}, {j})"
                    )));
                }
            }
        }

        self.cells[row][col] = Some(TableCell {
            row,
            col,
            kind: CellKind::Entity { rowspan, colspan },
            element: None,
            min_height: self.line_height,
            height: self.line_height * rowspan as i32,
            rows_written: 0,
        });
        for i in row..row + rowspan {
            for j in col..col + colspan {
                if i == row && j == col {
                    continue;
                }
                self.cells[i][j] = Some(TableCell {
                    row: i,
                    col: j,
                    kind: CellKind::Phantom {
                        owner_row: row,
                        owner_col: col,
                    },
                    element: None,
                    min_height: self.line_height,
                    height: self.line_height,
                    rows_written: 0,
                });
            }
        }
        self.advance_cursor(colspan);
        self.occupied_slot_mut(row, col)
    }

    fn occupied_slot_mut(
        &mut self,
        row: usize,
        col: usize,
    ) -> Result<&mut TableCell, GridFlowError> {
        self.cells[row][col]
            .as_mut()
            .ok_or_else(|| GridFlowError::ConstraintViolation(format!("slot ({row}, {col}) is empty")))
    }

    /// Moves the cursor to the next free slot in row-major order, or clears
    /// it once every slot is occupied.
    fn advance_cursor(&mut self, colspan: usize) {
        let Some((mut row, mut col)) = self.cursor else {
            return;
        };
        col += colspan;
        if col >= self.cols {
            col = 0;
            row += 1;
        }
        for i in row..self.rows {
            let start = if i == row { col } else { 0 };
            for j in start..self.cols {
                if self.cells[i][j].is_none() {
                    self.cursor = Some((i, j));
                    return;
                }
            }
        }
        self.cursor = None;
    }

    /// Deferred sanity check: every slot occupied, and the entity rectangles
    /// (all carrying payloads) tile the grid exactly. Runs once.
    fn check_constraint(&mut self) -> Result<(), GridFlowError> {
        if self.checked {
            return Ok(());
        }
        self.checked = true;
        let mut occupied = 0usize;
        let mut area = 0usize;
        for row in &self.cells {
            for slot in row {
                let Some(cell) = slot.as_ref() else { continue };
                occupied += 1;
                if let CellKind::Entity { rowspan, colspan } = cell.kind {
                    if cell.element.is_some() {
                        area += rowspan * colspan;
                    }
                }
            }
        }
        let expected = self.rows * self.cols;
        if occupied != expected || area != expected {
            return Err(GridFlowError::ConstraintViolation(format!(
                "{occupied} occupied slots and entity area {area} for a grid of {expected}"
            )));
        }
        Ok(())
    }

    fn origin_row(&self) -> usize {
        self.cells
            .first()
            .and_then(|row| row.first())
            .and_then(|slot| slot.as_ref())
            .map(|cell| cell.row)
            .unwrap_or(0)
    }

    /// Rows that can possibly intersect the current page: the grid row count
    /// capped by ceil(content_height / line_height) + 1. Rows below the cap
    /// cannot start above the page end because every row is at least
    /// `line_height` tall.
    fn page_row_bound(&self, canvas: &Canvas) -> usize {
        let line = self.line_height.to_milli_i64();
        if line <= 0 {
            return self.rows;
        }
        let content = canvas.content_height().to_milli_i64().max(0);
        let bound = ((content + line - 1) / line) as usize + 1;
        self.rows.min(bound)
    }

    /// Two-pass row-height solver. Pass 0 seeds intrinsic heights, pass 1
    /// levels each row to its tallest single-row occupant (floored at
    /// `line_height`), pass 2 pushes multi-row overflow into the last spanned
    /// row.
    fn solve_heights(&mut self, canvas: &Canvas) {
        let rows = self.page_row_bound(canvas);

        for i in 0..rows {
            for j in 0..self.cols {
                let Some(cell) = self.cells[i][j].as_mut() else {
                    continue;
                };
                match cell.element.as_ref() {
                    None => {
                        cell.min_height = self.line_height;
                        cell.height = self.line_height;
                    }
                    Some(element) => {
                        cell.height = element.height();
                        if matches!(cell.kind, CellKind::Entity { rowspan: 1, .. }) {
                            cell.min_height = cell.height;
                        }
                    }
                }
            }
        }

        for i in 0..rows {
            let mut max = self.line_height;
            for j in 0..self.cols {
                if let Some(cell) = self.cells[i][j].as_ref() {
                    max = max.max(cell.min_height);
                }
            }
            for j in 0..self.cols {
                let Some(cell) = self.cells[i][j].as_mut() else {
                    continue;
                };
                cell.min_height = max;
                match cell.kind {
                    CellKind::Entity { rowspan: 1, .. } | CellKind::Phantom { .. } => {
                        cell.height = max;
                    }
                    CellKind::Entity { .. } => {}
                }
            }
        }

        let origin = self.origin_row();
        for i in 0..rows {
            for j in 0..self.cols {
                let (rowspan, span_height) = match self.cells[i][j].as_ref() {
                    Some(cell) => match cell.kind {
                        CellKind::Entity { rowspan, .. } if rowspan > 1 => (rowspan, cell.height),
                        _ => continue,
                    },
                    None => continue,
                };
                let mut provided = Pt::ZERO;
                for k in 0..rowspan {
                    if let Some(below) = self.cells[i + k][j].as_ref() {
                        provided += below.min_height;
                    }
                }
                if provided < span_height {
                    // Push the overflow into the last spanned row only, so
                    // rows pinned by earlier spans keep their heights.
                    let delta = span_height - provided;
                    let last = i + rowspan - 1;
                    for col in 0..self.cols {
                        let mut bump_owner = None;
                        if let Some(slot) = self.cells[last][col].as_mut() {
                            slot.min_height += delta;
                            match slot.kind {
                                CellKind::Entity { rowspan: 1, .. } => slot.height += delta,
                                CellKind::Phantom {
                                    owner_row,
                                    owner_col,
                                } => {
                                    slot.height += delta;
                                    let oi = owner_row - origin;
                                    if oi < i || (oi == i && owner_col < j) {
                                        bump_owner = Some((oi, owner_col));
                                    }
                                }
                                CellKind::Entity { .. } => {}
                            }
                        }
                        if let Some((oi, oj)) = bump_owner {
                            if let Some(owner) = self.cells[oi][oj].as_mut() {
                                owner.height += delta;
                            }
                        }
                    }
                } else if let Some(cell) = self.cells[i][j].as_mut() {
                    cell.height = provided;
                }
            }
        }
    }

    /// Materializes per-column x and per-row y offsets for the current page.
    /// Column offsets are computed once; row offsets every page.
    fn cache_geometry(&mut self, canvas: &Canvas, sx: Pt, sy: Pt) {
        let rows = self.page_row_bound(canvas);
        if self.cached_col.is_empty() {
            let mut x = sx + self.margin.left;
            self.cached_col = Vec::with_capacity(self.cols);
            for col in 0..self.cols {
                self.cached_col.push(x);
                x += self.width.mul_f64(self.col_widths[col]);
            }
        }
        self.cached_row.clear();
        let mut y = sy + self.margin.top;
        for row in 0..rows {
            self.cached_row.push(y);
            y += self.cells[row][0]
                .as_ref()
                .map(|cell| cell.min_height)
                .unwrap_or(self.line_height);
        }
    }

    /// Top-left corner and bottom y of the slot's vertical closing line.
    fn vline_position(&self, row: usize, col: usize) -> (Pt, Pt, Pt) {
        let x = self.cached_col[col];
        let y = self.cached_row[row];
        let height = self.cells[row][col]
            .as_ref()
            .map(|cell| cell.height)
            .unwrap_or(Pt::ZERO);
        (x, y, y + height)
    }

    /// Top-left corner and right x of the slot's horizontal closing line.
    fn hline_position(&self, row: usize, col: usize) -> (Pt, Pt, Pt) {
        let x = self.cached_col[col];
        let y = self.cached_row[row];
        let colspan = match self.cells[row][col].as_ref().map(|cell| cell.kind) {
            Some(CellKind::Entity { colspan, .. }) => colspan,
            _ => 1,
        };
        let x2 = if colspan > 1 {
            if col + colspan >= self.cols {
                self.cached_col[0] + self.width
            } else {
                self.cached_col[col + colspan]
            }
        } else {
            x + self.width.mul_f64(self.col_widths[col])
        };
        (x, y, x2)
    }

    /// Total height of the remaining rows (the table's extent on its final
    /// page).
    fn visible_height(&self) -> Pt {
        self.cells
            .iter()
            .map(|row| {
                row.first()
                    .and_then(|slot| slot.as_ref())
                    .map(|cell| cell.min_height)
                    .unwrap_or(Pt::ZERO)
            })
            .sum()
    }

    /// Renders the whole table, advancing the canvas across as many pages as
    /// the grid needs and leaving the cursor below the table.
    pub fn generate(&mut self, canvas: &mut Canvas) -> Result<(), GridFlowError> {
        self.check_constraint()?;
        if self.rows == 0 || self.cols == 0 {
            return Ok(());
        }

        loop {
            let (sx, sy) = canvas.xy();
            let page_end = canvas.page_end_y();
            self.solve_heights(canvas);
            self.cache_geometry(canvas, sx, sy);

            let mut advanced = false;
            'grid: for i in 0..self.cached_row.len() {
                for j in 0..self.cols {
                    // Page-break detection floors multi-row entities to their
                    // first row: the break belongs to the row, not the span.
                    let (_, y1, mut y2) = self.vline_position(i, j);
                    if let Some(cell) = self.cells[i][j].as_ref() {
                        if let CellKind::Entity { rowspan, .. } = cell.kind {
                            if rowspan > 1 {
                                y2 = y1 + cell.min_height;
                            }
                        }
                    }

                    if y1 < page_end && page_end < y2 {
                        if i == 0 {
                            // Nothing fits below the current cursor; restart
                            // the table from the top of a fresh page.
                            if let Some(logger) = self.debug.as_deref() {
                                logger.log_json("{\"type\":\"table.page_restart\"}");
                                logger.increment("table.page_restart", 1);
                            }
                            canvas.add_page(false);
                            self.completed_rows = NO_ROW_COMPLETED;
                            self.margin.top = Pt::ZERO;
                            let (px, py) = canvas.page_start_xy();
                            canvas.set_xy(px, py);
                            advanced = true;
                            break 'grid;
                        }

                        self.write_rest_cells(canvas, i, j, page_end);
                        if self.completed_rows > i {
                            self.completed_rows = i;
                        }
                        self.draw_page_lines(canvas);
                        self.reflow();
                        if let Some(logger) = self.debug.as_deref() {
                            logger.log_json(&format!(
                                "{{\"type\":\"table.page_break\",\"row\":{},\"remaining_rows\":{}}}",
                                i,
                                self.cells.len()
                            ));
                            logger.increment("table.page_break", 1);
                        }
                        canvas.add_page(false);
                        self.margin.top = Pt::ZERO;
                        self.rows = self.cells.len();
                        self.completed_rows = NO_ROW_COMPLETED;
                        let (px, py) = canvas.page_start_xy();
                        canvas.set_xy(px, py);
                        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
                        canvas.gray_stroke(0.0);
                        if self.rows == 0 {
                            if let Some(logger) = self.debug.as_deref() {
                                logger.flush();
                            }
                            return Ok(());
                        }
                        advanced = true;
                        break 'grid;
                    }

                    let has_element = self.cells[i][j]
                        .as_ref()
                        .map(|cell| cell.element.is_some())
                        .unwrap_or(false);
                    if !has_element {
                        continue;
                    }

                    let (_, y1, y2) = self.vline_position(i, j);
                    if y1 < page_end && y2 >= page_end {
                        if self.completed_rows > i {
                            self.completed_rows = i;
                        }
                        self.write_overflow_cell(canvas, i, j, page_end);
                    } else if y1 < page_end && y2 < page_end {
                        self.write_whole_cell(canvas, i, j, page_end);
                    }
                }
            }
            if advanced {
                continue;
            }

            self.draw_last_page_lines(canvas);
            let height = self.visible_height();
            let y_top = self
                .cached_row
                .first()
                .copied()
                .unwrap_or(sy + self.margin.top);
            let (px, _) = canvas.page_start_xy();
            canvas.set_xy(px, y_top + height + self.margin.top + self.margin.bottom);
            if let Some(logger) = self.debug.as_deref() {
                logger.flush();
            }
            return Ok(());
        }
    }

    /// Commits a cell that fits entirely on the page. If the entity below it
    /// straddles the page end and cannot place anything in the remaining
    /// space, the render height is clamped to the page end so no orphaned
    /// short line appears below this cell.
    fn write_whole_cell(&mut self, canvas: &mut Canvas, row: usize, col: usize, page_end: Pt) {
        let (x1, y1, mut y2) = self.vline_position(row, col);
        canvas.set_xy(x1, y1);

        let Some((rowspan, _)) = self.cells[row][col]
            .as_ref()
            .and_then(|cell| cell.entity_span())
        else {
            return;
        };
        let next = row + rowspan;
        if next < self.cells.len() && next < self.cached_row.len() {
            let (_, y3, y4) = self.vline_position(next, col);
            if y3 < page_end && y4 >= page_end && !self.next_cell_can_write(row, col, page_end) {
                y2 = page_end;
            }
        }

        if let Some(cell) = self.cells[row][col].as_mut() {
            if let Some(element) = cell.element.as_mut() {
                element.generate(canvas, y2 - y1);
            }
            if let CellKind::Entity { rowspan, .. } = cell.kind {
                cell.rows_written = rowspan;
            }
        }
    }

    /// Commits as much of a straddling (or row-finishing) cell as the page
    /// still accepts, and records how many of its span rows that covered.
    fn write_overflow_cell(&mut self, canvas: &mut Canvas, row: usize, col: usize, page_end: Pt) {
        let (x1, y1, _) = self.hline_position(row, col);
        if y1 > page_end {
            return;
        }
        canvas.set_xy(x1, y1);

        let (rowspan, drained) = {
            let Some(cell) = self.cells[row][col].as_mut() else {
                return;
            };
            let Some((rowspan, _)) = cell.entity_span() else {
                return;
            };
            let Some(element) = cell.element.as_mut() else {
                return;
            };
            let (fit, _) = element.try_generate(page_end - y1);
            if fit == 0 {
                return;
            }
            element.generate(canvas, page_end - y1);
            (rowspan, element.height() == Pt::ZERO)
        };

        if drained {
            if let Some(cell) = self.cells[row][col].as_mut() {
                cell.rows_written = rowspan;
            }
        } else if rowspan > 1 {
            let count = self.count_rows_on_page(row, col, rowspan, page_end);
            if let Some(cell) = self.cells[row][col].as_mut() {
                cell.rows_written = count;
            }
        }
    }

    /// Finishes the row a page break was detected in: every entity from the
    /// break column rightwards gets a chance to fill the remaining space.
    fn write_rest_cells(&mut self, canvas: &mut Canvas, row: usize, start_col: usize, page_end: Pt) {
        for col in start_col..self.cols {
            self.write_overflow_cell(canvas, row, col, page_end);
        }
    }

    /// Span rows that ended up fully above the page end, counted from the
    /// span's top row downwards.
    fn count_rows_on_page(&self, row: usize, col: usize, rowspan: usize, page_end: Pt) -> usize {
        let mut count = 0;
        for i in row..(row + rowspan).min(self.cells.len()) {
            if i >= self.cached_row.len() {
                break;
            }
            let (_, y1, mut y2) = self.vline_position(i, col);
            if let Some(cell) = self.cells[i][col].as_ref() {
                if cell.element.is_some() {
                    y2 = y1 + cell.min_height;
                }
            }
            if y1 < page_end && y2 <= page_end {
                count += 1;
            }
            if y1 > page_end || y2 > page_end {
                break;
            }
        }
        count
    }

    /// True if, below the given entity, at least one covered slot's payload
    /// (phantoms resolved to their owners) can still place a line in the
    /// space left above the page end.
    fn next_cell_can_write(&self, row: usize, col: usize, page_end: Pt) -> bool {
        let Some((rowspan, colspan)) = self.cells[row][col]
            .as_ref()
            .and_then(|cell| cell.entity_span())
        else {
            return false;
        };
        let next_row = row + rowspan;
        if next_row >= self.cells.len() || next_row >= self.cached_row.len() {
            return false;
        }
        let y = self.cached_row[next_row];
        let origin = self.origin_row();
        for k in col..(col + colspan).min(self.cols) {
            let Some(slot) = self.cells[next_row][k].as_ref() else {
                continue;
            };
            let element = match slot.kind {
                CellKind::Phantom {
                    owner_row,
                    owner_col,
                } => self.cells[owner_row - origin][owner_col]
                    .as_ref()
                    .and_then(|owner| owner.element.as_ref()),
                CellKind::Entity { .. } => slot.element.as_ref(),
            };
            if let Some(element) = element {
                let (fit, _) = element.try_generate(page_end - y);
                if fit > 0 {
                    return true;
                }
            }
        }
        false
    }

    /// True if, below the given entity, at least one covered slot already
    /// emitted content on this page.
    fn next_cell_has_written(&self, row: usize, col: usize) -> bool {
        let Some((rowspan, colspan)) = self.cells[row][col]
            .as_ref()
            .and_then(|cell| cell.entity_span())
        else {
            return false;
        };
        let next_row = row + rowspan;
        if next_row >= self.cells.len() {
            return false;
        }
        let origin = self.origin_row();
        for k in col..(col + colspan).min(self.cols) {
            let Some(slot) = self.cells[next_row][k].as_ref() else {
                continue;
            };
            match slot.kind {
                CellKind::Phantom {
                    owner_row,
                    owner_col,
                } => {
                    if let Some(owner) = self.cells[owner_row - origin][owner_col].as_ref() {
                        if owner.rows_written >= slot.row - owner.row + 1 {
                            return true;
                        }
                    }
                }
                CellKind::Entity { rowspan: 1, .. } => {
                    if let Some(element) = slot.element.as_ref() {
                        if element_has_emitted(element.as_ref()) {
                            return true;
                        }
                    }
                }
                CellKind::Entity { .. } => {
                    if slot.rows_written > 0 {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether a straddling entity needs its right vertical closed on this
    /// page. It does unless both the entity and its right-hand neighbour
    /// (phantoms resolved) have emitted nothing yet.
    fn needs_vline(&self, row: usize, col: usize) -> bool {
        let Some(cell) = self.cells[row][col].as_ref() else {
            return false;
        };
        let Some((rowspan, colspan)) = cell.entity_span() else {
            return false;
        };

        let mut current_written = false;
        if rowspan == 1 {
            if let Some(element) = cell.element.as_ref() {
                current_written = element_has_emitted(element.as_ref());
            }
        } else if cell.rows_written > 0 {
            current_written = true;
        }

        let next_col = col + colspan;
        if next_col >= self.cols {
            return true;
        }
        let origin = self.origin_row();
        let (nrow, ncol) = match self.cells[row][next_col].as_ref().map(|slot| slot.kind) {
            Some(CellKind::Phantom {
                owner_row,
                owner_col,
            }) => (owner_row - origin, owner_col),
            _ => (row, next_col),
        };
        if let Some(neighbor) = self.cells[nrow][ncol].as_ref() {
            match neighbor.kind {
                CellKind::Entity { rowspan: 1, .. } => {
                    if let Some(element) = neighbor.element.as_ref() {
                        if element_has_emitted(element.as_ref()) {
                            return true;
                        }
                    }
                }
                CellKind::Entity { .. } => {
                    if neighbor.rows_written > 0 {
                        return true;
                    }
                }
                CellKind::Phantom { .. } => {}
            }
        }

        current_written
    }

    /// Border pass for a page the table continues past: outer rectangle down
    /// to the page end, plus per-entity closing segments. Segments belonging
    /// to cells that continue on the next page are suppressed.
    fn draw_page_lines(&self, canvas: &mut Canvas) {
        let page_end = canvas.page_end_y();
        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
        canvas.gray_stroke(0.0);

        let (x0, y0, _) = self.hline_position(0, 0);
        canvas.line_h(x0, y0, x0 + self.width);
        canvas.line_h(x0, page_end, x0 + self.width);

        for row in 0..self.cached_row.len() {
            for col in 0..self.cols {
                let Some(cell) = self.cells[row][col].as_ref() else {
                    continue;
                };
                if cell.element.is_none() {
                    continue;
                }
                let (x, y1, x1) = self.hline_position(row, col);
                let (_, _, y2) = self.vline_position(row, col);

                if y1 < page_end && y2 < page_end {
                    let mut bottom = y2;
                    if let CellKind::Entity { rowspan, .. } = cell.kind {
                        let next = row + rowspan;
                        if next < self.cells.len() && next < self.cached_row.len() {
                            let (_, y3, y4) = self.vline_position(next, col);
                            if y3 < page_end
                                && y4 >= page_end
                                && !self.next_cell_has_written(row, col)
                            {
                                // The cell below takes nothing on this page;
                                // close this cell at the page end instead of
                                // leaving a short open band above it.
                                bottom = page_end;
                            }
                        }
                    }
                    canvas.line_v(x1, y1, bottom);
                    canvas.line_h(x, bottom, x1);
                }

                if y1 < page_end && y2 >= page_end {
                    if self.needs_vline(row, col) {
                        canvas.line_v(x1, y1, page_end);
                    }
                    canvas.line_h(x, page_end, x1);
                }
            }
        }

        canvas.line_v(x0, y0, page_end);
        canvas.line_v(x0 + self.width, y0, page_end);
    }

    /// Border pass for the final page: the bottom edge sits at the table's
    /// visible extent rather than the page end, and no continuation
    /// suppression applies.
    fn draw_last_page_lines(&self, canvas: &mut Canvas) {
        canvas.set_line_style(LineStyle::straight(Pt::from_f32(0.1)));
        canvas.gray_stroke(0.0);

        let (x0, y0, _) = self.hline_position(0, 0);
        let bottom_y = y0 + self.visible_height();
        canvas.line_h(x0, y0, x0 + self.width);
        canvas.line_h(x0, bottom_y, x0 + self.width);

        for row in 0..self.cached_row.len() {
            for col in 0..self.cols {
                let Some(cell) = self.cells[row][col].as_ref() else {
                    continue;
                };
                if cell.element.is_none() {
                    continue;
                }
                let (x, y1, x1) = self.hline_position(row, col);
                let (_, _, y2) = self.vline_position(row, col);

                if y1 < bottom_y && y2 < bottom_y {
                    canvas.line_v(x1, y1, y2);
                    canvas.line_h(x, y2, x1);
                }
                if y1 < bottom_y && y2 >= bottom_y {
                    canvas.line_v(x1, y1, bottom_y);
                    canvas.line_h(x, bottom_y, x1);
                }
            }
        }

        canvas.line_v(x0, y0, bottom_y);
        canvas.line_v(x0 + self.width, y0, bottom_y);
    }

    /// Rewrites the residual grid after a page fills: drops the rows every
    /// column has fully consumed and turns partially-consumed spans into
    /// fresh entities at the new top row.
    fn reflow(&mut self) {
        let origin = self.origin_row();
        let head = self.completed_rows;
        if head >= self.cells.len() {
            return;
        }

        let mut min_consumed = usize::MAX;
        for col in 0..self.cols {
            let mut count = 0usize;
            if let Some(cell) = self.cells[head][col].as_ref() {
                match cell.kind {
                    CellKind::Phantom {
                        owner_row,
                        owner_col,
                    } => {
                        let oi = owner_row - origin;
                        if let Some(owner) = self.cells[oi][owner_col].as_ref() {
                            count += owner.rows_written.saturating_sub(cell.row - owner.row);
                            if let CellKind::Entity { rowspan, .. } = owner.kind {
                                if owner.rows_written == rowspan {
                                    count += self.count_written_chain(oi + rowspan, col);
                                }
                            }
                        }
                    }
                    CellKind::Entity { rowspan, .. } => {
                        count += cell.rows_written;
                        if cell.rows_written == rowspan {
                            count += self.count_written_chain(head + rowspan, col);
                        }
                    }
                }
            }
            min_consumed = min_consumed.min(count);
        }

        let target = head + min_consumed;
        if target >= self.cells.len() {
            self.cells.clear();
            return;
        }

        let mut col = 0;
        while col < self.cols {
            let Some(kind) = self.cells[target][col].as_ref().map(|cell| cell.kind) else {
                col += 1;
                continue;
            };
            match kind {
                CellKind::Entity { colspan, .. } => {
                    if let Some(cell) = self.cells[target][col].as_mut() {
                        cell.rows_written = 0;
                    }
                    col += colspan;
                }
                CellKind::Phantom {
                    owner_row,
                    owner_col,
                } => {
                    let oi = owner_row - origin;
                    let Some((orowspan, ocolspan)) = self.cells[oi][owner_col]
                        .as_ref()
                        .and_then(|owner| owner.entity_span())
                    else {
                        col += 1;
                        continue;
                    };
                    let mut element = self.cells[oi][owner_col]
                        .as_mut()
                        .and_then(|owner| owner.element.take());
                    let new_row = origin + target;
                    let new_rowspan = orowspan - (new_row - owner_row);
                    for x in target..oi + orowspan {
                        for y in col..col + ocolspan {
                            let Some(slot) = self.cells[x][y].as_mut() else {
                                continue;
                            };
                            if x == target && y == col {
                                slot.kind = CellKind::Entity {
                                    rowspan: new_rowspan,
                                    colspan: ocolspan,
                                };
                                slot.element = element.take();
                                slot.rows_written = 0;
                            } else {
                                slot.kind = CellKind::Phantom {
                                    owner_row: new_row,
                                    owner_col: col,
                                };
                            }
                        }
                    }
                    col += ocolspan;
                }
            }
        }

        self.cells.drain(0..target);
        if let Some(logger) = self.debug.as_deref() {
            logger.log_json(&format!(
                "{{\"type\":\"table.reflow\",\"dropped_rows\":{},\"remaining_rows\":{}}}",
                target,
                self.cells.len()
            ));
            logger.increment("table.reflow", 1);
        }
    }

    /// Walks one column downwards from `start_row`, accumulating the written
    /// row counts of chained entities; stops at the first untouched or
    /// partially-consumed one.
    fn count_written_chain(&self, start_row: usize, col: usize) -> usize {
        let origin = self.origin_row();
        let mut count = 0;
        let mut row = start_row;
        while row < self.cells.len() {
            let Some(cell) = self.cells[row][col].as_ref() else {
                break;
            };
            match cell.kind {
                CellKind::Phantom {
                    owner_row,
                    owner_col,
                } => {
                    let oi = owner_row - origin;
                    let Some(owner) = self.cells[oi][owner_col].as_ref() else {
                        break;
                    };
                    if owner.rows_written == 0 {
                        break;
                    }
                    if owner.rows_written >= cell.row - owner.row + 1 {
                        count += owner.rows_written - (cell.row - owner.row);
                    }
                    let Some((orowspan, _)) = owner.entity_span() else {
                        break;
                    };
                    row = oi + orowspan;
                }
                CellKind::Entity { rowspan, .. } => {
                    if cell.rows_written == 0 {
                        break;
                    }
                    count += cell.rows_written;
                    if rowspan > cell.rows_written {
                        break;
                    }
                    row += rowspan;
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Canvas;
    use crate::content::TextContent;
    use crate::types::Size;

    fn pt(value: f32) -> Pt {
        Pt::from_f32(value)
    }

    fn canvas(height: f32) -> Canvas {
        Canvas::new(
            Size {
                width: pt(600.0),
                height: pt(height),
            },
            Margins::zero(),
        )
    }

    fn text(content: &str, line_height: f32) -> Box<dyn CellContent> {
        Box::new(TextContent::new(content, pt(line_height)))
    }

    fn kind_at(table: &Table, row: usize, col: usize) -> CellKind {
        table.cells[row][col].as_ref().unwrap().kind
    }

    fn min_height_at(table: &Table, row: usize, col: usize) -> Pt {
        table.cells[row][col].as_ref().unwrap().min_height
    }

    fn height_at(table: &Table, row: usize, col: usize) -> Pt {
        table.cells[row][col].as_ref().unwrap().height
    }

    #[test]
    fn cursor_skips_spanned_slots_in_row_major_order() {
        let canvas = canvas(800.0);
        let mut table = Table::new(3, 3, pt(300.0), pt(20.0), &canvas);
        table.new_cell_by_range(2, 2).unwrap();
        assert_eq!(table.cursor, Some((0, 2)));
        table.new_cell().unwrap();
        assert_eq!(table.cursor, Some((1, 2)));
        table.new_cell().unwrap();
        assert_eq!(table.cursor, Some((2, 0)));
        assert_eq!(
            kind_at(&table, 1, 1),
            CellKind::Phantom {
                owner_row: 0,
                owner_col: 0
            }
        );
        table.new_cell_by_range(3, 1).unwrap();
        assert_eq!(table.cursor, None);
        assert!(matches!(table.new_cell(), Err(GridFlowError::GridFull)));
    }

    #[test]
    fn span_past_the_last_row_is_rejected_without_mutation() {
        let canvas = canvas(800.0);
        let mut table = Table::new(2, 2, pt(300.0), pt(20.0), &canvas);
        table.new_cell().unwrap().set_element(text("a", 20.0));
        table.new_cell().unwrap().set_element(text("b", 20.0));
        table.new_cell().unwrap().set_element(text("c", 20.0));

        let err = table.new_cell_by_range(1, 2);
        assert!(matches!(err, Err(GridFlowError::InvalidSpan(_))));
        assert!(table.cells[1][1].is_none());
        assert_eq!(table.cursor, Some((1, 1)));

        table.new_cell().unwrap().set_element(text("d", 20.0));
        assert_eq!(table.cursor, None);
    }

    #[test]
    fn span_colliding_with_an_occupied_slot_is_rejected() {
        let canvas = canvas(800.0);
        let mut table = Table::new(3, 3, pt(300.0), pt(20.0), &canvas);
        table.new_cell().unwrap();
        table.new_cell_by_range(1, 3).unwrap();
        table.new_cell().unwrap();
        assert_eq!(table.cursor, Some((1, 0)));

        let err = table.new_cell_by_range(2, 1);
        assert!(matches!(err, Err(GridFlowError::InvalidSpan(_))));
        assert!(table.cells[1][0].is_none());

        assert!(matches!(
            table.new_cell_by_range(0, 1),
            Err(GridFlowError::InvalidSpan(_))
        ));
    }

    #[test]
    fn constraint_check_requires_full_coverage_and_payloads() {
        let mut surface = canvas(800.0);
        let mut table = Table::new(2, 2, pt(300.0), pt(20.0), &surface);
        for _ in 0..3 {
            table.new_cell().unwrap().set_element(text("x", 20.0));
        }
        assert!(matches!(
            table.generate(&mut surface),
            Err(GridFlowError::ConstraintViolation(_))
        ));

        let mut surface = canvas(800.0);
        let mut table = Table::new(2, 2, pt(300.0), pt(20.0), &surface);
        for _ in 0..3 {
            table.new_cell().unwrap().set_element(text("x", 20.0));
        }
        table.new_cell().unwrap();
        assert!(matches!(
            table.generate(&mut surface),
            Err(GridFlowError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn solver_pushes_span_overflow_into_the_last_row() {
        let surface = canvas(800.0);
        let mut table = Table::new(2, 2, pt(300.0), pt(20.0), &surface);
        table
            .new_cell_by_range(1, 2)
            .unwrap()
            .set_element(text("a\nb", 25.0));
        table.new_cell().unwrap().set_element(text("x", 20.0));
        table.new_cell().unwrap().set_element(text("y", 20.0));
        table.check_constraint().unwrap();
        table.solve_heights(&surface);

        assert_eq!(min_height_at(&table, 0, 0), pt(20.0));
        assert_eq!(min_height_at(&table, 0, 1), pt(20.0));
        assert_eq!(min_height_at(&table, 1, 0), pt(30.0));
        assert_eq!(min_height_at(&table, 1, 1), pt(30.0));
        assert_eq!(height_at(&table, 0, 0), pt(50.0));
        assert_eq!(height_at(&table, 1, 1), pt(30.0));
    }

    #[test]
    fn solver_floors_every_row_at_the_line_height() {
        let surface = canvas(800.0);
        let mut table = Table::new(2, 1, pt(300.0), pt(20.0), &surface);
        table.new_cell().unwrap().set_element(text("a", 5.0));
        table.new_cell().unwrap().set_element(text("b", 5.0));
        table.check_constraint().unwrap();
        table.solve_heights(&surface);
        assert_eq!(min_height_at(&table, 0, 0), pt(20.0));
        assert_eq!(min_height_at(&table, 0, 1), pt(20.0));
    }

    #[test]
    fn solver_keeps_rows_uniform_and_spans_consistent() {
        let surface = canvas(800.0);
        let mut table = Table::new(3, 3, pt(300.0), pt(20.0), &surface);
        table
            .new_cell_by_range(1, 2)
            .unwrap()
            .set_element(text("s1\ns2\ns3", 20.0));
        table.new_cell().unwrap().set_element(text("a\na2", 20.0));
        table.new_cell().unwrap().set_element(text("b", 20.0));
        table.new_cell().unwrap().set_element(text("c", 20.0));
        table.new_cell().unwrap().set_element(text("d", 20.0));
        table
            .new_cell_by_range(3, 1)
            .unwrap()
            .set_element(text("wide", 20.0));
        table.check_constraint().unwrap();
        table.solve_heights(&surface);

        for row in 0..3 {
            let expected = min_height_at(&table, row, 0);
            for col in 1..3 {
                assert_eq!(min_height_at(&table, row, col), expected, "row {row}");
            }
        }
        for row in 0..3 {
            for col in 0..3 {
                let Some(cell) = table.cells[row][col].as_ref() else {
                    continue;
                };
                if let CellKind::Entity { rowspan, .. } = cell.kind {
                    let provided: Pt = (0..rowspan)
                        .map(|k| min_height_at(&table, row + k, col))
                        .sum();
                    assert_eq!(cell.height, provided, "entity at ({row}, {col})");
                }
            }
        }
    }

    #[test]
    fn every_slot_resolves_to_a_covering_entity() {
        let surface = canvas(800.0);
        let mut table = Table::new(4, 4, pt(400.0), pt(20.0), &surface);
        table.new_cell_by_range(2, 2).unwrap().set_element(text("a", 20.0));
        table.new_cell_by_range(2, 1).unwrap().set_element(text("b", 20.0));
        table.new_cell_by_range(1, 2).unwrap().set_element(text("c", 20.0));
        table.new_cell_by_range(1, 3).unwrap().set_element(text("d", 20.0));
        for label in ["e", "f", "g", "h", "i"] {
            table.new_cell().unwrap().set_element(text(label, 20.0));
        }
        table.check_constraint().unwrap();

        let mut area = 0usize;
        for row in 0..4 {
            for col in 0..4 {
                let cell = table.cells[row][col].as_ref().unwrap();
                let (erow, ecol) = match cell.kind {
                    CellKind::Entity { .. } => {
                        if let CellKind::Entity { rowspan, colspan } = cell.kind {
                            area += rowspan * colspan;
                        }
                        (row, col)
                    }
                    CellKind::Phantom {
                        owner_row,
                        owner_col,
                    } => (owner_row, owner_col),
                };
                let owner = table.cells[erow][ecol].as_ref().unwrap();
                let CellKind::Entity { rowspan, colspan } = owner.kind else {
                    panic!("phantom at ({row}, {col}) resolves to a phantom");
                };
                assert!(
                    erow <= row && row < erow + rowspan && ecol <= col && col < ecol + colspan,
                    "slot ({row}, {col}) outside its entity's rectangle"
                );
            }
        }
        assert_eq!(area, 16);
    }

    #[test]
    fn column_widths_must_cover_columns_and_sum_to_one() {
        let surface = canvas(800.0);
        let mut table = Table::new(3, 1, pt(300.0), pt(20.0), &surface);
        assert!((table.col_widths.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(matches!(
            table.set_col_widths(&[0.5, 0.5]),
            Err(GridFlowError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            table.set_col_widths(&[0.5, 0.6, 0.1]),
            Err(GridFlowError::InvalidConfiguration(_))
        ));
        table.set_col_widths(&[0.2, 0.3, 0.5]).unwrap();
        table.new_cell().unwrap();
        assert_eq!(table.col_width(0, 0).unwrap(), pt(60.0));
    }

    #[test]
    fn cell_width_indices_out_of_range_are_fatal() {
        let surface = canvas(800.0);
        let mut table = Table::new(2, 1, pt(300.0), pt(20.0), &surface);
        table.new_cell_by_range(2, 1).unwrap();
        assert_eq!(table.col_width(0, 0).unwrap(), pt(300.0));
        assert!(matches!(
            table.col_width(1, 0),
            Err(GridFlowError::ColumnOutOfBounds { .. })
        ));
        assert!(matches!(
            table.col_width(0, 2),
            Err(GridFlowError::ColumnOutOfBounds { .. })
        ));
    }

    #[test]
    fn whole_write_marks_every_span_row_written() {
        let mut surface = canvas(800.0);
        let mut table = Table::new(2, 2, pt(300.0), pt(20.0), &surface);
        table
            .new_cell_by_range(1, 2)
            .unwrap()
            .set_element(text("a\nb", 20.0));
        table.new_cell().unwrap().set_element(text("x", 20.0));
        table.new_cell().unwrap().set_element(text("y", 20.0));
        table.generate(&mut surface).unwrap();
        assert_eq!(table.cells[0][0].as_ref().unwrap().rows_written, 2);
        assert_eq!(table.cells[0][1].as_ref().unwrap().rows_written, 1);
    }

    #[test]
    fn reflow_converts_a_partial_span_into_a_continuation_entity() {
        let surface = canvas(50.0);
        let mut table = Table::new(2, 3, pt(300.0), pt(20.0), &surface);
        table
            .new_cell_by_range(1, 3)
            .unwrap()
            .set_element(text("l1\nl2\nl3", 20.0));
        for label in ["r0", "r1", "r2"] {
            table.new_cell().unwrap().set_element(text(label, 20.0));
        }
        table.check_constraint().unwrap();
        table.solve_heights(&surface);
        table.cache_geometry(&surface, Pt::ZERO, Pt::ZERO);

        table.cells[0][0].as_mut().unwrap().rows_written = 2;
        table.cells[0][1].as_mut().unwrap().rows_written = 1;
        table.cells[1][1].as_mut().unwrap().rows_written = 1;
        table.completed_rows = 0;
        table.reflow();

        assert_eq!(table.cells.len(), 1);
        let head = table.cells[0][0].as_ref().unwrap();
        assert_eq!(
            head.kind,
            CellKind::Entity {
                rowspan: 1,
                colspan: 1
            }
        );
        assert!(head.element.is_some());
        assert_eq!(head.rows_written, 0);
        assert_eq!(head.row, 2);
        assert_eq!(table.origin_row(), 2);
        assert!(matches!(
            table.cells[0][1].as_ref().unwrap().kind,
            CellKind::Entity {
                rowspan: 1,
                colspan: 1
            }
        ));
    }

    #[test]
    fn reflow_clears_the_grid_once_every_row_is_consumed() {
        let surface = canvas(800.0);
        let mut table = Table::new(1, 2, pt(300.0), pt(20.0), &surface);
        table.new_cell().unwrap().set_element(text("a", 20.0));
        table.new_cell().unwrap().set_element(text("b", 20.0));
        table.check_constraint().unwrap();
        table.solve_heights(&surface);
        table.cache_geometry(&surface, Pt::ZERO, Pt::ZERO);

        table.cells[0][0].as_mut().unwrap().rows_written = 1;
        table.cells[1][0].as_mut().unwrap().rows_written = 1;
        table.completed_rows = 1;
        table.reflow();
        assert!(table.cells.is_empty());
    }
}
