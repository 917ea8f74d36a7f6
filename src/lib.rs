mod canvas;
mod content;
mod debug;
mod error;
mod table;
mod types;

pub use canvas::{Canvas, Command, Document, LineDash, LineStyle, Page};
pub use content::{CellContent, TextContent};
pub use debug::DebugLogger;
pub use error::GridFlowError;
pub use table::{CellKind, Table, TableCell};
pub use types::{Margins, Pt, Size};
