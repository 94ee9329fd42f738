//! Consumer side of the pipeline: the polling thread, record handling and
//! rendering.

pub mod event_display;
pub mod event_processor;
pub mod stream;

pub use event_display::{flag_names, hex_dump, render_event, FaultStats};
pub use event_processor::{EventProcessor, TraceLinePrinter};
pub use stream::{ConsumerControl, ConsumerHandle, ConsumerReport, RecordHandler, StreamConsumer};
