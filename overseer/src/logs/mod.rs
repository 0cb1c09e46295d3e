pub mod history;
pub mod parser;
pub mod publisher;
pub mod tailer;

pub use history::{HistoryBuffer, RecordQuery};
pub use parser::{ParseError, RecordParser};
pub use publisher::LogPublisher;
pub use tailer::{FileTailer, TailState, TailerStatus};
