#![forbid(unsafe_code)]

//! Optional persistence sink for normalized EventSub notifications.

mod recorder;
mod store;

pub use recorder::{BufferedRecorder, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_PENDING};
pub use store::{EventStore, StoredEvent};
