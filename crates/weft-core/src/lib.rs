pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod schema;
pub mod tag;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{Result, WeftError};
pub use event::{EventBus, RuntimeEvent};
pub use schema::Schema;
pub use tag::{Tag, TagBag, TagKey, TagSink, TagSource, Tagged};
pub use types::*;
