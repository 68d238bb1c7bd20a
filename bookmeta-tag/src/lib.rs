//! bookmeta-tag library interface
//!
//! Enriches audiobook metadata from companion files, embedded tags and user
//! overrides, then writes it back through whichever installed tool suits the
//! container.

pub mod backends;
pub mod cache;
pub mod codecs;
pub mod dispatcher;
pub mod error;
pub mod improvers;
pub mod options;
pub mod quality;
pub mod record;
pub mod text;

pub use crate::dispatcher::{detect_container_format, BackendDispatcher, ContainerFormat};
pub use crate::error::{TagError, TagResult};
pub use crate::improvers::{ImproveContext, Improver, Pipeline};
pub use crate::options::{ConversionOptions, ExportOptions, TagFlags};
pub use crate::record::{Chapter, Cover, MetadataRecord};
