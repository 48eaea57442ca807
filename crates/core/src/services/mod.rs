//! Collaborators around the analysis core: image loaders, decoders, and the
//! per-file session that ties them to annotations and state tables.

pub mod backends;
pub mod decoder;
pub mod listing;
pub mod registry;
pub mod session;

pub use decoder::{
    Architecture, DecodeError, DecodeOptions, DecodeOutput, Decoder, ImageLoader, ImageSymbol,
    LoadedImage,
};
pub use listing::{ListingDecoder, ListingLoader};
pub use registry::{default_registry, AnalysisRegistry};
pub use session::{ChangeEvent, LoadedBinary, SessionConfig, SessionError};
