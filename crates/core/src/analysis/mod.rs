//! Analysis passes over a decoded image.
//!
//! - [`boundaries`]: function reconstruction by bounded reachability from entry points
//! - [`state`]: forward state propagation with fixup bookkeeping
//! - [`update`]: pluggable state update functions

pub mod boundaries;
pub mod state;
pub mod update;

pub use boundaries::{EntryPointRange, FunctionBoundaries, ReconstructOptions};
pub use state::{
    CalculationOptions, FixupKind, FixupResolution, ImageMemory, PropagationInput,
    StateCalculator, StateError, StateFixup, StateValue,
};
pub use update::{default_update_registry, StateUpdateFunction, UpdateFunctionRegistry};
