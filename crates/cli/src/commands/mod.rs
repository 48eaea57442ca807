pub mod analysis;
pub mod annotations;
pub mod binaries;
pub mod project;
pub mod util;

pub use analysis::*;
pub use annotations::*;
pub use binaries::*;
pub use project::*;
pub use util::*;
