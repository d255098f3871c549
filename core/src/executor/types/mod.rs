pub mod context;
pub mod edge;
pub mod node;
pub mod result;

pub use context::*;
pub use edge::*;
pub use node::*;
pub use result::*;
