pub mod export;
pub mod replay;

pub use export::*;
pub use replay::*;
