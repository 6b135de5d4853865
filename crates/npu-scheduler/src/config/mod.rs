pub mod cli;
pub mod daemon;
pub mod simulate;

pub use cli::*;
pub use daemon::*;
pub use simulate::*;
