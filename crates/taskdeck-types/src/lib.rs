pub mod board;
pub mod event;
pub mod filter;
pub mod record;

pub use board::*;
pub use event::*;
pub use filter::*;
pub use record::*;
