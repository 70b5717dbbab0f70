pub mod boards;
pub mod codec;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod manager;
pub mod records;
pub mod repository;
pub mod views;
pub mod watcher;

pub use boards::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use manager::*;
pub use records::*;
pub use repository::*;
pub use views::*;
pub use watcher::*;
