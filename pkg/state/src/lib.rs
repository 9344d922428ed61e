pub mod store;
pub mod watch;

pub use store::Store;
pub use watch::Event;
