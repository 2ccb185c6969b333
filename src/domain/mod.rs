pub mod activity;
pub mod market;
pub mod snapshot;

pub use activity::*;
pub use market::*;
pub use snapshot::*;
