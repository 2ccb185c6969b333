mod traits;

pub use traits::Exchange;
