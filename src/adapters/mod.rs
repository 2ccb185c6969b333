pub mod ethereum;

pub use ethereum::{EthereumBlockchain, EthereumNode};
