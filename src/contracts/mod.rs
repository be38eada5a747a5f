// Contracts Module - Public ABIs Only

pub mod erc20;
pub mod multicall3;

pub use erc20::{Erc20, ERC20_ABI};
pub use multicall3::{Multicall3, MULTICALL3_ABI};
