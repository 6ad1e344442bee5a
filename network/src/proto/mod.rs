pub mod bitswap;
pub mod dht;
pub mod identify;
