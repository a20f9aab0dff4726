pub mod fixtures;
pub mod temp;
pub mod transport;
