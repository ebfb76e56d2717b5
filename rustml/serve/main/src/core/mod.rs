pub mod batcher;
pub mod generate;
pub mod sampling;
pub mod serving;
pub mod session;
