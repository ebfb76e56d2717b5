pub mod data;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod network;
pub mod optim;
pub mod params;
pub mod persist;
pub mod schedule;
