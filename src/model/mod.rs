mod base_model;
mod layers;
mod network;

pub use base_model::*;
pub use layers::*;
pub use network::*;
