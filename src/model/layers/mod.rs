mod feed_forward;
mod norm;
mod primitives;
mod resnet_block;
mod unet_block;

pub use feed_forward::*;
pub use norm::*;
pub use primitives::*;
pub use resnet_block::*;
pub use unet_block::*;
