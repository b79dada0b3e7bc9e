pub mod keycode;
pub mod rle;

pub use keycode::{IndexZYX, InstanceId};
