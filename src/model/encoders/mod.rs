mod shared;

pub use shared::ConvEncoder;
