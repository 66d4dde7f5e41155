pub mod encoder;
pub mod encoders;
pub mod params;
pub mod predictor;

pub use encoder::{Architecture, Encoder};
pub use encoders::ConvEncoder;
pub use params::{count_parameters, snapshot_vars, ParamBuilder};
pub use predictor::Predictor;
