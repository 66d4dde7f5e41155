pub mod data;
pub mod io;
pub mod offset;

pub use data::{ContinuousLabels, Dataset, MultiSessionDataset, TensorDataset};
pub use io::{load_dataset, save_tensors};
pub use offset::Offset;
