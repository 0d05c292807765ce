mod callbacks;
mod model_trainer;

pub use callbacks::{Callback, EarlyStopping};
pub use model_trainer::{History, ModelTrainer};
