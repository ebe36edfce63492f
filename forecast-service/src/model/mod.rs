pub mod features;
pub mod fitter;
pub mod regression;

pub use fitter::{FitError, FitOutcome, FittedModel, FitterHandle, ModelFitter, TrainingData};
pub use regression::{LinearRegression, ModelError};
