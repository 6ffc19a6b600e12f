pub mod gate;
pub mod model;

pub use gate::SingleFlightGate;
pub use model::InferenceModel;
