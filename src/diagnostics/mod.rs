pub mod classifier;
pub mod hints;
