//! Reqwest adapters for the external collaborators.

pub mod generator;
pub mod media;

pub use generator::HttpImageGenerator;
pub use media::HttpMediaStore;
