pub mod classifier;
pub mod events;
pub mod psth;
pub mod templates;
pub mod trial;
