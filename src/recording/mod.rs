//! Recording Lifecycle Tracker: AMI-driven descriptor creation, filesystem stability sampling,
//! upload eligibility, and the file-discovery fallback used when a call document is built.

pub mod tracker;

pub use tracker::Tracker;
