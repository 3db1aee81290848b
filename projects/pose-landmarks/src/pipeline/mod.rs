// Landmark extraction pipeline

pub mod csv_writer;
pub mod extractor;
pub mod job;
pub mod observer;
pub mod schedule;
pub mod types;
