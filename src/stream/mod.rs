//! Streamed upload ingestion: line framing of the response body and the
//! controller that turns events into transcript updates.

pub mod controller;
pub mod framer;

pub use controller::{
    IngestOutcome, ProcessStreamSource, StreamIngestController, UploadHandle, DEFAULT_IDLE_TIMEOUT,
};
