pub mod api;
pub mod cli;
pub mod db;
pub mod desk;
pub mod files;
pub mod logging;
pub mod render;
pub mod settings;
pub mod stream;
pub mod transcript;

pub use desk::{Desk, DeskError};
pub use transcript::{Message, MessageStatus, Transcript, TranscriptEvent};
