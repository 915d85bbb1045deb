pub mod json_file;
pub mod streamers;
pub mod submissions;

pub use json_file::JsonFile;
pub use streamers::{
    JsonStreamerRepository, StreamerChange, StreamerKey, StreamerRepository, StreamerUpdate,
};
pub use submissions::{JsonSubmissionRepository, SubmissionRepository};
