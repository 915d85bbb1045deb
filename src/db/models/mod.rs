//! Roster data model: streamer records and pending submissions.

pub mod streamer;
pub mod submission;

pub use self::streamer::*;
pub use self::submission::*;
