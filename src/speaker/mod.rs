//! Upstream speech collaborators.
//!
//! Components:
//! - `completion`: chat completion client that writes reply text
//! - `synthesis`: speech synthesis client that turns text into MP3 audio
//!
//! Both sit behind traits so the delivery layer can run against fakes.

pub mod completion;
pub mod synthesis;
