pub mod events;
pub mod extract;
pub mod jobs;
pub mod prompts;
pub mod showcase;
