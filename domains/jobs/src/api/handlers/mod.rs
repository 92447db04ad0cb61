pub mod assets;
pub mod jobs;
pub mod projects;
