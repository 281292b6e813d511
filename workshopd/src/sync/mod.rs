pub mod backup;
pub mod detector;
pub mod downloader;
pub mod engine;
pub mod events;
pub mod installer;
pub mod markers;
pub mod scanner;
