pub mod media;
pub mod webhook;
