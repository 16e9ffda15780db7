pub mod ollama;
pub mod pattern;
pub mod remote;
