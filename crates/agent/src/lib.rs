pub mod engine;
pub mod pipeline;
pub mod prompt;
pub mod tools;
