pub mod fallback;
pub mod language;
pub mod provider;
pub mod schema;
