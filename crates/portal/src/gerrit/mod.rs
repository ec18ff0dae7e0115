//! Gerrit code-review server: REST client and event decoding

pub mod client;
pub mod events;

pub use client::{GerritClient, Group, Project};
pub use events::{ChangeEvent, RedmineAnnotation};
