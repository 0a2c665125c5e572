//! Mock Data Server
//!
//! A mock HTTP server that answers any request with a templated response
//! chosen by the request path. Mock definitions are YAML files in a
//! directory tree, loaded once at startup.
//!
//! # Features
//!
//! - **Path Matching**: Exact path match, first loaded definition wins
//! - **Body Normalization**: JSON, URL-encoded forms and multipart uploads
//!   become template variables
//! - **Dynamic Templates**: Handlebars expansion with strict variable lookup
//! - **Fallback**: Unmatched paths get `{"error": "No mock data found"}`
//!
//! # Example Definition
//!
//! `mock_data/users/login.yml`:
//!
//! ```yaml
//! path: /users/login
//! response:
//!   user: "{{ username }}"
//!   token: "{{uuid}}"
//! ```
//!
//! A `POST /users/login` with the form body `username=alice` returns
//! `{"user": "alice", "token": "..."}`.

pub mod body;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod matcher;
pub mod server;
pub mod template;

pub use catalog::Catalog;
pub use config::MockServerConfig;
pub use engine::MockEngine;
