//! Built-in flow handlers

pub mod header_rewrite;
pub mod passthrough;

pub use header_rewrite::{HeaderRewriteHandler, RewriteRule, TemplateVars};
pub use passthrough::PassthroughHandler;
