//! Integration tests for the supervised rule evaluator

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/reload_flow.rs"]
mod reload_flow;

#[path = "integration/control_plane.rs"]
mod control_plane;

#[path = "integration/pipeline.rs"]
mod pipeline;
