//! Command-line interface for `ctxport`.
//!
//! Parsing, transformation, and writes live in the library crates; this
//! binary wires flags and environment into them and presents the report.

mod app;
mod cli;
mod commands;

fn main() -> anyhow::Result<()> {
    app::run()
}
