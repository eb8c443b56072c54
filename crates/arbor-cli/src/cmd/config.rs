//! `arbor config`: print the resolved configuration.

use std::io::Write;

use arbor_core::config::ArborConfig;

use crate::output::{self, OutputMode};

pub fn run_config(config: &ArborConfig, mode: OutputMode, w: &mut dyn Write) -> anyhow::Result<()> {
    if mode.is_json() {
        return output::render_json(w, config);
    }
    write!(w, "{}", toml::to_string_pretty(config)?)?;
    Ok(())
}
