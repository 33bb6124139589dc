//! Config command handlers.

use anyhow::{Context, Result};
use taskrelay_core::config::{self, Config};

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn show() -> Result<()> {
    let config = Config::load().context("load config")?;
    print!("{}", config.to_toml()?);
    Ok(())
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}
