//! `coursegen config`: Configuration management commands.

use std::path::{Path, PathBuf};

use coursegen_config::AppConfig;

pub fn default_path() -> PathBuf {
    AppConfig::config_dir().join("config.toml")
}

/// Write the default configuration, refusing to overwrite unless `force`.
pub async fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, AppConfig::default_toml()).await?;
    println!("✅ Wrote default configuration to {}", path.display());
    Ok(())
}

/// The effective configuration as TOML, API keys masked.
pub fn render(config: &AppConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    let mask = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("***".into());
        }
    };
    mask(&mut shown.provider.api_key);
    for fallback in &mut shown.provider.fallbacks {
        mask(&mut fallback.api_key);
    }
    Ok(toml::to_string_pretty(&shown)?)
}

pub fn show(config: &AppConfig) -> anyhow::Result<()> {
    println!("{}", render(config)?);
    Ok(())
}

pub fn validate(path: &Path) -> anyhow::Result<()> {
    println!("🔍 Validating configuration...");
    match AppConfig::load_from(path) {
        Ok(config) => {
            println!("   ✅ Config parsed and validated");
            println!();
            println!("   Provider:    {} ({})", config.provider.name, config.provider.base_url);
            println!("   Model:       {}", config.provider.model);
            println!(
                "   Embeddings:  {:?}, {} dims",
                config.embedding.backend, config.embedding.dimensions
            );
            println!("   Fallbacks:   {}", config.provider.fallbacks.len());
            println!("   Max runs:    {}", config.runtime.max_concurrent_runs);
            Ok(())
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            Err(e.into())
        }
    }
}
