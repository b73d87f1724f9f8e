//! `coursegen doctor`: Diagnose backend health.

use std::path::Path;

use coursegen_config::AppConfig;
use coursegen_providers::build_from_config;

use super::corpus::FileCorpus;

pub async fn run(config_path: &Path, corpus: Option<&Path>) -> anyhow::Result<()> {
    println!("🩺 coursegen doctor");
    println!("===================\n");

    let mut issues = 0;

    let config = if config_path.exists() {
        match AppConfig::load_from(config_path) {
            Ok(config) => {
                println!("  ✅ Config file valid");
                config
            }
            Err(e) => {
                println!("  ❌ Config file invalid: {e}");
                return Err(e.into());
            }
        }
    } else {
        println!("  ⚠️  No config file, using defaults (run `coursegen config init`)");
        issues += 1;
        AppConfig::default()
    };

    let backends = build_from_config(&config);

    match backends.provider.health_check().await {
        Ok(true) => println!("  ✅ Inference engine reachable ({})", backends.provider.name()),
        Ok(false) => {
            println!("  ❌ Inference engine unhealthy ({})", backends.provider.name());
            issues += 1;
        }
        Err(e) => {
            println!("  ❌ Inference engine unreachable: {e}");
            issues += 1;
        }
    }

    match backends.provider.list_models().await {
        Ok(models) if models.iter().any(|m| m == &config.provider.model) => {
            println!("  ✅ Model available: {}", config.provider.model)
        }
        Ok(models) if models.is_empty() => {
            println!("  ⚠️  Engine did not list models, cannot confirm {}", config.provider.model);
        }
        Ok(_) => {
            println!("  ❌ Model not served by the engine: {}", config.provider.model);
            issues += 1;
        }
        Err(e) => {
            println!("  ⚠️  Could not list models: {e}");
            issues += 1;
        }
    }

    match backends.embedder.encode("проверка").await {
        Ok(v) if v.len() == backends.embedder.dimensions() => {
            println!("  ✅ Embedder ready ({}, {} dims)", backends.embedder.name(), v.len())
        }
        Ok(v) => {
            println!(
                "  ❌ Embedder returned {} dims, expected {}",
                v.len(),
                backends.embedder.dimensions()
            );
            issues += 1;
        }
        Err(e) => {
            println!("  ❌ Embedder unavailable: {e}");
            issues += 1;
        }
    }

    if let Some(path) = corpus {
        match FileCorpus::load(path).await {
            Ok(c) if c.is_empty() => {
                println!("  ⚠️  Corpus at {} has no sources", path.display());
                issues += 1;
            }
            Ok(c) => println!("  ✅ Corpus loaded ({} sources)", c.len()),
            Err(e) => {
                println!("  ❌ Corpus unreadable: {e:#}");
                issues += 1;
            }
        }
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
