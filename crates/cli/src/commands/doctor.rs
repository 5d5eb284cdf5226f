//! `mentorlink doctor`: diagnose setup problems.

use std::path::Path;

use mentorlink_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 MentorLink Doctor, System Diagnostics");
    println!("========================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("  ✅ Config file found");
    } else {
        println!("  ⚠️  No config file, using defaults (run `mentorlink config init`)");
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  1 issue(s) found. See above for details.");
            return Ok(());
        }
    };

    if config.has_api_key() {
        println!("  ✅ API key configured");
    } else {
        println!("  ⚠️  No API key configured, set MENTORLINK_API_KEY or add api_key to config.toml");
        issues += 1;
    }

    if let Some(dir) = &config.retrieval.documents_dir {
        if Path::new(dir).is_dir() {
            println!("  ✅ Documents directory: {dir}");
        } else {
            println!("  ❌ Documents directory missing: {dir}");
            issues += 1;
        }
    }

    match mentorlink_gateway::build_state(&config).await {
        Ok(state) => {
            println!("  ✅ Session store ready ({})", state.orchestrator.store().name());
            match state.orchestrator.invoker().health_check().await {
                Ok(true) => println!("  ✅ Provider reachable ({})", state.orchestrator.invoker().provider_name()),
                Ok(false) => {
                    println!("  ⚠️  Provider answered but reported unhealthy");
                    issues += 1;
                }
                Err(e) => {
                    println!("  ❌ Provider unreachable: {e}");
                    issues += 1;
                }
            }
        }
        Err(e) => {
            println!("  ❌ Pipeline could not start: {e}");
            issues += 1;
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
