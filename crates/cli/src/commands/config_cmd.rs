//! `mentorlink config`: configuration management commands.

use mentorlink_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            if !config.has_api_key() {
                warnings.push("No API key set (set MENTORLINK_API_KEY or OPENAI_API_KEY)");
            }
            if config.retrieval.backend == "keyword" && config.retrieval.documents_dir.is_none() {
                warnings.push("Keyword retrieval without retrieval.documents_dir: answers will have no citations");
            }
            if config.session.backend == "memory" {
                warnings.push("In-memory sessions are lost on restart");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Provider:  {}", config.default_provider);
            println!("   Model:     {}", config.default_model);
            println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
            println!("   Budget:    {} tokens", config.prompt.budget_tokens);
            println!("   Retrieval: {}", config.retrieval.backend);
            println!("   Sessions:  {}", config.session.backend);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path().display());
    Ok(())
}

pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path();
    if path.exists() {
        println!("⚠️  Config already exists at: {}", path.display());
        println!("   Edit it manually or delete it and re-run `mentorlink config init`.");
        return Ok(());
    }

    std::fs::create_dir_all(AppConfig::config_dir())?;
    std::fs::write(&path, AppConfig::default_toml())?;
    println!("✅ Created config.toml at: {}", path.display());
    println!("\n📝 Next steps:");
    println!("   1. Add your API key (or set MENTORLINK_API_KEY)");
    println!("   2. Point retrieval.documents_dir at your notes");
    println!("   3. Run: mentorlink serve\n");
    Ok(())
}

fn config_path() -> std::path::PathBuf {
    AppConfig::config_dir().join("config.toml")
}
