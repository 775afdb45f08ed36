//! `canopy init`: Write a default config file.

use canopy_config::AppConfig;

use crate::runtime::CliResult;

pub async fn run() -> CliResult {
    let path = AppConfig::config_dir().join("config.toml");
    if AppConfig::write_default(&path)? {
        println!("Created {}", path.display());
        println!("Add your api_key there (or set CANOPY_API_KEY), then run:");
        println!("  canopy tree new \"First tree\"");
    } else {
        println!("Config already exists at {}", path.display());
    }
    Ok(())
}
