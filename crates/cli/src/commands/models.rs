//! `canopy models`: List the models the configured endpoint advertises.

use canopy_providers::{ModelCategory, OpenAiCompatClient, model_info};

use crate::runtime::{CliResult, Runtime};

pub async fn run(all: bool) -> CliResult {
    let rt = Runtime::load().await?;
    let client = OpenAiCompatClient::default();
    let mut ids = client
        .list_models(&rt.config.base_url, rt.config.api_key.as_deref().unwrap_or(""))
        .await?;
    ids.sort();

    println!("Models at {}", rt.config.base_url);
    let mut shown = 0;
    for id in &ids {
        let info = model_info(id);
        if !all && !matches!(info.category, ModelCategory::Chat | ModelCategory::Reasoning) {
            continue;
        }
        shown += 1;
        let default = if *id == rt.config.default_model { "  (default)" } else { "" };
        let tools = if info.supports_tools { "tools" } else { "-" };
        println!("  {id:<40} {:<10} {tools}{default}", category_label(info.category));
    }
    if shown == 0 {
        println!("  No models.");
    } else if !all && shown < ids.len() {
        println!("  ({} non-chat models hidden; use --all)", ids.len() - shown);
    }
    Ok(())
}

fn category_label(category: ModelCategory) -> &'static str {
    match category {
        ModelCategory::Chat => "chat",
        ModelCategory::Reasoning => "reasoning",
        ModelCategory::Embedding => "embedding",
        ModelCategory::Image => "image",
    }
}
