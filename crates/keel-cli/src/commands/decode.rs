use std::path::Path;

use keel_core::KeelConfig;
use keel_manifest::Labels;

use super::read_input;

pub fn decode(input: &str, template: bool, config: Option<&Path>) -> anyhow::Result<()> {
    let labels: Labels = serde_json::from_str(&read_input(input)?)?;
    let decoded = keel_manifest::decode(&labels)?;

    let output = if template {
        let config = KeelConfig::load(config)?;
        serde_json::to_string_pretty(&decoded.template(&config.template_data())?)?
    } else {
        serde_json::to_string_pretty(&decoded)?
    };
    println!("{output}");
    Ok(())
}
