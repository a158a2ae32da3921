//! Catalog store backed by a JSON file.

use std::path::Path;

use anyhow::Context;
use tether_core::MemoryCatalog;

/// Load the catalog file. Accepts a full catalog object or a bare array of items, in which
/// case channels are derived from the items.
pub fn load(path: Option<&Path>) -> anyhow::Result<MemoryCatalog> {
    let Some(path) = path else {
        tracing::info!("no catalog configured; serving an empty catalog");
        return Ok(MemoryCatalog::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    let catalog = parse(&text).with_context(|| format!("parsing catalog {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        channels = catalog.channels.len(),
        items = catalog.items.len(),
        "catalog loaded"
    );
    Ok(catalog)
}

fn parse(text: &str) -> serde_json::Result<MemoryCatalog> {
    if text.trim_start().starts_with('[') {
        return Ok(MemoryCatalog::from_items(serde_json::from_str(text)?));
    }
    let mut catalog: MemoryCatalog = serde_json::from_str(text)?;
    if catalog.channels.is_empty() && !catalog.items.is_empty() {
        let derived = MemoryCatalog::from_items(std::mem::take(&mut catalog.items));
        catalog.channels = derived.channels;
        catalog.items = derived.items;
    }
    Ok(catalog)
}
