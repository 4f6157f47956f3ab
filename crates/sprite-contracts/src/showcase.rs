use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::prompts::DEFAULT_GRID;

pub const SHOWCASE_DIR: &str = "showcase";
pub const SHOWCASE_INDEX: &str = "showcase.json";

/// One generated sprite sheet, enriched in place once transcoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowcaseRecord {
    pub prompt: String,
    #[serde(default)]
    pub prompt_rewritten: String,
    pub sprite_url: String,
    #[serde(default = "default_grid")]
    pub grid_size: u32,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gif_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_grid() -> u32 {
    DEFAULT_GRID
}

impl ShowcaseRecord {
    /// File stem shared by the sprite and its derived outputs.
    pub fn basename(&self) -> String {
        Path::new(&self.sprite_url)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn sprite_path(&self, root: &Path) -> PathBuf {
        root.join(self.sprite_url.trim_start_matches('/'))
    }

    pub fn transparent_path(&self, root: &Path) -> PathBuf {
        root.join(SHOWCASE_DIR)
            .join(format!("{}-transparent.png", self.basename()))
    }

    pub fn gif_path(&self, root: &Path) -> PathBuf {
        root.join(SHOWCASE_DIR)
            .join(format!("{}.gif", self.basename()))
    }

    pub fn transparent_url_for(&self) -> String {
        format!("/{SHOWCASE_DIR}/{}-transparent.png", self.basename())
    }

    pub fn gif_url_for(&self) -> String {
        format!("/{SHOWCASE_DIR}/{}.gif", self.basename())
    }
}

/// The `showcase.json` array of past runs. Rewritten whole on every save.
#[derive(Debug, Clone)]
pub struct ShowcaseIndex {
    path: PathBuf,
}

impl ShowcaseIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn under(root: &Path) -> Self {
        Self::new(root.join(SHOWCASE_INDEX))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing index is empty; a malformed one is an error.
    pub fn load(&self) -> anyhow::Result<Vec<ShowcaseRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a showcase record array", self.path.display()))
    }

    pub fn save(&self, records: &[ShowcaseRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = serde_json::to_string_pretty(records)?;
        body.push('\n');
        std::fs::write(&self.path, body)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn append(&self, records: Vec<ShowcaseRecord>) -> anyhow::Result<Vec<ShowcaseRecord>> {
        let mut all = self.load()?;
        all.extend(records);
        self.save(&all)?;
        Ok(all)
    }

    pub fn reset(&self) -> anyhow::Result<()> {
        self.save(&[])
    }
}

/// Inline `data:` reference for an uploaded reference image.
pub fn data_url(content_type: &str, bytes: &[u8]) -> String {
    let mime = match content_type.trim() {
        "" => "image/png",
        other => other,
    };
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn record(sprite_url: &str) -> ShowcaseRecord {
        ShowcaseRecord {
            prompt: "crystal fox, chibi kawaii, isometric action RPG".to_string(),
            prompt_rewritten: "CHARACTER: fox".to_string(),
            sprite_url: sprite_url.to_string(),
            grid_size: 4,
            generated_at: "2026-03-01T00:00:00.000Z".to_string(),
            transparent_url: None,
            gif_url: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn missing_index_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let index = ShowcaseIndex::under(temp.path());
        assert!(index.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn append_preserves_existing_records_and_unknown_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let index = ShowcaseIndex::under(temp.path());
        std::fs::write(
            index.path(),
            serde_json::to_string(&json!([{
                "prompt": "old",
                "spriteUrl": "/showcase/000-old.png",
                "featured": true
            }]))?,
        )?;

        let all = index.append(vec![record("/showcase/001-crystal-fox.png")])?;
        assert_eq!(all.len(), 2);

        let raw = std::fs::read_to_string(index.path())?;
        assert!(raw.ends_with("]\n"));
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed[0]["featured"], json!(true));
        assert_eq!(parsed[0]["gridSize"], json!(4));
        assert_eq!(parsed[1]["promptRewritten"], json!("CHARACTER: fox"));
        assert!(parsed[1].get("gifUrl").is_none());
        Ok(())
    }

    #[test]
    fn malformed_index_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let index = ShowcaseIndex::under(temp.path());
        std::fs::write(index.path(), "{not json")?;
        assert!(index.load().is_err());
        Ok(())
    }

    #[test]
    fn derived_output_paths_share_the_sprite_stem() {
        let item = record("/showcase/007-baby-dragon.png");
        let root = Path::new("/srv/public");
        assert_eq!(item.basename(), "007-baby-dragon");
        assert_eq!(
            item.sprite_path(root),
            PathBuf::from("/srv/public/showcase/007-baby-dragon.png")
        );
        assert_eq!(
            item.transparent_path(root),
            PathBuf::from("/srv/public/showcase/007-baby-dragon-transparent.png")
        );
        assert_eq!(item.gif_url_for(), "/showcase/007-baby-dragon.gif");
    }

    #[test]
    fn data_url_defaults_mime() {
        assert_eq!(data_url("", b"hi"), "data:image/png;base64,aGk=");
        assert_eq!(data_url("image/webp", b"hi"), "data:image/webp;base64,aGk=");
    }
}
