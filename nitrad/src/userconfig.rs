//! User configuration (TOML) and the derived `extra_model_paths.yaml`.
//! The YAML carries explanatory comments, so it is rendered by hand
//! rather than through a serializer.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub extra_model_paths: Vec<String>,
    #[serde(default)]
    pub huggingface_token: String,
}

impl UserConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse {}: {}", path.display(), err),
            )
        })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        std::fs::write(path, raw)
    }
}

/// Strip Unicode format-control characters (category Cf) and
/// surrounding whitespace. Windows copy/paste regularly smuggles
/// U+202A-style marks into pasted paths.
pub fn clean_path(raw: &str) -> String {
    raw.chars()
        .filter(|&c| !is_format_char(c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_format_char(c: char) -> bool {
    matches!(c,
        '\u{00AD}'
        | '\u{0600}'..='\u{0605}'
        | '\u{061C}'
        | '\u{06DD}'
        | '\u{070F}'
        | '\u{08E2}'
        | '\u{180E}'
        | '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2060}'..='\u{2064}'
        | '\u{2066}'..='\u{206F}'
        | '\u{FEFF}'
        | '\u{FFF9}'..='\u{FFFB}'
        | '\u{110BD}'
        | '\u{110CD}'
        | '\u{1BCA0}'..='\u{1BCA3}'
        | '\u{1D173}'..='\u{1D17A}'
        | '\u{E0001}'
        | '\u{E0020}'..='\u{E007F}'
    )
}

/// ComfyUI's standard folder table; a couple of entries carry legacy
/// alternate locations rendered as YAML block lists.
const DEFAULT_FOLDER_ENTRIES: &[(&str, &[&str])] = &[
    ("checkpoints", &["models/checkpoints/"]),
    (
        "text_encoders",
        &[
            "models/text_encoders/",
            "models/clip/  # legacy location still supported",
        ],
    ),
    ("clip_vision", &["models/clip_vision/"]),
    ("configs", &["models/configs/"]),
    ("controlnet", &["models/controlnet/"]),
    ("diffusion_models", &["models/diffusion_models", "models/unet"]),
    ("embeddings", &["models/embeddings/"]),
    ("loras", &["models/loras/"]),
    ("upscale_models", &["models/upscale_models/"]),
    ("vae", &["models/vae/"]),
    ("audio_encoders", &["models/audio_encoders/"]),
    ("model_patches", &["models/model_patches/"]),
];

fn relative_model_subdir(folder: &str) -> String {
    let relative = folder.trim();
    if relative.is_empty() {
        return "models".to_string();
    }
    let mut path = if relative.starts_with("models/") {
        relative.to_string()
    } else {
        format!("models/{}", relative)
    };
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Render extra_model_paths.yaml: the fixed comfyui section plus
/// deduplicated dynamic entries discovered from the user's models.
pub fn render_yaml(base_path: &str, detected_folders: &[String]) -> String {
    let mut lines: Vec<String> = vec![
        "#Rename this to extra_model_paths.yaml and ComfyUI will load it".to_string(),
        String::new(),
        "#config for comfyui".to_string(),
        "#your base path should be either an existing comfy install or a central folder where you store all of your models, loras, etc.".to_string(),
        String::new(),
        "comfyui:".to_string(),
        format!("     base_path: {}", base_path),
        "     # You can use is_default to mark that these folders should be listed first, and used as the default dirs for eg downloads".to_string(),
        "     #is_default: true".to_string(),
    ];

    let mut seen: Vec<String> = DEFAULT_FOLDER_ENTRIES
        .iter()
        .map(|(name, _)| name.to_lowercase())
        .collect();

    let mut dynamic: Vec<(String, String)> = Vec::new();
    for raw in detected_folders {
        let Some(name) = nitra_common::paths::normalize_folder_name(raw) else {
            continue;
        };
        let key = name.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        let subdir = relative_model_subdir(&name);
        dynamic.push((name, subdir));
    }

    if !dynamic.is_empty() {
        lines.push("     # Additional install folders detected from your Nitra models".to_string());
    }

    for (name, values) in DEFAULT_FOLDER_ENTRIES
        .iter()
        .map(|(name, values)| (name.to_string(), values.iter().map(|v| v.to_string()).collect::<Vec<_>>()))
        .chain(dynamic.into_iter().map(|(name, value)| (name, vec![value])))
    {
        if values.len() > 1 {
            lines.push(format!("     {}: |", name));
            for value in values {
                lines.push(format!("          {}", value));
            }
        } else {
            lines.push(format!("     {}: {}", name, values[0]));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Regenerate (or delete) extra_model_paths.yaml for the given base
/// path. An empty base path removes the file.
pub fn update_yaml(
    yaml_path: &Path,
    base_path: &str,
    detected_folders: &[String],
) -> io::Result<()> {
    if base_path.trim().is_empty() {
        match std::fs::remove_file(yaml_path) {
            Ok(()) => info!("removed {} (user cleared path)", yaml_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        return Ok(());
    }
    std::fs::write(yaml_path, render_yaml(base_path.trim(), detected_folders))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_roundtrip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("config.toml");

        let config = UserConfig {
            extra_model_paths: vec!["/data/models".to_string()],
            huggingface_token: "hf_secret".to_string(),
        };
        config.save(&path).expect("save");

        let loaded = UserConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_config_is_default() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let loaded = UserConfig::load(&tmp.path().join("absent.toml")).expect("load");
        assert_eq!(loaded, UserConfig::default());
    }

    #[test]
    fn test_clean_path_strips_format_chars() {
        assert_eq!(clean_path("\u{202A}C:\\Models\u{202C} "), "C:\\Models");
        assert_eq!(clean_path("  /data/models  "), "/data/models");
        assert_eq!(clean_path("\u{FEFF}"), "");
    }

    #[test]
    fn test_render_yaml_defaults() {
        let yaml = render_yaml("/data/comfy", &[]);
        assert!(yaml.contains("comfyui:"));
        assert!(yaml.contains("     base_path: /data/comfy"));
        assert!(yaml.contains("     checkpoints: models/checkpoints/"));
        // Multi-location entries render as block scalars.
        assert!(yaml.contains("     text_encoders: |"));
        assert!(yaml.contains("          models/clip/  # legacy location still supported"));
        assert!(!yaml.contains("Additional install folders"));
    }

    #[test]
    fn test_render_yaml_dynamic_entries_deduplicated() {
        let detected = vec![
            "video_models".to_string(),
            "Video_Models".to_string(),
            "loras".to_string(),
            "  ".to_string(),
        ];
        let yaml = render_yaml("/base", &detected);
        assert!(yaml.contains("     # Additional install folders detected from your Nitra models"));
        assert_eq!(yaml.matches("video_models").count(), 2); // key + path
        assert!(yaml.contains("     video_models: models/video_models/"));
        // The default loras entry must not be duplicated.
        assert_eq!(yaml.matches("     loras:").count(), 1);
    }

    #[test]
    fn test_update_yaml_empty_path_deletes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let yaml_path = tmp.path().join("extra_model_paths.yaml");

        update_yaml(&yaml_path, "/base", &[]).expect("write");
        assert!(yaml_path.exists());

        update_yaml(&yaml_path, "   ", &[]).expect("delete");
        assert!(!yaml_path.exists());

        // Deleting an absent file is fine.
        update_yaml(&yaml_path, "", &[]).expect("noop");
    }
}
