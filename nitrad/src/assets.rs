//! Local asset inspection: installed model files and custom node
//! packages.

use std::path::Path;

use walkdir::WalkDir;

pub const MODEL_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin", "gguf"];

/// Generic HF shard/config stems that never identify a model.
const SKIP_STEMS: &[&str] = &[
    "diffusion_pytorch_model",
    "pytorch_model",
    "model",
    "model-00001-of-00002",
    "model-00002-of-00002",
];

#[derive(Debug, Default)]
pub struct ModelScan {
    /// File stems, shard names filtered out.
    pub names: Vec<String>,
    /// Full file names matching the stems above.
    pub files: Vec<String>,
}

fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MODEL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Walk the models tree collecting installed model files.
pub fn scan_models(models_dir: &Path) -> ModelScan {
    let mut scan = ModelScan::default();
    if !models_dir.exists() {
        return scan;
    }
    for entry in WalkDir::new(models_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_model_file(path) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if SKIP_STEMS.contains(&stem.to_ascii_lowercase().as_str()) {
            continue;
        }
        scan.names.push(stem.to_string());
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            scan.files.push(name.to_string());
        }
    }
    scan
}

/// Non-hidden directories under custom_nodes, lowercased for matching.
pub fn installed_custom_nodes(custom_nodes_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(custom_nodes_dir) else {
        return Vec::new();
    };
    let mut nodes: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.') && name != "__pycache__")
        .map(|name| name.to_lowercase())
        .collect();
    nodes.sort();
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(path, b"").expect("write");
    }

    #[test]
    fn test_scan_collects_model_extensions_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let models = tmp.path().join("models");
        touch(&models.join("checkpoints/sdxl_base.safetensors"));
        touch(&models.join("loras/style/detail_lora.ckpt"));
        touch(&models.join("checkpoints/readme.txt"));

        let scan = scan_models(&models);
        let mut names = scan.names.clone();
        names.sort();
        assert_eq!(names, vec!["detail_lora", "sdxl_base"]);
        assert_eq!(scan.files.len(), 2);
    }

    #[test]
    fn test_scan_skips_generic_shard_names() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let models = tmp.path().join("models");
        touch(&models.join("llm/pytorch_model.bin"));
        touch(&models.join("llm/Model.safetensors"));
        touch(&models.join("llm/real_model.gguf"));

        let scan = scan_models(&models);
        assert_eq!(scan.names, vec!["real_model"]);
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let scan = scan_models(&tmp.path().join("nope"));
        assert!(scan.names.is_empty());
    }

    #[test]
    fn test_installed_custom_nodes_filters_hidden() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("custom_nodes");
        std::fs::create_dir_all(dir.join("ComfyUI-Manager")).expect("mkdir");
        std::fs::create_dir_all(dir.join(".git")).expect("mkdir");
        std::fs::create_dir_all(dir.join("__pycache__")).expect("mkdir");
        std::fs::write(dir.join("loose_file.py"), b"").expect("write");

        assert_eq!(installed_custom_nodes(&dir), vec!["comfyui-manager"]);
    }
}
