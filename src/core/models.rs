//! Model descriptors and the supported-models table.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Static description of a WebGPU-compiled model: where its weight shards
/// and compiled kernel live. Created by configuration, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Display name ("Dolphin 2.2.1").
    pub simple_name: String,
    /// Internal identifier the backend loads by.
    pub model_name: String,
    /// Location of the weight parameter shards.
    pub model_params_url: String,
    /// Location of the compiled WASM kernel.
    pub wasm_url: String,
    /// Optional documentation / origin URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
}

/// Resource locations handed to the backend on reload, keyed by the internal
/// model name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub local_id: String,
    pub model_url: String,
    pub model_lib_url: String,
}

impl ModelDescriptor {
    /// Derive the backend-facing configuration for this model.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            local_id: self.model_name.clone(),
            model_url: self.model_params_url.clone(),
            model_lib_url: self.wasm_url.clone(),
        }
    }
}

/// Named table of supported models. Static configuration, not runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    /// The built-in table of known-good WebGPU model builds.
    pub fn builtin() -> Self {
        let mut models = HashMap::new();

        models.insert(
            "dolphin-2.2.1".to_owned(),
            ModelDescriptor {
                simple_name: "Dolphin 2.2.1".to_owned(),
                model_name: "dolphin-2.2.1-mistral-7b-q4f32_1".to_owned(),
                root_url: Some(
                    "https://huggingface.co/hrishioa/mlc-chat-dolphin-2.2.1-mistral-7b-q4f32_1"
                        .to_owned(),
                ),
                model_params_url: "https://huggingface.co/hrishioa/mlc-chat-dolphin-2.2.1-mistral-7b-q4f32_1/resolve/main/params/".to_owned(),
                wasm_url: "https://huggingface.co/hrishioa/mlc-chat-dolphin-2.2.1-mistral-7b-q4f32_1/resolve/main/dolphin-2.2.1-mistral-7b-q4f32_1-webgpu.wasm".to_owned(),
            },
        );
        models.insert(
            "openhermes-2.5".to_owned(),
            ModelDescriptor {
                simple_name: "OpenHermes 2.5".to_owned(),
                model_name: "OpenHermes-2.5-Mistral-7B-q4f32_1".to_owned(),
                root_url: Some(
                    "https://huggingface.co/hrishioa/wasm-OpenHermes-2.5-Mistral-7B-q4f32_1"
                        .to_owned(),
                ),
                model_params_url: "https://huggingface.co/hrishioa/wasm-OpenHermes-2.5-Mistral-7B-q4f32_1/resolve/main/params/".to_owned(),
                wasm_url: "https://huggingface.co/hrishioa/wasm-OpenHermes-2.5-Mistral-7B-q4f32_1/resolve/main/OpenHermes-2.5-Mistral-7B-q4f32_1-webgpu.wasm".to_owned(),
            },
        );
        models.insert(
            "glaive-coder".to_owned(),
            ModelDescriptor {
                simple_name: "Glaive Coder 7B".to_owned(),
                model_name: "glaive-coder-7b-q4f32_1".to_owned(),
                root_url: Some(
                    "https://huggingface.co/cfahlgren1/wasm-glaive-coder-7b-q4f32_1".to_owned(),
                ),
                model_params_url: "https://huggingface.co/cfahlgren1/wasm-glaive-coder-7b-q4f32_1/resolve/main/params/".to_owned(),
                wasm_url: "https://huggingface.co/cfahlgren1/wasm-glaive-coder-7b-q4f32_1/resolve/main/glaive-coder-7b-q4f32_1-webgpu.wasm".to_owned(),
            },
        );
        models.insert(
            "sql-coder".to_owned(),
            ModelDescriptor {
                simple_name: "SQLCoder 7B".to_owned(),
                model_name: "sqlcoder-7b-q4f32_1".to_owned(),
                root_url: Some(
                    "https://huggingface.co/cfahlgren1/wasm-sqlcoder-7b-q4f32_1".to_owned(),
                ),
                model_params_url: "https://huggingface.co/cfahlgren1/wasm-sqlcoder-7b-q4f32_1/resolve/main/params/".to_owned(),
                wasm_url: "https://huggingface.co/cfahlgren1/wasm-sqlcoder-7b-q4f32_1/resolve/main/sqlcoder-7b-q4f32_1-webgpu.wasm".to_owned(),
            },
        );

        Self { models }
    }

    /// Load the registry from the environment: `.env` is honored, and a
    /// `MODELS_FILE` variable pointing at a JSON table replaces the built-in
    /// one.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        match env::var("MODELS_FILE") {
            Ok(path) => Self::from_json_file(Path::new(&path)),
            Err(_) => Ok(Self::builtin()),
        }
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read models file {}", path.display()))?;
        let models: HashMap<String, ModelDescriptor> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse models file {}", path.display()))?;
        Ok(Self { models })
    }

    pub fn get(&self, key: &str) -> Option<&ModelDescriptor> {
        self.models.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
