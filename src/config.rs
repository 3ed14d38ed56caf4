use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub log_level: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_image_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_safety_settings: String,
    pub image_aspect_ratio: String,
    pub image_size: String,
    pub history_soft_limit: usize,
    pub prompt_template_path: PathBuf,
    pub prompt_template: String,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn resolve_prompt_template_path() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(env_value) = env::var("PROMPT_TEMPLATE_PATH") {
        let env_path = PathBuf::from(env_value);
        if env_path.is_absolute() {
            candidates.push(env_path);
        } else {
            candidates.push(
                PathBuf::from(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
                    .join(env_path),
            );
        }
    }
    candidates.push(PathBuf::from("prompt_example.txt"));

    for candidate in &candidates {
        if candidate.exists() {
            return candidate.to_path_buf();
        }
    }

    candidates
        .first()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("prompt_example.txt"))
}

fn load_prompt_template(path: &Path) -> String {
    if !path.exists() {
        info!(
            "Prompt template not found at {}; using the built-in structure.",
            path.display()
        );
        return DEFAULT_PROMPT_TEMPLATE.to_string();
    }

    match fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => {
            info!("Loaded prompt template from {}", path.display());
            content
        }
        Ok(_) => {
            warn!(
                "Prompt template at {} is empty; using the built-in structure.",
                path.display()
            );
            DEFAULT_PROMPT_TEMPLATE.to_string()
        }
        Err(err) => {
            warn!(
                "Failed to read prompt template at {}: {}; using the built-in structure.",
                path.display(),
                err
            );
            DEFAULT_PROMPT_TEMPLATE.to_string()
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let prompt_template_path = resolve_prompt_template_path();
        let prompt_template = load_prompt_template(&prompt_template_path);

        Ok(Config {
            bind_addr: env_string("BIND_ADDR", "127.0.0.1:8787"),
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_model: env_string("GEMINI_MODEL", "gemini-2.5-flash"),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-2.5-flash-image"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.7),
            gemini_top_k: env_i32("GEMINI_TOP_K", 40),
            gemini_top_p: env_f32("GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 4096),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            image_aspect_ratio: env_string("IMAGE_ASPECT_RATIO", ""),
            image_size: env_string("IMAGE_SIZE", ""),
            history_soft_limit: env_usize("HISTORY_SOFT_LIMIT", 50),
            prompt_template_path,
            prompt_template,
        })
    }
}

pub const ANALYZE_SYSTEM_PROMPT: &str = "You are a meticulous visual analyst. You describe images as detailed, structured JSON suitable for driving an image generation model. The output MUST be valid JSON with no commentary around it.";

pub const CRITIQUE_SYSTEM_PROMPT: &str = "You are an expert image generation prompt engineer. You compare a source image against a generated attempt and rewrite the generation prompt so the next attempt lands closer to the source. The output MUST be valid JSON with no commentary around it.";

pub const RENDER_SYSTEM_PROMPT: &str = "Generate an image based on the description in the prompt. CRITICAL: the response must be an image, NOT TEXT.";

pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"{
  "subject": {
    "main": "what the image is primarily of",
    "details": "distinguishing features, pose, expression, materials",
    "count": "how many subjects and how they relate"
  },
  "composition": {
    "framing": "close-up, medium shot, wide shot",
    "camera_angle": "eye level, high angle, low angle",
    "layout": "where each element sits in the frame (left/right/center, foreground/background)"
  },
  "lighting": {
    "source": "natural, studio, neon, candlelight",
    "direction": "where the light comes from",
    "mood": "soft, harsh, dramatic"
  },
  "style": {
    "medium": "photograph, oil painting, 3D render",
    "palette": "dominant colors",
    "era_or_aesthetic": "any recognizable style or period"
  },
  "background": "what surrounds the subject",
  "negative_prompt": "elements that must not appear"
}"#;
