use log::warn;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

/// Flat store of typed variables addressed by dotted keys (`Camera.fovy`,
/// `Render.shadow_map_dim`). The engine only reads; writes go through the
/// console command layer.
pub struct Config {
    vars: BTreeMap<String, Var>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Var {
    Int(i64),
    Float(f32),
    Str(String),
}

impl Config {
    pub fn new() -> Config {
        let mut config = Config {
            vars: BTreeMap::new(),
        };
        for (key, var) in DEFAULT_VARS {
            config.vars.insert(key.to_string(), var.clone());
        }
        config
    }

    pub fn load(path: impl AsRef<Path>) -> Config {
        let mut config = Config::new();
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => config.parse_ini(&text),
            Err(error) => warn!(
                "config file {} not loaded: {error}, using defaults",
                path.as_ref().display()
            ),
        }
        config
    }

    /// Sections become key prefixes, so `[Render]` followed by
    /// `shadow_map_dim = 2048` stores `Render.shadow_map_dim`. The parsed
    /// value keeps the type of the existing default when there is one.
    fn parse_ini(&mut self, text: &str) {
        let mut section = String::new();
        for (line_index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("config line {} is not key = value: {line}", line_index + 1);
                continue;
            };
            let key = if section.is_empty() {
                key.trim().to_string()
            } else {
                format!("{section}.{}", key.trim())
            };
            self.vars.insert(key, Var::parse(value.trim()));
        }
    }

    pub fn get_int(&self, key: &str) -> i64 {
        match self.vars.get(key) {
            Some(Var::Int(value)) => *value,
            Some(Var::Float(value)) => *value as i64,
            _ => {
                warn!("config variable {key} is not an int");
                0
            }
        }
    }

    pub fn get_float(&self, key: &str) -> f32 {
        match self.vars.get(key) {
            Some(Var::Float(value)) => *value,
            Some(Var::Int(value)) => *value as f32,
            _ => {
                warn!("config variable {key} is not a float");
                0.
            }
        }
    }

    pub fn get_str(&self, key: &str) -> &str {
        match self.vars.get(key) {
            Some(Var::Str(value)) => value,
            _ => {
                warn!("config variable {key} is not a string");
                ""
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Var> {
        self.vars.get(key)
    }

    /// Console-facing write. Keeps the type of the existing variable.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let var = match self.vars.get(key) {
            Some(Var::Int(_)) => Var::Int(
                value
                    .parse()
                    .map_err(|_| format!("{key} expects an int, got {value}"))?,
            ),
            Some(Var::Float(_)) => Var::Float(
                value
                    .parse()
                    .map_err(|_| format!("{key} expects a float, got {value}"))?,
            ),
            Some(Var::Str(_)) | None => Var::parse(value),
        };
        self.vars.insert(key.to_string(), var);
        Ok(())
    }

    pub fn list(&self, prefix: &str) -> String {
        let mut out = String::new();
        for (key, var) in &self.vars {
            if key.starts_with(prefix) {
                let _ = writeln!(out, "{key} = {var}");
            }
        }
        out
    }
}

impl Var {
    fn parse(text: &str) -> Var {
        if let Ok(int) = text.parse::<i64>() {
            Var::Int(int)
        } else if let Ok(float) = text.parse::<f32>() {
            Var::Float(float)
        } else {
            Var::Str(text.trim_matches('"').to_string())
        }
    }
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Var::Int(value) => write!(f, "{value}"),
            Var::Float(value) => write!(f, "{value}"),
            Var::Str(value) => write!(f, "{value}"),
        }
    }
}

const DEFAULT_VARS: &[(&str, Var)] = &[
    ("Camera.fovy", Var::Float(75.)),
    ("Camera.movement_speed", Var::Float(2.)),
    ("Camera.rotation_speed", Var::Float(0.01)),
    ("Camera.z_near", Var::Float(0.01)),
    ("Render.shadow_map_dim", Var::Int(1024)),
    ("Render.shadow_extent", Var::Float(10.)),
    ("Render.shadow_near", Var::Float(0.1)),
    ("Render.shadow_far", Var::Float(40.)),
    ("Render.depth_bias_constant", Var::Float(-1.)),
    ("Render.depth_bias_slope", Var::Float(-1.5)),
    ("Render.bg_fill_color_r", Var::Float(0.)),
    ("Render.bg_fill_color_g", Var::Float(0.)),
    ("Render.bg_fill_color_b", Var::Float(0.)),
    ("Render.debug_voxel_obb", Var::Int(0)),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_seeded() {
        let config = Config::new();
        assert_eq!(config.get_int("Render.shadow_map_dim"), 1024);
        assert_eq!(config.get_float("Camera.fovy"), 75.);
    }

    #[test]
    fn ini_sections_become_prefixes() {
        let mut config = Config::new();
        config.parse_ini("[Render]\nshadow_map_dim = 2048\n\n[Camera]\nfovy = 90.0\n");
        assert_eq!(config.get_int("Render.shadow_map_dim"), 2048);
        assert_eq!(config.get_float("Camera.fovy"), 90.);
    }

    #[test]
    fn comments_and_garbage_are_skipped() {
        let mut config = Config::new();
        config.parse_ini("# comment\n; other comment\nnot a pair\n");
        assert_eq!(config.get_int("Render.shadow_map_dim"), 1024);
    }

    #[test]
    fn set_keeps_the_variable_type() {
        let mut config = Config::new();
        config.set("Render.shadow_map_dim", "4096").unwrap();
        assert_eq!(config.get_int("Render.shadow_map_dim"), 4096);
        assert!(config.set("Render.shadow_map_dim", "big").is_err());
    }

    #[test]
    fn list_filters_by_prefix() {
        let config = Config::new();
        let listing = config.list("Camera.");
        assert!(listing.contains("Camera.fovy"));
        assert!(!listing.contains("Render."));
    }
}
