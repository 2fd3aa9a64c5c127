use std::path::{Path, PathBuf};

use crate::color::Color;
use crate::error::Result;
use crate::log_warn;

pub const MIN_HISTORY: usize = 25;
pub const MAX_HISTORY: usize = 1000;
const DEFAULT_HISTORY: usize = 250;
const MAX_BRUSH_SIZE: u32 = 1000;

/// User-tunable engine settings, persisted as `key=value` lines.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Undo depth, clamped to `[MIN_HISTORY, MAX_HISTORY]`.
    pub history_capacity: usize,
    /// Show the brush footprint on the preview layer while hovering.
    pub live_preview: bool,
    /// 0 disables autosave.
    pub autosave_minutes: u32,
    pub animation_fps: f32,
    pub default_brush_size: u32,
    pub primary_color: Color,
    pub secondary_color: Color,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY,
            live_preview: true,
            autosave_minutes: 0,
            animation_fps: 12.0,
            default_brush_size: 1,
            primary_color: Color::BLACK,
            secondary_color: Color::WHITE,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/paintcore/paintcore_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\PaintCore\paintcore_settings.cfg
    /// On macOS:   ~/Library/Application Support/PaintCore/paintcore_settings.cfg
    pub fn settings_path() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            if let Ok(appdata) = std::env::var("APPDATA") {
                return PathBuf::from(appdata).join("PaintCore").join("paintcore_settings.cfg");
            }
        }
        #[cfg(target_os = "macos")]
        {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("PaintCore")
                    .join("paintcore_settings.cfg");
            }
        }
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".config")
            });
        config_dir.join("paintcore").join("paintcore_settings.cfg")
    }

    /// Parse settings text.  Unknown keys and unparsable values fall back
    /// to the defaults; bounded values are clamped.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "history_capacity" | "max_undo_steps" => {
                    s.history_capacity = val.parse().unwrap_or(DEFAULT_HISTORY);
                }
                "live_preview" => {
                    s.live_preview = val == "true";
                }
                "autosave_minutes" => {
                    s.autosave_minutes = val.parse().unwrap_or(0);
                }
                "animation_fps" => {
                    s.animation_fps = val.parse().unwrap_or(12.0);
                }
                "default_brush_size" => {
                    s.default_brush_size = val.parse().unwrap_or(1);
                }
                "primary_color" => {
                    s.primary_color = Color::from_hex(val).unwrap_or(Color::BLACK);
                }
                "secondary_color" => {
                    s.secondary_color = Color::from_hex(val).unwrap_or(Color::WHITE);
                }
                _ => {}
            }
        }
        s.clamped()
    }

    /// Bring every bounded value back into range.
    pub fn clamped(mut self) -> Self {
        self.history_capacity = self.history_capacity.clamp(MIN_HISTORY, MAX_HISTORY);
        self.animation_fps = if self.animation_fps.is_finite() {
            self.animation_fps.clamp(1.0, 60.0)
        } else {
            12.0
        };
        self.default_brush_size = self.default_brush_size.clamp(1, MAX_BRUSH_SIZE);
        self
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "history_capacity={}\n\
             live_preview={}\n\
             autosave_minutes={}\n\
             animation_fps={}\n\
             default_brush_size={}\n\
             primary_color={}\n\
             secondary_color={}\n",
            self.history_capacity,
            self.live_preview,
            self.autosave_minutes,
            self.animation_fps,
            self.default_brush_size,
            self.primary_color.to_hex(),
            self.secondary_color.to_hex(),
        )
    }

    /// Load from the default location (defaults if missing or unreadable).
    pub fn load() -> Self {
        Self::load_from(&Self::settings_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Save to the default location, logging failures.
    pub fn save(&self) {
        let path = Self::settings_path();
        if let Err(e) = self.save_to(&path) {
            log_warn!("Could not save settings to {}: {}", path.display(), e);
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_capacity_is_clamped() {
        assert_eq!(EngineSettings::parse("history_capacity=3").history_capacity, MIN_HISTORY);
        assert_eq!(EngineSettings::parse("history_capacity=99999").history_capacity, MAX_HISTORY);
        assert_eq!(EngineSettings::parse("history_capacity=abc").history_capacity, 250);
        assert_eq!(EngineSettings::parse("").history_capacity, 250);
    }

    #[test]
    fn parses_known_keys_and_ignores_junk() {
        let s = EngineSettings::parse(
            "# comment\nlive_preview=false\nautosave_minutes = 5\nnonsense\nwhatever=1\nprimary_color=#FF0000\n",
        );
        assert!(!s.live_preview);
        assert_eq!(s.autosave_minutes, 5);
        assert_eq!(s.primary_color, Color::RED);
        assert_eq!(s.secondary_color, Color::WHITE);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("paintcore_settings.cfg");
        let s = EngineSettings {
            history_capacity: 40,
            animation_fps: 24.0,
            secondary_color: Color::BLUE,
            ..EngineSettings::default()
        };
        s.save_to(&path).unwrap();
        assert_eq!(EngineSettings::load_from(&path), s);
        assert_eq!(EngineSettings::load_from(&dir.path().join("missing.cfg")), EngineSettings::default());
    }
}
