//! Configuration Vault – reads/writes `~/.armsight/config.toml`.

use armsight_hal::camera::{CameraSettings, DEPTH_ALIGNMENT_UNIT};
use armsight_motion::MotionConfig;
use armsight_perception::DepthConfig;
use armsight_perception::frame_store::DEFAULT_CAPACITY;
use armsight_runtime::StackConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Requested stream resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_color_width")]
    pub color_width: u32,
    #[serde(default = "default_color_height")]
    pub color_height: u32,
    /// Rounded down to `alignment_unit` when the camera opens.
    #[serde(default = "default_depth_width")]
    pub depth_width: u32,
    #[serde(default = "default_depth_height")]
    pub depth_height: u32,
    #[serde(default = "default_alignment_unit")]
    pub alignment_unit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Annotated result images kept in memory; `0` keeps every image.
    #[serde(default = "default_store_capacity")]
    pub capacity: usize,
}

/// Persisted user configuration stored in `~/.armsight/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial port, speeds, and motion offsets.
    #[serde(default)]
    pub robot: MotionConfig,

    /// Depth clamp, sampling window, and frame retry policy.
    #[serde(default)]
    pub depth: DepthConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_color_width() -> u32 {
    640
}
fn default_color_height() -> u32 {
    400
}
fn default_depth_width() -> u32 {
    320
}
fn default_depth_height() -> u32 {
    200
}
fn default_alignment_unit() -> u32 {
    DEPTH_ALIGNMENT_UNIT
}
fn default_store_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            color_width: default_color_width(),
            color_height: default_color_height(),
            depth_width: default_depth_width(),
            depth_height: default_depth_height(),
            alignment_unit: default_alignment_unit(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_store_capacity(),
        }
    }
}

impl CameraConfig {
    pub fn settings(&self) -> CameraSettings {
        CameraSettings::new(
            (self.color_width, self.color_height),
            (self.depth_width, self.depth_height),
            self.alignment_unit,
        )
    }
}

impl Config {
    /// Everything the runtime needs to assemble a stack.
    pub fn stack(&self) -> StackConfig {
        StackConfig {
            camera: self.camera.settings(),
            depth: self.depth,
            motion: self.robot.clone(),
            store_capacity: self.store.capacity,
        }
    }
}

/// Return the path to `~/.armsight/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armsight").join("config.toml")
}

/// Load the config from disk with environment overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `ARMSIGHT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMSIGHT_ROBOT_PORT` | `robot.port` |
/// | `ARMSIGHT_GRIP_OFFSET_MM` | `robot.grip_offset_mm` |
/// | `ARMSIGHT_LIFT_OFFSET_MM` | `robot.lift_offset_mm` |
/// | `ARMSIGHT_STORE_CAPACITY` | `store.capacity` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ARMSIGHT_ROBOT_PORT")
        && !v.trim().is_empty()
    {
        cfg.robot.port = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("ARMSIGHT_GRIP_OFFSET_MM")
        && let Ok(mm) = v.trim().parse::<f32>()
        && mm.is_finite()
    {
        cfg.robot.grip_offset_mm = mm;
    }
    if let Ok(v) = std::env::var("ARMSIGHT_LIFT_OFFSET_MM")
        && let Ok(mm) = v.trim().parse::<f32>()
        && mm.is_finite()
    {
        cfg.robot.lift_offset_mm = mm;
    }
    if let Ok(v) = std::env::var("ARMSIGHT_STORE_CAPACITY")
        && let Ok(n) = v.trim().parse::<usize>()
    {
        cfg.store.capacity = n;
    }
}

/// Save the config to disk, creating `~/.armsight/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700, "config directory must be 0o700");
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot.port, "/dev/ttyACM0");
        assert_eq!(loaded.robot.grip_offset_mm, 10.0);
        assert_eq!(loaded.depth, DepthConfig::default());
        assert_eq!(loaded.camera.alignment_unit, 16);
        assert_eq!(loaded.store.capacity, 64);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, "[robot]\nsettle_ms = 500\n\n[camera]\ndepth_width = 330\n").expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.robot.settle_ms, 500);
        assert_eq!(cfg.robot.velocity, 50.0);
        assert_eq!(cfg.camera.color_width, 640);
        // 330 is not a multiple of 16.
        assert_eq!(cfg.camera.settings().depth_width, 320);
        assert_eq!(cfg.store.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[robot\nport = ").expect("write");
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn stack_carries_every_section() {
        let mut cfg = Config::default();
        cfg.robot.lift_offset_mm = 80.0;
        cfg.depth.roi_half_width = 3;
        cfg.store.capacity = 0;
        let stack = cfg.stack();
        assert_eq!(stack.motion.lift_offset_mm, 80.0);
        assert_eq!(stack.depth.roi_half_width, 3);
        assert_eq!(stack.store_capacity, 0);
        assert_eq!(stack.camera, CameraSettings::default());
    }

    #[test]
    fn config_path_points_to_armsight_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".armsight"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    // Each test below owns a distinct variable.

    #[test]
    fn apply_env_overrides_changes_port() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("ARMSIGHT_ROBOT_PORT", "/dev/ttyUSB0") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot.port, "/dev/ttyUSB0");
        unsafe { std::env::remove_var("ARMSIGHT_ROBOT_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_grip_offset() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("ARMSIGHT_GRIP_OFFSET_MM", "12.5") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot.grip_offset_mm, 12.5);
        unsafe { std::env::remove_var("ARMSIGHT_GRIP_OFFSET_MM") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_lift_offset() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("ARMSIGHT_LIFT_OFFSET_MM", "high") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot.lift_offset_mm, 50.0);
        unsafe { std::env::remove_var("ARMSIGHT_LIFT_OFFSET_MM") };
    }

    #[test]
    fn apply_env_overrides_changes_store_capacity() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("ARMSIGHT_STORE_CAPACITY", "0") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.store.capacity, 0);
        unsafe { std::env::remove_var("ARMSIGHT_STORE_CAPACITY") };
    }
}
