use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default config directory under `$XDG_CONFIG_HOME`.
const CONFIG_DIR: &str = "venc";
/// Default config file name.
const CONFIG_FILE: &str = "config.toml";

/// Resolve the default config file path.
///
/// Returns `$XDG_CONFIG_HOME/venc/config.toml` or
/// `~/.config/venc/config.toml`.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(CONFIG_DIR)
        .join(CONFIG_FILE)
}

/// Load the encoder configuration from a TOML file.
///
/// If `path` is `None`, reads from the default location. A missing file
/// yields the defaults.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if it names
/// settings no encoder session could be opened with.
pub fn load(path: Option<&Path>) -> Result<EncodeConfig> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(?path, "No encoder config, using defaults");
            return Ok(EncodeConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config: {}", path.display()));
        }
    };

    let config: EncodeConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config
        .nvenc
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;

    tracing::info!(
        ?path,
        prefer_hardware = config.prefer_hardware,
        encoder = %config.nvenc.encoder,
        "Encoder configuration loaded"
    );
    Ok(config)
}

/// Encoder selection configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// Initial state of the hardware/software selection flag.
    pub prefer_hardware: bool,

    /// `FFmpeg` NVENC session settings.
    pub nvenc: NvencConfig,
}

/// Settings applied when opening a hardware encoder session.
///
/// The tuning strings are passed verbatim to the encoder's private
/// options, so they must be values `h264_nvenc` understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvencConfig {
    /// `FFmpeg` encoder name to look up.
    pub encoder: String,

    /// H.264 profile.
    pub profile: String,

    /// Speed/quality preset (`p1` fastest .. `p7` best).
    pub preset: String,

    /// Rate control mode.
    pub rc: String,

    /// Disable encoder-side frame reordering delay.
    pub zerolatency: bool,

    /// Emit Annex B start codes with in-band SPS/PPS.
    pub annexb: bool,

    /// Bitrate in bits per second used when the codec settings carry none.
    pub default_bitrate: i64,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            prefer_hardware: false,
            nvenc: NvencConfig::default(),
        }
    }
}

impl NvencConfig {
    /// Reject settings that can never open a session.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.encoder.trim().is_empty() {
            bail!("nvenc.encoder must name an FFmpeg encoder");
        }
        if self.default_bitrate <= 0 {
            bail!("nvenc.default_bitrate must be positive, got {}", self.default_bitrate);
        }
        Ok(())
    }
}

impl Default for NvencConfig {
    fn default() -> Self {
        Self {
            encoder: "h264_nvenc".to_string(),
            profile: "high".to_string(),
            preset: "p4".to_string(),
            rc: "cbr_lowdelay_hq".to_string(),
            zerolatency: true,
            annexb: true,
            default_bitrate: 2_000_000,
        }
    }
}
