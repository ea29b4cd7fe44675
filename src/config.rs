//! Configuration file loading: the three knobs this relay takes from the
//! outside world, plus the `used`-frames derivation the engine needs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Native Protocol-1 inter-packet period at 48 kHz, in milliseconds.
const NATIVE_PERIOD_MS: f64 = 2.625;
const MAX_DELAY_MS: u32 = 4000;
const MIN_USED_FRAMES: u16 = 8;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    hl2_interface: String,
    wifi_interface: String,
    buffer_milliseconds: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub hl2_interface: String,
    pub wifi_interface: String,
    pub buffer_milliseconds: u32,
    /// Target ring fill in frames. Zero selects pass-through mode.
    pub used: u16,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let delay = raw.buffer_milliseconds.min(MAX_DELAY_MS);
        let used = frames_for_delay(delay);
        Config {
            hl2_interface: raw.hl2_interface,
            wifi_interface: raw.wifi_interface,
            buffer_milliseconds: delay,
            used,
        }
    }
}

fn frames_for_delay(delay_ms: u32) -> u16 {
    if delay_ms == 0 {
        return 0;
    }
    let frames = (f64::from(delay_ms) / NATIVE_PERIOD_MS).round() as u16;
    frames.max(MIN_USED_FRAMES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay_selects_pass_through() {
        assert_eq!(frames_for_delay(0), 0);
    }

    #[test]
    fn small_delay_is_raised_to_minimum() {
        assert_eq!(frames_for_delay(1), MIN_USED_FRAMES);
    }

    #[test]
    fn delay_rounds_to_native_period() {
        // 50ms / 2.625ms ~= 19.05 -> rounds to 19
        assert_eq!(frames_for_delay(50), 19);
    }

    #[test]
    fn from_raw_clamps_to_max_delay() {
        let raw = RawConfig {
            hl2_interface: "eth0".into(),
            wifi_interface: "wlan0".into(),
            buffer_milliseconds: 10_000,
        };
        let cfg = Config::from_raw(raw);
        assert_eq!(cfg.buffer_milliseconds, MAX_DELAY_MS);
    }
}
