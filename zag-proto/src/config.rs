//! Typed persistent configuration, spec.md §6. A thin wrapper around the
//! `ini` crate — the closest ecosystem analogue to Python's `configparser`,
//! which `coordinator.py`/`device.py` use directly. Each role owns its
//! config struct; there is no shared global config (spec.md §9 "Config as
//! owned state"). Persistence serialises to `<path>.tmp` then renames over
//! the original, atomic on POSIX, so a crash mid-write can never corrupt the
//! on-disk file (spec.md §7: "initial PAN-ID allocation must persist").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::error::ConfigError;

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn hex_to_long_addr(s: &str) -> Result<[u8; 8], ConfigError> {
    let trimmed = s.trim();
    if trimmed.len() != 16 {
        return Err(ConfigError::BadLongAddr(s.to_string()));
    }
    let mut out = [0u8; 8];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&trimmed[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::BadLongAddr(s.to_string()))?;
    }
    Ok(out)
}

fn long_addr_to_hex(addr: &[u8; 8]) -> String {
    addr.iter().map(|b| format!("{b:02X}")).collect()
}

/// `coordinator.ini`: a `[coordinator]` section plus a `[devices]` map of
/// assigned short address -> long address, spec.md §6.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    path: PathBuf,
    pub channel: u8,
    pub panid: u16,
    pub services: Vec<u16>,
    pub ssid: String,
    /// Persisted on a successful address allocation only, spec.md §3.
    pub devices: BTreeMap<u16, [u8; 8]>,
}

impl CoordinatorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let ini = if path.exists() { Ini::load_from_file(&path)? } else { Ini::new() };
        let section = ini.section(Some("coordinator"));

        let channel = section.and_then(|s| s.get("channel")).and_then(parse_int).map(|v| v as u8).unwrap_or(11);
        let panid = section.and_then(|s| s.get("panid")).and_then(parse_int).map(|v| v as u16).unwrap_or(0xFFFF);
        let mut services: Vec<u16> = section
            .and_then(|s| s.get("services"))
            .map(|raw| raw.split(',').filter_map(|n| parse_int(n).map(|v| v as u16)).collect())
            .unwrap_or_else(|| vec![0]);
        services.sort_unstable();
        let ssid = section.and_then(|s| s.get("ssid")).unwrap_or("Sample").to_string();

        let mut devices = BTreeMap::new();
        if let Some(devices_section) = ini.section(Some("devices")) {
            for (short_addr, long_addr) in devices_section.iter() {
                let short_addr = match parse_int(short_addr) {
                    Some(v) => v as u16,
                    None => continue,
                };
                devices.insert(short_addr, hex_to_long_addr(long_addr)?);
            }
        }

        Ok(Self { path, channel, panid, services, ssid, devices })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        ini.with_section(Some("coordinator"))
            .set("channel", self.channel.to_string())
            .set("panid", format!("0x{:04X}", self.panid))
            .set("services", self.services.iter().map(u16::to_string).collect::<Vec<_>>().join(","))
            .set("ssid", &self.ssid);

        let mut devices_section = ini.with_section(Some("devices"));
        for (short_addr, long_addr) in &self.devices {
            devices_section.set(format!("0x{short_addr:04X}"), long_addr_to_hex(long_addr));
        }

        write_atomic(&self.path, &ini)
    }
}

/// `device.ini`'s `[device]` section, spec.md §6.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    path: PathBuf,
    pub channel: u8,
    pub panid: u16,
    pub coordinator: [u8; 8],
    pub service: i32,
    pub ssid: Option<String>,
    /// Only present once the device has associated, spec.md §6.
    pub short_addr: Option<u16>,
}

impl DeviceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let ini = if path.exists() { Ini::load_from_file(&path)? } else { Ini::new() };
        let section = ini.section(Some("device"));

        let channel = section.and_then(|s| s.get("channel")).and_then(parse_int).map(|v| v as u8).unwrap_or(11);
        let panid = section.and_then(|s| s.get("panid")).and_then(parse_int).map(|v| v as u16).unwrap_or(0xFFFF);
        let coordinator = match section.and_then(|s| s.get("coordinator")).filter(|s| !s.is_empty()) {
            Some(hex) => hex_to_long_addr(hex)?,
            None => [0u8; 8],
        };
        let service = section.and_then(|s| s.get("service")).and_then(parse_int).map(|v| v as i32).unwrap_or(-1);
        let ssid = section.and_then(|s| s.get("ssid")).map(|s| s.to_string());
        let short_addr = section.and_then(|s| s.get("short_addr")).and_then(parse_int).map(|v| v as u16);

        Ok(Self { path, channel, panid, coordinator, service, ssid, short_addr })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        {
            let mut section = ini.with_section(Some("device"));
            section
                .set("channel", self.channel.to_string())
                .set("panid", format!("0x{:04X}", self.panid))
                .set("coordinator", long_addr_to_hex(&self.coordinator))
                .set("service", self.service.to_string());
            if let Some(ssid) = &self.ssid {
                section.set("ssid", ssid);
            }
            if let Some(short_addr) = self.short_addr {
                section.set("short_addr", format!("0x{short_addr:04X}"));
            }
        }
        write_atomic(&self.path, &ini)
    }
}

fn write_atomic(path: &Path, ini: &Ini) -> Result<(), ConfigError> {
    let tmp_path = path.with_extension("tmp");
    ini.write_to_file(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
