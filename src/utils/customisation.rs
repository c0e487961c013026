// OS customisation settings and their rendering into a boot partition payload.
//
// The pipeline only sees the rendered `CustomisationPayload`; everything here
// is front-end side.

use crate::models::{CustomisationPayload, PayloadFile};
use crate::utils::validation;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

pub const USER_DATA: &str = "user-data";
pub const NETWORK_CONFIG: &str = "network-config";
pub const SSH_MARKER: &str = "ssh";

const DEFAULT_GROUPS: &str =
    "users,adm,dialout,audio,netdev,video,plugdev,cdrom,games,input,gpio,spi,i2c,render,sudo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub name: String,
    /// crypt(3) hash; plain text passwords are never accepted.
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub authorized_keys: Vec<String>,
    pub password_authentication: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiSettings {
    pub ssid: String,
    /// `None` for an open network.
    pub psk: Option<String>,
    pub country: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialMode {
    Disabled,
    #[default]
    Default,
    ConsoleAndHardware,
    Hardware,
    Console,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    pub i2c: bool,
    pub spi: bool,
    pub onewire: bool,
    pub serial: SerialMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomisationSettings {
    pub hostname: Option<String>,
    pub user: Option<UserSettings>,
    pub ssh: Option<SshSettings>,
    pub wifi: Option<WifiSettings>,
    pub timezone: Option<String>,
    pub keyboard_layout: Option<String>,
    pub interfaces: InterfaceSettings,
}

/// Double-quoted YAML scalar. JSON string syntax is a subset of it.
fn quote(value: &str) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

impl CustomisationSettings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Human-readable problems with the settings, empty when they are usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(hostname) = &self.hostname {
            if !validation::is_valid_hostname(hostname) {
                errors.push(
                    "Hostname should contain only letters, numbers, and hyphens.".to_string(),
                );
            }
        }

        if let Some(user) = &self.user {
            if !validation::is_valid_username(&user.name) {
                errors.push(
                    "The username must be lowercase and contain only letters, numbers, underscores, and hyphens."
                        .to_string(),
                );
            }
            if let Some(hash) = &user.password_hash {
                if !validation::is_valid_password_hash(hash) {
                    errors.push("Password must be supplied as a crypt hash".to_string());
                }
            }
        }

        if let Some(ssh) = &self.ssh {
            errors.extend(validation::validate_ssh_keys(&ssh.authorized_keys.join("\n")));
            let has_password = self
                .user
                .as_ref()
                .is_some_and(|u| u.password_hash.is_some());
            if ssh.password_authentication && !has_password {
                errors.push("SSH password authentication requires a user password".to_string());
            }
            if !ssh.password_authentication && ssh.authorized_keys.is_empty() {
                errors.push("No SSH keys configured".to_string());
            }
            if self.user.is_none() {
                errors.push("SSH access requires a user account".to_string());
            }
        }

        if let Some(wifi) = &self.wifi {
            if !validation::is_valid_wifi_ssid(&wifi.ssid) {
                errors.push("SSID must be 1-32 bytes long".to_string());
            }
            if let Some(psk) = &wifi.psk {
                if psk.len() < 8 {
                    errors.push("Password is too short (min 8 characters)".to_string());
                } else if psk.len() > 64 || (psk.len() == 64 && !validation::is_valid_wifi_psk(psk)) {
                    errors.push("Password is too long (max 63 characters)".to_string());
                } else if !validation::is_valid_wifi_psk(psk) {
                    errors.push("Password contains unsupported characters".to_string());
                }
            }
            if !validation::is_valid_country(&wifi.country) {
                errors.push(format!("Invalid Wi-Fi country code: {}", wifi.country));
            }
        }

        if let Some(tz) = &self.timezone {
            if !validation::is_valid_timezone(tz) {
                errors.push(format!("Invalid time zone: {}", tz));
            }
        }
        if let Some(layout) = &self.keyboard_layout {
            if !validation::is_valid_keyboard_layout(layout) {
                errors.push(format!("Invalid keyboard layout: {}", layout));
            }
        }

        errors
    }

    /// Render the settings into files for the boot partition.
    pub fn render(&self) -> Result<CustomisationPayload> {
        let errors = self.validate();
        if !errors.is_empty() {
            bail!("Invalid customisation: {}", errors.join("; "));
        }

        let mut payload = CustomisationPayload::default();
        if let Some(user_data) = self.user_data()? {
            payload.files.push(PayloadFile {
                name: USER_DATA.to_string(),
                contents: user_data.into_bytes(),
            });
        }
        if let Some(network) = self.network_config()? {
            payload.files.push(PayloadFile {
                name: NETWORK_CONFIG.to_string(),
                contents: network.into_bytes(),
            });
        }
        if self.ssh.is_some() {
            payload.files.push(PayloadFile {
                name: SSH_MARKER.to_string(),
                contents: Vec::new(),
            });
        }
        payload.config_txt_append = self.config_txt();
        payload.cmdline_append = self.cmdline();
        Ok(payload)
    }

    fn user_data(&self) -> Result<Option<String>> {
        if self.hostname.is_none()
            && self.user.is_none()
            && self.ssh.is_none()
            && self.timezone.is_none()
            && self.keyboard_layout.is_none()
        {
            return Ok(None);
        }

        let mut out = String::from("#cloud-config\n");
        if let Some(hostname) = &self.hostname {
            writeln!(out, "hostname: {}", quote(hostname)?)?;
            out.push_str("manage_etc_hosts: true\n");
        }
        if let Some(tz) = &self.timezone {
            writeln!(out, "timezone: {}", quote(tz)?)?;
        }
        if let Some(layout) = &self.keyboard_layout {
            out.push_str("keyboard:\n  model: pc105\n");
            writeln!(out, "  layout: {}", quote(layout)?)?;
        }
        if let Some(user) = &self.user {
            out.push_str("users:\n");
            writeln!(out, "- name: {}", quote(&user.name)?)?;
            writeln!(out, "  groups: {}", DEFAULT_GROUPS)?;
            out.push_str("  shell: /bin/bash\n");
            match &user.password_hash {
                Some(hash) => {
                    out.push_str("  lock_passwd: false\n");
                    writeln!(out, "  passwd: {}", quote(hash)?)?;
                }
                None => out.push_str("  lock_passwd: true\n"),
            }
            if let Some(ssh) = &self.ssh {
                if !ssh.authorized_keys.is_empty() {
                    out.push_str("  ssh_authorized_keys:\n");
                    for key in &ssh.authorized_keys {
                        writeln!(out, "    - {}", quote(key.trim())?)?;
                    }
                }
            }
            out.push_str("  sudo: ALL=(ALL) NOPASSWD:ALL\n");
        }
        if let Some(ssh) = &self.ssh {
            out.push_str("enable_ssh: true\n");
            writeln!(out, "ssh_pwauth: {}", ssh.password_authentication)?;
        }
        Ok(Some(out))
    }

    fn network_config(&self) -> Result<Option<String>> {
        let Some(wifi) = &self.wifi else {
            return Ok(None);
        };

        let mut out = String::from("network:\n  version: 2\n  wifis:\n    renderer: NetworkManager\n    wlan0:\n");
        out.push_str("      dhcp4: true\n");
        writeln!(out, "      regulatory-domain: {}", quote(&wifi.country)?)?;
        out.push_str("      access-points:\n");
        writeln!(out, "        {}:", quote(&wifi.ssid)?)?;
        match &wifi.psk {
            Some(psk) => writeln!(out, "          password: {}", quote(psk)?)?,
            None => out.push_str("          auth:\n            key-management: none\n"),
        }
        if wifi.hidden {
            out.push_str("          hidden: true\n");
        }
        out.push_str("      optional: true\n");
        Ok(Some(out))
    }

    fn config_txt(&self) -> Option<String> {
        let i = &self.interfaces;
        let mut lines = Vec::new();
        if i.i2c {
            lines.push("dtparam=i2c_arm=on");
        }
        if i.spi {
            lines.push("dtparam=spi=on");
        }
        if i.onewire {
            lines.push("dtoverlay=w1-gpio");
        }
        match i.serial {
            SerialMode::Hardware | SerialMode::ConsoleAndHardware => lines.push("enable_uart=1"),
            SerialMode::Disabled => lines.push("enable_uart=0"),
            SerialMode::Default | SerialMode::Console => {}
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn cmdline(&self) -> Option<String> {
        let mut params = Vec::new();
        if matches!(
            self.interfaces.serial,
            SerialMode::Console | SerialMode::ConsoleAndHardware
        ) {
            params.push("console=serial0,115200".to_string());
        }
        if let Some(wifi) = &self.wifi {
            params.push(format!("cfg80211.ieee80211_regdom={}", wifi.country));
        }
        if params.is_empty() {
            None
        } else {
            Some(params.join(" "))
        }
    }
}
