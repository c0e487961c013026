/// Validation utilities for customisation fields
use once_cell::sync::Lazy;
use regex::Regex;

static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("valid regex"));
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").expect("valid regex"));
static PASSWORD_HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$(1|5|6|y|2[aby])\$[./A-Za-z0-9$=]+$").expect("valid regex"));
static TIMEZONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_]+(/[A-Za-z0-9_+-]+)*$").expect("valid regex"));
static KEYBOARD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2,8}$").expect("valid regex"));

/// Validates if a string is a valid SSH public key in OpenSSH format
pub fn is_valid_ssh_public_key(key: &str) -> bool {
    let trimmed = key.trim();

    // Empty keys are considered valid (optional field)
    if trimmed.is_empty() {
        return true;
    }

    let valid_algorithms = [
        "ssh-rsa",
        "ssh-dss",
        "ssh-ed25519",
        "ecdsa-sha2-nistp256",
        "ecdsa-sha2-nistp384",
        "ecdsa-sha2-nistp521",
        "sk-ssh-ed25519@openssh.com",
        "sk-ecdsa-sha2-nistp256@openssh.com",
    ];

    // Algorithm, key data, optional comment
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() < 2 {
        return false;
    }

    if !valid_algorithms.contains(&parts[0]) {
        return false;
    }

    // The key data should be base64 encoded and reasonably long
    let key_data = parts[1];
    if key_data.len() < 50 {
        return false;
    }

    key_data
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Validates multiple SSH public keys (one per line or comma separated)
pub fn validate_ssh_keys(keys_input: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if keys_input.trim().is_empty() {
        return errors;
    }

    let keys: Vec<&str> = if keys_input.contains('\n') {
        keys_input.lines().collect()
    } else {
        keys_input.split(',').collect()
    };

    for (i, key) in keys.iter().enumerate() {
        let trimmed_key = key.trim();
        if !trimmed_key.is_empty() && !is_valid_ssh_public_key(trimmed_key) {
            errors.push(format!("SSH key {} is invalid", i + 1));
        }
    }

    errors
}

/// A single DNS label, as accepted for a device hostname.
pub fn is_valid_hostname(hostname: &str) -> bool {
    HOSTNAME_RE.is_match(hostname)
}

pub fn is_valid_username(username: &str) -> bool {
    USERNAME_RE.is_match(username) && username != "root"
}

/// A crypt(3) hash such as `$6$salt$hash` or `$y$...`.
pub fn is_valid_password_hash(hash: &str) -> bool {
    PASSWORD_HASH_RE.is_match(hash)
}

/// WPA passphrase: 8 to 63 printable ASCII characters, or a raw 64 digit hex PSK.
pub fn is_valid_wifi_psk(psk: &str) -> bool {
    let len = psk.len();
    if len == 64 {
        return psk.chars().all(|c| c.is_ascii_hexdigit());
    }
    (8..=63).contains(&len) && psk.chars().all(|c| (' '..='~').contains(&c))
}

pub fn is_valid_wifi_ssid(ssid: &str) -> bool {
    !ssid.is_empty() && ssid.len() <= 32
}

/// ISO 3166 alpha-2 code in upper case.
pub fn is_valid_country(code: &str) -> bool {
    code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase())
}

pub fn is_valid_timezone(tz: &str) -> bool {
    TIMEZONE_RE.is_match(tz)
}

pub fn is_valid_keyboard_layout(layout: &str) -> bool {
    KEYBOARD_RE.is_match(layout)
}
