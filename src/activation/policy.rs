//! Activation policy: discover validation, mode selection, and credential
//! rules.
//!
//! Everything here is pure decision logic; the state machine in the parent
//! module drives it and owns all I/O.

use md5::compute as md5_compute;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{ActivationPolicy, TrustedCert};
use crate::error::ActivationError;

/// Wire code for client control mode in `modes` / `currentMode` fields.
pub const MODE_WIRE_CCM: u32 = 1;
/// Wire code for admin control mode in `modes` / `currentMode` fields.
pub const MODE_WIRE_ACM: u32 = 2;

/// Target activation mode. Discriminants are the device-record flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    Ccm = 2,
    Acm = 4,
}

impl ActivationMode {
    /// Flag bits stored on the device record.
    pub fn flag(self) -> u32 {
        self as u32
    }

    /// Code used in handshake `modes` / `currentMode` fields.
    pub fn wire_code(self) -> u32 {
        match self {
            Self::Ccm => MODE_WIRE_CCM,
            Self::Acm => MODE_WIRE_ACM,
        }
    }

    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            MODE_WIRE_CCM => Some(Self::Ccm),
            MODE_WIRE_ACM => Some(Self::Acm),
            _ => None,
        }
    }
}

/// Validated contents of a discover command.
#[derive(Debug, Clone)]
pub struct DiscoverInfo {
    pub uuid: String,
    pub realm: String,
    pub fqdn: String,
    /// Reported certificate hashes, lowercase hex.
    pub hashes: Vec<String>,
    /// Firmware version, `x.y.z`.
    pub ver: String,
    /// Supported activation modes, wire codes.
    pub modes: Vec<u32>,
    /// 0 = pre-provisioning, 1 = CCM, 2 = ACM.
    pub current_mode: u32,
    pub sku: Option<u64>,
    pub tag: Option<String>,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ActivationError {
    ActivationError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Validate a discover/activate command's fields.
///
/// Every rule failure is a structured error naming the offending field; the
/// caller terminates the connection on any of them.
pub fn validate_discover(msg: &Value) -> Result<DiscoverInfo, ActivationError> {
    if msg["version"].as_u64() != Some(1) {
        return Err(invalid("version", "version tag must be 1"));
    }

    let realm = msg["realm"]
        .as_str()
        .ok_or_else(|| invalid("realm", "must be a string"))?;
    if realm.len() < 16 || realm.len() > 256 {
        return Err(invalid("realm", "length must be 16-256"));
    }

    let uuid = msg["uuid"]
        .as_str()
        .ok_or_else(|| invalid("uuid", "must be a string"))?;
    if uuid.len() != 36 {
        return Err(invalid("uuid", "must be exactly 36 characters"));
    }

    let hashes = msg["hashes"]
        .as_array()
        .ok_or_else(|| invalid("hashes", "must be a collection"))?
        .iter()
        .map(|h| {
            h.as_str()
                .map(str::to_ascii_lowercase)
                .ok_or_else(|| invalid("hashes", "entries must be strings"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let fqdn = msg["fqdn"]
        .as_str()
        .ok_or_else(|| invalid("fqdn", "must be a string"))?;

    let ver = msg["ver"]
        .as_str()
        .ok_or_else(|| invalid("ver", "must be a string"))?;
    if ver.split('.').count() != 3 {
        return Err(invalid("ver", "must have exactly 3 dot-separated components"));
    }

    let modes_raw = msg["modes"]
        .as_array()
        .ok_or_else(|| invalid("modes", "must be a collection"))?;
    if modes_raw.is_empty() || modes_raw.len() > 2 {
        return Err(invalid("modes", "must contain 1 or 2 entries"));
    }
    let modes = modes_raw
        .iter()
        .map(|m| {
            m.as_u64()
                .map(|v| v as u32)
                .ok_or_else(|| invalid("modes", "entries must be integers"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let current_mode = msg["currentMode"]
        .as_u64()
        .ok_or_else(|| invalid("currentMode", "must be an integer"))?;
    if current_mode > 2 {
        return Err(invalid("currentMode", "must be 0, 1, or 2"));
    }

    Ok(DiscoverInfo {
        uuid: uuid.to_string(),
        realm: realm.to_string(),
        fqdn: fqdn.to_string(),
        hashes,
        ver: ver.to_string(),
        modes,
        current_mode: current_mode as u32,
        sku: msg["sku"].as_u64(),
        tag: msg["tag"].as_str().map(ToString::to_string),
    })
}

/// Outcome of mode selection for a device.
#[derive(Debug, Clone)]
pub struct ModeDecision {
    pub mode: ActivationMode,
    /// The allow-list entry that qualified the device for ACM.
    pub matched: Option<TrustedCert>,
    /// Informational message for the client when ACM was requested but the
    /// device fell back to CCM.
    pub downgrade_reason: Option<String>,
}

/// Pick the activation mode for a device under the group's policy.
///
/// ACM requires an allow-list entry whose common name equals the reported
/// FQDN (case-insensitive) and whose SHA-256 or SHA-1 fingerprint appears in
/// the reported hash list. A wildcard (`*`) common name is treated the same
/// as no match and falls back to CCM (see DESIGN.md).
pub fn decide_mode(
    policy: ActivationPolicy,
    allowlist: &[TrustedCert],
    info: &DiscoverInfo,
) -> ModeDecision {
    if policy == ActivationPolicy::Acm {
        let matched = allowlist.iter().find(|cert| {
            cert.common_name != "*"
                && cert.common_name.eq_ignore_ascii_case(&info.fqdn)
                && hash_listed(cert, &info.hashes)
        });
        if let Some(cert) = matched {
            return ModeDecision {
                mode: ActivationMode::Acm,
                matched: Some(cert.clone()),
                downgrade_reason: None,
            };
        }
        return ModeDecision {
            mode: ActivationMode::Ccm,
            matched: None,
            downgrade_reason: Some(
                "no trusted certificate matches this device; activating in client control mode"
                    .to_string(),
            ),
        };
    }
    ModeDecision {
        mode: ActivationMode::Ccm,
        matched: None,
        downgrade_reason: None,
    }
}

/// Whether the selected mode appears in the device's supported-modes list.
pub fn ensure_mode_allowed(mode: ActivationMode, modes: &[u32]) -> Result<(), ActivationError> {
    if modes.contains(&mode.wire_code()) {
        Ok(())
    } else {
        Err(ActivationError::ModeNotAllowed)
    }
}

fn hash_listed(cert: &TrustedCert, reported: &[String]) -> bool {
    let sha256 = cert.sha256.to_ascii_lowercase();
    let sha1 = cert.sha1.to_ascii_lowercase();
    reported.iter().any(|h| {
        (!sha256.is_empty() && *h == sha256) || (!sha1.is_empty() && *h == sha1)
    })
}

/// Hex SHA-256 fingerprint of a DER certificate, the form allow-list entries
/// and device hash reports carry.
pub fn sha256_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Administrative credential complexity rule: longer than 7 characters with
/// at least one digit, one lowercase, one uppercase, and one non-word
/// character.
pub fn check_password_requirements(password: &str) -> bool {
    password.len() > 7
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| !c.is_alphanumeric() && c != '_')
}

/// Generate a random administrative credential meeting the complexity rule.
pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%&*+-=?";
    let mut rng = rand::thread_rng();
    loop {
        let candidate: String = (0..12)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect();
        if check_password_requirements(&candidate) {
            return candidate;
        }
    }
}

/// HTTP-Digest-style response hash of `user:realm:password`, returned to CCM
/// clients as the provisioning credential.
pub fn digest_response(user: &str, realm: &str, password: &str) -> String {
    format!("{:x}", md5_compute(format!("{user}:{realm}:{password}")))
}
