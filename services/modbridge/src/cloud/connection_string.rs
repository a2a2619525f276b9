//! IoT Hub device connection string and SAS token generation

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use crate::error::{BridgeError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Parsed `HostName=...;DeviceId=...;SharedAccessKey=...`
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConnectionString {
    host_name: String,
    device_id: String,
    key: Vec<u8>,
}

// Never print the key
impl fmt::Debug for DeviceConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DeviceConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                BridgeError::Config(format!("Malformed connection string segment '{}'", part))
            })?;

            match name.trim() {
                n if n.eq_ignore_ascii_case("HostName") => host_name = Some(value.trim()),
                n if n.eq_ignore_ascii_case("DeviceId") => device_id = Some(value.trim()),
                n if n.eq_ignore_ascii_case("SharedAccessKey") => key = Some(value.trim()),
                n if n.eq_ignore_ascii_case("ModuleId") => {
                    return Err(BridgeError::Config(
                        "Module identities are not supported; use a device connection string"
                            .to_string(),
                    ))
                },
                // GatewayHostName and friends
                _ => {},
            }
        }

        let host_name = required(host_name, "HostName")?;
        let device_id = required(device_id, "DeviceId")?;
        let key = required(key, "SharedAccessKey")?;

        let key = general_purpose::STANDARD
            .decode(key)
            .map_err(|e| BridgeError::Config(format!("SharedAccessKey is not valid base64: {}", e)))?;

        Ok(Self {
            host_name: host_name.to_string(),
            device_id: device_id.to_string(),
            key,
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// `<host>/devices/<device>`
    pub fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.host_name, self.device_id)
    }

    /// Token valid for `ttl` from now
    pub fn sas_token(&self, ttl: Duration) -> Result<String> {
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| BridgeError::Config(format!("SAS token lifetime {:?} too large", ttl)))?;
        let expiry = chrono::Utc::now().timestamp() + ttl_secs;
        generate_sas_token(&self.resource_uri(), &self.key, expiry)
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(BridgeError::Config(format!(
            "Connection string is missing {}",
            name
        ))),
    }
}

fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// `SharedAccessSignature sr=..&sig=..&se=..` for `resource_uri`, expiring at `expiry` (unix seconds)
pub fn generate_sas_token(resource_uri: &str, key: &[u8], expiry: i64) -> Result<String> {
    let resource = url_encode(resource_uri);
    let to_sign = format!("{}\n{}", resource, expiry);

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| BridgeError::Config(format!("HMAC error: {}", e)))?;
    mac.update(to_sign.as_bytes());
    let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        resource,
        url_encode(&signature),
        expiry
    ))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const CONN: &str = "HostName=hub.azure-devices.net;DeviceId=collector;SharedAccessKey=c2VjcmV0";

    #[test]
    fn test_parse_valid() {
        let cs = DeviceConnectionString::parse(CONN).unwrap();
        assert_eq!(cs.host_name(), "hub.azure-devices.net");
        assert_eq!(cs.device_id(), "collector");
        assert_eq!(cs.resource_uri(), "hub.azure-devices.net/devices/collector");
    }

    #[test]
    fn test_parse_order_and_padding() {
        let cs = DeviceConnectionString::parse(
            "SharedAccessKey=YWJjZA==; DeviceId=dev-1 ;HostName=h.example;",
        )
        .unwrap();
        assert_eq!(cs.device_id(), "dev-1");
        assert_eq!(cs.key, b"abcd".to_vec());
    }

    #[test]
    fn test_parse_rejects() {
        assert!(DeviceConnectionString::parse("").is_err());
        assert!(DeviceConnectionString::parse("garbage").is_err());
        assert!(DeviceConnectionString::parse("HostName=h;DeviceId=d").is_err());
        assert!(DeviceConnectionString::parse("HostName=h;DeviceId=d;SharedAccessKey=!!").is_err());
        assert!(DeviceConnectionString::parse(&format!("{};ModuleId=m", CONN)).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let cs = DeviceConnectionString::parse(CONN).unwrap();
        let printed = format!("{:?}", cs);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("c2VjcmV0"));
    }

    #[test]
    fn test_sas_token_known_vector() {
        let token =
            generate_sas_token("hub.azure-devices.net/devices/collector", b"secret", 1_700_000_000)
                .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fcollector\
             &sig=EpnDFQeCQ69%2B5o2ivDDVZbcgkBm4KiyUTrLdRwBwJIw%3D&se=1700000000"
        );
    }

    #[test]
    fn test_sas_token_expiry_in_future() {
        let cs = DeviceConnectionString::parse(CONN).unwrap();
        let token = cs.sas_token(Duration::from_secs(3600)).unwrap();
        let se: i64 = token.rsplit("se=").next().unwrap().parse().unwrap();
        assert!(se > chrono::Utc::now().timestamp());
    }
}
