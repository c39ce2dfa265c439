//! Account credentials and region mapping

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geographic region of the account. Each maps to one vendor API cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Europe,
    Africa,
    Asia,
    NorthAmerica,
    Oceania,
    SouthAmerica,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Europe,
        Region::Africa,
        Region::Asia,
        Region::NorthAmerica,
        Region::Oceania,
        Region::SouthAmerica,
    ];

    /// Vendor region code
    pub fn code(self) -> &'static str {
        match self {
            Region::Europe | Region::Africa => "ieu",
            Region::Asia => "isgp",
            Region::NorthAmerica | Region::Oceania => "ius",
            Region::SouthAmerica => "isa",
        }
    }

    /// Base URL of the cloud API serving this region
    pub fn api_url(self) -> String {
        format!("https://api{}.ezvizlife.com", self.code())
    }

    pub fn name(self) -> &'static str {
        match self {
            Region::Europe => "Europe",
            Region::Africa => "Africa",
            Region::Asia => "Asia",
            Region::NorthAmerica => "NorthAmerica",
            Region::Oceania => "Oceania",
            Region::SouthAmerica => "SouthAmerica",
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Region::Europe
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_lowercase();

        Region::ALL
            .into_iter()
            .find(|r| r.name().to_lowercase() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown region '{}' (expected one of: {})",
                    s,
                    Region::ALL.map(|r| r.name()).join(", ")
                )
            })
    }
}

/// Account credentials plus the camera to stream
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    password: String,
    pub serial: String,
    #[serde(default)]
    pub region: Region,
}

impl Credentials {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        serial: impl Into<String>,
        region: Region,
    ) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            serial: serial.into(),
            region,
        }
    }

    /// Password as sent to the vendor: lowercase hex MD5
    pub fn password_digest(&self) -> String {
        format!("{:x}", Md5::digest(self.password.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .field("serial", &self.serial)
            .field("region", &self.region)
            .finish()
    }
}
