use std::fmt;
use std::time::Duration;
use base64::{engine::general_purpose, Engine};
use log::{debug, info, warn};
use thiserror::Error;
use crate::gateway::{OsType, ScriptPayload};

const WINDOWS_SCRIPT: &str = include_str!("../scripts/generalize.ps1");
const LINUX_SCRIPT: &str = include_str!("../scripts/generalize.sh");

/// Longest command line the Windows extension handler accepts.
const MAX_COMMAND_LINE: usize = 8191;

#[derive(Error, Debug)]
pub enum Error {
    #[error("script URI {0:?} has no file name")]
    NoFileName(String),

    #[error("pinned script hash must be 64 hex characters, got {0:?}")]
    InvalidHash(String),

    #[error("--script-sha256 needs --script-uri or script_uri in the configuration file")]
    PinWithoutUri,

    #[error("download {uri}: {source}")]
    Download {
        uri: String,
        source: reqwest::Error,
    },

    #[error("download {uri}: status {status}")]
    Status { uri: String, status: u16 },

    #[error("script {uri} has sha256 {actual}, expected {expected}")]
    HashMismatch {
        uri: String,
        expected: String,
        actual: String,
    },

    #[error("script {0} is not UTF-8 text")]
    NotText(String),

    #[error("script {uri} needs a {length} character command line, the limit is 8191")]
    TooLarge { uri: String, length: usize },

    #[error("script {file_name} cannot run on a {os} VM")]
    Unsuitable { file_name: String, os: &'static str },
}

/// The in-guest script that generalizes the temporary VM and shuts it down.
///
/// Whatever runs there has administrative rights inside the VM. A remote
/// script with a pinned SHA-256 is downloaded here, checked, and the checked
/// bytes are what the VM receives. An unpinned remote script is fetched by
/// the VM itself and trusted as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneralizationScript {
    /// Shipped with imgcap, one per OS.
    Bundled,
    Remote {
        uri: String,
        file_name: String,
        sha256: Option<String>,
    },
}

impl GeneralizationScript {
    pub fn new(uri: Option<&str>, sha256: Option<&str>) -> Result<Self, Error> {
        let sha256 = sha256
            .map(|hash| {
                let hash = hash.trim().to_ascii_lowercase();
                if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
                    Ok(hash)
                } else {
                    Err(Error::InvalidHash(hash))
                }
            })
            .transpose()?;

        let Some(uri) = uri else {
            return match sha256 {
                Some(_) => Err(Error::PinWithoutUri),
                None => Ok(Self::Bundled),
            };
        };

        let file_name = uri
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty() && !name.contains(':'))
            .ok_or_else(|| Error::NoFileName(uri.to_string()))?
            .to_string();

        Ok(Self::Remote {
            uri: uri.to_string(),
            file_name,
            sha256,
        })
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Remote { sha256: Some(_), .. })
    }

    /// Settle what the VM will run. A pinned script is downloaded and
    /// checked here; nothing else touches the network.
    pub async fn verify(&self) -> Result<VerifiedScript, Error> {
        let Self::Remote { uri, .. } = self else {
            info!("Using the bundled generalization script");
            return self.check(&[]);
        };
        if !self.is_pinned() {
            warn!("Generalization script {uri} is not pinned; it runs inside the VM unverified");
            return self.check(&[]);
        }

        debug!("Downloading {uri} to verify its hash");
        let download = |source| Error::Download {
            uri: uri.clone(),
            source,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(download)?;
        let resp = client.get(uri).send().await.map_err(download)?;
        if !resp.status().is_success() {
            return Err(Error::Status {
                uri: uri.clone(),
                status: resp.status().as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(download)?;
        self.check(&bytes)
    }

    /// Check downloaded `content` against the pinned hash. Content is only
    /// looked at for pinned scripts.
    pub fn check(&self, content: &[u8]) -> Result<VerifiedScript, Error> {
        let (uri, file_name, expected) = match self {
            Self::Bundled => return Ok(VerifiedScript::Bundled),
            Self::Remote {
                uri,
                file_name,
                sha256: None,
            } => {
                return Ok(VerifiedScript::Download {
                    uri: uri.clone(),
                    file_name: file_name.clone(),
                })
            }
            Self::Remote {
                uri,
                file_name,
                sha256: Some(expected),
            } => (uri, file_name, expected),
        };

        let actual = sha256::digest(content);
        if &actual != expected {
            return Err(Error::HashMismatch {
                uri: uri.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        debug!("Script {uri} matches pinned sha256 {expected}");

        let content = std::str::from_utf8(content).map_err(|_| Error::NotText(uri.clone()))?;
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        if is_powershell(file_name) {
            let length = encoded_command(content).len();
            if length > MAX_COMMAND_LINE {
                return Err(Error::TooLarge {
                    uri: uri.clone(),
                    length,
                });
            }
        }

        Ok(VerifiedScript::Pinned {
            uri: uri.clone(),
            file_name: file_name.clone(),
            content: content.to_string(),
        })
    }
}

/// A generalization script that passed [`GeneralizationScript::check`].
#[derive(Debug, Clone, PartialEq)]
pub enum VerifiedScript {
    Bundled,
    /// Fetched by the VM when the extension runs.
    Download { uri: String, file_name: String },
    /// Matched the pinned hash; `content` is sent to the VM inline.
    Pinned {
        uri: String,
        file_name: String,
        content: String,
    },
}

impl VerifiedScript {
    /// What the script extension runs on a VM with the given OS.
    /// A remote script must suit the OS: PowerShell for Windows, anything
    /// else for Linux.
    pub fn payload(&self, os_type: OsType) -> Result<ScriptPayload, Error> {
        match self {
            Self::Bundled => Ok(inline(
                os_type,
                match os_type {
                    OsType::Windows => WINDOWS_SCRIPT,
                    OsType::Linux => LINUX_SCRIPT,
                },
            )),
            Self::Download { uri, file_name } => {
                suits(file_name, os_type)?;
                Ok(ScriptPayload::Download {
                    file_uri: uri.clone(),
                    command: match os_type {
                        OsType::Windows => {
                            format!("powershell -ExecutionPolicy Unrestricted -File {file_name}")
                        }
                        OsType::Linux => format!("sh {file_name}"),
                    },
                })
            }
            Self::Pinned {
                file_name, content, ..
            } => {
                suits(file_name, os_type)?;
                Ok(inline(os_type, content))
            }
        }
    }
}

impl fmt::Display for VerifiedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bundled => write!(f, "the bundled generalization script"),
            Self::Download { uri, .. } => write!(f, "{uri}"),
            Self::Pinned { uri, .. } => write!(f, "{uri} (pinned)"),
        }
    }
}

fn is_powershell(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(".ps1")
}

fn suits(file_name: &str, os_type: OsType) -> Result<(), Error> {
    match (os_type, is_powershell(file_name)) {
        (OsType::Windows, true) | (OsType::Linux, false) => Ok(()),
        _ => Err(Error::Unsuitable {
            file_name: file_name.to_string(),
            os: os_type.as_str(),
        }),
    }
}

fn inline(os_type: OsType, script: &str) -> ScriptPayload {
    match os_type {
        OsType::Windows => ScriptPayload::Command(encoded_command(script)),
        OsType::Linux => ScriptPayload::Script(general_purpose::STANDARD.encode(script)),
    }
}

/// PowerShell's -EncodedCommand takes base64 of the UTF-16LE script text.
fn encoded_command(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!(
        "powershell -NoProfile -ExecutionPolicy Unrestricted -EncodedCommand {}",
        general_purpose::STANDARD.encode(utf16)
    )
}
