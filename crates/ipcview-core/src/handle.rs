//! Cross-process memory handle

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Size of a CUDA IPC memory handle in bytes
pub const IPC_HANDLE_SIZE: usize = 64;

/// Length of the hex encoding of a handle
pub const IPC_HANDLE_HEX_LEN: usize = IPC_HANDLE_SIZE * 2;

/// CUDA IPC memory handle (64 bytes)
///
/// Opaque token produced by the exporting process. The bytes are passed to the
/// driver unchanged; only the hex transport encoding is interpreted here.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct IpcMemHandle {
    pub reserved: [u8; IPC_HANDLE_SIZE],
}

impl IpcMemHandle {
    pub const fn from_bytes(reserved: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self { reserved }
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.reserved
    }

    /// Decode the 128-character hex transport form.
    ///
    /// Upper and lower case digits are accepted. Anything else, including
    /// surrounding whitespace, is rejected.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != IPC_HANDLE_HEX_LEN {
            return Err(Error::InvalidHandleFormat(format!(
                "expected {} hex characters, got {}",
                IPC_HANDLE_HEX_LEN,
                s.chars().count()
            )));
        }

        let mut reserved = [0u8; IPC_HANDLE_SIZE];
        hex::decode_to_slice(s, &mut reserved).map_err(|e| {
            Error::InvalidHandleFormat(match e {
                hex::FromHexError::InvalidHexCharacter { c, index } => {
                    format!("non-hex character {:?} at offset {}", c, index)
                }
                other => format!("invalid hex: {}", other),
            })
        })?;

        Ok(Self { reserved })
    }

    /// Lower-case hex transport form
    pub fn to_hex(&self) -> String {
        hex::encode(self.reserved)
    }
}

impl FromStr for IpcMemHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for IpcMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IpcMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // full handle is a capability; show a prefix only
        write!(f, "IpcMemHandle({}..)", &self.to_hex()[..16])
    }
}
