// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("No peers available")]
    NoPeersAvailable,

    #[error("File already owned by another peer")]
    OwnershipConflict,

    #[error("Allocation would lead to unsafe state")]
    UnsafeState,

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Function '{0}' not found in program")]
    FunctionNotFound(String),

    #[error("'{0}' is not callable")]
    NotCallable(String),

    #[error("Task execution timeout")]
    Timeout,

    #[error("Task cancelled")]
    Cancelled,

    #[error("Exceeded ratelimit")]
    Ratelimited,

    #[error("File is owned by another peer, use GET_OWNED_FILE")]
    OwnedFileForbidden,

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Unable to parse int {0}")]
    InvalidInt(#[from] std::num::ParseIntError),

    #[error("Config error {0}")]
    Config(#[from] toml::de::Error),

    #[error("Stream shutdown watch channel error {0}")]
    ShutdownWatchError(#[from] tokio::sync::watch::error::SendError<bool>),
}

impl From<serde_json::Error> for WeftError {
    fn from(e: serde_json::Error) -> Self {
        WeftError::Codec(e.to_string())
    }
}

impl WeftError {
    /// Stable tag embedded in wire errors so clients can branch without
    /// parsing free-form text.
    pub fn tag(&self) -> &'static str {
        match *self {
            WeftError::Io(_) => "IO_ERROR",
            WeftError::Codec(_) => "CODEC_ERROR",
            WeftError::UnknownMessageType(_) => "UNKNOWN_MESSAGE_TYPE",
            WeftError::Validation(_) => "VALIDATION_ERROR",
            WeftError::NotFound(_) => "NOT_FOUND",
            WeftError::Unauthorized(_) => "UNAUTHORIZED",
            WeftError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            WeftError::NoPeersAvailable => "NO_PEERS_AVAILABLE",
            WeftError::OwnershipConflict => "OWNERSHIP_CONFLICT",
            WeftError::UnsafeState => "UNSAFE_STATE",
            WeftError::Execution(_) => "EXECUTION_ERROR",
            WeftError::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
            WeftError::NotCallable(_) => "NOT_CALLABLE",
            WeftError::Timeout => "TIMEOUT",
            WeftError::Cancelled => "CANCELLED",
            WeftError::Ratelimited => "RATELIMITED",
            WeftError::OwnedFileForbidden => "OWNED_FILE_FORBIDDEN",
            WeftError::InvalidAddress(_) => "VALIDATION_ERROR",
            WeftError::InvalidInt(_) => "VALIDATION_ERROR",
            WeftError::Config(_) => "CONFIG_ERROR",
            WeftError::ShutdownWatchError(_) => "IO_ERROR",
        }
    }

    /// Render the error the way it crosses the wire: `TAG: message`.
    pub fn wire_message(&self) -> String {
        format!("{}: {}", self.tag(), self)
    }

    /// Reconstruct a typed error from a wire `ERROR` frame, keying on the
    /// stable tag prefix.
    pub fn from_wire(message: &str) -> WeftError {
        let tag = message.split(':').next().unwrap_or("");
        let rest = message
            .splitn(2, ':')
            .nth(1)
            .map(str::trim)
            .unwrap_or(message)
            .to_string();

        match tag {
            "NO_PEERS_AVAILABLE" => WeftError::NoPeersAvailable,
            "OWNERSHIP_CONFLICT" => WeftError::OwnershipConflict,
            "UNSAFE_STATE" => WeftError::UnsafeState,
            "TIMEOUT" => WeftError::Timeout,
            "CANCELLED" => WeftError::Cancelled,
            "RATELIMITED" => WeftError::Ratelimited,
            "OWNED_FILE_FORBIDDEN" => WeftError::OwnedFileForbidden,
            "UNAUTHORIZED" => WeftError::Unauthorized(rest),
            "QUOTA_EXCEEDED" => WeftError::QuotaExceeded(rest),
            "NOT_FOUND" => WeftError::NotFound(rest),
            "VALIDATION_ERROR" => WeftError::Validation(rest),
            "UNKNOWN_MESSAGE_TYPE" => WeftError::UnknownMessageType(rest),
            "FUNCTION_NOT_FOUND" => WeftError::FunctionNotFound(rest),
            "NOT_CALLABLE" => WeftError::NotCallable(rest),
            "CODEC_ERROR" => WeftError::Codec(rest),
            _ => WeftError::Execution(message.to_string()),
        }
    }
}

pub type WeftResult<T> = std::result::Result<T, WeftError>;
