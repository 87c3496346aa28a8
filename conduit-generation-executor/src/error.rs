// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::services::providers::ProviderError;
use crate::services::virtual_key::VirtualKeyError;
use crate::storage::StorageError;

/// The central error taxonomy of the pipeline. Classification into
/// retryable/terminal happens here, in one place; the orchestrator never
/// inspects provider error details itself.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unauthorized: {0}")]
    Authorization(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Provider degraded: {0}")]
    ProviderDegraded(String),
    #[error("Fatal failure: {0}")]
    Fatal(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Timed out: {0}")]
    TimedOut(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GenerationError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GenerationError::Transient(_)
                | GenerationError::ProviderDegraded(_)
                | GenerationError::Internal(_)
        )
    }

    /// The error string exposed through polling responses and webhook bodies.
    /// Internal class names never leak; newlines are stripped so the value is
    /// safe in log lines and single-line JSON fields.
    pub fn to_public_string(&self) -> String {
        let message = match self {
            GenerationError::Validation(msg) => format!("Invalid request: {msg}"),
            GenerationError::Authorization(msg) => format!("Unauthorized: {msg}"),
            GenerationError::NotFound(msg) => format!("Not found: {msg}"),
            GenerationError::Transient(msg) => format!("Temporary failure: {msg}"),
            GenerationError::ProviderDegraded(msg) => format!("Provider unavailable: {msg}"),
            GenerationError::Fatal(msg) => msg.clone(),
            GenerationError::Cancelled => "Cancelled".to_string(),
            GenerationError::TimedOut(msg) => format!("Timed out: {msg}"),
            GenerationError::Internal(_) => "Internal error".to_string(),
        };
        message.replace(['\n', '\r'], " ")
    }
}

impl From<StorageError> for GenerationError {
    fn from(value: StorageError) -> Self {
        GenerationError::Transient(value.to_string())
    }
}

impl From<ProviderError> for GenerationError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Transient(msg) => GenerationError::Transient(msg),
            ProviderError::RateLimited(msg) => GenerationError::Transient(msg),
            ProviderError::Unavailable(msg) => GenerationError::ProviderDegraded(msg),
            ProviderError::ContentPolicy(msg) => GenerationError::Fatal(msg),
            ProviderError::Unretryable(msg) => GenerationError::Fatal(msg),
            ProviderError::Protocol(msg) => GenerationError::Fatal(msg),
        }
    }
}

impl From<VirtualKeyError> for GenerationError {
    fn from(value: VirtualKeyError) -> Self {
        match value {
            VirtualKeyError::Unauthorized(msg) => GenerationError::Authorization(msg),
            VirtualKeyError::InsufficientBalance(msg) => GenerationError::Authorization(msg),
            VirtualKeyError::Internal(msg) => GenerationError::Transient(msg),
        }
    }
}
