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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

#[macro_export]
macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            Ord,
            PartialOrd,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s)
                    .map_err(|err| format!("Invalid {}: {err}", stringify!($name)))?;
                Ok(Self(uuid))
            }
        }
    };
}

#[macro_export]
macro_rules! newtype_string {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            Ord,
            PartialOrd,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

newtype_uuid!(TaskId);
newtype_uuid!(CorrelationId);

newtype_string!(VirtualKeyId);
newtype_string!(WorkerId);
newtype_string!(InstanceId);
newtype_string!(ProviderId);
newtype_string!(Region);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl WorkerId {
    /// A fresh identity for this process, stable for the process lifetime.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }
}

/// Kind of generation work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Transcription,
    Tts,
    Image,
    Video,
    Realtime,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Transcription => write!(f, "transcription"),
            TaskType::Tts => write!(f, "tts"),
            TaskType::Image => write!(f, "image"),
            TaskType::Video => write!(f, "video"),
            TaskType::Realtime => write!(f, "realtime"),
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcription" => Ok(TaskType::Transcription),
            "tts" => Ok(TaskType::Tts),
            "image" => Ok(TaskType::Image),
            "video" => Ok(TaskType::Video),
            "realtime" => Ok(TaskType::Realtime),
            other => Err(format!("Invalid task type: {other}")),
        }
    }
}

/// Task lifecycle state. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "Pending"),
            TaskState::Processing => write!(f, "Processing"),
            TaskState::Completed => write!(f, "Completed"),
            TaskState::Failed => write!(f, "Failed"),
            TaskState::Cancelled => write!(f, "Cancelled"),
            TaskState::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Priority class of a work item. Strict ordering across classes, FIFO within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Billable operation kinds, the axis provider rate cards are keyed on
/// together with provider id and model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOperation {
    Transcription,
    TextToSpeech,
    Realtime,
    ImageGeneration,
    VideoGeneration,
}

impl Display for ProviderOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProviderOperation::Transcription => write!(f, "transcription"),
            ProviderOperation::TextToSpeech => write!(f, "text_to_speech"),
            ProviderOperation::Realtime => write!(f, "realtime"),
            ProviderOperation::ImageGeneration => write!(f, "image_generation"),
            ProviderOperation::VideoGeneration => write!(f, "video_generation"),
        }
    }
}

impl From<TaskType> for ProviderOperation {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Transcription => ProviderOperation::Transcription,
            TaskType::Tts => ProviderOperation::TextToSpeech,
            TaskType::Image => ProviderOperation::ImageGeneration,
            TaskType::Video => ProviderOperation::VideoGeneration,
            TaskType::Realtime => ProviderOperation::Realtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::model::{TaskId, TaskState, TaskType};
    use std::str::FromStr;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::generate();
        let parsed = TaskId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn task_type_roundtrip() {
        for s in ["transcription", "tts", "image", "video", "realtime"] {
            assert_eq!(TaskType::from_str(s).unwrap().to_string(), s);
        }
        assert!(TaskType::from_str("audio").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
    }
}
