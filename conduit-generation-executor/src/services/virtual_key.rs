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

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use conduit_common::model::VirtualKeyId;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum VirtualKeyError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Quota/balance check against the billing account a virtual key identifies.
/// The external ledger owns balance mutation; this is a pre-flight gate only.
#[async_trait]
pub trait VirtualKeyService: Send + Sync {
    async fn authorize_spend(
        &self,
        virtual_key_id: &VirtualKeyId,
        estimated_cost: &BigDecimal,
    ) -> Result<(), VirtualKeyError>;
}

#[derive(Default)]
pub struct VirtualKeyServiceNoop {}

#[async_trait]
impl VirtualKeyService for VirtualKeyServiceNoop {
    async fn authorize_spend(
        &self,
        _virtual_key_id: &VirtualKeyId,
        _estimated_cost: &BigDecimal,
    ) -> Result<(), VirtualKeyError> {
        Ok(())
    }
}

/// Test implementation with explicit balances; unknown keys are rejected.
#[derive(Default)]
pub struct InMemoryVirtualKeyService {
    balances: Mutex<HashMap<VirtualKeyId, BigDecimal>>,
}

impl InMemoryVirtualKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, virtual_key_id: VirtualKeyId, balance: BigDecimal) {
        let mut balances = self.balances.lock().unwrap();
        balances.insert(virtual_key_id, balance);
    }
}

#[async_trait]
impl VirtualKeyService for InMemoryVirtualKeyService {
    async fn authorize_spend(
        &self,
        virtual_key_id: &VirtualKeyId,
        estimated_cost: &BigDecimal,
    ) -> Result<(), VirtualKeyError> {
        let balances = self.balances.lock().unwrap();
        match balances.get(virtual_key_id) {
            None => Err(VirtualKeyError::Unauthorized(format!(
                "unknown virtual key {virtual_key_id}"
            ))),
            Some(balance) if balance < estimated_cost => Err(
                VirtualKeyError::InsufficientBalance(format!(
                    "balance {balance} is below the estimated cost {estimated_cost}"
                )),
            ),
            Some(_) => Ok(()),
        }
    }
}
