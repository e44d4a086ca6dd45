//! Control-plane mutations replicated through the mutation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::client::Client;
use super::signing_key::StoredKeySet;
use super::tenant::{Scope, Tenant, TenantSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    UpsertTenant,
    DeleteTenant,
    UpsertClient,
    DeleteClient,
    UpsertScope,
    DeleteScope,
    UpdateTenantSettings,
    RotateTenantKey,
}

/// `payload` is the JSON encoding of the matching [`MutationPayload`] body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "type")]
    pub kind: MutationKind,
    /// Empty for deployment-wide mutations such as the global key.
    pub tenant_slug: String,
    pub ts_unix: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteClientPayload {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteScopePayload {
    pub name: String,
}

/// Carries the exact key material; followers install it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateKeyPayload {
    pub keys: StoredKeySet,
}

/// Decoded mutation body.
#[derive(Debug, Clone)]
pub enum MutationPayload {
    UpsertTenant(Tenant),
    DeleteTenant,
    UpsertClient(Client),
    DeleteClient(DeleteClientPayload),
    UpsertScope(Scope),
    DeleteScope(DeleteScopePayload),
    UpdateTenantSettings(TenantSettings),
    RotateTenantKey(RotateKeyPayload),
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::UpsertTenant(_) => MutationKind::UpsertTenant,
            MutationPayload::DeleteTenant => MutationKind::DeleteTenant,
            MutationPayload::UpsertClient(_) => MutationKind::UpsertClient,
            MutationPayload::DeleteClient(_) => MutationKind::DeleteClient,
            MutationPayload::UpsertScope(_) => MutationKind::UpsertScope,
            MutationPayload::DeleteScope(_) => MutationKind::DeleteScope,
            MutationPayload::UpdateTenantSettings(_) => MutationKind::UpdateTenantSettings,
            MutationPayload::RotateTenantKey(_) => MutationKind::RotateTenantKey,
        }
    }
}

impl Mutation {
    pub fn new(
        tenant_slug: &str,
        payload: &MutationPayload,
        at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let bytes = match payload {
            MutationPayload::UpsertTenant(t) => serde_json::to_vec(t)?,
            MutationPayload::DeleteTenant => b"{}".to_vec(),
            MutationPayload::UpsertClient(c) => serde_json::to_vec(c)?,
            MutationPayload::DeleteClient(p) => serde_json::to_vec(p)?,
            MutationPayload::UpsertScope(s) => serde_json::to_vec(s)?,
            MutationPayload::DeleteScope(p) => serde_json::to_vec(p)?,
            MutationPayload::UpdateTenantSettings(s) => serde_json::to_vec(s)?,
            MutationPayload::RotateTenantKey(p) => serde_json::to_vec(p)?,
        };
        Ok(Self {
            kind: payload.kind(),
            tenant_slug: tenant_slug.to_string(),
            ts_unix: at.timestamp(),
            payload: bytes,
        })
    }

    pub fn decode(&self) -> Result<MutationPayload, serde_json::Error> {
        let p = &self.payload;
        Ok(match self.kind {
            MutationKind::UpsertTenant => MutationPayload::UpsertTenant(serde_json::from_slice(p)?),
            MutationKind::DeleteTenant => MutationPayload::DeleteTenant,
            MutationKind::UpsertClient => MutationPayload::UpsertClient(serde_json::from_slice(p)?),
            MutationKind::DeleteClient => MutationPayload::DeleteClient(serde_json::from_slice(p)?),
            MutationKind::UpsertScope => MutationPayload::UpsertScope(serde_json::from_slice(p)?),
            MutationKind::DeleteScope => MutationPayload::DeleteScope(serde_json::from_slice(p)?),
            MutationKind::UpdateTenantSettings => {
                MutationPayload::UpdateTenantSettings(serde_json::from_slice(p)?)
            }
            MutationKind::RotateTenantKey => {
                MutationPayload::RotateTenantKey(serde_json::from_slice(p)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&MutationKind::RotateTenantKey).unwrap();
        assert_eq!(json, "\"rotate_tenant_key\"");
    }

    #[test]
    fn decode_restores_scope_payload() {
        let scope = Scope {
            name: "email".into(),
            description: "Email address".into(),
            system: true,
        };
        let m = Mutation::new("acme", &MutationPayload::UpsertScope(scope.clone()), Utc::now())
            .unwrap();
        match m.decode().unwrap() {
            MutationPayload::UpsertScope(decoded) => assert_eq!(decoded, scope),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
