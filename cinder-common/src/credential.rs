//! Step-launch credentials (spec §4.5, §6). A credential is a
//! canonicalized byte sequence plus a signature over that sequence;
//! the signer is pluggable (a capability trait per the design notes'
//! "plugin-style backend selection" rule) with HMAC-SHA-256 as the
//! reference implementation.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, ErrorKind, Result};
use crate::ids::{JobId, NodeIndex, StepId};

type HmacSha256 = Hmac<Sha256>;

/// The fields a credential authorizes, before signing. Canonical byte
/// form is `jobId | stepId | uid | gid | sortedNodeList | deadline |
/// nonce`, pipe-separated, node list comma-separated and numerically
/// sorted ascending — sorting makes the canonical form independent of
/// allocation order so two controllers with the same inputs produce
/// byte-identical credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: u32,
    pub gid: u32,
    pub node_set: Vec<NodeIndex>,
    /// Unix timestamp seconds after which the credential is expired.
    pub deadline_unix: i64,
    pub nonce: u64,
}

impl CredentialPayload {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut nodes: Vec<u32> = self.node_set.iter().map(|n| n.get()).collect();
        nodes.sort_unstable();
        let node_list = nodes
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.job_id, self.step_id, self.uid, self.gid, node_list, self.deadline_unix, self.nonce
        )
        .into_bytes()
    }

    /// Stable identity for replay-rejection bookkeeping: two
    /// byte-identical credentials must hash the same so the agent can
    /// reject a re-delivery.
    pub fn identity(&self) -> String {
        hex::encode(self.canonical_bytes())
    }

    pub fn names_node(&self, node: NodeIndex) -> bool {
        self.node_set.contains(&node)
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.deadline_unix
    }
}

/// A signed credential as carried on the wire: payload plus signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub payload: CredentialPayload,
    pub signature: Vec<u8>,
}

/// Pluggable signer capability (spec §6, §9: "HMAC vs alternate
/// credential signer" is a capability interface, not a dlopen plugin).
pub trait CredentialSigner: Send + Sync {
    fn sign(&self, payload: &CredentialPayload) -> Credential;
    fn verify(&self, credential: &Credential) -> Result<()>;
}

pub struct HmacSha256Signer {
    key: Vec<u8>,
}

impl HmacSha256Signer {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let key = hex::decode(hex_key)
            .map_err(|e| Error::with_source(ErrorKind::Validation, "invalid credential key hex", e))?;
        Ok(Self::new(key))
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length")
    }
}

impl CredentialSigner for HmacSha256Signer {
    fn sign(&self, payload: &CredentialPayload) -> Credential {
        let mut mac = self.mac();
        mac.update(&payload.canonical_bytes());
        let signature = mac.finalize().into_bytes().to_vec();
        Credential {
            payload: payload.clone(),
            signature,
        }
    }

    fn verify(&self, credential: &Credential) -> Result<()> {
        let mut mac = self.mac();
        mac.update(&credential.payload.canonical_bytes());
        mac.verify_slice(&credential.signature)
            .map_err(|_| Error::integrity("credential signature mismatch"))
    }
}
