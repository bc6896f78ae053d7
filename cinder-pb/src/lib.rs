//! Generated protobuf/gRPC stubs: hand-written types never cross an
//! RPC boundary, only these generated messages and service traits do.

pub mod common {
    tonic::include_proto!("cinder.common");
}

pub mod controller {
    tonic::include_proto!("cinder.controller");
}

pub mod agent {
    tonic::include_proto!("cinder.agent");
}

impl From<cinder_common::credential::Credential> for common::Credential {
    fn from(c: cinder_common::credential::Credential) -> Self {
        common::Credential {
            job_id: c.payload.job_id.get(),
            step_id: c.payload.step_id.get(),
            uid: c.payload.uid,
            gid: c.payload.gid,
            node_set: c.payload.node_set.iter().map(|n| n.get()).collect(),
            deadline_unix: c.payload.deadline_unix,
            nonce: c.payload.nonce,
            signature: c.signature,
        }
    }
}

impl From<common::Credential> for cinder_common::credential::Credential {
    fn from(c: common::Credential) -> Self {
        cinder_common::credential::Credential {
            payload: cinder_common::credential::CredentialPayload {
                job_id: c.job_id.into(),
                step_id: c.step_id.into(),
                uid: c.uid,
                gid: c.gid,
                node_set: c.node_set.into_iter().map(Into::into).collect(),
                deadline_unix: c.deadline_unix,
                nonce: c.nonce,
            },
            signature: c.signature,
        }
    }
}

impl From<cinder_common::error::ErrorKind> for common::ErrorKind {
    fn from(k: cinder_common::error::ErrorKind) -> Self {
        use cinder_common::error::ErrorKind as K;
        match k {
            K::Validation => common::ErrorKind::Validation,
            K::Policy => common::ErrorKind::Policy,
            K::TransientResource => common::ErrorKind::TransientResource,
            K::Unavailable => common::ErrorKind::Unavailable,
            K::Integrity => common::ErrorKind::Integrity,
            K::Internal => common::ErrorKind::Internal,
        }
    }
}

impl From<&cinder_common::error::Error> for common::Status {
    fn from(e: &cinder_common::error::Error) -> Self {
        common::Status {
            kind: common::ErrorKind::from(e.kind) as i32,
            reason: e.reason.clone(),
        }
    }
}
