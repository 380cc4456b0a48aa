//! Control-plane commands carried over the pub/sub bus.

use serde::{Deserialize, Serialize};

use crate::{JobId, TenantId};

/// Topic names used on the control bus.
pub mod topics {
    pub const CREATE_WORKER: &str = "create-worker";
    pub const TERMINATE_JOB: &str = "terminate-job";
    pub const REMOVE_WORKER: &str = "remove-worker";

    /// Every topic a control channel subscribes to.
    pub const ALL: [&str; 3] = [CREATE_WORKER, TERMINATE_JOB, REMOVE_WORKER];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkerPayload {
    tenant_id: TenantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateJobPayload {
    tenant_id: TenantId,
    job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveWorkerPayload {
    tenant_id: TenantId,
    #[serde(default)]
    force: bool,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    CreateWorker {
        tenant_id: TenantId,
    },
    /// `job_id` is kept as sent; an id that does not parse can never match
    /// a running job.
    TerminateJob {
        tenant_id: TenantId,
        job_id: String,
    },
    RemoveWorker {
        tenant_id: TenantId,
        force: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown control topic: {0}")]
    UnknownTopic(String),

    #[error("malformed {topic} message: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ControlCommand {
    /// Build a terminate command for a known job.
    pub fn terminate(tenant_id: TenantId, job_id: JobId) -> Self {
        ControlCommand::TerminateJob {
            tenant_id,
            job_id: job_id.to_string(),
        }
    }

    /// Topic this command is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            ControlCommand::CreateWorker { .. } => topics::CREATE_WORKER,
            ControlCommand::TerminateJob { .. } => topics::TERMINATE_JOB,
            ControlCommand::RemoveWorker { .. } => topics::REMOVE_WORKER,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            ControlCommand::CreateWorker { tenant_id }
            | ControlCommand::TerminateJob { tenant_id, .. }
            | ControlCommand::RemoveWorker { tenant_id, .. } => tenant_id,
        }
    }

    /// Decode a payload received on `topic`.
    pub fn decode(topic: &str, payload: &str) -> Result<Self, ControlError> {
        let malformed = |source| ControlError::Malformed {
            topic: topic.to_string(),
            source,
        };

        match topic {
            topics::CREATE_WORKER => {
                let p: CreateWorkerPayload = serde_json::from_str(payload).map_err(malformed)?;
                Ok(ControlCommand::CreateWorker {
                    tenant_id: p.tenant_id,
                })
            }
            topics::TERMINATE_JOB => {
                let p: TerminateJobPayload = serde_json::from_str(payload).map_err(malformed)?;
                Ok(ControlCommand::TerminateJob {
                    tenant_id: p.tenant_id,
                    job_id: p.job_id,
                })
            }
            topics::REMOVE_WORKER => {
                let p: RemoveWorkerPayload = serde_json::from_str(payload).map_err(malformed)?;
                Ok(ControlCommand::RemoveWorker {
                    tenant_id: p.tenant_id,
                    force: p.force,
                })
            }
            other => Err(ControlError::UnknownTopic(other.to_string())),
        }
    }

    /// Encode the payload for publishing on [`ControlCommand::topic`].
    pub fn encode(&self) -> Result<String, ControlError> {
        let json = match self {
            ControlCommand::CreateWorker { tenant_id } => {
                serde_json::to_string(&CreateWorkerPayload {
                    tenant_id: tenant_id.clone(),
                })?
            }
            ControlCommand::TerminateJob { tenant_id, job_id } => {
                serde_json::to_string(&TerminateJobPayload {
                    tenant_id: tenant_id.clone(),
                    job_id: job_id.clone(),
                })?
            }
            ControlCommand::RemoveWorker { tenant_id, force } => {
                serde_json::to_string(&RemoveWorkerPayload {
                    tenant_id: tenant_id.clone(),
                    force: *force,
                })?
            }
        };
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camel_case_payloads() {
        let cmd = ControlCommand::decode(
            topics::TERMINATE_JOB,
            r#"{"tenantId":"t1","jobId":"doesnotexist"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ControlCommand::TerminateJob {
                tenant_id: TenantId::new("t1").unwrap(),
                job_id: "doesnotexist".to_string(),
            }
        );

        let remove =
            ControlCommand::decode(topics::REMOVE_WORKER, r#"{"tenantId":"t1"}"#).unwrap();
        assert_eq!(
            remove,
            ControlCommand::RemoveWorker {
                tenant_id: TenantId::new("t1").unwrap(),
                force: false,
            }
        );
    }

    #[test]
    fn rejects_schema_violations() {
        for payload in ["not json", r#"{"tenant":"t1"}"#, r#"{"tenantId":""}"#, "[]"] {
            let err = ControlCommand::decode(topics::CREATE_WORKER, payload).unwrap_err();
            assert!(matches!(err, ControlError::Malformed { .. }), "{payload}");
        }
        assert!(matches!(
            ControlCommand::decode("bogus", "{}"),
            Err(ControlError::UnknownTopic(_))
        ));
    }

    #[test]
    fn encode_matches_decode() {
        let cmd = ControlCommand::terminate(TenantId::new("t1").unwrap(), JobId::new());
        let payload = cmd.encode().unwrap();
        assert_eq!(ControlCommand::decode(cmd.topic(), &payload).unwrap(), cmd);
    }
}
