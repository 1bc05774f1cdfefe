//! Request/response envelopes exchanged with the enclave
//!
//! Every envelope carries a unique request identifier and exactly one
//! operation payload. Responses may also carry an endpoint identifier,
//! out-of-band metadata from the cloud relay that applies to the pairing
//! rather than to the request it happens to ride on.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request sent to the enclave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Uuid,
    pub unix_seconds: i64,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl Request {
    /// Build a request with a fresh identifier.
    pub fn new(body: RequestBody) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            unix_seconds: Utc::now().timestamp(),
            body,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self.body {
            RequestBody::Profile(_) => RequestKind::Profile,
            RequestBody::Sign(_) => RequestKind::Sign,
            RequestBody::List(_) => RequestKind::List,
        }
    }
}

/// Operation payload of a request. Serialized as a single keyed object
/// (`"profile"`, `"sign"` or `"list"`) next to the envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBody {
    Profile(ProfileRequest),
    Sign(SignRequest),
    List(ListRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Profile,
    Sign,
    List,
}

/// A response from the enclave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    /// Relay endpoint assigned to the enclave, piggybacked on any response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn kind(&self) -> RequestKind {
        match self.body {
            ResponseBody::Profile(_) => RequestKind::Profile,
            ResponseBody::Sign(_) => RequestKind::Sign,
            ResponseBody::List(_) => RequestKind::List,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Profile(ProfileResponse),
    Sign(SignResponse),
    List(ListResponse),
}

/// The identity the enclave signs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Ed25519 verifying key bytes.
    pub public_key: Vec<u8>,
    pub email: String,
}

impl Profile {
    /// SHA-256 fingerprint of the public key, used to address sign requests.
    pub fn fingerprint(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        Sha256::digest(&self.public_key).into()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub public_key_fingerprint: Vec<u8>,
    pub data: Vec<u8>,
    /// Human-readable context shown on the phone before approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub profiles: Vec<Profile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_has_single_payload_key() {
        let request = Request::new(RequestBody::List(ListRequest::default()));
        let value = serde_json::to_value(&request).unwrap();
        let object = value.as_object().unwrap();

        assert!(object.contains_key("request_id"));
        assert!(object.contains_key("list"));
        assert!(!object.contains_key("profile"));
        assert!(!object.contains_key("sign"));
        assert_eq!(request.kind(), RequestKind::List);
    }

    #[test]
    fn test_fresh_request_ids() {
        let a = Request::new(RequestBody::Profile(ProfileRequest::default()));
        let b = Request::new(RequestBody::Profile(ProfileRequest::default()));
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_response_without_endpoint() {
        let json = serde_json::json!({
            "request_id": Uuid::new_v4(),
            "sign": { "signature": [1, 2, 3] }
        });
        let response: Response = serde_json::from_value(json).unwrap();
        assert!(response.endpoint_id.is_none());
        assert_eq!(response.kind(), RequestKind::Sign);
        match response.body {
            ResponseBody::Sign(sign) => assert_eq!(sign.signature, Some(vec![1, 2, 3])),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_response_endpoint_is_parsed() {
        let json = serde_json::json!({
            "request_id": Uuid::new_v4(),
            "endpoint_id": "arn:relay:endpoint/abc",
            "list": { "profiles": [] }
        });
        let response: Response = serde_json::from_value(json).unwrap();
        assert_eq!(response.endpoint_id.as_deref(), Some("arn:relay:endpoint/abc"));
    }

    #[test]
    fn test_response_without_payload_is_rejected() {
        let json = serde_json::json!({ "request_id": Uuid::new_v4() });
        assert!(serde_json::from_value::<Response>(json).is_err());
    }

    #[test]
    fn test_profile_fingerprint_deterministic() {
        let profile = Profile {
            public_key: vec![7u8; 32],
            email: "me@example.com".into(),
        };
        assert_eq!(profile.fingerprint(), profile.clone().fingerprint());
        let other = Profile {
            public_key: vec![8u8; 32],
            email: "me@example.com".into(),
        };
        assert_ne!(profile.fingerprint(), other.fingerprint());
    }
}
