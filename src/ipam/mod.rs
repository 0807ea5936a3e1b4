//! Client for the external IP allocation service.
//!
//! The service owns every lease; this plugin only asks for an address on
//! ADD and hands it back on DEL. Calls are blocking from the caller's point
//! of view and are never retried here.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IpamConf;
use crate::error::AllocationError;

/// Address handed out by the allocator for one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    /// Hardware address of the ENI the address lives on
    pub mac: Option<String>,
}

/// Identity of the pod an address is requested for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub host: String,
    pub host_gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub host: String,
}

impl AllocateRequest {
    pub fn new(pod: &PodIdentity, container_id: &str, host: Ipv4Addr, host_gateway: Ipv4Addr) -> Self {
        Self {
            pod_name: pod.name.clone(),
            pod_namespace: pod.namespace.clone(),
            container_id: container_id.to_string(),
            host: host.to_string(),
            host_gateway: host_gateway.to_string(),
        }
    }
}

impl ReleaseRequest {
    pub fn new(pod: &PodIdentity, container_id: &str, host: Ipv4Addr) -> Self {
        Self {
            pod_name: pod.name.clone(),
            pod_namespace: pod.namespace.clone(),
            container_id: container_id.to_string(),
            host: host.to_string(),
        }
    }
}

/// Envelope every allocator response is wrapped in
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub result: Option<bool>,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<LeaseData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseData {
    pub ip_addr: String,
    pub mask: u8,
    pub gateway: String,
    #[serde(default)]
    pub mac_addr: Option<String>,
}

impl AllocatorResponse {
    /// Fail on a non-zero code or an explicit `result: false`
    pub fn check(self) -> Result<Self, AllocationError> {
        if self.code != 0 || self.result == Some(false) {
            return Err(AllocationError::Refused {
                code: self.code,
                request_id: self.request_id,
                message: self.message.unwrap_or_default(),
            });
        }
        Ok(self)
    }

    pub fn into_lease(self) -> Result<Lease, AllocationError> {
        let data = self
            .check()?
            .data
            .ok_or_else(|| AllocationError::InvalidLease("response has no data".to_string()))?;
        data.into_lease()
    }
}

impl LeaseData {
    pub fn into_lease(self) -> Result<Lease, AllocationError> {
        let address = self
            .ip_addr
            .parse()
            .map_err(|_| AllocationError::InvalidLease(format!("ipAddr {:?}", self.ip_addr)))?;
        let gateway = self
            .gateway
            .parse()
            .map_err(|_| AllocationError::InvalidLease(format!("gateway {:?}", self.gateway)))?;
        if self.mask > 32 {
            return Err(AllocationError::InvalidLease(format!("mask {}", self.mask)));
        }
        let mac = self.mac_addr.filter(|m| !m.is_empty());

        Ok(Lease {
            address,
            prefix_len: self.mask,
            gateway,
            mac,
        })
    }
}

/// Something that hands out and takes back pod addresses
pub trait Allocator {
    fn allocate(&self, request: &AllocateRequest) -> Result<Lease, AllocationError>;

    fn release(&self, request: &ReleaseRequest) -> Result<(), AllocationError>;
}

/// HTTP client for the allocation service
pub struct AllocatorClient {
    client: reqwest::Client,
    url: String,
    runtime: Runtime,
}

impl AllocatorClient {
    /// Create a new allocator client
    pub fn new(conf: &IpamConf) -> Result<Self, AllocationError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AllocationError::Client(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_seconds))
            .build()
            .map_err(|e| AllocationError::Client(e.to_string()))?;

        let url = format!(
            "{}/{}",
            conf.endpoint.trim_end_matches('/'),
            conf.allocator_path.trim_start_matches('/')
        );

        Ok(Self {
            client,
            url,
            runtime,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn call<B: Serialize>(
        &self,
        method: reqwest::Method,
        body: &B,
    ) -> Result<AllocatorResponse, AllocationError> {
        let request_id = Uuid::new_v4().to_string();
        debug!(method = %method, url = %self.url, request_id = %request_id, "Calling allocator");

        self.runtime.block_on(async {
            let response = self
                .client
                .request(method, &self.url)
                .header("X-Request-ID", &request_id)
                .json(body)
                .send()
                .await
                .map_err(|source| AllocationError::Transport {
                    url: self.url.clone(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, body = %body, "Allocator returned an error status");
                return Err(AllocationError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|source| AllocationError::Transport {
                    url: self.url.clone(),
                    source,
                })?;
            serde_json::from_slice(&bytes).map_err(|e| AllocationError::Decode(e.to_string()))
        })
    }
}

impl Allocator for AllocatorClient {
    fn allocate(&self, request: &AllocateRequest) -> Result<Lease, AllocationError> {
        let response = self.call(reqwest::Method::POST, request)?;
        let request_id = response.request_id.clone();
        let lease = response.into_lease()?;
        info!(
            request_id = %request_id,
            pod = %request.pod_name,
            namespace = %request.pod_namespace,
            address = %lease.address,
            gateway = %lease.gateway,
            mac = ?lease.mac,
            "Allocated address"
        );
        Ok(lease)
    }

    fn release(&self, request: &ReleaseRequest) -> Result<(), AllocationError> {
        let response = self.call(reqwest::Method::DELETE, request)?.check()?;
        info!(
            request_id = %response.request_id,
            pod = %request.pod_name,
            namespace = %request.pod_namespace,
            "Released address"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    /// Allocator answering from a fixed lease and recording requests
    pub struct FakeAllocator {
        pub lease: Result<Lease, String>,
        pub release_error: Option<String>,
        pub allocations: RefCell<Vec<AllocateRequest>>,
        pub releases: RefCell<Vec<ReleaseRequest>>,
    }

    impl FakeAllocator {
        pub fn new(lease: Lease) -> Self {
            Self {
                lease: Ok(lease),
                release_error: None,
                allocations: RefCell::new(Vec::new()),
                releases: RefCell::new(Vec::new()),
            }
        }

        pub fn refusing(message: &str) -> Self {
            Self {
                lease: Err(message.to_string()),
                ..Self::new(Lease {
                    address: Ipv4Addr::UNSPECIFIED,
                    prefix_len: 0,
                    gateway: Ipv4Addr::UNSPECIFIED,
                    mac: None,
                })
            }
        }
    }

    impl Allocator for FakeAllocator {
        fn allocate(&self, request: &AllocateRequest) -> Result<Lease, AllocationError> {
            self.allocations.borrow_mut().push(request.clone());
            self.lease.clone().map_err(|message| AllocationError::Refused {
                code: 1,
                request_id: "fake".to_string(),
                message,
            })
        }

        fn release(&self, request: &ReleaseRequest) -> Result<(), AllocationError> {
            self.releases.borrow_mut().push(request.clone());
            match &self.release_error {
                Some(message) => Err(AllocationError::Refused {
                    code: 1,
                    request_id: "fake".to_string(),
                    message: message.clone(),
                }),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> AllocatorResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_lease_from_response() {
        let lease = response(
            r#"{"code":0,"result":true,"requestID":"r-1",
                "data":{"ipAddr":"10.0.0.5","mask":24,"gateway":"10.0.0.1","macAddr":"aa:bb:cc:dd:ee:01"}}"#,
        )
        .into_lease()
        .unwrap();

        assert_eq!(lease.address, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(lease.prefix_len, 24);
        assert_eq!(lease.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(lease.mac.as_deref(), Some("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn test_failure_flags() {
        let refused = response(r#"{"code":0,"result":false,"requestID":"r-2","message":"pool exhausted"}"#);
        assert!(matches!(
            refused.into_lease(),
            Err(AllocationError::Refused { message, .. }) if message == "pool exhausted"
        ));

        let coded = response(r#"{"code":500,"result":true,"requestID":"r-3"}"#);
        assert!(matches!(coded.check(), Err(AllocationError::Refused { code: 500, .. })));
    }

    #[test]
    fn test_missing_or_bad_data() {
        let empty = response(r#"{"code":0,"result":true}"#);
        assert!(matches!(empty.into_lease(), Err(AllocationError::InvalidLease(_))));

        let bad = response(r#"{"code":0,"data":{"ipAddr":"10.0.0.x","mask":24,"gateway":"10.0.0.1"}}"#);
        assert!(matches!(bad.into_lease(), Err(AllocationError::InvalidLease(_))));
    }

    #[test]
    fn test_request_bodies() {
        let pod = PodIdentity {
            name: "web-0".into(),
            namespace: "default".into(),
        };
        let allocate = AllocateRequest::new(&pod, "c1", Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 1));
        let json = serde_json::to_value(&allocate).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "podName": "web-0",
                "podNamespace": "default",
                "containerID": "c1",
                "host": "192.168.1.10",
                "hostGateway": "192.168.1.1"
            })
        );

        let release = serde_json::to_value(ReleaseRequest::new(&pod, "c1", Ipv4Addr::new(192, 168, 1, 10))).unwrap();
        assert!(release.get("hostGateway").is_none());
        assert_eq!(release["containerID"], "c1");
    }

    #[test]
    fn test_url_join() {
        let conf: IpamConf = serde_json::from_str(
            r#"{"endpoint":"http://10.0.0.2:8080/","allocatorPath":"/api/v1/ip/allocator"}"#,
        )
        .unwrap();
        let client = AllocatorClient::new(&conf).unwrap();
        assert_eq!(client.url(), "http://10.0.0.2:8080/api/v1/ip/allocator");
    }
}
