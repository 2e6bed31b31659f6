use crate::auth::{Identity, TokenSource};
use crate::error::{FleetError, GrpcCode};
use crate::model::{
    DutComponentState, Empty, GetDutStateRequest, GetStableVersionRequest,
    GetStableVersionResponse, GetStateRequest, ListMachineLsesRequest, ListMachineLsesResponse,
    Machine, MachineLse, NameRequest, SchedulingUnit, StateRecord, UpdateDutStateRequest,
    UpdateStateRequest, HOST_STATE_PREFIX, MACHINE_LSE_PREFIX, MACHINE_PREFIX,
    SCHEDULING_UNIT_PREFIX,
};
use crate::FleetTransport;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const UFS_SERVICE: &str = "unifiedfleet.api.v1.rpc.Fleet";
const ADMIN_INVENTORY_SERVICE: &str = "crosskylabadmin.api.fleet.v1.Inventory";
const PRPC_CODE_HEADER: &str = "X-Prpc-Grpc-Code";
const NAMESPACE_HEADER: &str = "namespace";
const OS_NAMESPACE: &str = "os";
const XSSI_PREFIX: &str = ")]}'";
const LIST_PAGE_SIZE: i32 = 100;
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct PrpcTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for PrpcTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(10_000),
            request: Duration::from_millis(60_000),
        }
    }
}

/// Talks to UFS and the admin service over pRPC with JSON bodies.
pub struct PrpcFleetTransport {
    ufs_host: Option<String>,
    admin_host: Option<String>,
    client: HttpClient,
    tokens: Arc<dyn TokenSource>,
}

impl PrpcFleetTransport {
    pub fn new(
        ufs_host: Option<String>,
        admin_host: Option<String>,
        tokens: Arc<dyn TokenSource>,
        timeouts: PrpcTimeouts,
    ) -> Result<Self, FleetError> {
        let client = HttpClient::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .build()
            .map_err(|err| FleetError::Config(format!("build http client: {}", err)))?;
        Ok(Self {
            ufs_host: ufs_host.filter(|h| !h.trim().is_empty()),
            admin_host: admin_host.filter(|h| !h.trim().is_empty()),
            client,
            tokens,
        })
    }

    fn ufs_call<Req, Resp>(&self, identity: Identity, method: &str, request: &Req) -> Result<Resp, FleetError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let host = self
            .ufs_host
            .as_deref()
            .ok_or_else(|| FleetError::Config("UFS_SERVICE is not configured".to_string()))?;
        self.call(host, UFS_SERVICE, method, identity, request, true)
    }

    fn call<Req, Resp>(
        &self,
        host: &str,
        service: &str,
        method: &str,
        identity: Identity,
        request: &Req,
        os_namespace: bool,
    ) -> Result<Resp, FleetError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = prpc_url(host, service, method);
        let mut builder = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if os_namespace {
            builder = builder.header(NAMESPACE_HEADER, OS_NAMESPACE);
        }
        if let Some(token) = self.tokens.token(identity)? {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(request).send().map_err(|err| {
            let message = format!("POST {} transport error: {}", url, err);
            if err.is_timeout() {
                FleetError::from_code(method, GrpcCode::DeadlineExceeded, message)
            } else if err.is_connect() || err.is_request() {
                FleetError::from_code(method, GrpcCode::Unavailable, message)
            } else {
                FleetError::Fatal {
                    method: method.to_string(),
                    code: GrpcCode::Unknown,
                    message,
                }
            }
        })?;
        let status = response.status().as_u16();
        let code = response
            .headers()
            .get(PRPC_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i32>().ok())
            .map(GrpcCode::from_i32)
            .unwrap_or_else(|| GrpcCode::from_http_status(status));
        let body = response.text().unwrap_or_default();
        if code != GrpcCode::Ok {
            return Err(FleetError::from_code(
                method,
                code,
                format!("status={} body={}", status, truncate_body(&body)),
            ));
        }
        decode_prpc_body(method, &body)
    }
}

fn prpc_url(host: &str, service: &str, method: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        format!("{}/prpc/{}/{}", host, service, method)
    } else {
        format!("https://{}/prpc/{}/{}", host, service, method)
    }
}

fn truncate_body(raw: &str) -> String {
    let normalized = raw.replace('\n', " ");
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

pub(crate) fn decode_prpc_body<Resp: DeserializeOwned>(
    method: &str,
    body: &str,
) -> Result<Resp, FleetError> {
    let trimmed = body.trim_start();
    let trimmed = trimmed.strip_prefix(XSSI_PREFIX).unwrap_or(trimmed);
    let trimmed = if trimmed.trim().is_empty() { "{}" } else { trimmed };
    serde_json::from_str(trimmed)
        .map_err(|err| FleetError::malformed(method, format!("invalid response JSON: {}", err)))
}

impl FleetTransport for PrpcFleetTransport {
    fn get_machine(&self, identity: Identity, id: &str) -> Result<Machine, FleetError> {
        let req = NameRequest {
            name: format!("{}{}", MACHINE_PREFIX, id),
        };
        self.ufs_call(identity, "GetMachine", &req)
    }

    fn get_machine_lse(&self, identity: Identity, hostname: &str) -> Result<MachineLse, FleetError> {
        let req = NameRequest {
            name: format!("{}{}", MACHINE_LSE_PREFIX, hostname),
        };
        self.ufs_call(identity, "GetMachineLSE", &req)
    }

    fn list_machine_lses(&self, identity: Identity, filter: &str) -> Result<Vec<MachineLse>, FleetError> {
        let mut out = Vec::new();
        let mut page_token = String::new();
        loop {
            let req = ListMachineLsesRequest {
                page_size: LIST_PAGE_SIZE,
                page_token: page_token.clone(),
                filter: filter.to_string(),
            };
            let resp: ListMachineLsesResponse = self.ufs_call(identity, "ListMachineLSEs", &req)?;
            out.extend(resp.machine_lses);
            if resp.next_page_token.is_empty() {
                return Ok(out);
            }
            page_token = resp.next_page_token;
        }
    }

    fn get_dut_state(
        &self,
        identity: Identity,
        dut_id: &str,
        hostname: &str,
    ) -> Result<DutComponentState, FleetError> {
        let req = GetDutStateRequest {
            chromeos_device_id: dut_id.to_string(),
            hostname: hostname.to_string(),
        };
        self.ufs_call(identity, "GetDutState", &req)
    }

    fn get_scheduling_unit(&self, identity: Identity, name: &str) -> Result<SchedulingUnit, FleetError> {
        let req = NameRequest {
            name: format!("{}{}", SCHEDULING_UNIT_PREFIX, name),
        };
        self.ufs_call(identity, "GetSchedulingUnit", &req)
    }

    fn get_state(&self, identity: Identity, hostname: &str) -> Result<StateRecord, FleetError> {
        let req = GetStateRequest {
            resource_name: format!("{}{}", HOST_STATE_PREFIX, hostname),
        };
        self.ufs_call(identity, "GetState", &req)
    }

    fn update_state(&self, identity: Identity, record: &StateRecord) -> Result<(), FleetError> {
        let req = UpdateStateRequest {
            state: record.clone(),
        };
        let _: StateRecord = self.ufs_call(identity, "UpdateState", &req)?;
        Ok(())
    }

    fn update_dut_state(&self, identity: Identity, req: &UpdateDutStateRequest) -> Result<(), FleetError> {
        let _: Empty = self.ufs_call(identity, "UpdateDutState", req)?;
        Ok(())
    }

    fn get_stable_version(
        &self,
        identity: Identity,
        hostname: &str,
    ) -> Result<GetStableVersionResponse, FleetError> {
        let host = self
            .admin_host
            .as_deref()
            .ok_or_else(|| FleetError::Config("ADMIN_SERVICE is not configured".to_string()))?;
        let req = GetStableVersionRequest {
            hostname: hostname.to_string(),
        };
        self.call(host, ADMIN_INVENTORY_SERVICE, "GetStableVersion", identity, &req, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::error::FleetErrorKind;
    use std::io::Read;
    use std::thread;

    struct Recorded {
        url: String,
        auth: Option<String>,
        namespace: Option<String>,
        body: String,
    }

    fn header(request: &tiny_http::Request, name: &'static str) -> Option<String> {
        request
            .headers()
            .iter()
            .find(|h| h.field.equiv(name))
            .map(|h| h.value.to_string())
    }

    /// Serves one canned reply per request, in order.
    fn serve(replies: Vec<(u16, Option<i32>, String)>) -> (String, thread::JoinHandle<Vec<Recorded>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let port = server.server_addr().to_ip().expect("ip addr").port();
        let handle = thread::spawn(move || {
            let mut recorded = Vec::new();
            for (status, code, body) in replies {
                let mut request = server.recv().expect("request");
                let mut req_body = String::new();
                request.as_reader().read_to_string(&mut req_body).expect("body");
                recorded.push(Recorded {
                    url: request.url().to_string(),
                    auth: header(&request, "Authorization"),
                    namespace: header(&request, "namespace"),
                    body: req_body,
                });
                let mut response = tiny_http::Response::from_string(body).with_status_code(status);
                if let Some(code) = code {
                    let h = tiny_http::Header::from_bytes(
                        PRPC_CODE_HEADER.as_bytes(),
                        code.to_string().as_bytes(),
                    )
                    .expect("header");
                    response = response.with_header(h);
                }
                request.respond(response).expect("respond");
            }
            recorded
        });
        (format!("http://127.0.0.1:{}", port), handle)
    }

    fn transport(host: &str) -> PrpcFleetTransport {
        PrpcFleetTransport::new(
            Some(host.to_string()),
            Some(host.to_string()),
            Arc::new(StaticTokenSource::new(Some("tok".to_string()))),
            PrpcTimeouts {
                connect: Duration::from_secs(2),
                request: Duration::from_secs(5),
            },
        )
        .expect("transport")
    }

    #[test]
    fn decodes_xssi_prefixed_response_and_sends_namespace() {
        let (host, handle) = serve(vec![(
            200,
            Some(0),
            ")]}'\n{\"name\":\"machines/dut-42\",\"serialNumber\":\"SN\"}".to_string(),
        )]);
        let machine = transport(&host)
            .get_machine(Identity::System, "dut-42")
            .expect("machine");
        assert_eq!(machine.serial_number, "SN");
        let recorded = handle.join().expect("join");
        assert_eq!(
            recorded[0].url,
            "/prpc/unifiedfleet.api.v1.rpc.Fleet/GetMachine"
        );
        assert_eq!(recorded[0].auth.as_deref(), Some("Bearer tok"));
        assert_eq!(recorded[0].namespace.as_deref(), Some("os"));
        assert!(recorded[0].body.contains("machines/dut-42"));
    }

    #[test]
    fn maps_grpc_codes_from_header() {
        let (host, handle) = serve(vec![
            (404, Some(5), "not here".to_string()),
            (503, Some(14), "overloaded".to_string()),
            (403, Some(7), "nope".to_string()),
        ]);
        let t = transport(&host);
        let not_found = t.get_state(Identity::System, "host1").expect_err("not found");
        assert_eq!(not_found.kind(), FleetErrorKind::NotFound);
        let unavailable = t.get_state(Identity::System, "host1").expect_err("unavailable");
        assert_eq!(unavailable.kind(), FleetErrorKind::Transient);
        let denied = t.get_state(Identity::System, "host1").expect_err("denied");
        assert_eq!(denied.kind(), FleetErrorKind::Fatal);
        handle.join().expect("join");
    }

    #[test]
    fn list_follows_page_tokens() {
        let (host, handle) = serve(vec![
            (
                200,
                Some(0),
                ")]}'{\"machineLSEs\":[{\"hostname\":\"a\"}],\"nextPageToken\":\"p2\"}".to_string(),
            ),
            (
                200,
                Some(0),
                ")]}'{\"machineLSEs\":[{\"hostname\":\"b\"}]}".to_string(),
            ),
        ]);
        let lses = transport(&host)
            .list_machine_lses(Identity::System, "machine=dut-42")
            .expect("list");
        let hostnames: Vec<_> = lses.iter().map(|l| l.hostname.as_str()).collect();
        assert_eq!(hostnames, vec!["a", "b"]);
        let recorded = handle.join().expect("join");
        assert!(recorded[1].body.contains("\"pageToken\":\"p2\""));
        assert!(recorded[0].body.contains("machine=dut-42"));
    }

    #[test]
    fn stable_version_goes_to_admin_service_without_namespace() {
        let (host, handle) = serve(vec![(
            200,
            Some(0),
            ")]}'{\"crosVersion\":\"R90-1.0\"}".to_string(),
        )]);
        let resp = transport(&host)
            .get_stable_version(Identity::System, "host1")
            .expect("stable version");
        assert_eq!(resp.cros_version, "R90-1.0");
        let recorded = handle.join().expect("join");
        assert_eq!(
            recorded[0].url,
            "/prpc/crosskylabadmin.api.fleet.v1.Inventory/GetStableVersion"
        );
        assert!(recorded[0].namespace.is_none());
    }

    #[test]
    fn missing_ufs_host_is_a_config_error() {
        let t = PrpcFleetTransport::new(
            None,
            None,
            Arc::new(StaticTokenSource::new(None)),
            PrpcTimeouts::default(),
        )
        .expect("transport");
        let err = t.get_machine(Identity::System, "x").expect_err("no host");
        assert_eq!(err.kind(), FleetErrorKind::Config);
    }

    #[test]
    fn prpc_url_defaults_to_https() {
        assert_eq!(
            prpc_url("ufs.example.com", "svc.S", "M"),
            "https://ufs.example.com/prpc/svc.S/M"
        );
        assert_eq!(
            prpc_url("http://127.0.0.1:9/", "svc.S", "M"),
            "http://127.0.0.1:9/prpc/svc.S/M"
        );
    }
}
