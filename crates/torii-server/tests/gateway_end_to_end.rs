//! End-to-end tests against a running gateway.
//!
//! Both external collaborators are wiremock servers: the identity
//! provider (discovery document + JWKS) and the upstream FHIR store. The
//! gateway itself listens on an ephemeral port and is exercised with a
//! real HTTP client.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use torii_server::{GatewayConfig, RunMode, build_app};

struct TestEnv {
    #[allow(dead_code)]
    idp: MockServer,
    upstream: MockServer,
    encoding_key: EncodingKey,
    issuer: String,
    gateway_base: String,
    _allowed_file: Option<tempfile::NamedTempFile>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl TestEnv {
    /// Starts the identity provider, the upstream store, and the gateway.
    async fn start(checker: &str, allowed_queries: Option<&str>) -> Self {
        let idp = MockServer::start().await;
        let upstream = MockServer::start().await;

        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = private.to_public_key();
        let pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": idp.uri(),
                "authorization_endpoint": format!("{}/authorize", idp.uri()),
                "token_endpoint": format!("{}/token", idp.uri()),
                "jwks_uri": format!("{}/certs", idp.uri()),
                "grant_types_supported": ["authorization_code"],
                "response_types_supported": ["code"],
                "subject_types_supported": ["public"],
                "id_token_signing_alg_values_supported": ["RS256"],
                "code_challenge_methods_supported": ["S256"]
            })))
            .mount(&idp)
            .await;

        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "RSA",
                    "kid": "it-key",
                    "use": "sig",
                    "alg": "RS256",
                    "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                    "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
                }]
            })))
            .mount(&idp)
            .await;

        let allowed_file = allowed_queries.map(|content| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            write!(file, "{content}").unwrap();
            file
        });

        // Bind first so the public base URL can point at the real port.
        let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway_base = format!("http://{addr}");

        let config = GatewayConfig {
            proxy_to: Some(upstream.uri()),
            token_issuer: Some(idp.uri()),
            access_checker: checker.to_string(),
            allowed_queries_file: allowed_file
                .as_ref()
                .map(|f| f.path().to_string_lossy().into_owned()),
            public_base_url: Some(gateway_base.clone()),
            run_mode: RunMode::Prod,
            allow_http: true,
            ..GatewayConfig::default()
        };

        let app = build_app(&config).unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            issuer: idp.uri(),
            idp,
            upstream,
            encoding_key,
            gateway_base,
            _allowed_file: allowed_file,
            _shutdown: shutdown_tx,
        }
    }

    fn sign(&self, extra_claims: Value) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let mut claims = json!({
            "iss": self.issuer,
            "sub": "user-1",
            "exp": now + 3600,
        });
        if let (Some(claims_obj), Some(extra)) = (claims.as_object_mut(), extra_claims.as_object())
        {
            for (k, v) in extra {
                claims_obj.insert(k.clone(), v.clone());
            }
        }

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("it-key".to_string());
        encode(&header, &claims, &self.encoding_key).unwrap()
    }

    fn list_token(&self) -> String {
        self.sign(json!({"patient_list": "patient-list-example"}))
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.gateway_base)
    }
}

/// Mounts the list membership search for one patient reference.
async fn mount_list_membership(upstream: &MockServer, item: &str, matched: bool) {
    let body = if matched {
        json!({
            "resourceType": "Bundle",
            "total": 1,
            "entry": [{"resource": {"resourceType": "List", "id": "patient-list-example"}}]
        })
    } else {
        json!({"resourceType": "Bundle", "total": 0})
    };

    Mock::given(method("GET"))
        .and(path("/List"))
        .and(query_param("_id", "patient-list-example"))
        .and(query_param("item", item))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(upstream)
        .await;
}

#[tokio::test]
async fn scenario_patient_read_on_list_with_url_rewrite() {
    let env = TestEnv::start("list", None).await;
    mount_list_membership(&env.upstream, "Patient/75270", true).await;

    let upstream_base = env.upstream.uri();
    Mock::given(method("GET"))
        .and(path("/Patient/75270"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [{
                "fullUrl": format!("{upstream_base}/Patient/75270"),
                "resource": {"resourceType": "Patient", "id": "75270"}
            }]
        })))
        .mount(&env.upstream)
        .await;

    let response = reqwest::Client::new()
        .get(env.url("/Patient/75270"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["entry"][0]["fullUrl"],
        format!("{}/Patient/75270", env.gateway_base)
    );
}

#[tokio::test]
async fn scenario_patient_read_off_list_is_403_with_exact_body() {
    let env = TestEnv::start("list", None).await;
    mount_list_membership(&env.upstream, "Patient/3", false).await;

    let response = reqwest::Client::new()
        .get(env.url("/Patient/3"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(
        response.text().await.unwrap(),
        "User is not authorized to GET /Patient/3"
    );
}

#[tokio::test]
async fn scenario_allowed_query_skips_the_checker() {
    let allowed = r#"{"entries": [{
        "path": "",
        "queryParams": {"_getpages": "ANY_VALUE"},
        "allowExtraParams": true
    }]}"#;
    let env = TestEnv::start("list", Some(allowed)).await;

    // Only the paging request itself reaches the store; a List membership
    // search would hit an unmatched route and fail the request.
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("_getpages", "ABC-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset"
        })))
        .expect(1)
        .mount(&env.upstream)
        .await;

    let response = reqwest::Client::new()
        .get(env.url("/?_getpages=ABC-123"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn scenario_bundle_with_delete_is_400() {
    let env = TestEnv::start("list", None).await;

    let bundle = json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": [
            {"request": {"method": "DELETE", "url": "Patient/X"}}
        ]
    });

    let response = reqwest::Client::new()
        .post(env.url("/"))
        .bearer_auth(env.list_token())
        .json(&bundle)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn scenario_include_query_is_400_before_policy() {
    let env = TestEnv::start("patient", None).await;
    let token = env.sign(json!({"patient_id": "A"}));

    let response = reqwest::Client::new()
        .get(env.url("/Observation?subject=A&_include=Observation:patient"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    // Invalid request shape, not a policy denial.
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn scenario_post_patient_appends_to_list() {
    let env = TestEnv::start("list", None).await;

    let upstream_base = env.upstream.uri();
    Mock::given(method("POST"))
        .and(path("/Patient"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header(
                    "Location",
                    format!("{upstream_base}/Patient/new-patient-1/_history/1").as_str(),
                )
                .set_body_json(json!({"resourceType": "Patient", "id": "new-patient-1"})),
        )
        .expect(1)
        .mount(&env.upstream)
        .await;

    let list_patch = Mock::given(method("PATCH"))
        .and(path("/List/patient-list-example"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount_as_scoped(&env.upstream)
        .await;

    let response = reqwest::Client::new()
        .post(env.url("/Patient"))
        .bearer_auth(env.list_token())
        .json(&json!({"resourceType": "Patient"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);

    // The post-process hook patched the list with the created patient.
    let patches = list_patch.received_requests().await;
    assert_eq!(patches.len(), 1);
    let patch: Value = serde_json::from_slice(&patches[0].body).unwrap();
    assert_eq!(
        patch[0]["value"]["item"]["reference"],
        "Patient/new-patient-1"
    );
}

#[tokio::test]
async fn typed_read_is_escalated_to_upstream_inspection() {
    let env = TestEnv::start("list", None).await;

    // GET /Observation/obs-1 names no patient; the gateway must fetch the
    // resource (inspection), check its subject against the list, and only
    // then forward. The mock therefore sees the path twice.
    Mock::given(method("GET"))
        .and(path("/Observation/obs-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Observation",
            "id": "obs-1",
            "subject": {"reference": "Patient/75270"}
        })))
        .expect(2)
        .mount(&env.upstream)
        .await;
    mount_list_membership(&env.upstream, "Patient/75270", true).await;

    let response = reqwest::Client::new()
        .get(env.url("/Observation/obs-1"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["resourceType"], "Observation");
}

#[tokio::test]
async fn escalated_read_outside_the_list_is_403() {
    let env = TestEnv::start("list", None).await;

    Mock::given(method("GET"))
        .and(path("/Observation/obs-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Observation",
            "id": "obs-9",
            "subject": {"reference": "Patient/3"}
        })))
        .expect(1)
        .mount(&env.upstream)
        .await;
    mount_list_membership(&env.upstream, "Patient/3", false).await;

    let response = reqwest::Client::new()
        .get(env.url("/Observation/obs-9"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(
        response.text().await.unwrap(),
        "User is not authorized to GET /Observation/obs-9"
    );
}

#[tokio::test]
async fn missing_token_is_401_with_empty_body() {
    let env = TestEnv::start("list", None).await;

    let response = reqwest::Client::new()
        .get(env.url("/Patient/75270"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn garbage_token_is_401() {
    let env = TestEnv::start("list", None).await;

    let response = reqwest::Client::new()
        .get(env.url("/Patient/75270"))
        .bearer_auth("not.a.jwt")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn expired_token_is_401() {
    let env = TestEnv::start("list", None).await;

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("it-key".to_string());
    let token = encode(
        &header,
        &json!({"iss": env.issuer, "exp": now - 7200, "patient_list": "x"}),
        &env.encoding_key,
    )
    .unwrap();

    let response = reqwest::Client::new()
        .get(env.url("/Patient/75270"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn delete_is_400() {
    let env = TestEnv::start("list", None).await;

    let response = reqwest::Client::new()
        .delete(env.url("/Patient/75270"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn upstream_error_status_passes_through() {
    let env = TestEnv::start("list", None).await;
    mount_list_membership(&env.upstream, "Patient/75270", true).await;

    Mock::given(method("GET"))
        .and(path("/Patient/75270"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"resourceType": "OperationOutcome"})),
        )
        .mount(&env.upstream)
        .await;

    let response = reqwest::Client::new()
        .get(env.url("/Patient/75270"))
        .bearer_auth(env.list_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["resourceType"], "OperationOutcome");
}

#[tokio::test]
async fn smart_configuration_is_unauthenticated() {
    let env = TestEnv::start("list", None).await;

    let response = reqwest::Client::new()
        .get(env.url("/.well-known/smart-configuration"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["issuer"], env.issuer);
    assert_eq!(body["token_endpoint"], format!("{}/token", env.issuer));
    assert_eq!(body["jwks_uri"], format!("{}/certs", env.issuer));
    assert_eq!(body["code_challenge_methods_supported"][0], "S256");
}

#[tokio::test]
async fn metadata_is_unauthenticated_and_patched() {
    let env = TestEnv::start("list", None).await;

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "CapabilityStatement",
            "status": "active",
            "rest": [{"mode": "server"}]
        })))
        .mount(&env.upstream)
        .await;

    let response = reqwest::Client::new()
        .get(env.url("/metadata"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["resourceType"], "CapabilityStatement");

    let security = &body["rest"][0]["security"];
    assert_eq!(security["cors"], true);
    assert_eq!(security["service"][0]["coding"][0]["code"], "OAuth");
    assert_eq!(
        security["extension"][0]["extension"][0]["valueUri"],
        format!("{}/authorize", env.issuer)
    );
    assert_eq!(
        security["extension"][0]["extension"][1]["valueUri"],
        format!("{}/token", env.issuer)
    );
}

#[tokio::test]
async fn healthz_works() {
    let env = TestEnv::start("list", None).await;

    let response = reqwest::Client::new()
        .get(env.url("/healthz"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn single_patient_checker_pins_the_caller() {
    let env = TestEnv::start("patient", None).await;
    let token = env.sign(json!({"patient_id": "A"}));

    Mock::given(method("GET"))
        .and(path("/Observation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset"
        })))
        .mount(&env.upstream)
        .await;

    let client = reqwest::Client::new();

    let granted = client
        .get(env.url("/Observation?subject=A"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(granted.status(), 200);

    let denied = client
        .get(env.url("/Observation?subject=B"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 403);
    assert_eq!(
        denied.text().await.unwrap(),
        "User is not authorized to GET /Observation?subject=B"
    );
}

#[tokio::test]
async fn transaction_bundle_decided_on_union_compartment() {
    let env = TestEnv::start("list", None).await;

    // Both Patient/A and Patient/B must be on the list; one membership
    // search covers the union.
    Mock::given(method("GET"))
        .and(path("/List"))
        .and(query_param("_id", "patient-list-example"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "total": 1,
            "entry": [{"resource": {"resourceType": "List"}}]
        })))
        .mount(&env.upstream)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "transaction-response"
        })))
        .mount(&env.upstream)
        .await;

    let bundle = json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": [
            {"request": {"method": "GET", "url": "Patient/A"}},
            {
                "request": {"method": "POST", "url": "Observation"},
                "resource": {
                    "resourceType": "Observation",
                    "subject": {"reference": "Patient/B"}
                }
            }
        ]
    });

    let response = reqwest::Client::new()
        .post(env.url("/"))
        .bearer_auth(env.list_token())
        .json(&bundle)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);

    let list_queries: Vec<_> = env
        .upstream
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/List")
        .collect();
    assert_eq!(list_queries.len(), 1);
    let query = list_queries[0].url.query().unwrap();
    assert!(query.contains("item=Patient%2FA"));
    assert!(query.contains("item=Patient%2FB"));
}
