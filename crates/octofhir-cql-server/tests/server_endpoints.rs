use axum::body::Body;
use axum::extract::{FromRequest, Multipart};
use axum::http::Request;
use octofhir_cql_server::{AppConfig, build_app};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tokio::task::JoinHandle;

async fn start_server() -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let app = build_app(&AppConfig::default()).expect("build app");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, server)
}

/// Decode a multipart response into (field name, content type, body) triples.
async fn read_multipart(resp: reqwest::Response) -> Vec<(String, String, String)> {
    let content_type = resp
        .headers()
        .get("content-type")
        .expect("content type")
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let bytes = resp.bytes().await.unwrap();

    let req = Request::builder()
        .header("content-type", content_type)
        .body(Body::from(bytes))
        .unwrap();
    let mut multipart = Multipart::from_request(req, &()).await.expect("multipart");
    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let body = field.text().await.unwrap();
        parts.push((name, content_type, body));
    }
    parts
}

fn cql_form(parts: &[(&str, &str)]) -> Form {
    parts.iter().fold(Form::new(), |form, (name, source)| {
        form.part(
            name.to_string(),
            Part::text(source.to_string())
                .file_name(format!("{name}.cql"))
                .mime_str("application/cql")
                .unwrap(),
        )
    })
}

#[tokio::test]
async fn health_endpoints_work() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/")).send().await.unwrap();
    assert!(resp.status().is_success());
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "OctoFHIR CQL Translator");
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ready");

    // Incoming request ids are echoed back
    let resp = client
        .get(format!("{base}/healthz"))
        .header("x-request-id", "abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "abc-123");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn single_source_translation() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{base}/cql/translator");

    // No Accept header: ELM JSON
    let resp = client
        .post(&url)
        .header("content-type", "application/cql")
        .body("library Demo version '1.0'\ndefine Two: 1 + 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(resp.headers()["content-type"], "application/elm+json");
    let elm: Value = resp.json().await.unwrap();
    assert_eq!(elm["library"]["identifier"]["id"], "Demo");
    assert_eq!(elm["library"]["identifier"]["version"], "1.0");

    // Explicit XML
    let resp = client
        .post(&url)
        .header("content-type", "application/cql; charset=utf-8")
        .header("accept", "application/elm+xml")
        .body("library Demo\ndefine Two: 1 + 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/elm+xml");
    let xml = resp.text().await.unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<identifier id=\"Demo\"/>"));

    // Compilation errors: 400 with the translated body
    let resp = client
        .post(&url)
        .header("content-type", "application/cql")
        .header("accept", "*/*")
        .body("library Demo\ndefine X: Y")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let elm: Value = resp.json().await.unwrap();
    let errors: Vec<&Value> = elm["library"]["annotation"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|a| a["type"] == "CqlToElmError")
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["errorSeverity"], "error");
    assert_eq!(
        errors[0]["message"],
        "Could not resolve identifier Y in the current library."
    );

    // The same failure rendered as XML keeps the 400 and the error annotation
    let resp = client
        .post(&url)
        .header("content-type", "application/cql")
        .header("accept", "application/elm+xml")
        .body("library Demo\ndefine X: Y")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.headers()["content-type"], "application/elm+xml");
    let xml = resp.text().await.unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("xsi:type=\"a:CqlToElmError\""));
    assert!(xml.contains("message=\"Could not resolve identifier Y in the current library.\""));
    assert!(xml.contains("errorSeverity=\"error\""));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn query_parameters_configure_the_session() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/cql/translator?debug=true&strict=true&signatures=All"))
        .header("content-type", "application/cql")
        .body("library Demo\ndefine X: 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let elm: Value = resp.json().await.unwrap();
    let info = &elm["library"]["annotation"][0];
    assert_eq!(info["type"], "CqlToElmInfo");
    assert_eq!(info["signatureLevel"], "All");
    assert_eq!(info["translatorOptions"], ALL_DEBUG_AND_STRICT_OPTIONS);

    // Unknown signature level is a client error
    let resp = client
        .post(format!("{base}/cql/translator?signatures=Some"))
        .header("content-type", "application/cql")
        .body("library Demo\ndefine X: 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["resourceType"], "OperationOutcome");
    assert_eq!(outcome["issue"][0]["code"], "invalid");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

const ALL_DEBUG_AND_STRICT_OPTIONS: &str = "EnableAnnotations,EnableLocators,EnableResultTypes,\
     DisableListTraversal,DisableListDemotion,DisableListPromotion,DisableMethodInvocation";

/// Translate `define X: 1` and return the CqlToElmInfo annotation.
async fn translation_info(client: &reqwest::Client, url: String) -> Value {
    let resp = client
        .post(url)
        .header("content-type", "application/cql")
        .body("library Demo\ndefine X: 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let elm: Value = resp.json().await.unwrap();
    let info = elm["library"]["annotation"][0].clone();
    assert_eq!(info["type"], "CqlToElmInfo");
    info
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_do_not_share_options() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let configured = format!("{base}/cql/translator?debug=true&strict=true&signatures=All");
    let bare = format!("{base}/cql/translator");

    for _ in 0..5 {
        let (a, b, c, d) = tokio::join!(
            translation_info(&client, configured.clone()),
            translation_info(&client, bare.clone()),
            translation_info(&client, configured.clone()),
            translation_info(&client, bare.clone()),
        );
        for info in [&a, &c] {
            assert_eq!(info["translatorOptions"], ALL_DEBUG_AND_STRICT_OPTIONS);
            assert_eq!(info["signatureLevel"], "All");
        }
        for info in [&b, &d] {
            assert_eq!(info["translatorOptions"], "");
            assert_eq!(info["signatureLevel"], "None");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn rejected_requests() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{base}/cql/translator");

    // Unsupported request content type
    let resp = client
        .post(&url)
        .header("content-type", "text/plain")
        .body("library Demo")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
    assert!(resp.headers().contains_key("x-request-id"));
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["issue"][0]["code"], "not-supported");

    // Accept header without an ELM type
    let resp = client
        .post(&url)
        .header("content-type", "application/cql")
        .header("accept", "text/html")
        .body("library Demo")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 406);

    // Invalid UTF-8 source
    let resp = client
        .post(&url)
        .header("content-type", "application/cql")
        .body(vec![0xffu8, 0xfe, 0x00])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["issue"][0]["diagnostics"], "Unable to read request");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn batch_translation_with_includes() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{base}/cql/translator");

    let form = cql_form(&[
        ("main", "library Main\ninclude Common\ndefine X: Common.Y + 1"),
        ("common", "library Common\ndefine Y: 41"),
    ]);
    let resp = client
        .post(&url)
        .header("x-targetformat", "application/elm+xml,application/elm+json")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let parts = read_multipart(resp).await;

    let labels: Vec<(&str, &str)> = parts
        .iter()
        .map(|(name, ct, _)| (name.as_str(), ct.as_str()))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("main", "application/elm+xml"),
            ("main", "application/elm+json"),
            ("common", "application/elm+xml"),
            ("common", "application/elm+json"),
        ]
    );
    assert!(parts.iter().all(|(_, _, body)| !body.contains("CqlToElmError")));
    let main: Value = serde_json::from_str(&parts[1].2).unwrap();
    assert_eq!(main["library"]["identifier"]["id"], "Main");

    // Repeated headers behave like one comma-joined header
    let form = cql_form(&[("common", "library Common\ndefine Y: 41")]);
    let resp = client
        .post(&url)
        .header("x-targetformat", "application/elm+xml")
        .header("x-targetformat", "application/elm+json")
        .multipart(form)
        .send()
        .await
        .unwrap();
    let parts = read_multipart(resp).await;
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].1, "application/elm+xml");
    assert_eq!(parts[1].1, "application/elm+json");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn batch_partial_failure_and_rejection() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{base}/cql/translator");

    // Missing include fails only that part; the batch still succeeds
    let form = cql_form(&[
        ("main", "library Main\ninclude Common\ndefine X: Common.Y"),
        ("other", "library Other\ndefine Z: 1"),
    ]);
    let resp = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let parts = read_multipart(resp).await;
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].0, "main");
    assert_eq!(parts[0].1, "application/elm+json");
    assert!(parts[0].2.contains("Common"));
    assert!(parts[0].2.contains("CqlToElmError"));
    assert_eq!(parts[1].0, "other");
    assert!(!parts[1].2.contains("CqlToElmError"));

    // Any unsupported format rejects the whole batch
    let form = cql_form(&[("other", "library Other\ndefine Z: 1")]);
    let resp = client
        .post(&url)
        .header("x-targetformat", "application/elm+json, text/plain")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["resourceType"], "OperationOutcome");
    assert_eq!(outcome["issue"][0]["code"], "invalid");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}
