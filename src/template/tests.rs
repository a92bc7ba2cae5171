//! Engine-level tests: template decoding, compilation invariants and
//! end-to-end execution against local stub servers.

mod decoding {
    use crate::error::{CompileError, TemplateError};
    use crate::template::{Severity, Template};

    const APACHE: &str = include_str!("../../demos/apache-detect.yaml");

    #[test]
    fn parses_demo_template() {
        let template = Template::from_yaml(APACHE).unwrap();
        assert_eq!(template.id, "apache-detect");
        assert_eq!(template.info.severity, Severity::Info);
        assert_eq!(template.http.len(), 1);
        assert_eq!(template.tags(), vec!["tech", "apache"]);
        // Single-string reference round-trips to a list.
        assert_eq!(template.info.reference, vec!["https://httpd.apache.org/"]);
    }

    #[test]
    fn reference_accepts_string_or_list() {
        let single: Template = Template::from_yaml(
            "id: t\ninfo:\n  name: x\n  reference: https://a.example\nhttp:\n  - path: ['{{BaseURL}}/']\n    matchers:\n      - type: status\n        status: [200]",
        )
        .unwrap();
        assert_eq!(single.info.reference, vec!["https://a.example"]);

        let many: Template = Template::from_yaml(
            "id: t\ninfo:\n  name: x\n  reference:\n    - https://a.example\n    - https://b.example\nhttp:\n  - path: ['{{BaseURL}}/']\n    matchers:\n      - type: status\n        status: [200]",
        )
        .unwrap();
        assert_eq!(many.info.reference.len(), 2);
    }

    #[test]
    fn yaml_round_trips_after_decode() {
        let original = Template::from_yaml(APACHE).unwrap();
        let encoded = serde_yaml::to_string(&original).unwrap();
        let decoded = Template::from_yaml(&encoded).unwrap();

        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.info.name, original.info.name);
        assert_eq!(decoded.info.reference, original.info.reference);
        assert_eq!(decoded.http.len(), original.http.len());
        assert_eq!(
            decoded.http[0].operators.matchers.len(),
            original.http[0].operators.matchers.len()
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let yaml = "id: t\nfuture-field: whatever\ninfo:\n  name: x\n  lab: 3\nhttp:\n  - path: ['{{BaseURL}}/']\n    matchers:\n      - type: status\n        status: [200]";
        assert!(Template::from_yaml(yaml).is_ok());
    }

    #[test]
    fn schema_errors_are_fatal_for_the_template() {
        assert!(matches!(
            Template::from_yaml("id: ["),
            Err(TemplateError::Schema(_))
        ));
        assert!(matches!(
            Template::from_yaml("info:\n  name: no-id"),
            Err(TemplateError::Schema(_))
        ));
        // Unknown matcher type is an unknown enum value.
        let yaml = "id: t\nhttp:\n  - path: ['{{BaseURL}}/']\n    matchers:\n      - type: telepathy";
        assert!(matches!(
            Template::from_yaml(yaml),
            Err(TemplateError::Schema(_))
        ));
    }

    #[test]
    fn legacy_requests_alias_folds_into_http() {
        let yaml = "id: legacy\nrequests:\n  - method: GET\n    path: ['{{BaseURL}}/x']\n    matchers:\n      - type: status\n        status: [200]";
        let mut template = Template::from_yaml(yaml).unwrap();
        template.compile().unwrap();
        assert_eq!(template.http.len(), 1);
        assert!(template.requests.is_empty());
        assert_eq!(template.total_requests, 1);
    }

    #[test]
    fn total_requests_sums_payload_iterations() {
        let yaml = r#"
id: totals
http:
  - path: ["{{BaseURL}}/{{a}}{{b}}"]
    attack: clusterbomb
    payloads:
      a: [x, y]
      b: ["1", "2"]
    matchers:
      - type: status
        status: [200]
  - path: ["{{BaseURL}}/plain"]
    matchers:
      - type: status
        status: [200]
network:
  - host: ["{{Hostname}}"]
    inputs:
      - data: "HELLO"
    matchers:
      - type: word
        part: data
        words: [hi]
"#;
        let mut template = Template::from_yaml(yaml).unwrap();
        template.compile().unwrap();
        assert_eq!(template.total_requests, 4 + 1 + 1);
    }

    #[test]
    fn forward_extractor_reference_fails_compile() {
        // Request 1 uses a value request 2 extracts; declaration order
        // binds visibility.
        let yaml = r#"
id: forward-ref
http:
  - path: ["{{BaseURL}}/{{token}}"]
    matchers:
      - type: status
        status: [200]
  - path: ["{{BaseURL}}/source"]
    extractors:
      - type: regex
        name: token
        regex: ['token=(\w+)']
        group: 1
"#;
        let mut template = Template::from_yaml(yaml).unwrap();
        match template.compile() {
            Err(TemplateError::Compile(CompileError::UnresolvedVariable { name, .. })) => {
                assert_eq!(name, "token")
            }
            other => panic!("expected unresolved variable error, got {:?}", other),
        }
    }

    #[test]
    fn backward_extractor_reference_compiles() {
        let yaml = r#"
id: backward-ref
http:
  - path: ["{{BaseURL}}/source"]
    extractors:
      - type: regex
        name: token
        regex: ['token=(\w+)']
        group: 1
  - path: ["{{BaseURL}}/{{token}}"]
    matchers:
      - type: status
        status: [200]
"#;
        let mut template = Template::from_yaml(yaml).unwrap();
        assert!(template.compile().is_ok());
    }

    #[test]
    fn pitchfork_length_mismatch_fails_compile() {
        let yaml = r#"
id: uneven
http:
  - path: ["{{BaseURL}}/{{a}}{{b}}"]
    attack: pitchfork
    payloads:
      a: [x, y]
      b: ["1"]
    matchers:
      - type: status
        status: [200]
"#;
        let mut template = Template::from_yaml(yaml).unwrap();
        assert!(matches!(
            template.compile(),
            Err(TemplateError::Compile(
                CompileError::PayloadLengthMismatch { .. }
            ))
        ));
    }

    #[test]
    fn double_compile_is_rejected() {
        let mut template = Template::from_yaml(APACHE).unwrap();
        template.compile().unwrap();
        assert!(matches!(
            template.compile(),
            Err(TemplateError::Compile(CompileError::AlreadyCompiled))
        ));
    }

    #[test]
    fn template_variables_resolve_in_requests() {
        let yaml = r#"
id: with-vars
variables:
  probe_path: "{{BaseURL}}/probe"
http:
  - path: ["{{probe_path}}"]
    matchers:
      - type: status
        status: [200]
"#;
        let mut template = Template::from_yaml(yaml).unwrap();
        assert!(template.compile().is_ok());

        let yaml_bad = r#"
id: with-bad-vars
variables:
  broken: "{{nonexistent_thing}}/x"
http:
  - path: ["{{broken}}"]
    matchers:
      - type: status
        status: [200]
"#;
        let mut template = Template::from_yaml(yaml_bad).unwrap();
        assert!(matches!(
            template.compile(),
            Err(TemplateError::Compile(CompileError::UnresolvedVariable { .. }))
        ));
    }
}

mod execution {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::scan::ScanContext;
    use crate::template::Template;

    /// Serves every connection through `handler` (request text in, raw
    /// response bytes out), closing the socket after each response.
    async fn spawn_stub(
        handler: impl Fn(&str) -> Vec<u8> + Send + Sync + 'static,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let hit_counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hit_counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16384];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let response = handler(&request);
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn http_response(status: u16, body: &str, extra_headers: &[(&str, &str)]) -> Vec<u8> {
        let mut headers = String::new();
        for (name, value) in extra_headers {
            headers.push_str(&format!("{}: {}\r\n", name, value));
        }
        format!(
            "HTTP/1.1 {} STUB\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            headers,
            body.len(),
            body
        )
        .into_bytes()
    }

    fn request_path(request: &str) -> String {
        request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string()
    }

    fn compiled(yaml: &str) -> Template {
        let mut template = Template::from_yaml(yaml).unwrap();
        template.compile().unwrap();
        template
    }

    const APACHE_AND: &str = r#"
id: apache-and
info:
  name: Apache banner
  severity: info
http:
  - method: GET
    path: ["{{BaseURL}}/"]
    matchers-condition: and
    matchers:
      - type: status
        status: [200]
      - type: word
        words: ["Apache"]
"#;

    #[tokio::test]
    async fn matching_template_emits_one_result() {
        let (target, _) =
            spawn_stub(|_| http_response(200, "Server: Apache/2.4", &[])).await;

        let template = compiled(APACHE_AND);
        let results = template.execute(&target, None).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].template_id, "apache-and");
        assert!(results[0].matched_at.starts_with(&target));
    }

    #[tokio::test]
    async fn non_matching_status_still_records_the_event() {
        let (target, _) =
            spawn_stub(|_| http_response(404, "Server: Apache/2.4", &[])).await;

        let template = compiled(APACHE_AND);
        let ctx = ScanContext::new(target.clone(), None);
        let results = template.execute_with_context(&ctx, &target).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(ctx.events_recorded(), 1);
    }

    #[tokio::test]
    async fn clusterbomb_payloads_dispatch_the_full_product() {
        let (target, hits) =
            spawn_stub(|req| http_response(200, &request_path(req), &[])).await;

        let template = compiled(
            r#"
id: echo-probe
http:
  - method: GET
    path: ["{{BaseURL}}/echo/{{a}}{{b}}"]
    attack: clusterbomb
    payloads:
      a: [x, y]
      b: ["1", "2"]
    matchers:
      - type: word
        words: ["{{a}}{{b}}"]
"#,
        );

        let ctx = ScanContext::new(target.clone(), None);
        let results = template.execute_with_context(&ctx, &target).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.events_recorded(), 4);
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn extracted_token_flows_into_the_next_request() {
        let (target, _) = spawn_stub(|req| {
            if request_path(req) == "/token" {
                http_response(200, "token=abc123", &[])
            } else if req.to_lowercase().contains("authorization: abc123") {
                http_response(200, "authorized", &[])
            } else {
                http_response(403, "denied", &[])
            }
        })
        .await;

        let template = compiled(
            r#"
id: token-flow
http:
  - method: GET
    path: ["{{BaseURL}}/token"]
    extractors:
      - type: regex
        name: token
        regex: ['token=(\w+)']
        group: 1
  - method: GET
    path: ["{{BaseURL}}/auth"]
    headers:
      Authorization: "{{token}}"
    matchers:
      - type: status
        status: [200]
"#,
        );

        let results = template.execute(&target, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].extracted_results.get("token"),
            Some(&vec!["abc123".to_string()])
        );
    }

    #[tokio::test]
    async fn network_template_reads_and_matches() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if buf[..n].windows(4).any(|w| w == b"PING") {
                        let _ = socket.write_all(b"PONG").await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        let template = compiled(
            r#"
id: ping-probe
network:
  - host: ["{{Hostname}}"]
    inputs:
      - data: "PING\r\n"
        read: 4
    matchers:
      - type: word
        part: data
        words: [PONG]
"#,
        );

        let target = format!("http://{}", addr);
        let results = template.execute(&target, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].matched_at, addr.to_string());
    }

    #[tokio::test]
    async fn dsl_failure_is_a_non_match_without_errors() {
        // 50-byte body: len(body) > 100 fails, contains() never runs.
        let body = format!("error {}", "x".repeat(44));
        let (target, _) = spawn_stub(move |_| http_response(200, &body, &[])).await;

        let template = compiled(
            r#"
id: dsl-probe
http:
  - method: GET
    path: ["{{BaseURL}}/"]
    matchers:
      - type: dsl
        dsl: ['len(body) > 100 && contains(body, "error")']
"#,
        );

        let ctx = ScanContext::new(target.clone(), None);
        let results = template.execute_with_context(&ctx, &target).await.unwrap();

        assert!(results.is_empty());
        assert!(ctx.errors().is_empty());
        assert!(ctx.warnings().is_empty());
    }

    #[tokio::test]
    async fn internal_extractions_never_reach_results() {
        let (target, _) = spawn_stub(|_| http_response(200, "token=hunter2", &[])).await;

        let template = compiled(
            r#"
id: internal-probe
http:
  - method: GET
    path: ["{{BaseURL}}/"]
    matchers:
      - type: status
        status: [200]
    extractors:
      - type: regex
        name: secret
        internal: true
        regex: ['token=(\w+)']
        group: 1
"#,
        );

        let results = template.execute(&target, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].extracted_results.is_empty());
    }

    #[tokio::test]
    async fn stop_at_first_match_halts_payload_iteration() {
        let (target, hits) = spawn_stub(|_| http_response(200, "hit", &[])).await;

        let template = compiled(
            r#"
id: early-stop
http:
  - method: GET
    path: ["{{BaseURL}}/{{probe}}"]
    stop-at-first-match: true
    payloads:
      probe: [a, b, c]
    matchers:
      - type: status
        status: [200]
"#,
        );

        let ctx = ScanContext::new(target.clone(), None);
        let results = template.execute_with_context(&ctx, &target).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.events_recorded(), 1);
    }

    #[tokio::test]
    async fn race_mode_dispatches_and_evaluates_all_copies() {
        let (target, hits) = spawn_stub(|_| http_response(200, "ok", &[])).await;

        let template = compiled(
            r#"
id: race-probe
http:
  - method: GET
    path: ["{{BaseURL}}/race"]
    race: true
    race_count: 3
    matchers:
      - type: status
        status: [200]
"#,
        );

        let ctx = ScanContext::new(target.clone(), None);
        let results = template.execute_with_context(&ctx, &target).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.events_recorded(), 3);
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_context_dispatches_nothing() {
        let (target, hits) = spawn_stub(|_| http_response(200, "ok", &[])).await;

        let template = compiled(APACHE_AND);
        let ctx = ScanContext::new(target.clone(), None);
        ctx.cancel();

        let results = template.execute_with_context(&ctx, &target).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(ctx.events_recorded(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn template_level_stop_at_first_match_short_circuits() {
        let (target, hits) = spawn_stub(|_| http_response(200, "ok", &[])).await;

        let template = compiled(
            r#"
id: template-stop
stop-at-first-match: true
http:
  - method: GET
    path: ["{{BaseURL}}/one"]
    matchers:
      - type: status
        status: [200]
  - method: GET
    path: ["{{BaseURL}}/two"]
    matchers:
      - type: status
        status: [200]
"#,
        );

        let results = template.execute(&target, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsafe_raw_request_is_sent_literally() {
        let (target, _) = spawn_stub(|req| {
            // The raw path must arrive exactly as written in the
            // template, including the unnormalized double slash.
            if req.starts_with("GET //weird-path HTTP/1.1") {
                http_response(200, "rawhit", &[])
            } else {
                http_response(400, "bad", &[])
            }
        })
        .await;

        let template = compiled(
            r#"
id: raw-probe
http:
  - unsafe: true
    raw:
      - |
        GET //weird-path HTTP/1.1
        Host: {{Hostname}}
    matchers:
      - type: word
        words: [rawhit]
"#,
        );

        let results = template.execute(&target, None).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_warns_and_continues() {
        // Nothing listens on this port; connection is refused.
        let template = compiled(APACHE_AND);
        let ctx = ScanContext::new("http://127.0.0.1:1", None);
        let results = template
            .execute_with_context(&ctx, "http://127.0.0.1:1")
            .await
            .unwrap();

        assert!(results.is_empty());
        // The failed dispatch still recorded its event with an error key.
        assert_eq!(ctx.events_recorded(), 1);
    }

    #[tokio::test]
    async fn invalid_target_is_an_error() {
        let template = compiled(APACHE_AND);
        assert!(template.execute("not a url", None).await.is_err());
    }
}
