/// Integration tests for the compositor HTTP API.
///
/// External tools are replaced by a scripted runner so the full request
/// path (multipart parsing, validation, cascade, job records) runs without
/// Ghostscript, ImageMagick, qpdf or pdftk installed.
///
/// ## Running Tests
///
/// ```bash
/// # Scripted tools only
/// cargo test --test composite_api_test
///
/// # Also run against the real binaries
/// cargo test --test composite_api_test -- --ignored
/// ```

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use pdf_compositor::compositor::Compositor;
    use pdf_compositor::config::Config;
    use pdf_compositor::server::{router, AppState, JOB_ID_HEADER, STRATEGY_HEADER};
    use pdf_compositor::store::JobStore;
    use pdf_compositor::tools::{Invocation, ToolError, ToolOutput, ToolPaths, ToolRunner};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "compositor-test-boundary";
    const TEMPLATE: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n";
    const ARTWORK: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

    const LAYER_DUMP: &str = r#"{"version":2,"qpdf":[{"jsonversion":2},{
        "obj:1 0 R":{"value":{"/Type":"/Catalog"}},
        "obj:8 0 R":{"value":{"/Type":"/OCG","/Name":"u:Artwork Here"}},
        "obj:9 0 R":{"value":{"/Type":"/OCG","/Name":"u:Dieline"}}}]}"#;

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        /// Every tool works.
        Healthy,
        /// Probes work, every compositing step fails.
        StrategiesFail,
        /// Nothing is installed.
        Missing,
    }

    /// Stands in for the external tools, writing fake PDFs where a real
    /// tool would write its output.
    struct ScriptedTools {
        mode: Mode,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTools {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn output_target(inv: &Invocation) -> PathBuf {
        let args = inv.args_lossy();
        args.iter()
            .find_map(|a| a.strip_prefix("-sOutputFile=").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(args.last().unwrap()))
    }

    impl ToolRunner for ScriptedTools {
        fn run(&self, inv: &Invocation) -> Result<ToolOutput, ToolError> {
            self.calls.lock().unwrap().push(inv.to_string());
            let args = inv.args_lossy();

            if self.mode == Mode::Missing {
                return Err(ToolError::NotFound {
                    tool: inv.tool,
                    program: inv.program.clone(),
                });
            }
            if args == vec![inv.tool.version_flag()] {
                return Ok(ToolOutput {
                    stdout: format!("{} 1.0.0\n", inv.program),
                    ..Default::default()
                });
            }
            if args.iter().any(|a| a == "-dNODISPLAY") {
                return Ok(ToolOutput {
                    stdout: "[0 0 612 792]\n".to_string(),
                    ..Default::default()
                });
            }
            if args.iter().any(|a| a == "--json=2") {
                return Ok(ToolOutput {
                    stdout: LAYER_DUMP.to_string(),
                    ..Default::default()
                });
            }
            if self.mode == Mode::StrategiesFail {
                return Err(ToolError::Failed {
                    tool: inv.tool,
                    code: Some(1),
                    stderr: format!("{} could not read input", inv.program),
                });
            }

            std::fs::write(output_target(inv), b"%PDF-1.7\n% composited by test\n").unwrap();
            Ok(ToolOutput::default())
        }
    }

    struct Harness {
        app: Router,
        _work: TempDir,
    }

    fn harness(mode: Mode) -> Harness {
        harness_with_config(mode, |_| {})
    }

    fn harness_with_limit(mode: Mode, max_upload_bytes: usize) -> Harness {
        harness_with_config(mode, |config| config.max_upload_bytes = max_upload_bytes)
    }

    fn harness_with_config(mode: Mode, adjust: impl FnOnce(&mut Config)) -> Harness {
        let work = TempDir::new().unwrap();
        let mut config = Config {
            work_dir: work.path().to_path_buf(),
            max_upload_bytes: 1024 * 1024,
            ..Config::default()
        };
        adjust(&mut config);
        let compositor = Compositor::new(
            Arc::new(ScriptedTools::new(mode)),
            ToolPaths::default(),
            Duration::from_secs(10),
            work.path(),
        );
        let state = AppState::new(compositor, JobStore::memory(), config);
        Harness {
            app: router(state),
            _work: work,
        }
    }

    enum Part<'a> {
        File(&'a str, &'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::File(name, file_name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            name, file_name
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn standard_upload() -> Vec<Part<'static>> {
        vec![
            Part::File("template", "mug-11oz.pdf", TEMPLATE),
            Part::File("artwork", "sunset.png", ARTWORK),
        ]
    }

    #[tokio::test]
    async fn test_health_lists_tools() {
        let h = harness(Mode::Healthy);
        let response = h.app.oneshot(get("/api/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["tools"].as_array().unwrap().len(), 5);
        assert_eq!(json["strategies"][0], "qpdf_underlay");
    }

    #[tokio::test]
    async fn test_health_degraded_without_tools() {
        let h = harness(Mode::Missing);
        let response = h.app.oneshot(get("/api/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert!(json["strategies"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_composite_returns_pdf_and_records_job() {
        let h = harness(Mode::Healthy);
        let response = h
            .app
            .clone()
            .oneshot(multipart("/api/composite", &standard_upload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(response.headers()[STRATEGY_HEADER], "qpdf_underlay");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"mug-11oz-composited.pdf\""
        );
        let job_id = response.headers()[JOB_ID_HEADER].to_str().unwrap().to_string();

        let pdf = body_bytes(response).await;
        assert!(pdf.starts_with(b"%PDF-"));

        let response = h
            .app
            .oneshot(get(&format!("/api/jobs/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = body_json(response).await;
        assert_eq!(job["status"], "complete");
        assert_eq!(job["strategy"], "qpdf_underlay");
        assert_eq!(job["layer_name"], "ARTWORK HERE");
        assert_eq!(job["layers"]["target_found"], true);
        assert_eq!(job["template"]["file_name"], "mug-11oz.pdf");
        assert_eq!(job["artwork"]["content_type"], "image/png");
    }

    #[tokio::test]
    async fn test_composite_with_forced_strategy_and_params() {
        let h = harness(Mode::Healthy);
        let mut parts = standard_upload();
        parts.push(Part::Text("strategy", "ghostscript_raster"));
        parts.push(Part::Text("dpi", "150"));
        parts.push(Part::Text("layer_name", "Dieline"));

        let response = h
            .app
            .oneshot(multipart("/api/composite", &parts))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[STRATEGY_HEADER], "ghostscript_raster");
    }

    #[tokio::test]
    async fn test_composite_requires_artwork() {
        let h = harness(Mode::Healthy);
        let response = h
            .app
            .oneshot(multipart(
                "/api/composite",
                &[Part::File("template", "t.pdf", TEMPLATE)],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
        assert_eq!(json["error"]["message"], "missing required field 'artwork'");
    }

    #[tokio::test]
    async fn test_composite_rejects_wrong_file_types() {
        let h = harness(Mode::Healthy);
        let response = h
            .app
            .clone()
            .oneshot(multipart(
                "/api/composite",
                &[
                    Part::File("template", "t.pdf", TEMPLATE),
                    Part::File("artwork", "a.pdf", TEMPLATE),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = h
            .app
            .oneshot(multipart(
                "/api/composite",
                &[
                    Part::File("template", "t.png", ARTWORK),
                    Part::File("artwork", "a.png", ARTWORK),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_composite_rejects_bad_parameters() {
        let h = harness(Mode::Healthy);

        let mut parts = standard_upload();
        parts.push(Part::Text("dpi", "5000"));
        let response = h
            .app
            .clone()
            .oneshot(multipart("/api/composite", &parts))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut parts = standard_upload();
        parts.push(Part::Text("strategy", "photoshop"));
        let response = h
            .app
            .oneshot(multipart("/api/composite", &parts))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_composite_rejects_oversized_upload() {
        let h = harness_with_limit(Mode::Healthy, 64);
        let mut big = TEMPLATE.to_vec();
        big.resize(256, b' ');

        let response = h
            .app
            .oneshot(multipart(
                "/api/composite",
                &[
                    Part::File("template", "t.pdf", &big),
                    Part::File("artwork", "a.png", ARTWORK),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_composite_all_strategies_fail() {
        let h = harness(Mode::StrategiesFail);
        let response = h
            .app
            .clone()
            .oneshot(multipart("/api/composite", &standard_upload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let job_id = response.headers()[JOB_ID_HEADER].to_str().unwrap().to_string();
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "COMPOSITE_FAILED");
        let message = json["error"]["message"].as_str().unwrap();
        assert!(message.starts_with("all compositing strategies failed: qpdf_underlay ("));
        let attempts = json["error"]["attempts"].as_array().unwrap();
        let tried: Vec<&str> = attempts
            .iter()
            .map(|a| a["strategy"].as_str().unwrap())
            .collect();
        assert_eq!(
            tried,
            vec![
                "qpdf_underlay",
                "pdftk_background",
                "ghostscript_raster",
                "imagemagick_direct"
            ]
        );

        // The names a failure reports are accepted back as a forced strategy.
        let mut retry: Vec<Part<'_>> = standard_upload();
        retry.push(Part::Text("strategy", tried[3]));
        let response = h
            .app
            .clone()
            .oneshot(multipart("/api/composite", &retry))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = h
            .app
            .oneshot(get(&format!("/api/jobs/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = body_json(response).await;
        assert_eq!(job["status"], "failed");
        assert_eq!(job["attempts"].as_array().unwrap().len(), 4);
        assert!(job["error"].as_str().unwrap().contains("imagemagick_direct"));
    }

    #[tokio::test]
    async fn test_composite_io_failure_marks_job_failed() {
        let h = harness_with_config(Mode::Healthy, |config| {
            config.work_dir = config.work_dir.join("does-not-exist");
        });
        let response = h
            .app
            .clone()
            .oneshot(multipart("/api/composite", &standard_upload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let job_id = response.headers()[JOB_ID_HEADER].to_str().unwrap().to_string();

        let response = h
            .app
            .oneshot(get(&format!("/api/jobs/{}", job_id)))
            .await
            .unwrap();
        let job = body_json(response).await;
        assert_eq!(job["status"], "failed");
        assert!(job["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_composite_unreadable_template() {
        let h = harness(Mode::Missing);
        let response = h
            .app
            .oneshot(multipart("/api/composite", &standard_upload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(response.headers().contains_key(JOB_ID_HEADER));
    }

    #[tokio::test]
    async fn test_layers_endpoint() {
        let h = harness(Mode::Healthy);
        let response = h
            .app
            .oneshot(multipart(
                "/api/layers",
                &[
                    Part::File("template", "t.pdf", TEMPLATE),
                    Part::Text("layer_name", "dieline"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["target"], "dieline");
        assert_eq!(json["target_found"], true);
        assert_eq!(json["layers"][0]["name"], "Artwork Here");
        assert_eq!(json["layers"][1]["object"], "9 0 R");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let h = harness(Mode::Healthy);
        let response = h
            .app
            .oneshot(get("/api/jobs/00000000-0000-0000-0000-000000000000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// End-to-end run against the real binaries.
    ///
    /// Requires ImageMagick plus at least one of qpdf, pdftk or Ghostscript.
    #[test]
    #[ignore]
    fn test_real_tools_composite() {
        use pdf_compositor::compositor::{verify_pdf, CompositeRequest};
        use pdf_compositor::tools::ProcessRunner;
        use std::process::Command;

        let dir = TempDir::new().unwrap();
        let template = dir.path().join("template.pdf");
        let artwork = dir.path().join("artwork.png");
        let output = dir.path().join("output.pdf");

        let status = Command::new("magick")
            .args(["-size", "612x792", "xc:white"])
            .arg(&template)
            .status()
            .unwrap();
        assert!(status.success());
        let status = Command::new("magick")
            .args(["-size", "200x200", "xc:red"])
            .arg(&artwork)
            .status()
            .unwrap();
        assert!(status.success());

        let compositor = Compositor::new(
            Arc::new(ProcessRunner::new()),
            ToolPaths::default(),
            Duration::from_secs(60),
            dir.path(),
        );
        let outcome = compositor
            .composite(&CompositeRequest {
                template,
                artwork,
                output: output.clone(),
                layer_name: "ARTWORK HERE".to_string(),
                dpi: 72,
                strategy: None,
            })
            .unwrap();

        assert!(outcome.page_size.width_pt > 600.0);
        assert!(verify_pdf(&output).is_ok());
        assert_eq!(outcome.attempts.last().map(|a| a.succeeded), Some(true));
    }
}
