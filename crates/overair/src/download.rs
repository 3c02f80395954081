//! Direct payload download with verification.
//!
//! The download step consults the plugin layer first; whatever the plugins
//! do not handle is fetched over HTTP into the sandbox. Every file is hash
//! verified before anything else may touch it, and unmatched downloads are
//! deleted on the spot.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use overair_retry::{RetryPolicy, backoff_delay, next_attempt_at_throttled};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content;
use crate::error::AgentError;
use crate::handler::WorkflowView;
use crate::plugin::PluginOutcome;
use crate::types::FileEntity;
use crate::verify;

/// Inline attempts per file before the failure is surfaced to the phase
/// retry machinery.
const ATTEMPTS_PER_CALL: u32 = 3;

/// Granularity at which backoff waits poll the cancel flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Blocking HTTP downloader used by handlers through the workflow view.
pub struct Downloader {
    client: reqwest::blocking::Client,
    policy: RetryPolicy,
    throttle_policy: RetryPolicy,
}

impl Downloader {
    pub fn new(policy: RetryPolicy, throttle_policy: RetryPolicy) -> Result<Self, AgentError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            policy,
            throttle_policy,
        })
    }

    /// Fetch `uri` into `dest`, retrying transient failures inline.
    /// Ordinary failures back off under the download policy; throttling
    /// answers back off under the throttle policy, floored by the
    /// server-provided `Retry-After`. Waits observe the cancel flag.
    pub fn fetch(&self, uri: &str, dest: &Path, cancel: &AtomicBool) -> Result<(), AgentError> {
        let mut attempt = 0;
        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(AgentError::TransientIo("download cancelled".into()));
            }
            match self.fetch_once(uri, dest) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < ATTEMPTS_PER_CALL => {
                    let delay = self.retry_delay(&e, attempt);
                    warn!(
                        uri,
                        attempt,
                        "download failed ({e}); retrying in {}",
                        humantime::format_duration(delay)
                    );
                    if !sleep_unless_cancelled(delay, cancel) {
                        return Err(AgentError::TransientIo("download cancelled".into()));
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn retry_delay(&self, error: &AgentError, attempt: u32) -> Duration {
        match error {
            AgentError::Throttled {
                retry_after_secs, ..
            } => {
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                let due =
                    next_attempt_at_throttled(&self.throttle_policy, attempt, now, *retry_after_secs);
                Duration::from_secs(due.saturating_sub(now))
            }
            _ => backoff_delay(&self.policy, attempt),
        }
    }

    fn fetch_once(&self, uri: &str, dest: &Path) -> Result<(), AgentError> {
        let transient = |msg: String| AgentError::TransientIo(msg);

        let mut response = self
            .client
            .get(uri)
            .send()
            .map_err(|e| transient(format!("request to {uri} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            // Throttling answers carry the server's pacing; other
            // server-side failures may clear up; the rest of the 4xx range
            // means the deployment references a dead URI.
            let retry_after = retry_after_secs(&response);
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || (status == reqwest::StatusCode::SERVICE_UNAVAILABLE && retry_after.is_some())
            {
                return Err(AgentError::Throttled {
                    retry_after_secs: retry_after.unwrap_or(0),
                    message: format!("{uri} answered {status}"),
                });
            }
            let retriable = status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT;
            return if retriable {
                Err(transient(format!("{uri} answered {status}")))
            } else {
                Err(AgentError::Config(format!("{uri} answered {status}")))
            };
        }

        let part_path = dest.with_extension(format!("part-{}", Uuid::new_v4().simple()));
        let result = (|| -> Result<(), AgentError> {
            let mut file = File::create(&part_path)
                .map_err(|e| transient(format!("failed to create {}: {e}", part_path.display())))?;
            response
                .copy_to(&mut file)
                .map_err(|e| transient(format!("failed to stream {uri}: {e}")))?;
            file.flush()
                .map_err(|e| transient(format!("failed to flush {}: {e}", part_path.display())))?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&part_path);
            return Err(e);
        }
        fs::rename(&part_path, dest)
            .map_err(|e| transient(format!("failed to move payload into place: {e}")))?;
        debug!(uri, dest = %dest.display(), "payload downloaded");
        Ok(())
    }
}

/// The seconds form of a `Retry-After` header, when present.
fn retry_after_secs(response: &reqwest::blocking::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Sleep in cancel-aware slices; `false` means the wait was cancelled.
fn sleep_unless_cancelled(delay: Duration, cancel: &AtomicBool) -> bool {
    let mut remaining = delay;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let slice = remaining.min(CANCEL_POLL_INTERVAL);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !cancel.load(Ordering::Acquire)
}

/// Produce every payload file of the deployment in the sandbox,
/// hash-verified.
///
/// Per file: a matching plugin gets the first shot; `Fallback` (or no
/// plugin) means a direct fetch. When the deployment carries a
/// content-protection block, directly fetched bytes are decrypted with
/// the unwrapped DEK before verification (declared hashes name the
/// plaintext; plugin-rebuilt payloads are already plaintext). Files
/// already present and valid are kept, so a resumed download does not
/// refetch.
pub fn download_deployment_files(view: &WorkflowView<'_>) -> Result<(), AgentError> {
    let dek = match &view.deployment.content_protection {
        Some(protection) => {
            let device_key = content::load_device_key(view.device_key_file)?;
            Some(protection.unwrap_dek(&device_key)?)
        }
        None => None,
    };

    for file in &view.deployment.files {
        if view.is_cancel_requested() {
            return Err(AgentError::TransientIo("download cancelled".into()));
        }
        let dest = view.file_path(file);

        if dest.is_file() && verify::is_hash_valid(&dest, &file.hashes)? {
            debug!(file = %file.target_filename, "payload already present and verified");
            continue;
        }

        let handled = match plugin_attempt(view, file, &dest)? {
            PluginOutcome::Handled => true,
            PluginOutcome::Fallback => false,
            PluginOutcome::Failed(_) => unreachable!("plugin_attempt surfaces failures as errors"),
        };
        if !handled {
            match &dek {
                Some(dek) => {
                    let encrypted = dest.with_extension("enc");
                    view.downloader
                        .fetch(&file.download_uri, &encrypted, view.cancel)?;
                    let decrypted = content::decrypt_payload(&encrypted, &dest, dek);
                    let _ = fs::remove_file(&encrypted);
                    decrypted?;
                    debug!(file = %file.target_filename, "payload decrypted");
                }
                None => view.downloader.fetch(&file.download_uri, &dest, view.cancel)?,
            }
        }

        if !verify::is_hash_valid(&dest, &file.hashes)? {
            // Invariant: unmatched downloads never survive on disk.
            let _ = fs::remove_file(&dest);
            return Err(AgentError::Verification(format!(
                "hash mismatch for {}",
                file.target_filename
            )));
        }
        info!(file = %file.target_filename, "payload verified");
    }
    Ok(())
}

fn plugin_attempt(
    view: &WorkflowView<'_>,
    file: &FileEntity,
    dest: &Path,
) -> Result<PluginOutcome, AgentError> {
    let Some(handler_id) = &file.download_handler_id else {
        return Ok(PluginOutcome::Fallback);
    };
    let Some(plugin) = view.plugins.get(handler_id) else {
        warn!(handler_id, "no download plugin registered; falling back to direct fetch");
        return Ok(PluginOutcome::Fallback);
    };
    match plugin.process_update(view, file, dest) {
        PluginOutcome::Failed(msg) => Err(AgentError::Handler {
            class: crate::types::FailureClass::Fatal,
            extended_code: crate::error::extended_codes::HANDLER,
            message: msg,
        }),
        outcome => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    use tempfile::tempdir;

    use super::*;
    use crate::criteria::CriteriaLedger;
    use crate::plugin::PluginRegistry;
    use crate::types::{Deployment, FileHash, UpdateId, UpdateType};

    fn serve_once(body: Vec<u8>, status: u16) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_string();
        std::thread::spawn(move || {
            // Serve a handful of requests, then let the thread die with the
            // server.
            for _ in 0..8 {
                let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(5)) else {
                    break;
                };
                let response = tiny_http::Response::from_data(body.clone())
                    .with_status_code(tiny_http::StatusCode(status));
                let _ = request.respond(response);
            }
        });
        format!("http://{addr}")
    }

    /// Serve a fixed script of `(status, body, optional header)` answers.
    fn serve_script(script: Vec<(u16, Vec<u8>, Option<(&'static str, String)>)>) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_string();
        std::thread::spawn(move || {
            for (status, body, header) in script {
                let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(5)) else {
                    break;
                };
                let mut response = tiny_http::Response::from_data(body)
                    .with_status_code(tiny_http::StatusCode(status));
                if let Some((name, value)) = header {
                    response.add_header(
                        tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes())
                            .expect("header"),
                    );
                }
                let _ = request.respond(response);
            }
        });
        format!("http://{addr}")
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            additional_delay_secs: 0,
            initial_delay_ms: 1,
            max_delay_secs: 1,
            max_jitter_percent: 0,
            max_exponent: 1,
        }
    }

    fn quick_downloader() -> Downloader {
        Downloader::new(quick_policy(), quick_policy()).expect("downloader")
    }

    #[test]
    fn fetch_downloads_body() {
        let td = tempdir().expect("tempdir");
        let url = serve_once(b"firmware bytes".to_vec(), 200);
        let downloader = quick_downloader();

        let dest = td.path().join("image.swu");
        downloader
            .fetch(&url, &dest, &AtomicBool::new(false))
            .expect("fetch");
        assert_eq!(fs::read(&dest).expect("read"), b"firmware bytes");
        // No .part leftovers.
        let leftovers: Vec<_> = fs::read_dir(td.path())
            .expect("readdir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn client_error_status_is_fatal() {
        let td = tempdir().expect("tempdir");
        let url = serve_once(b"gone".to_vec(), 404);
        let downloader = quick_downloader();

        let err = downloader
            .fetch(&url, &td.path().join("x"), &AtomicBool::new(false))
            .expect_err("404");
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn server_error_is_transient_and_retried() {
        let td = tempdir().expect("tempdir");
        let url = serve_once(b"oops".to_vec(), 503);
        let downloader = quick_downloader();

        let err = downloader
            .fetch(&url, &td.path().join("x"), &AtomicBool::new(false))
            .expect_err("503 persists");
        assert!(matches!(err, AgentError::TransientIo(_)));
    }

    #[test]
    fn unreachable_endpoint_is_transient() {
        let td = tempdir().expect("tempdir");
        // Reserved port with nothing listening.
        let downloader = quick_downloader();
        let err = downloader
            .fetch(
                "http://127.0.0.1:1/payload",
                &td.path().join("x"),
                &AtomicBool::new(false),
            )
            .expect_err("nothing listening");
        assert!(matches!(err, AgentError::TransientIo(_)));
    }

    #[test]
    fn cancelled_flag_short_circuits() {
        let td = tempdir().expect("tempdir");
        let downloader = quick_downloader();
        let err = downloader
            .fetch(
                "http://127.0.0.1:1/payload",
                &td.path().join("x"),
                &AtomicBool::new(true),
            )
            .expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
    }

    struct ViewParts {
        deployment: Deployment,
        work_folder: PathBuf,
        cancel: AtomicBool,
        criteria: CriteriaLedger,
        downloader: Downloader,
        plugins: PluginRegistry,
        device_key_file: PathBuf,
    }

    impl ViewParts {
        fn new(root: &Path, files: Vec<FileEntity>) -> Self {
            let work_folder = root.join("sandbox");
            fs::create_dir_all(&work_folder).expect("sandbox");
            Self {
                deployment: Deployment {
                    workflow_id: "w1".into(),
                    update_id: UpdateId {
                        provider: "contoso".into(),
                        name: "fw".into(),
                        version: "1".into(),
                    },
                    update_type: UpdateType::new("microsoft/swupdate:1"),
                    installed_criteria: "1".into(),
                    files,
                    content_protection: None,
                    steps: None,
                },
                work_folder,
                cancel: AtomicBool::new(false),
                criteria: CriteriaLedger::new(root.join("installedcriteria")),
                downloader: quick_downloader(),
                plugins: PluginRegistry::new(),
                device_key_file: root.join("device.key"),
            }
        }

        fn view(&self) -> WorkflowView<'_> {
            WorkflowView {
                deployment: &self.deployment,
                work_folder: &self.work_folder,
                cancel: &self.cancel,
                criteria: &self.criteria,
                downloader: &self.downloader,
                plugins: &self.plugins,
                device_key_file: &self.device_key_file,
            }
        }
    }

    fn file_for(url: &str, digest: &str) -> FileEntity {
        FileEntity {
            file_id: "f1".into(),
            target_filename: "image.swu".into(),
            size_in_bytes: 0,
            hashes: vec![FileHash {
                hash_type: "sha256".into(),
                value: digest.into(),
            }],
            download_uri: url.to_string(),
            related_files: Vec::new(),
            download_handler_id: None,
        }
    }

    #[test]
    fn deployment_files_downloaded_and_verified() {
        let td = tempdir().expect("tempdir");
        let body = b"the firmware".to_vec();
        // Compute the declared digest from a staged copy.
        let staged = td.path().join("staged");
        fs::write(&staged, &body).expect("stage");
        let digest = verify::file_sha256_base64(&staged).expect("digest");

        let url = serve_once(body, 200);
        let parts = ViewParts::new(td.path(), vec![file_for(&url, &digest)]);

        download_deployment_files(&parts.view()).expect("download");
        assert!(parts.work_folder.join("image.swu").is_file());
    }

    #[test]
    fn mismatched_payload_is_deleted() {
        let td = tempdir().expect("tempdir");
        let url = serve_once(b"not what was promised".to_vec(), 200);
        let parts = ViewParts::new(td.path(), vec![file_for(&url, "c29tZW90aGVyaGFzaA==")]);

        let err = download_deployment_files(&parts.view()).expect_err("mismatch");
        assert!(matches!(err, AgentError::Verification(_)));
        assert!(
            !parts.work_folder.join("image.swu").exists(),
            "unverified payloads must not survive"
        );
    }

    #[test]
    fn valid_file_already_present_skips_fetch() {
        let td = tempdir().expect("tempdir");
        // downloadUri points nowhere; the pre-staged file must make the
        // fetch unnecessary.
        let parts = ViewParts::new(
            td.path(),
            vec![file_for("http://127.0.0.1:1/unreachable", "")],
        );
        let dest = parts.work_folder.join("image.swu");
        fs::write(&dest, b"already here").expect("stage");
        let digest = verify::file_sha256_base64(&dest).expect("digest");

        let mut parts = parts;
        parts.deployment.files[0].hashes[0].value = digest;

        download_deployment_files(&parts.view()).expect("no fetch needed");
    }

    #[test]
    fn throttled_retry_waits_for_the_server_floor() {
        let td = tempdir().expect("tempdir");
        let url = serve_script(vec![
            (
                429,
                b"slow down".to_vec(),
                Some(("Retry-After", "1".to_string())),
            ),
            (200, b"payload".to_vec(), None),
        ]);
        let downloader = quick_downloader();

        let dest = td.path().join("image.swu");
        let start = std::time::Instant::now();
        downloader
            .fetch(&url, &dest, &AtomicBool::new(false))
            .expect("fetch");

        assert!(
            start.elapsed() >= Duration::from_secs(1),
            "retry-after floor was not honored"
        );
        assert_eq!(fs::read(&dest).expect("read"), b"payload");
    }

    #[test]
    fn persistent_throttling_surfaces_throttled_error() {
        let td = tempdir().expect("tempdir");
        let answer = || {
            (
                429,
                b"slow down".to_vec(),
                Some(("Retry-After", "0".to_string())),
            )
        };
        let url = serve_script(vec![answer(), answer(), answer()]);
        let downloader = quick_downloader();

        let err = downloader
            .fetch(&url, &td.path().join("x"), &AtomicBool::new(false))
            .expect_err("429 persists");
        assert!(matches!(err, AgentError::Throttled { .. }));
    }

    #[test]
    fn service_unavailable_with_retry_after_is_throttled() {
        let td = tempdir().expect("tempdir");
        let answer = || {
            (
                503,
                b"maintenance".to_vec(),
                Some(("Retry-After", "0".to_string())),
            )
        };
        let url = serve_script(vec![answer(), answer(), answer()]);
        let downloader = quick_downloader();

        let err = downloader
            .fetch(&url, &td.path().join("x"), &AtomicBool::new(false))
            .expect_err("503 persists");
        assert!(matches!(
            err,
            AgentError::Throttled {
                retry_after_secs: 0,
                ..
            }
        ));
    }

    #[test]
    fn protected_deployment_without_device_key_is_fatal() {
        let td = tempdir().expect("tempdir");
        let mut parts = ViewParts::new(
            td.path(),
            vec![file_for("http://127.0.0.1:1/unreachable", "x")],
        );
        parts.deployment.content_protection = Some(crate::types::ContentProtection {
            encrypted_dek: "AAAA".into(),
            algorithm: "aes".into(),
            mode: "gcm".into(),
            key_length: 256,
        });

        // No device key file was provisioned.
        let err = download_deployment_files(&parts.view()).expect_err("no device key");
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn protected_payload_is_decrypted_before_verification() {
        use aes_gcm::aead::{Aead, KeyInit};
        use aes_gcm::{Aes256Gcm, Nonce};
        use base64::Engine;

        fn seal(plaintext: &[u8], key: &[u8; 32]) -> Vec<u8> {
            let cipher = Aes256Gcm::new_from_slice(key).expect("cipher");
            let nonce_bytes = [7u8; 12];
            let nonce = Nonce::from_slice(&nonce_bytes);
            let ciphertext = cipher.encrypt(nonce, plaintext).expect("encrypt");
            let mut blob = nonce_bytes.to_vec();
            blob.extend_from_slice(&ciphertext);
            blob
        }

        let td = tempdir().expect("tempdir");
        let plaintext = b"protected firmware image".to_vec();
        let dek = [9u8; 32];
        let device_key = [1u8; 32];

        // Declared hash names the plaintext.
        let staged = td.path().join("staged");
        fs::write(&staged, &plaintext).expect("stage");
        let digest = verify::file_sha256_base64(&staged).expect("digest");

        let url = serve_once(seal(&plaintext, &dek), 200);
        let mut parts = ViewParts::new(td.path(), vec![file_for(&url, &digest)]);
        fs::write(&parts.device_key_file, device_key).expect("provision key");
        parts.deployment.content_protection = Some(crate::types::ContentProtection {
            encrypted_dek: base64::engine::general_purpose::STANDARD.encode(seal(&dek, &device_key)),
            algorithm: "aes".into(),
            mode: "gcm".into(),
            key_length: 256,
        });

        download_deployment_files(&parts.view()).expect("download");

        let dest = parts.work_folder.join("image.swu");
        assert_eq!(fs::read(&dest).expect("read"), plaintext);
        assert!(
            !parts.work_folder.join("image.enc").exists(),
            "encrypted staging file must not survive"
        );
    }
}
