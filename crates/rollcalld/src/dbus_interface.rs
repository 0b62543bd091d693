use image::DynamicImage;
use rollcall_core::pipeline::RegistrationError;
use rollcall_core::{FaceDetection, Recognizer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use zbus::{fdo, interface};

/// D-Bus interface for the rollcall recognition daemon.
///
/// Bus name: org.rollcall.Recognition1
/// Object path: /org/rollcall/Recognition1
///
/// Every method returns a JSON document with a boolean `success` field.
/// Rejected requests (no face, bad session id) come back as
/// `success: false` with an `error` message; an unreadable image is an
/// `InvalidArgs` D-Bus error.
pub struct RollcallService {
    recognizer: Arc<Recognizer>,
    started: Instant,
}

impl RollcallService {
    pub fn new(recognizer: Arc<Recognizer>) -> Self {
        Self {
            recognizer,
            started: Instant::now(),
        }
    }
}

#[interface(name = "org.rollcall.Recognition1")]
impl RollcallService {
    /// Enroll `identity` from an image containing exactly one face.
    async fn register(&self, image_path: &str, identity: &str) -> fdo::Result<String> {
        tracing::info!(image_path, identity, "register requested");
        let recognizer = Arc::clone(&self.recognizer);
        let path = image_path.to_string();
        let identity = identity.to_string();

        run_blocking(move || {
            let image = load_image(&path)?;
            match recognizer.register(&image, &identity) {
                Ok(registration) => succeed(&registration),
                Err(e @ RegistrationError::Detector(_)) | Err(e @ RegistrationError::Embedder(_)) => {
                    tracing::error!(identity = %identity, error = %e, "registration failed");
                    Err(fdo::Error::Failed(e.to_string()))
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "registration rejected");
                    Ok(fail(&e.to_string()))
                }
            }
        })
        .await
    }

    /// Recognize every face in an image. An empty `session_id` starts a new
    /// session; results are appended to the session log when `save_results`.
    async fn recognize(&self, image_path: &str, session_id: &str, save_results: bool) -> fdo::Result<String> {
        tracing::info!(image_path, session_id, save_results, "recognize requested");
        let recognizer = Arc::clone(&self.recognizer);
        let path = image_path.to_string();
        let session_id = session_id.trim().to_string();

        run_blocking(move || {
            let image = load_image(&path)?;
            let session = (!session_id.is_empty()).then_some(session_id.as_str());
            match recognizer.recognize(&image, session, save_results) {
                Ok(recognition) => succeed(&recognition),
                Err(e) => Ok(fail(&e.to_string())),
            }
        })
        .await
    }

    /// Run face detection only.
    async fn detect(&self, image_path: &str) -> fdo::Result<String> {
        tracing::debug!(image_path, "detect requested");
        let recognizer = Arc::clone(&self.recognizer);
        let path = image_path.to_string();

        run_blocking(move || {
            let image = load_image(&path)?;
            let faces = recognizer
                .detect(&image)
                .map_err(|e| fdo::Error::Failed(e.to_string()))?;
            succeed(&Detections {
                count: faces.len(),
                faces,
            })
        })
        .await
    }

    /// All recorded results for a session, oldest first.
    async fn session_results(&self, session_id: &str) -> fdo::Result<String> {
        let recognizer = Arc::clone(&self.recognizer);
        let session_id = session_id.trim().to_string();

        run_blocking(move || match recognizer.session_results(&session_id) {
            Ok(Some(results)) => succeed(&SessionResults {
                session_id: &session_id,
                count: results.len(),
                results,
            }),
            Ok(None) => Ok(fail(&format!("no results recorded for session {session_id}"))),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "failed to read session results");
                Ok(fail(&e.to_string()))
            }
        })
        .await
    }

    /// Remove an identity from the cache and from durable storage.
    async fn remove_student(&self, identity: &str) -> fdo::Result<String> {
        tracing::info!(identity, "remove requested");
        let recognizer = Arc::clone(&self.recognizer);
        let identity = identity.trim().to_string();

        run_blocking(move || {
            match recognizer.store().delete(&identity, true) {
                Ok(existed) => succeed(&Removal {
                    identity: &identity,
                    existed,
                }),
                Err(e) => {
                    tracing::error!(identity = %identity, error = %e, "failed to remove stored embedding");
                    Ok(fail(&e.to_string()))
                }
            }
        })
        .await
    }

    /// Drop cached embeddings without touching durable storage. An empty
    /// `identity` clears everything.
    async fn clear_cache(&self, identity: &str) -> fdo::Result<String> {
        let identity = identity.trim();
        let target = (!identity.is_empty()).then_some(identity);
        self.recognizer.store().clear(target);
        tracing::info!(identity = target.unwrap_or("*"), "cache cleared");

        succeed(&Cleared {
            cleared: target.unwrap_or("all"),
            remaining: self.recognizer.store().len(),
        })
    }

    async fn cache_stats(&self) -> fdo::Result<String> {
        succeed(&self.recognizer.stats())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let stats = self.recognizer.stats();
        succeed(&Status {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
            identities: stats.store.count,
            model: &stats.store.model,
            distance_metric: stats.store.distance_metric.name(),
            detector: &stats.detector,
            fps_limit: stats.fps_limit,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    success: bool,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct Detections {
    count: usize,
    faces: Vec<FaceDetection>,
}

#[derive(Serialize)]
struct SessionResults<'a> {
    session_id: &'a str,
    count: usize,
    results: Vec<rollcall_core::types::RecognitionResult>,
}

#[derive(Serialize)]
struct Removal<'a> {
    identity: &'a str,
    existed: bool,
}

#[derive(Serialize)]
struct Cleared<'a> {
    cleared: &'a str,
    remaining: usize,
}

#[derive(Serialize)]
struct Status<'a> {
    version: &'static str,
    uptime_secs: u64,
    identities: usize,
    model: &'a str,
    distance_metric: &'a str,
    detector: &'a str,
    fps_limit: f64,
}

fn succeed<T: Serialize>(body: &T) -> fdo::Result<String> {
    serde_json::to_string(&Envelope { success: true, body })
        .map_err(|e| fdo::Error::Failed(format!("serialize response: {e}")))
}

fn fail(message: &str) -> String {
    serde_json::json!({ "success": false, "error": message }).to_string()
}

fn load_image(path: &str) -> fdo::Result<DynamicImage> {
    image::open(path).map_err(|e| {
        tracing::warn!(path, error = %e, "cannot open image");
        fdo::Error::InvalidArgs(format!("cannot open image {path}: {e}"))
    })
}

/// Run model inference and disk I/O on the blocking pool so the bus
/// connection keeps serving other callers.
async fn run_blocking<T, F>(f: F) -> fdo::Result<T>
where
    F: FnOnce() -> fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
}
