//! HTTP server on a Unix socket that dispatches Docker volume plugin calls
//! to a [`VolumeLifecycle`] implementation.

use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode, header};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use crate::error::VolError;
use crate::lifecycle::VolumeLifecycle;
use crate::message::{PLUGIN_CONTENT_TYPE, PluginRequest, PluginResponse, VolumeEntry};

/// A plugin server that accepts connections on a Unix socket and dispatches
/// [`PluginRequest`]s to a [`VolumeLifecycle`].
pub struct PluginServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
}

impl<T> PluginServer<T>
where
    T: VolumeLifecycle + 'static,
{
    /// Bind the socket at `path`, replacing a stale socket file left by a
    /// previous run.
    pub fn bind(path: impl Into<PathBuf>, handler: Arc<T>) -> Result<Self, VolError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                VolError::Transport(format!("could not create {}: {e}", parent.display()))
            })?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale plugin socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VolError::Transport(format!(
                    "could not remove {}: {e}",
                    path.display()
                )));
            }
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| VolError::Transport(format!("could not bind {}: {e}", path.display())))?;
        info!(path = %path.display(), "volume plugin listening");
        Ok(Self {
            listener,
            path,
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests and
    /// remove the socket file.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), VolError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            path,
            handler,
        } = self;

        let incoming = hyper::server::accept::poll_fn(move |cx| {
            listener
                .poll_accept(cx)
                .map(|accepted| Some(accepted.map(|(stream, _addr)| stream)))
        });
        let make_svc = make_service_fn(move |_conn: &UnixStream| {
            let handler = Arc::clone(&handler);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(Arc::clone(&handler), req)
                }))
            }
        });

        let result = hyper::Server::builder(incoming)
            .serve(make_svc)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(VolError::transport);

        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "could not remove plugin socket");
        }
        info!("volume plugin stopped");
        result
    }

    /// Serve until the process is stopped.
    pub async fn serve(self) -> Result<(), VolError> {
        self.serve_with_shutdown(std::future::pending()).await
    }
}

/// Process one HTTP request: decode → dispatch → encode.
async fn handle_request<T>(handler: Arc<T>, req: Request<Body>) -> Result<Response<Body>, Infallible>
where
    T: VolumeLifecycle + 'static,
{
    let path = req.uri().path().to_owned();
    if req.method() != Method::POST {
        let e = VolError::InvalidArgument(format!("{} not allowed on {path}", req.method()));
        return Ok(encode(StatusCode::METHOD_NOT_ALLOWED, &PluginResponse::error(&e)));
    }

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            let e = VolError::Transport(format!("could not read request body: {e}"));
            return Ok(encode(StatusCode::BAD_REQUEST, &PluginResponse::error(&e)));
        }
    };
    let request = match PluginRequest::decode(&path, &body) {
        Ok(request) => request,
        Err(e) => {
            warn!(%path, error = %e, "rejected plugin request");
            let status = if path.starts_with("/VolumeDriver.") || path == "/Plugin.Activate" {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::NOT_FOUND
            };
            return Ok(encode(status, &PluginResponse::error(&e)));
        }
    };

    // Run on its own task: a client hanging up must not cancel a request
    // halfway through a locked registry update or a helper run.
    let response = match tokio::spawn(async move { dispatch(handler.as_ref(), request).await }).await
    {
        Ok(response) => response,
        Err(e) => {
            error!(%path, error = %e, "plugin handler task failed");
            PluginResponse::error(&VolError::internal(e))
        }
    };

    let status = if response.is_error() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok(encode(status, &response))
}

fn encode(status: StatusCode, response: &PluginResponse) -> Response<Body> {
    let payload = serde_json::to_vec(response).unwrap_or_else(|e| {
        error!(error = %e, "could not encode plugin response");
        br#"{"Err":"could not encode response"}"#.to_vec()
    });
    let mut resp = Response::new(Body::from(payload));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(PLUGIN_CONTENT_TYPE),
    );
    resp
}

/// Map a [`PluginRequest`] to the correct lifecycle call and wrap the result
/// in a [`PluginResponse`].
#[instrument(skip_all, fields(request = %request))]
pub async fn dispatch<T>(handler: &T, request: PluginRequest) -> PluginResponse
where
    T: VolumeLifecycle + ?Sized,
{
    let result = match request {
        PluginRequest::Activate => Ok(PluginResponse::activate()),
        PluginRequest::Capabilities => Ok(PluginResponse::Capabilities {
            capabilities: handler.capabilities().into(),
        }),
        PluginRequest::Create(req) => handler
            .create(&req.name, req.options())
            .await
            .map(|()| PluginResponse::ok()),
        PluginRequest::Remove(req) => handler.remove(&req.name).await.map(|()| PluginResponse::ok()),
        PluginRequest::Mount(req) => handler
            .mount(&req.name, &req.id)
            .await
            .map(PluginResponse::mountpoint),
        PluginRequest::Unmount(req) => handler
            .unmount(&req.name, &req.id)
            .await
            .map(|()| PluginResponse::ok()),
        PluginRequest::Path(req) => handler.path(&req.name).await.map(PluginResponse::mountpoint),
        PluginRequest::Get(req) => handler
            .get(&req.name)
            .await
            .map(|info| PluginResponse::volume(VolumeEntry::detailed(info))),
        PluginRequest::List => handler.list().await.map(|infos| {
            PluginResponse::volumes(infos.into_iter().map(VolumeEntry::summary).collect())
        }),
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "plugin request failed");
            PluginResponse::error(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::message::{CreateRequest, MountRequest, NameRequest};
    use crate::types::{Capabilities, MountOptions, Scope, VolumeInfo};

    /// Lifecycle fake recording the calls it receives.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn info(name: &str) -> VolumeInfo {
        VolumeInfo {
            name: name.to_owned(),
            mountpoint: format!("/mnt/{name}"),
            created_at: String::new(),
            mounts: 1,
        }
    }

    #[async_trait]
    impl VolumeLifecycle for Recorder {
        async fn create(&self, name: &str, options: MountOptions) -> Result<(), VolError> {
            self.record(format!("create {name} {}", crate::options::serialize(&options)));
            Ok(())
        }
        async fn list(&self) -> Result<Vec<VolumeInfo>, VolError> {
            Ok(vec![info("a"), info("b")])
        }
        async fn get(&self, name: &str) -> Result<VolumeInfo, VolError> {
            if name == "a" {
                Ok(info(name))
            } else {
                Err(VolError::VolumeNotFound(name.to_owned()))
            }
        }
        async fn remove(&self, name: &str) -> Result<(), VolError> {
            self.record(format!("remove {name}"));
            Ok(())
        }
        async fn path(&self, name: &str) -> Result<String, VolError> {
            Ok(format!("/mnt/{name}"))
        }
        async fn mount(&self, name: &str, request_id: &str) -> Result<String, VolError> {
            self.record(format!("mount {name} {request_id}"));
            Ok(format!("/mnt/{name}"))
        }
        async fn unmount(&self, name: &str, request_id: &str) -> Result<(), VolError> {
            self.record(format!("unmount {name} {request_id}"));
            Err(VolError::NotMounted(name.to_owned()))
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                scope: Scope::Global,
            }
        }
    }

    #[tokio::test]
    async fn dispatches_to_lifecycle() {
        let h = Recorder::default();
        let opts = [("ro".to_owned(), String::new())].into_iter().collect();
        let resp = dispatch(
            &h,
            PluginRequest::Create(CreateRequest {
                name: "v".into(),
                opts: Some(opts),
            }),
        )
        .await;
        assert_eq!(resp, PluginResponse::ok());

        let resp = dispatch(
            &h,
            PluginRequest::Mount(MountRequest {
                name: "v".into(),
                id: "r1".into(),
            }),
        )
        .await;
        assert_eq!(resp, PluginResponse::mountpoint("/mnt/v".into()));

        dispatch(&h, PluginRequest::Remove(NameRequest { name: "v".into() })).await;
        assert_eq!(
            *h.calls.lock().unwrap(),
            vec!["create v ro", "mount v r1", "remove v"]
        );
    }

    #[tokio::test]
    async fn errors_become_err_field() {
        let h = Recorder::default();
        let resp = dispatch(&h, PluginRequest::Get(NameRequest { name: "zz".into() })).await;
        assert_eq!(resp.err(), Some("volume zz not found"));

        let resp = dispatch(
            &h,
            PluginRequest::Unmount(MountRequest {
                name: "v".into(),
                id: "r1".into(),
            }),
        )
        .await;
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn get_and_list_shapes() {
        let h = Recorder::default();
        let PluginResponse::Volume { volume, .. } =
            dispatch(&h, PluginRequest::Get(NameRequest { name: "a".into() })).await
        else {
            panic!("expected a volume");
        };
        assert_eq!(volume.status.get("mounts"), Some(&serde_json::json!(1)));

        let PluginResponse::Volumes { volumes, .. } = dispatch(&h, PluginRequest::List).await else {
            panic!("expected volumes");
        };
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|v| v.status.is_empty()));

        let resp = dispatch(&h, PluginRequest::Capabilities).await;
        assert_eq!(
            serde_json::to_value(resp).unwrap(),
            serde_json::json!({"Capabilities": {"Scope": "global"}})
        );
    }

    #[tokio::test]
    async fn serves_over_unix_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("run/s3vol.sock");
        let server = PluginServer::bind(&socket, Arc::new(Recorder::default())).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_with_shutdown(async {
            let _ = stop_rx.await;
        }));

        let body = r#"{"Name":"v","ID":"r9"}"#;
        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let request = format!(
            "POST /VolumeDriver.Mount HTTP/1.1\r\nHost: plugin\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200 OK"), "{raw}");
        assert!(raw.contains(PLUGIN_CONTENT_TYPE));
        assert!(raw.ends_with(r#"{"Mountpoint":"/mnt/v","Err":""}"#), "{raw}");

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
