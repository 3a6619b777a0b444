//! Local axum stubs for exercising the reqwest-backed clients.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::Router;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    /// Path plus query string.
    pub path: String,
    pub body: String,
}

type Handler = dyn Fn(&Request) -> (u16, String) + Send + Sync;

#[derive(Clone)]
struct Stub {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<Request>>>,
}

pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

/// Accepts connections and never answers.
pub async fn serve_silent() -> String {
    serve(Router::new().fallback(|| async {
        std::future::pending::<StatusCode>().await
    }))
    .await
}

/// Answers every request through `handler` and records what it saw.
pub struct StubServer {
    base_url: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl StubServer {
    pub async fn start(handler: impl Fn(&Request) -> (u16, String) + Send + Sync + 'static) -> Self {
        let stub = Stub {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = stub.requests.clone();
        let app = Router::new().fallback(respond).with_state(stub);

        Self {
            base_url: serve(app).await,
            requests,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

async fn respond(
    State(stub): State<Stub>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    let request = Request {
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        body,
    };
    let (status, reply) = (stub.handler)(&request);
    stub.requests.lock().unwrap().push(request);
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        reply,
    )
}
